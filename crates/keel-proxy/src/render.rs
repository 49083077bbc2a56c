//! Tera rendering of the nginx configuration files.

use std::collections::HashMap;

use serde::Serialize;
use tera::{Context, Tera};

use crate::error::ProxyResult;
use crate::routes::ServerEntry;

pub const SERVER_BLOCK_TEMPLATE: &str = include_str!("../templates/server-block.conf.tera");
pub const ROOT_TEMPLATE: &str = include_str!("../templates/root.conf.tera");
pub const BASE_TEMPLATE: &str = include_str!("../templates/base.conf.tera");

/// Check that `template` parses, without rendering it.
pub fn validate_template(template: &str) -> ProxyResult<()> {
    let mut tera = Tera::default();
    tera.add_raw_template("validate.conf", template)?;
    Ok(())
}

/// Render a single template with `context` exposed at the top level.
pub fn render_one(template: &str, context: &impl Serialize) -> ProxyResult<String> {
    let mut tera = Tera::default();
    tera.add_raw_template("one.conf", template)?;
    Ok(tera.render("one.conf", &Context::from_serialize(context)?)?)
}

/// Renders server entries, compiling each distinct template once.
#[derive(Default)]
pub struct ServerRenderer {
    tera: Tera,
    names: HashMap<String, String>,
}

impl ServerRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn template_name(&mut self, template: &str) -> ProxyResult<String> {
        if let Some(name) = self.names.get(template) {
            return Ok(name.clone());
        }
        let name = format!("server-{}.conf", self.names.len());
        self.tera.add_raw_template(&name, template)?;
        self.names.insert(template.to_string(), name.clone());
        Ok(name)
    }

    pub fn render(&mut self, entry: &ServerEntry) -> ProxyResult<String> {
        let template = entry.template.as_deref().unwrap_or(SERVER_BLOCK_TEMPLATE);
        let name = self.template_name(template)?;
        let mut context = Context::new();
        context.insert("s", entry);
        Ok(self.tera.render(&name, &context)?)
    }
}
