//! Built-in Dockerfile templates, selected with `templateId: "{name}/{version}"`.

use crate::error::{BuildError, BuildResult};

struct Template {
    name: &'static str,
    base_image: &'static str,
    tag_suffix: &'static str,
    post_from_lines: &'static str,
}

const TEMPLATES: &[Template] = &[
    Template {
        name: "node",
        base_image: "library/node",
        tag_suffix: "-alpine",
        post_from_lines: "\
RUN mkdir -p /usr/src/app
WORKDIR /usr/src/app
COPY ./src/package.json /usr/src/app/
RUN npm install && npm cache clean --force
COPY ./src /usr/src/app
ENV NODE_ENV=production
ENV PORT=80
EXPOSE 80
CMD [ \"npm\", \"start\" ]
",
    },
    Template {
        name: "php",
        base_image: "library/php",
        tag_suffix: "-apache",
        post_from_lines: "\
COPY ./src/ /var/www/html/
RUN docker-php-ext-install pdo pdo_mysql mysqli
EXPOSE 80
",
    },
    Template {
        name: "python-django",
        base_image: "library/python",
        tag_suffix: "-alpine",
        post_from_lines: "\
RUN mkdir -p /usr/src/app
WORKDIR /usr/src/app
COPY ./src /usr/src/app
RUN pip install --no-cache-dir -r requirements.txt
EXPOSE 80
CMD [\"sh\", \"-c\", \"python manage.py migrate && python manage.py runserver 0.0.0.0:80\"]
",
    },
    Template {
        name: "ruby-rack",
        base_image: "library/ruby",
        tag_suffix: "-alpine",
        post_from_lines: "\
RUN mkdir -p /usr/src/app
WORKDIR /usr/src/app
COPY ./src /usr/src/app
RUN bundle install
EXPOSE 80
CMD [\"rackup\", \"-p\", \"80\", \"--host\", \"0.0.0.0\"]
",
    },
];

/// Dockerfile content for a `{name}/{version}` template id.
pub fn render(template_id: &str) -> BuildResult<String> {
    let mut parts = template_id.split('/');
    let name = parts.next().unwrap_or_default();
    let version = parts.next().unwrap_or_default();
    if version.is_empty() {
        return Err(BuildError::Generic(
            "Template version field is empty!".to_string(),
        ));
    }
    let template = TEMPLATES
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| BuildError::Generic(format!("TEMPLATE NAME NOT FOUND: {name}")))?;
    Ok(format!(
        "FROM {}:{version}{}\n{}",
        template.base_image, template.tag_suffix, template.post_from_lines
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_goes_into_from_tag() {
        let dockerfile = render("node/18").unwrap();
        assert!(dockerfile.starts_with("FROM library/node:18-alpine\n"));
        assert!(dockerfile.contains("npm install"));

        let dockerfile = render("php/8.2").unwrap();
        assert!(dockerfile.starts_with("FROM library/php:8.2-apache\n"));
    }

    #[test]
    fn test_missing_version_and_unknown_name() {
        let err = render("node").unwrap_err();
        assert_eq!(err.to_string(), "Template version field is empty!");
        let err = render("cobol/1").unwrap_err();
        assert_eq!(err.to_string(), "TEMPLATE NAME NOT FOUND: cobol");
    }
}
