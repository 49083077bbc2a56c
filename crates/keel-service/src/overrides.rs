//! Service-update overrides: a JSON or YAML object deep-merged over the
//! generated spec before submission.

use serde_json::Value;

use crate::error::{ServiceError, ServiceResult};

/// Parse a stored override. Blank input means no override.
pub fn parse_override(raw: &str) -> ServiceResult<Option<Value>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let parsed: Option<Value> = if raw.starts_with('{') || raw.starts_with('[') {
        serde_json::from_str(raw).ok()
    } else {
        serde_yaml::from_str(raw).ok()
    };
    match parsed {
        Some(value @ Value::Object(_)) => Ok(Some(value)),
        _ => Err(ServiceError::IllegalParameter(
            "serviceUpdateOverride must be either a valid JSON object starting with { or an equivalent yaml"
                .to_string(),
        )),
    }
}

/// Merge `overlay` into `base`. Objects merge key by key; arrays and
/// scalars in `overlay` replace what is in `base`.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let both_objects = value.is_object() && base.get(key).is_some_and(Value::is_object);
                if !both_objects {
                    base.insert(key.clone(), value.clone());
                } else if let Some(existing) = base.get_mut(key) {
                    deep_merge(existing, value);
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
