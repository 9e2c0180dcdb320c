use serde_json::{Map, Value};

pub const USER_ID_FIELD: &str = "user_id";
pub const EMAIL_FIELD: &str = "email";
pub const ATTRIBUTION_MARKER_FIELD: &str = "apps_flyer_id";
pub const ANONYMOUS_ID_FIELD: &str = "appsflyer_id";
pub const CUSTOM_DATA_PREFIX: &str = "custom_data.";

const CUSTOM_DATA_FIELD: &str = "custom_data";
const CUSTOMER_ID_FIELD: &str = "customer_user_id";
const CUSTOMER_ID_PLACEHOLDER: &str = "customer_id";

/// Best-effort parse of string values that look like JSON objects or arrays.
/// Anything that is not a string, does not have the `{..}`/`[..]` shape, or
/// fails to parse is returned unchanged.
pub fn try_parse_json(value: Value) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            let object_like = trimmed.starts_with('{') && trimmed.ends_with('}');
            let array_like = trimmed.starts_with('[') && trimmed.ends_with(']');
            if object_like || array_like {
                if let Ok(parsed) = serde_json::from_str(trimmed) {
                    return parsed;
                }
            }
            Value::String(s)
        }
        other => other,
    }
}

/// Normalize a raw value into a valid non-empty identifier string.
/// Numbers (including zero) always stringify; strings are trimmed and the
/// literals `""`, `"undefined"` and `"null"` are treated as absent.
pub fn sanitize_id(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => sanitize_str(s),
        other => sanitize_str(&other.to_string()),
    }
}

fn sanitize_str(s: &str) -> Option<String> {
    match s.trim() {
        "" | "undefined" | "null" => None,
        trimmed => Some(trimmed.to_string()),
    }
}

/// A raw webhook payload collapsed to a single level, plus the user
/// identifier resolved during the walk.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlattenedEvent {
    pub fields: Map<String, Value>,
    pub user_id: Option<String>,
}

/// Depth-first walk of the raw payload. Nested objects (including
/// JSON-encoded string objects) are collapsed onto their leaf key name, so
/// same-named leaves in different branches collide and the last visited one
/// wins. Leaves under `custom_data` keep a `custom_data.` prefix, which the
/// partitioner relies on. The canonical `user_id` field is consumed rather
/// than emitted; an email seen anywhere is promoted to the user id when the
/// payload carries the attribution marker and no explicit user id was set.
pub fn flatten(raw: &Map<String, Value>) -> FlattenedEvent {
    let mut walk = Walk::default();
    walk.visit(raw, false);

    let Walk {
        fields,
        user_id,
        email_candidate,
        saw_attribution_marker,
    } = walk;

    let user_id = user_id.or(if saw_attribution_marker {
        email_candidate
    } else {
        None
    });

    FlattenedEvent { fields, user_id }
}

#[derive(Default)]
struct Walk {
    fields: Map<String, Value>,
    user_id: Option<String>,
    email_candidate: Option<String>,
    saw_attribution_marker: bool,
}

impl Walk {
    fn visit(&mut self, obj: &Map<String, Value>, in_custom_data: bool) {
        for (key, value) in obj {
            if key == ATTRIBUTION_MARKER_FIELD {
                self.saw_attribution_marker = true;
            }

            if key == EMAIL_FIELD {
                if let Some(email) = sanitize_id(value) {
                    self.email_candidate = Some(email);
                }
            }

            if key == USER_ID_FIELD {
                if let Some(user_id) = sanitize_id(value) {
                    self.user_id = Some(user_id);
                    continue;
                }
            }

            // AppsFlyer fills customer_user_id with a placeholder when the
            // app never set one; drop it instead of forwarding the sentinel.
            if key == CUSTOMER_ID_FIELD && value.as_str() == Some(CUSTOMER_ID_PLACEHOLDER) {
                continue;
            }

            match try_parse_json(value.clone()) {
                Value::Object(nested) => {
                    self.visit(&nested, in_custom_data || key == CUSTOM_DATA_FIELD);
                }
                leaf => {
                    let out_key = if in_custom_data {
                        format!("{CUSTOM_DATA_PREFIX}{key}")
                    } else {
                        key.clone()
                    };
                    self.fields.insert(out_key, leaf);
                }
            }
        }
    }
}
