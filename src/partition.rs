use once_cell::sync::Lazy;
use serde_json::{Map, Number, Value};
use std::collections::HashSet;

use crate::flatten::CUSTOM_DATA_PREFIX;

/// Segment envelope fields that must never be copied into track properties.
static RESERVED_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "event",
        "userId",
        "anonymousId",
        "timestamp",
        "properties",
        "traits",
        "context",
        "integrations",
        "messageId",
        "sentAt",
        "receivedAt",
        "type",
        "version",
        "channel",
    ]
    .into_iter()
    .collect()
});

/// Trait keys that aggregate into `traits.address`.
static ADDRESS_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "country_code",
        "city",
        "postal_code",
        "state",
        "region",
        "street",
        "ip",
        "custom_data.last_city",
    ]
    .into_iter()
    .collect()
});

/// The closed set of flattened keys eligible for identify traits.
static TRAIT_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    let mut keys: HashSet<&'static str> = [
        "custom_data.email",
        "custom_data.name",
        "custom_data.first_name",
        "custom_data.last_name",
        "custom_data.dob",
        "custom_data.gender",
        "custom_data.phone",
        "custom_data.mobile",
        "custom_data.latitude",
        "custom_data.longitude",
        "custom_data.braze_customer_id",
        // attribution/install metadata carried verbatim on the profile
        "media_source",
        "campaign",
        "af_status",
        "af_channel",
        "install_time",
    ]
    .into_iter()
    .collect();
    keys.extend(ADDRESS_KEYS.iter().copied());
    keys
});

/// Identity traits and event properties derived from the same flattened
/// record. The two outputs are independent projections; a key may appear in
/// both.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Partitioned {
    pub traits: Map<String, Value>,
    pub properties: Map<String, Value>,
}

/// Split the flattened fields into identify traits and track properties.
/// Null values are skipped entirely. Address-related trait keys accumulate
/// into `traits.address` (present only when at least one was observed), with
/// country/city/ip mirrored onto flat and `$`-prefixed legacy trait names.
pub fn partition(fields: &Map<String, Value>) -> Partitioned {
    let mut traits = Map::new();
    let mut properties = Map::new();
    let mut address = Map::new();

    for (key, value) in fields {
        if value.is_null() {
            continue;
        }

        if TRAIT_KEYS.contains(key.as_str()) {
            if ADDRESS_KEYS.contains(key.as_str()) {
                route_address(key, value, &mut traits, &mut address);
            } else if let Some(suffix) = key.strip_prefix(CUSTOM_DATA_PREFIX) {
                if let CustomField::Mapped(name, mapped) = map_custom_field(suffix, value) {
                    traits.insert(name, mapped);
                }
            } else {
                traits.insert(key.clone(), value.clone());
            }
        }

        if !RESERVED_KEYS.contains(key.as_str()) {
            if let Some(suffix) = key.strip_prefix(CUSTOM_DATA_PREFIX) {
                match map_custom_field(suffix, value) {
                    CustomField::Mapped(name, mapped) => {
                        properties.insert(name, mapped);
                    }
                    CustomField::Dropped => {}
                    CustomField::Unmapped => {
                        // unrecognized custom fields are kept under their
                        // prefixed name unless effectively empty
                        if !is_blank(value) {
                            properties.insert(key.clone(), value.clone());
                        }
                    }
                }
            } else {
                properties.insert(key.clone(), value.clone());
            }
        }
    }

    if !address.is_empty() {
        traits.insert("address".to_string(), Value::Object(address));
    }

    Partitioned { traits, properties }
}

fn route_address(
    key: &str,
    value: &Value,
    traits: &mut Map<String, Value>,
    address: &mut Map<String, Value>,
) {
    match key {
        "country_code" => {
            address.insert("country".to_string(), value.clone());
            mirror(traits, "country", value);
        }
        "city" => {
            address.insert("city".to_string(), value.clone());
            mirror(traits, "city", value);
        }
        "ip" => {
            address.insert("ip".to_string(), value.clone());
            mirror(traits, "ip", value);
        }
        "postal_code" => {
            address.insert("postalCode".to_string(), value.clone());
        }
        "custom_data.last_city" => {
            address.insert("city".to_string(), value.clone());
        }
        other => {
            address.insert(other.to_string(), value.clone());
        }
    }
}

/// Write a trait under its normal name and its `$`-prefixed legacy alias.
fn mirror(traits: &mut Map<String, Value>, name: &str, value: &Value) {
    traits.insert(name.to_string(), value.clone());
    traits.insert(format!("${name}"), value.clone());
}

enum CustomField {
    /// Renamed (and possibly coerced) onto a canonical field name.
    Mapped(String, Value),
    /// Recognized but empty after normalization; omit from both outputs.
    Dropped,
    /// Not one of the known custom fields.
    Unmapped,
}

fn map_custom_field(suffix: &str, value: &Value) -> CustomField {
    match suffix {
        "email" | "name" | "first_name" | "last_name" | "dob" => {
            CustomField::Mapped(suffix.to_string(), value.clone())
        }
        "gender" => match value.as_str() {
            Some(s) if s.trim().is_empty() => CustomField::Dropped,
            Some(s) => CustomField::Mapped("gender".to_string(), Value::String(s.trim().to_string())),
            None => CustomField::Mapped("gender".to_string(), value.clone()),
        },
        "phone" | "mobile" => CustomField::Mapped("phone".to_string(), value.clone()),
        "latitude" | "longitude" => match parse_float(value) {
            Some(parsed) => CustomField::Mapped(suffix.to_string(), parsed),
            None => CustomField::Dropped,
        },
        "braze_customer_id" => CustomField::Mapped("brazeCustomerId".to_string(), value.clone()),
        "last_city" => CustomField::Mapped("last_city".to_string(), value.clone()),
        _ => CustomField::Unmapped,
    }
}

fn parse_float(value: &Value) -> Option<Value> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.and_then(Number::from_f64).map(Value::Number)
}

fn is_blank(value: &Value) -> bool {
    matches!(value.as_str(), Some(s) if s.trim().is_empty())
}
