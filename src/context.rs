use serde::Serialize;
use serde_json::{Map, Value};

/// Fixed library name reported to Segment alongside the AppsFlyer SDK version.
const LIBRARY_NAME: &str = env!("CARGO_PKG_NAME");

/// Structured environment metadata derived from the flattened event.
/// Sub-objects are sparse: each is present only when at least one of its
/// contributing fields was present in the payload.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct EventContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<AppContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign: Option<CampaignContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<OsContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<LibraryContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen: Option<ScreenContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<Value>,
    #[serde(rename = "userAgent", skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<Value>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct AppContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<Value>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct DeviceContext {
    #[serde(rename = "advertisingId", skip_serializing_if = "Option::is_none")]
    pub advertising_id: Option<Value>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub device_type: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(rename = "adTrackingEnabled", skip_serializing_if = "Option::is_none")]
    pub ad_tracking_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<Value>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct CampaignContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medium: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct OsContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LibraryContext {
    pub name: &'static str,
    pub version: Value,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ScreenContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub density: Option<Value>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct NetworkContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carrier: Option<Value>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct LocationContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(rename = "postalCode", skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<Value>,
}

/// Derive the Segment context from the flattened fields. Pure projection;
/// the input is not mutated.
pub fn build_context(fields: &Map<String, Value>) -> EventContext {
    let get = |key: &str| fields.get(key).filter(|v| !v.is_null()).cloned();

    let app = sparse(AppContext {
        name: get("app_name").or_else(|| get("app_id")),
        namespace: get("bundle_id"),
        version: get("app_version"),
        build: get("api_version"),
    });

    let device = sparse(DeviceContext {
        advertising_id: get("advertising_id").or_else(|| get("idfa")),
        device_type: get("platform"),
        model: get("device_model"),
        name: get("device_name"),
        id: get("idfv"),
        ad_tracking_enabled: fields
            .get("att")
            .and_then(Value::as_str)
            .map(|att| att == "authorized"),
        manufacturer: get("manufacturer"),
    });

    let campaign = sparse(CampaignContext {
        source: get("media_source"),
        name: get("campaign").or_else(|| get("campaign_name")),
        medium: get("campaign_medium"),
        term: get("campaign_term"),
        content: get("campaign_content"),
    });

    // os is gated on either field, and Apple platforms report "iPhone OS"
    let platform = get("platform");
    let os_version = get("os_version");
    let os = (platform.is_some() || os_version.is_some()).then(|| OsContext {
        name: platform.map(|p| {
            if p.as_str() == Some("ios") {
                Value::String("iPhone OS".to_string())
            } else {
                p
            }
        }),
        version: os_version,
    });

    let library = get("sdk_version").map(|version| LibraryContext {
        name: LIBRARY_NAME,
        version,
    });

    let screen = sparse(ScreenContext {
        width: get("screen_width"),
        height: get("screen_height"),
        density: get("screen_density"),
    });

    let network = sparse(NetworkContext {
        // wifi is a boolean and must survive even when false
        wifi: get("wifi"),
        carrier: get("carrier"),
    });

    let location = sparse(LocationContext {
        country: get("country_code"),
        city: get("city"),
        region: get("region"),
        state: get("state"),
        postal_code: get("postal_code"),
        latitude: get("latitude"),
        longitude: get("longitude"),
    });

    EventContext {
        app,
        device,
        campaign,
        os,
        library,
        screen,
        network,
        location,
        ip: get("ip"),
        timezone: get("selected_timezone").or_else(|| get("timezone")),
        locale: get("locale"),
        user_agent: get("user_agent"),
    }
}

/// Keep a sub-object only when at least one field contributed to it.
fn sparse<T: Default + PartialEq>(candidate: T) -> Option<T> {
    (candidate != T::default()).then_some(candidate)
}
