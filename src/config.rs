use std::env;
use std::num::ParseIntError;

pub const DEFAULT_ENDPOINT: &str = "https://api.segment.io/v1";

#[derive(Debug, Clone)]
pub struct Config {
    /// Segment write key. Absence is not fatal for the adapter itself, only
    /// for sink construction - the webhook keeps answering with forwarding
    /// skipped.
    pub write_key: Option<String>,
    pub endpoint: String,
    pub dispatch_timeout_millis: u64,
}

impl Config {
    pub fn load_from_env() -> Result<Config, String> {
        let conf = Config {
            write_key: env::var("SEGMENT_WRITE_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            endpoint: env::var("SEGMENT_ENDPOINT").unwrap_or(DEFAULT_ENDPOINT.to_string()),
            dispatch_timeout_millis: env::var("DISPATCH_TIMEOUT_MS")
                .unwrap_or("3000".to_string())
                .parse::<u64>()
                .map_err(|e: ParseIntError| {
                    format!("Error parsing DISPATCH_TIMEOUT_MS to u64 - {}", e)
                })?,
        };

        Ok(conf)
    }
}
