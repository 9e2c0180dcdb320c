use appsflyer_segment_webhook::config;
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde_json::Value;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    appsflyer_segment_webhook::set_up_logging();

    info!(
        "Initializing {} version {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = config::Config::load_from_env()?;

    // A missing write key disables forwarding but must not take the webhook
    // down: the adapter keeps answering callers either way.
    let sink = match appsflyer_segment_webhook::set_up_segment_sink(&config) {
        Ok(sink) => Some(sink),
        Err(e) => {
            error!("Segment sink initialization failed, events will not be forwarded: {}", e);
            None
        }
    };

    run(service_fn(|request: LambdaEvent<Value>| {
        appsflyer_segment_webhook::function_handler(sink.clone(), &config, request)
    }))
    .await
}
