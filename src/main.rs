//! netrpc server.
//!
//! Usage: `netrpc [config.toml]`. Without a path the built-in defaults are
//! used (TCP on 5500, HTTP on 8080).

use std::path::Path;

use serde_json::{json, Value};

use netrpc::config::{load_config, HostConfig};
use netrpc::lifecycle::{signals::shutdown_signal, startup::build_host};
use netrpc::observability::{logging::init_logging, metrics::init_metrics};
use netrpc::rpc::{ApiError, ApiHost};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => load_config(Path::new(&path))?,
        None => HostConfig::default(),
    };

    init_logging(&config.observability.log_level);
    tracing::info!("netrpc v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        name = %config.host.name,
        endpoints = ?config.host.endpoints,
        session_timeout_secs = config.session.timeout_secs,
        framing = ?config.session.framing,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let host = build_host(&config)?;
    register_demo(&host);
    host.start()?;

    shutdown_signal().await;
    host.stop("Shutdown");

    tracing::info!("Shutdown complete");
    Ok(())
}

fn register_demo(host: &ApiHost) {
    host.register("Demo/Echo", |_, args| Ok(Value::Object(args)));
    host.register("Demo/Add", |_, args| {
        let operand = |key: &str| {
            args.get(key)
                .and_then(|v| v.as_f64().or_else(|| v.as_str()?.parse().ok()))
                .ok_or_else(|| ApiError::generic(format!("missing numeric argument `{key}`")))
        };
        Ok(json!(operand("a")? + operand("b")?))
    });
}
