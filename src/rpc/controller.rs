//! Built-in `Api/*` actions every host exposes.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

use super::action::{ActionContext, Controller};
use super::encoder::Args;
use super::error::ApiError;

/// `Api/All` lists action names; `Api/Info` describes the host and caller.
pub struct ApiController;

impl Controller for ApiController {
    fn name() -> &'static str {
        "Api"
    }

    fn actions() -> &'static [&'static str] {
        &["All", "Info"]
    }

    fn execute(&self, ctx: &ActionContext<'_>, method: &str, _args: Args) -> Result<Value, ApiError> {
        match method {
            "All" => Ok(json!(ctx.host.manager().names())),
            "Info" => {
                let time = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default();
                Ok(json!({
                    "name": ctx.host.name(),
                    "version": env!("CARGO_PKG_VERSION"),
                    "session": ctx.session.id,
                    "remote": ctx.session.remote.map(|addr| addr.to_string()),
                    "time": time,
                    "uptime_secs": ctx.host.uptime().as_secs(),
                    "actions": ctx.host.manager().len(),
                }))
            }
            other => Err(ApiError::not_found(&format!("Api/{}", other))),
        }
    }
}
