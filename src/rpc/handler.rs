//! Action dispatcher.

use serde_json::Value;

use super::action::ActionContext;
use super::encoder::Args;
use super::error::ApiError;

/// Resolves and runs the action named in the context.
pub trait ApiHandler: Send + Sync {
    fn execute(&self, ctx: &ActionContext<'_>, args: Args) -> Result<Value, ApiError>;
}

/// Looks the action up in the host's registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandler;

impl ApiHandler for DefaultHandler {
    fn execute(&self, ctx: &ActionContext<'_>, args: Args) -> Result<Value, ApiError> {
        let action = ctx
            .host
            .manager()
            .find(ctx.action)
            .ok_or_else(|| ApiError::not_found(ctx.action))?;
        action.invoke(ctx, args)
    }
}
