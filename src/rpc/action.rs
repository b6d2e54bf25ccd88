//! Action registry.
//!
//! # Responsibilities
//! - Map action names (`Controller/method`) to invocable handlers
//! - Build controller instances per call, or once per session when sticky
//! - Enumerate `(name, descriptor)` pairs for diagnostics
//!
//! # Design Decisions
//! - Lookup is exact and case-sensitive
//! - Registration is explicit; a controller lists its own methods

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde_json::Value;

use super::encoder::Args;
use super::error::ApiError;
use super::host::HostCore;

type ActionFn = dyn Fn(&ActionContext<'_>, Args) -> Result<Value, ApiError> + Send + Sync;

/// A named, invocable unit of application logic.
#[derive(Clone)]
pub struct ApiAction {
    name: String,
    descriptor: String,
    handler: Arc<ActionFn>,
}

impl ApiAction {
    pub fn new<F>(name: impl Into<String>, descriptor: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&ActionContext<'_>, Args) -> Result<Value, ApiError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
            handler: Arc::new(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn invoke(&self, ctx: &ActionContext<'_>, args: Args) -> Result<Value, ApiError> {
        (self.handler)(ctx, args)
    }
}

impl std::fmt::Debug for ApiAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiAction")
            .field("name", &self.name)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Controller instances kept for one session (sticky routing).
#[derive(Default)]
pub struct ControllerCache {
    items: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ControllerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session's instance of `C`, created on first use.
    pub fn get_or_insert_with<C, F>(&self, make: F) -> Option<Arc<C>>
    where
        C: Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        let item = self
            .items
            .entry(TypeId::of::<C>())
            .or_insert_with(|| Arc::new(make()) as Arc<dyn Any + Send + Sync>)
            .value()
            .clone();
        item.downcast::<C>().ok()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Identity of the peer a call came from.
#[derive(Clone)]
pub struct SessionInfo {
    /// Session id, 0 when the transport has no session (plain HTTP).
    pub id: u32,
    pub remote: Option<SocketAddr>,
    pub controllers: Arc<ControllerCache>,
}

impl SessionInfo {
    pub fn new(id: u32, remote: Option<SocketAddr>) -> Self {
        Self {
            id,
            remote,
            controllers: Arc::new(ControllerCache::new()),
        }
    }
}

impl std::fmt::Debug for SessionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInfo")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

/// Everything an action can see about the call it serves.
pub struct ActionContext<'a> {
    pub action: &'a str,
    pub session: &'a SessionInfo,
    pub host: &'a HostCore,
}

impl ActionContext<'_> {
    /// Whether controllers are reused per session.
    pub fn reusable(&self) -> bool {
        self.host.reusable()
    }
}

/// A group of actions sharing one instance type.
pub trait Controller: Send + Sync + 'static {
    /// Prefix of every action this controller registers.
    fn name() -> &'static str
    where
        Self: Sized;

    /// Method names exposed as `<name>/<method>`.
    fn actions() -> &'static [&'static str]
    where
        Self: Sized;

    fn execute(&self, ctx: &ActionContext<'_>, method: &str, args: Args) -> Result<Value, ApiError>;
}

/// Name → action table.
#[derive(Default)]
pub struct ApiManager {
    actions: RwLock<BTreeMap<String, ApiAction>>,
}

impl ApiManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under `name`, replacing any previous one.
    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(&ActionContext<'_>, Args) -> Result<Value, ApiError> + Send + Sync + 'static,
    {
        let descriptor = std::any::type_name::<F>();
        self.register_action(ApiAction::new(name, descriptor, handler));
    }

    pub fn register_action(&self, action: ApiAction) {
        self.actions
            .write()
            .expect("action table lock poisoned")
            .insert(action.name.clone(), action);
    }

    /// Register every method of controller `C`. Returns how many were added.
    pub fn register_controller<C, F>(&self, factory: F) -> usize
    where
        C: Controller,
        F: Fn() -> C + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        for method in C::actions() {
            let method: &'static str = *method;
            let factory = factory.clone();
            let name = format!("{}/{}", C::name(), method);
            let descriptor = format!("{}::{}", std::any::type_name::<C>(), method);
            self.register_action(ApiAction::new(name, descriptor, move |ctx, args| {
                let controller = if ctx.reusable() {
                    ctx.session
                        .controllers
                        .get_or_insert_with(|| (*factory)())
                        .unwrap_or_else(|| Arc::new((*factory)()))
                } else {
                    Arc::new((*factory)())
                };
                controller.execute(ctx, method, args)
            }));
        }
        C::actions().len()
    }

    pub fn find(&self, name: &str) -> Option<ApiAction> {
        self.actions
            .read()
            .expect("action table lock poisoned")
            .get(name)
            .cloned()
    }

    /// `(name, descriptor)` pairs sorted by name.
    pub fn services(&self) -> Vec<(String, String)> {
        self.actions
            .read()
            .expect("action table lock poisoned")
            .values()
            .map(|a| (a.name.clone(), a.descriptor.clone()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.actions
            .read()
            .expect("action table lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.actions.read().expect("action table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter;

    #[test]
    fn cache_returns_same_instance() {
        let cache = ControllerCache::new();
        let a = cache.get_or_insert_with(|| Counter).unwrap();
        let b = cache.get_or_insert_with(|| Counter).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let manager = ApiManager::new();
        manager.register("Demo/Echo", |_, args| Ok(Value::Object(args)));
        assert!(manager.find("Demo/Echo").is_some());
        assert!(manager.find("demo/echo").is_none());
        assert_eq!(manager.names(), vec!["Demo/Echo".to_string()]);
    }
}
