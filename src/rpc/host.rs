//! RPC host: protocol servers, registry, encoder and filter chain.
//!
//! # Responsibilities
//! - Resolve connection strings to protocol servers through a [`ProviderMap`]
//! - Share one encoder and one handler with every server on start
//! - Run the dispatch pipeline for every inbound request
//! - Issue outbound calls over a connected session
//!
//! # Dispatch
//! ```text
//! inbound message
//!     → reply? stop (handled by the waiting caller)
//!     → filters (reverse)
//!     → decode (action, args), undecodable? stop
//!     → handler (lookup + invoke, faults mapped to code/message)
//!     → encode (code, result) into a correlated reply
//!     → filters (forward)
//!     → back to the protocol server
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::{Handle, RuntimeFlavor};

use super::action::{ActionContext, ApiManager, Controller, SessionInfo};
use super::controller::ApiController;
use super::encoder::{Args, Encoder, JsonEncoder};
use super::error::{ApiError, HostError};
use super::filter::{Filter, FilterChain};
use super::handler::{ApiHandler, DefaultHandler};
use super::message::Message;
use super::net_server::ApiNetServer;
use super::session::ApiSession;
use crate::http::ApiHttpServer;
use crate::net::{Framing, NetUri};
use crate::observability::metrics;

/// Default timeout for outbound calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Settings a host hands to every protocol server it creates.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub session_timeout: Option<Duration>,
    pub framing: Framing,
    pub max_frame_len: usize,
    pub use_session: bool,
    pub udp_concurrency_ratio: f64,
    /// HTTP request timeout.
    pub request_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            session_timeout: None,
            framing: Framing::LengthPrefixed,
            max_frame_len: 1024 * 1024,
            use_session: true,
            udp_concurrency_ratio: crate::net::server::DEFAULT_UDP_CONCURRENCY_RATIO,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// A protocol-specific server owned by an [`ApiHost`].
pub trait ApiServer: Send + Sync {
    fn name(&self) -> String;

    /// Configure for an endpoint. Returns false when the endpoint is unusable.
    fn init(&mut self, uri: &NetUri, settings: &ServerSettings) -> bool;

    fn encoder(&self) -> Option<Arc<dyn Encoder>>;
    fn set_encoder(&self, encoder: Arc<dyn Encoder>);

    fn handler(&self) -> Option<Arc<dyn ApiHandler>>;
    fn set_handler(&self, handler: Arc<dyn ApiHandler>);

    fn set_provider(&self, host: Arc<HostCore>);

    fn start(&self) -> Result<(), HostError>;
    fn stop(&self, reason: &str);
    fn is_active(&self) -> bool;

    /// Endpoint; the port is the bound one once started.
    fn local(&self) -> NetUri;

    fn as_any(&self) -> &dyn Any;
}

pub type ServerConstructor = Arc<dyn Fn() -> Box<dyn ApiServer> + Send + Sync>;

/// Protocol token → server constructor. Tokens are case-insensitive.
#[derive(Clone)]
pub struct ProviderMap {
    providers: HashMap<String, ServerConstructor>,
}

impl ProviderMap {
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn insert<F>(&mut self, token: &str, constructor: F)
    where
        F: Fn() -> Box<dyn ApiServer> + Send + Sync + 'static,
    {
        self.providers
            .insert(token.to_ascii_lowercase(), Arc::new(constructor));
    }

    pub fn get(&self, token: &str) -> Option<ServerConstructor> {
        self.providers.get(&token.to_ascii_lowercase()).cloned()
    }

    pub fn tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.providers.keys().cloned().collect();
        tokens.sort();
        tokens
    }
}

impl Default for ProviderMap {
    fn default() -> Self {
        let mut map = Self::empty();
        for token in ["tcp", "udp", "", "unknown"] {
            map.insert(token, || Box::new(ApiNetServer::new()) as Box<dyn ApiServer>);
        }
        for token in ["http", "ws"] {
            map.insert(token, || Box::new(ApiHttpServer::new()) as Box<dyn ApiServer>);
        }
        map
    }
}

/// Encoder and handler bound to one protocol server.
#[derive(Clone)]
pub struct Dispatcher {
    pub host: Arc<HostCore>,
    pub encoder: Arc<dyn Encoder>,
    pub handler: Arc<dyn ApiHandler>,
}

impl Dispatcher {
    pub fn process(&self, session: &SessionInfo, message: Message) -> Option<Message> {
        self.host
            .process_with(&*self.encoder, &*self.handler, session, message)
    }
}

/// State shared between the host and its servers and sessions.
pub struct HostCore {
    name: String,
    manager: ApiManager,
    encoder: RwLock<Option<Arc<dyn Encoder>>>,
    handler: RwLock<Option<Arc<dyn ApiHandler>>>,
    filters: ArcSwap<FilterChain>,
    reusable: AtomicBool,
    call_timeout_ms: AtomicU64,
    started: Instant,
}

impl HostCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            manager: ApiManager::new(),
            encoder: RwLock::new(None),
            handler: RwLock::new(None),
            filters: ArcSwap::from_pointee(FilterChain::new()),
            reusable: AtomicBool::new(false),
            call_timeout_ms: AtomicU64::new(DEFAULT_CALL_TIMEOUT.as_millis() as u64),
            started: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager(&self) -> &ApiManager {
        &self.manager
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// The shared encoder, a [`JsonEncoder`] unless one was set.
    pub fn encoder(&self) -> Arc<dyn Encoder> {
        if let Some(encoder) = self.encoder.read().expect("encoder lock poisoned").as_ref() {
            return encoder.clone();
        }
        self.encoder
            .write()
            .expect("encoder lock poisoned")
            .get_or_insert_with(|| Arc::new(JsonEncoder))
            .clone()
    }

    pub fn set_encoder(&self, encoder: Arc<dyn Encoder>) {
        *self.encoder.write().expect("encoder lock poisoned") = Some(encoder);
    }

    /// The shared handler, a [`DefaultHandler`] unless one was set.
    pub fn handler(&self) -> Arc<dyn ApiHandler> {
        if let Some(handler) = self.handler.read().expect("handler lock poisoned").as_ref() {
            return handler.clone();
        }
        self.handler
            .write()
            .expect("handler lock poisoned")
            .get_or_insert_with(|| Arc::new(DefaultHandler))
            .clone()
    }

    pub fn set_handler(&self, handler: Arc<dyn ApiHandler>) {
        *self.handler.write().expect("handler lock poisoned") = Some(handler);
    }

    pub fn filters(&self) -> Arc<FilterChain> {
        self.filters.load_full()
    }

    pub fn add_filter(&self, filter: Arc<dyn Filter>) {
        self.filters.rcu(|chain| chain.with(filter.clone()));
    }

    pub fn reusable(&self) -> bool {
        self.reusable.load(Ordering::Relaxed)
    }

    pub fn set_reusable(&self, reusable: bool) {
        self.reusable.store(reusable, Ordering::Relaxed);
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_call_timeout(&self, timeout: Duration) {
        self.call_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Dispatcher using the host-wide encoder and handler.
    pub fn dispatcher(self: &Arc<Self>) -> Dispatcher {
        Dispatcher {
            host: self.clone(),
            encoder: self.encoder(),
            handler: self.handler(),
        }
    }

    pub fn execute_filters(&self, message: &mut Message, is_send: bool) {
        let chain = self.filters.load();
        if !chain.is_empty() {
            chain.apply(message, is_send);
        }
    }

    /// Run the dispatch pipeline with the host-wide encoder and handler.
    pub fn process(&self, session: &SessionInfo, message: Message) -> Option<Message> {
        let encoder = self.encoder();
        let handler = self.handler();
        self.process_with(&*encoder, &*handler, session, message)
    }

    /// Dispatch one inbound message. `None` means no reply is sent.
    pub fn process_with(
        &self,
        encoder: &dyn Encoder,
        handler: &dyn ApiHandler,
        session: &SessionInfo,
        mut message: Message,
    ) -> Option<Message> {
        if message.reply {
            return None;
        }

        self.execute_filters(&mut message, false);

        let dict = encoder.decode(&message.payload)?;
        let Some((action, args)) = encoder.try_get_request(&dict) else {
            tracing::debug!(session_id = session.id, "Payload is not a request, dropped");
            return None;
        };

        let started = Instant::now();
        let ctx = ActionContext {
            action: &action,
            session,
            host: self,
        };
        let outcome =
            run_blocking(|| panic::catch_unwind(AssertUnwindSafe(|| handler.execute(&ctx, args))));
        let (code, result) = match outcome {
            Ok(Ok(value)) => (0, value),
            Ok(Err(e)) => {
                tracing::debug!(action = %action, code = e.code, error = %e.message, "Action failed");
                (e.code, Value::String(e.message))
            }
            Err(panic) => {
                let text = panic_message(panic.as_ref());
                tracing::error!(action = %action, panic = %text, "Action panicked");
                (ApiError::GENERIC, Value::String(text))
            }
        };
        metrics::record_dispatch(&action, code, started);

        let payload = match encoder.encode_response(code, &result) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(action = %action, error = %e, "Result could not be encoded");
                encoder
                    .encode_response(ApiError::GENERIC, &Value::String(e.message))
                    .ok()?
            }
        };

        let mut reply = message.create_reply();
        reply.error = code != 0;
        reply.payload = payload;
        self.execute_filters(&mut reply, true);
        Some(reply)
    }

    /// Call `action` on the peer behind `session`; returns the reply payload.
    pub async fn invoke_raw(
        &self,
        session: &ApiSession,
        action: &str,
        args: Args,
    ) -> Result<Vec<u8>, ApiError> {
        let payload = session.encoder().encode_request(action, &args)?;
        let mut request = session.create_message(payload);
        self.execute_filters(&mut request, true);

        let mut reply = session.send_message(request).await?;
        self.execute_filters(&mut reply, false);
        Ok(reply.payload)
    }

    async fn invoke_value(
        &self,
        session: &ApiSession,
        action: &str,
        args: Args,
    ) -> Result<Value, ApiError> {
        let payload = self.invoke_raw(session, action, args).await?;
        let encoder = session.encoder();
        let (code, result) = encoder
            .decode(&payload)
            .and_then(|dict| encoder.try_get_response(&dict))
            .ok_or_else(|| ApiError::generic(format!("invalid reply to `{}`", action)))?;
        if code != 0 {
            let message = match result {
                Value::String(text) => text,
                other => other.to_string(),
            };
            return Err(ApiError::new(code, message));
        }
        Ok(result)
    }

    /// Call `action` and return the result dictionary.
    pub async fn invoke_dict(
        &self,
        session: &ApiSession,
        action: &str,
        args: Args,
    ) -> Result<Args, ApiError> {
        match self.invoke_value(session, action, args).await? {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Args::new()),
            other => Err(ApiError::generic(format!(
                "reply to `{}` is not a dictionary: {}",
                action, other
            ))),
        }
    }

    /// Call `action` and convert the result to `T`.
    pub async fn invoke<T: DeserializeOwned>(
        &self,
        session: &ApiSession,
        action: &str,
        args: Args,
    ) -> Result<T, ApiError> {
        let value = self.invoke_value(session, action, args).await?;
        session.encoder().convert(value)
    }
}

/// Run a synchronous action. On a multi-thread runtime the worker hands its
/// other tasks off first, so a slow action only holds its own task.
fn run_blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "action panicked".to_string()
    }
}

/// An RPC host listening on any number of protocol servers.
pub struct ApiHost {
    core: Arc<HostCore>,
    providers: ProviderMap,
    settings: RwLock<ServerSettings>,
    servers: Mutex<Vec<Arc<dyn ApiServer>>>,
    active: AtomicBool,
}

impl ApiHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_providers(name, ProviderMap::default())
    }

    pub fn with_providers(name: impl Into<String>, providers: ProviderMap) -> Self {
        let core = Arc::new(HostCore::new(name));
        core.manager().register_controller(|| ApiController);
        Self {
            core,
            providers,
            settings: RwLock::new(ServerSettings::default()),
            servers: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
        }
    }

    pub fn core(&self) -> &Arc<HostCore> {
        &self.core
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn manager(&self) -> &ApiManager {
        self.core.manager()
    }

    pub fn settings(&self) -> ServerSettings {
        self.settings.read().expect("settings lock poisoned").clone()
    }

    /// Settings used by servers added afterwards.
    pub fn set_settings(&self, settings: ServerSettings) {
        *self.settings.write().expect("settings lock poisoned") = settings;
    }

    pub fn providers(&self) -> &ProviderMap {
        &self.providers
    }

    /// Add a server for a `protocol://host:port[/path]` string.
    pub fn add(&self, connection: &str) -> Option<Arc<dyn ApiServer>> {
        match NetUri::parse(connection) {
            Ok(uri) => self.add_uri(uri),
            Err(e) => {
                tracing::warn!(endpoint = connection, error = %e, "Endpoint rejected");
                None
            }
        }
    }

    pub fn add_uri(&self, uri: NetUri) -> Option<Arc<dyn ApiServer>> {
        let Some(constructor) = self.providers.get(uri.protocol.token()) else {
            tracing::warn!(endpoint = %uri, "No server provider for protocol");
            return None;
        };

        let mut server = constructor();
        if !server.init(&uri, &self.settings()) {
            tracing::warn!(endpoint = %uri, server = %server.name(), "Server failed to initialise");
            return None;
        }

        let server: Arc<dyn ApiServer> = Arc::from(server);
        server.set_provider(self.core.clone());
        self.servers.lock().expect("server list mutex poisoned").push(server.clone());
        Some(server)
    }

    /// Attach a preconstructed server and return its typed handle.
    pub fn add_server<S: ApiServer + 'static>(&self, server: S) -> Arc<S> {
        let server = Arc::new(server);
        server.set_provider(self.core.clone());
        self.servers
            .lock()
            .expect("server list mutex poisoned")
            .push(server.clone() as Arc<dyn ApiServer>);
        server
    }

    pub fn servers(&self) -> Vec<Arc<dyn ApiServer>> {
        self.servers.lock().expect("server list mutex poisoned").clone()
    }

    /// First server of type `S`.
    pub fn server<S: ApiServer + 'static>(&self) -> Option<Arc<dyn ApiServer>> {
        self.servers()
            .into_iter()
            .find(|server| server.as_any().is::<S>())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Start every server. Fails fast: a server that cannot start stops the
    /// ones already started.
    pub fn start(&self) -> Result<(), HostError> {
        if self.is_active() {
            return Ok(());
        }

        let encoder = self.core.encoder();
        let handler = self.core.handler();
        let servers = self.servers();
        tracing::info!(host = %self.name(), servers = servers.len(), "Starting host");

        for (index, server) in servers.iter().enumerate() {
            if server.encoder().is_none() {
                server.set_encoder(encoder.clone());
            }
            if server.handler().is_none() {
                server.set_handler(handler.clone());
            }
            if let Err(e) = server.start() {
                tracing::error!(server = %server.name(), error = %e, "Server failed to start");
                for started in &servers[..index] {
                    started.stop("startup failed");
                }
                return Err(e);
            }
            tracing::info!(server = %server.name(), endpoint = %server.local(), "Server started");
        }

        self.active.store(true, Ordering::SeqCst);

        let services = self.manager().services();
        tracing::info!(host = %self.name(), actions = services.len(), "Available actions");
        for (name, descriptor) in services {
            tracing::info!(action = %name, descriptor = %descriptor, "  action");
        }
        Ok(())
    }

    pub fn stop(&self, reason: &str) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        for server in self.servers() {
            server.stop(reason);
        }
        tracing::info!(host = %self.name(), reason, "Host stopped");
    }

    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(&ActionContext<'_>, Args) -> Result<Value, ApiError> + Send + Sync + 'static,
    {
        self.core.manager().register(name, handler);
    }

    pub fn register_controller<C, F>(&self, factory: F) -> usize
    where
        C: Controller,
        F: Fn() -> C + Send + Sync + 'static,
    {
        self.core.manager().register_controller(factory)
    }

    pub fn add_filter(&self, filter: Arc<dyn Filter>) {
        self.core.add_filter(filter);
    }

    pub fn set_encoder(&self, encoder: Arc<dyn Encoder>) {
        self.core.set_encoder(encoder);
    }

    pub fn set_handler(&self, handler: Arc<dyn ApiHandler>) {
        self.core.set_handler(handler);
    }

    pub fn set_reusable(&self, reusable: bool) {
        self.core.set_reusable(reusable);
    }
}

impl Drop for ApiHost {
    fn drop(&mut self) {
        self.stop("Dispose");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NetType;

    #[test]
    fn provider_lookup_is_case_insensitive() {
        let providers = ProviderMap::default();
        assert!(providers.get("TCP").is_some());
        assert!(providers.get("Ws").is_some());
        assert!(providers.get("").is_some());
        assert!(providers.get("ftp").is_none());
    }

    #[test]
    fn unknown_provider_yields_no_server() {
        let host = ApiHost::with_providers("Empty", ProviderMap::empty());
        let uri = NetUri::new(NetType::Tcp, "127.0.0.1".parse().unwrap(), 0);
        assert!(host.add_uri(uri).is_none());
        assert!(host.add("ftp://127.0.0.1:21").is_none());
        assert!(host.servers().is_empty());
    }

    #[test]
    fn builtin_actions_are_registered() {
        let host = ApiHost::new("Builtin");
        let names = host.manager().names();
        assert!(names.contains(&"Api/All".to_string()));
        assert!(names.contains(&"Api/Info".to_string()));
    }

    #[test]
    fn handler_and_encoder_default_lazily() {
        let core = HostCore::new("Lazy");
        assert_eq!(core.encoder().name(), "json");
        let a = core.handler();
        let b = core.handler();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
