//! Socket protocol server (`tcp`, `udp`, or both).

use std::any::Any;
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwapOption;

use super::encoder::Encoder;
use super::error::HostError;
use super::handler::ApiHandler;
use super::host::{ApiServer, Dispatcher, HostCore, ServerSettings};
use super::session::ApiNetSession;
use crate::net::{
    AddressFamily, NetServer, NetSession, NetType, NetUri, PlainSession, ServerOptions,
};

/// Serves RPC over raw sockets through a [`NetServer`].
pub struct ApiNetServer {
    server: NetServer,
    encoder: RwLock<Option<Arc<dyn Encoder>>>,
    handler: RwLock<Option<Arc<dyn ApiHandler>>>,
    host: RwLock<Option<Arc<HostCore>>>,
    dispatcher: Arc<ArcSwapOption<Dispatcher>>,
}

impl ApiNetServer {
    pub fn new() -> Self {
        let dispatcher = Arc::new(ArcSwapOption::empty());
        let server = NetServer::new("Api", NetUri::default());
        install_factory(&server, &dispatcher);
        Self {
            server,
            encoder: RwLock::new(None),
            handler: RwLock::new(None),
            host: RwLock::new(None),
            dispatcher,
        }
    }

    pub fn net_server(&self) -> &NetServer {
        &self.server
    }

    /// Connected session by id, for calls back into the peer.
    pub fn session(&self, id: u32) -> Option<Arc<ApiNetSession>> {
        self.server.get_session_as::<ApiNetSession>(id)
    }
}

impl Default for ApiNetServer {
    fn default() -> Self {
        Self::new()
    }
}

fn install_factory(server: &NetServer, slot: &Arc<ArcSwapOption<Dispatcher>>) {
    let slot = slot.clone();
    server.set_session_factory(move |core| -> Arc<dyn NetSession> {
        match slot.load_full() {
            Some(dispatcher) => Arc::new(ApiNetSession::new(core, (*dispatcher).clone())),
            None => {
                core.close("host not started");
                Arc::new(PlainSession::new(core))
            }
        }
    });
}

impl ApiServer for ApiNetServer {
    fn name(&self) -> String {
        self.server.name().to_string()
    }

    fn init(&mut self, uri: &NetUri, settings: &ServerSettings) -> bool {
        if !matches!(uri.protocol, NetType::Tcp | NetType::Udp | NetType::Unknown) {
            return false;
        }

        let server = NetServer::new("Api", uri.clone());
        let family = if uri.address.is_unspecified() {
            AddressFamily::Unspecified
        } else {
            uri.family()
        };
        server.set_family(family);
        server.set_options(ServerOptions {
            session_timeout: settings.session_timeout,
            codec: settings.framing.codec(settings.max_frame_len),
            use_session: settings.use_session,
            udp_concurrency_ratio: settings.udp_concurrency_ratio,
        });
        install_factory(&server, &self.dispatcher);
        self.server = server;
        true
    }

    fn encoder(&self) -> Option<Arc<dyn Encoder>> {
        self.encoder.read().expect("encoder lock poisoned").clone()
    }

    fn set_encoder(&self, encoder: Arc<dyn Encoder>) {
        *self.encoder.write().expect("encoder lock poisoned") = Some(encoder);
    }

    fn handler(&self) -> Option<Arc<dyn ApiHandler>> {
        self.handler.read().expect("handler lock poisoned").clone()
    }

    fn set_handler(&self, handler: Arc<dyn ApiHandler>) {
        *self.handler.write().expect("handler lock poisoned") = Some(handler);
    }

    fn set_provider(&self, host: Arc<HostCore>) {
        *self.host.write().expect("host lock poisoned") = Some(host);
    }

    fn start(&self) -> Result<(), HostError> {
        let host = self
            .host
            .read()
            .expect("host lock poisoned")
            .clone()
            .ok_or_else(|| HostError::Init(self.name()))?;
        let encoder = self.encoder().unwrap_or_else(|| host.encoder());
        let handler = self.handler().unwrap_or_else(|| host.handler());
        self.dispatcher.store(Some(Arc::new(Dispatcher {
            host,
            encoder,
            handler,
        })));

        if self.server.start() {
            Ok(())
        } else {
            Err(HostError::Start {
                name: self.name(),
                reason: format!("no listener could bind {}", self.server.local()),
            })
        }
    }

    fn stop(&self, reason: &str) {
        self.server.stop(reason);
    }

    fn is_active(&self) -> bool {
        self.server.is_active()
    }

    fn local(&self) -> NetUri {
        self.server.local()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
