//! RPC peer over one connection.
//!
//! Both ends of a connection are peers: either may send requests, and each
//! routes inbound replies to its own pending calls.

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use super::action::SessionInfo;
use super::encoder::{Args, Encoder};
use super::error::ApiError;
use super::host::{Dispatcher, HostCore};
use super::message::Message;
use crate::net::{Connection, NetSession, SessionCore};

pub struct ApiSession {
    connection: Arc<Connection>,
    info: SessionInfo,
    dispatcher: Dispatcher,
    sequence: AtomicU32,
    pending: DashMap<u32, oneshot::Sender<Message>>,
}

impl ApiSession {
    pub fn new(connection: Arc<Connection>, info: SessionInfo, dispatcher: Dispatcher) -> Self {
        Self {
            connection,
            info,
            dispatcher,
            sequence: AtomicU32::new(0),
            pending: DashMap::new(),
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn host(&self) -> &Arc<HostCore> {
        &self.dispatcher.host
    }

    pub fn encoder(&self) -> &Arc<dyn Encoder> {
        &self.dispatcher.encoder
    }

    /// Calls still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Request message with a fresh sequence number.
    pub fn create_message(&self, payload: Vec<u8>) -> Message {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        Message::request(sequence, payload)
    }

    /// Send a request and wait for its correlated reply.
    pub async fn send_message(&self, message: Message) -> Result<Message, ApiError> {
        let sequence = message.sequence;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(sequence, tx);

        if let Err(e) = self.connection.send(&message.to_bytes()).await {
            self.pending.remove(&sequence);
            return Err(e.into());
        }

        let timeout = self.host().call_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ApiError::generic("connection closed before reply")),
            Err(_) => {
                self.pending.remove(&sequence);
                Err(ApiError::new(
                    ApiError::TIMEOUT,
                    format!("no reply within {:?}", timeout),
                ))
            }
        }
    }

    /// Hand a reply to the call waiting for it.
    pub fn complete(&self, reply: Message) -> bool {
        match self.pending.remove(&reply.sequence) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => {
                tracing::debug!(sequence = reply.sequence, "Reply without a pending call");
                false
            }
        }
    }

    /// Fail every pending call.
    pub fn fail_all(&self) {
        self.pending.clear();
    }

    /// Route one inbound packet. Returns the encoded reply for requests.
    pub fn handle_packet(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let Some(message) = Message::from_bytes(packet) else {
            tracing::debug!(session_id = self.info.id, bytes = packet.len(), "Malformed packet dropped");
            return None;
        };
        if message.reply {
            self.complete(message);
            return None;
        }
        self.dispatcher
            .process(&self.info, message)
            .map(|reply| reply.to_bytes())
    }

    pub async fn invoke<T: DeserializeOwned>(&self, action: &str, args: Args) -> Result<T, ApiError> {
        self.host().invoke(self, action, args).await
    }

    pub async fn invoke_dict(&self, action: &str, args: Args) -> Result<Args, ApiError> {
        self.host().invoke_dict(self, action, args).await
    }

    pub async fn invoke_raw(&self, action: &str, args: Args) -> Result<Vec<u8>, ApiError> {
        self.host().invoke_raw(self, action, args).await
    }
}

/// Server-side session running the dispatch pipeline.
pub struct ApiNetSession {
    core: SessionCore,
    api: ApiSession,
}

impl ApiNetSession {
    pub fn new(core: SessionCore, dispatcher: Dispatcher) -> Self {
        let info = SessionInfo::new(core.id(), Some(core.remote()));
        let api = ApiSession::new(core.connection().clone(), info, dispatcher);
        Self { core, api }
    }

    pub fn api(&self) -> &ApiSession {
        &self.api
    }
}

impl NetSession for ApiNetSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn on_receive(&self, packet: &[u8]) -> Option<Vec<u8>> {
        self.api.handle_packet(packet)
    }

    fn on_dispose(&self) {
        self.api.fail_all();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
