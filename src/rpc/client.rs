//! TCP client peer.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::action::SessionInfo;
use super::encoder::Args;
use super::error::ApiError;
use super::host::{ApiHost, HostCore, ServerSettings};
use super::session::ApiSession;
use crate::net::connection::pump_stream;
use crate::net::listener::INBOUND_QUEUE;
use crate::net::{Connection, NetType, NetUri, Statistics};

/// Connects to an RPC server and talks to it as a peer.
///
/// The client answers requests the server sends back over the same
/// connection using the host's registry.
pub struct ApiClient {
    session: Arc<ApiSession>,
    task: JoinHandle<()>,
}

impl ApiClient {
    pub async fn connect(address: SocketAddr, host: &ApiHost) -> Result<Self, ApiError> {
        Self::connect_with(address, host.core().clone(), &host.settings()).await
    }

    pub async fn connect_with(
        address: SocketAddr,
        host: Arc<HostCore>,
        settings: &ServerSettings,
    ) -> Result<Self, ApiError> {
        let stream = TcpStream::connect(address).await?;
        let _ = stream.set_nodelay(true);
        let local = stream.local_addr()?;
        let (reader, writer) = stream.into_split();

        let connection = Connection::tcp(
            NetUri::new(NetType::Tcp, local.ip(), local.port()),
            address,
            writer,
            settings.framing.codec(settings.max_frame_len),
            Arc::new(Statistics::new()),
        );
        let (tx, mut inbound) = mpsc::channel(INBOUND_QUEUE);
        tokio::spawn(pump_stream(
            reader,
            connection.clone(),
            tx,
            None,
            Arc::new(Statistics::new()),
        ));

        let session = Arc::new(ApiSession::new(
            connection.clone(),
            SessionInfo::new(0, Some(address)),
            host.dispatcher(),
        ));

        let peer = session.clone();
        let task = tokio::spawn(async move {
            while let Some(packet) = inbound.recv().await {
                if let Some(reply) = peer.handle_packet(&packet) {
                    if connection.send(&reply).await.is_err() {
                        break;
                    }
                }
            }
            peer.fail_all();
        });

        tracing::debug!(remote = %address, local = %local, "Client connected");
        Ok(Self { session, task })
    }

    pub fn session(&self) -> &Arc<ApiSession> {
        &self.session
    }

    pub fn is_connected(&self) -> bool {
        !self.session.connection().is_closed()
    }

    pub async fn invoke<T: DeserializeOwned>(&self, action: &str, args: Args) -> Result<T, ApiError> {
        self.session.invoke(action, args).await
    }

    pub async fn invoke_dict(&self, action: &str, args: Args) -> Result<Args, ApiError> {
        self.session.invoke_dict(action, args).await
    }

    pub fn close(&self) {
        self.session.connection().close("client closed");
        self.session.fail_all();
    }
}

impl Drop for ApiClient {
    fn drop(&mut self) {
        self.close();
        self.task.abort();
    }
}
