//! RPC subsystem.
//!
//! # Data Flow
//! ```text
//! Protocol server (net_server.rs / http::server)
//!     → session.rs (peer: replies to pending calls, requests to the host)
//!     → host.rs (filters → decode → handler → encode → filters)
//!     → handler.rs → action.rs (registry lookup + controller instances)
//!     → reply back through the originating session
//! ```
//!
//! # Design Decisions
//! - Identical pipeline for every transport
//! - Filters operate on wire messages, never on decoded envelopes
//! - Action faults become `(code, message)` replies, never crash a session

pub mod action;
pub mod client;
pub mod controller;
pub mod encoder;
pub mod error;
pub mod filter;
pub mod handler;
pub mod host;
pub mod message;
pub mod net_server;
pub mod session;

pub use action::{ActionContext, ApiAction, ApiManager, Controller, ControllerCache, SessionInfo};
pub use client::ApiClient;
pub use controller::ApiController;
pub use encoder::{into_args, Args, Encoder, JsonEncoder};
pub use error::{ApiError, HostError};
pub use filter::{Filter, FilterChain, FilterContext, TraceFilter};
pub use handler::{ApiHandler, DefaultHandler};
pub use host::{ApiHost, ApiServer, Dispatcher, HostCore, ProviderMap, ServerSettings};
pub use message::Message;
pub use net_server::ApiNetServer;
pub use session::{ApiNetSession, ApiSession};
