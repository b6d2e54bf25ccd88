//! netrpc: multi-transport session server and RPC host.
//!
//! # Architecture Overview
//!
//! ```text
//!                   ┌──────────────────────────────────────────────┐
//!                   │                   ApiHost                    │
//!                   │                                              │
//!  tcp/udp ─────────┼─▶ ApiNetServer ─▶ NetServer ─▶ ApiNetSession ┐│
//!                   │                  (listeners,   (peer calls) ││
//!                   │                   sessions)                 ▼│
//!  http/ws ─────────┼─▶ ApiHttpServer (axum) ──────────▶ HostCore  ││
//!                   │                                 filters →    ││
//!                   │                                 decode →     ││
//!                   │                                 handler →    ││
//!                   │                                 ApiManager   ││
//!                   │                                              │
//!                   │  config · lifecycle · observability          │
//!                   └──────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod rpc;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::schema::HostConfig;
pub use http::ApiHttpServer;
pub use lifecycle::Shutdown;
pub use net::{NetServer, NetUri};
pub use rpc::{ApiClient, ApiError, ApiHost};
