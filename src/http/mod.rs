//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware, action routing)
//!         → ANY /{*action}: query + JSON body → args → dispatch → JSON reply
//!         → GET /ws: upgrade → websocket.rs (per-connection dispatch loop)
//! ```

pub mod server;
pub mod websocket;

pub use server::ApiHttpServer;
