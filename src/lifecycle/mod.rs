//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → ServerSettings → ApiHost with one server per endpoint
//!
//! Shutdown (shutdown.rs):
//!     trigger() → accept loops and WebSocket sessions exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → host stop
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then host, then listeners
//! - Ordered shutdown: stop accept, close sessions, stop listeners

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
