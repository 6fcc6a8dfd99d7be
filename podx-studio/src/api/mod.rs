//! REST API server module.
//!
//! HTTP endpoints for submitting and inspecting runs, managing presets, and
//! streaming run progress over WebSocket.

pub mod error;
pub mod models;
pub mod routes;
pub mod server;

pub use server::ApiServer;
