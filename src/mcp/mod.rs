//! Agent-facing tool server: the JSON-RPC-over-HTTP tool surface and the
//! embedded OAuth authorization server that protects it.

pub mod oauth;
pub mod server;

pub use oauth::OAuthAuthServer;
pub use server::{ToolServer, TransportSecurity};
