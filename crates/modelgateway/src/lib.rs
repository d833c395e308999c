pub mod client;
pub mod config;
pub mod error;
pub mod hooks;
pub mod http;
pub mod llm;
pub mod mcp;
pub mod parse;
pub mod proxy;
pub mod router;
pub mod serdes;
pub mod store;
pub mod strng;
pub mod telemetry;

pub use strng::Strng;

pub(crate) use serdes::is_default;
pub(crate) use tracing::{debug, trace, warn};
