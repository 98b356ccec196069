pub mod config;
pub mod errors;
pub mod proto;

pub use config::ForwardConfig;
pub use errors::ProxyError;
pub use proto::{Endpoint, Proto};
