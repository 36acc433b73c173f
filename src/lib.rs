pub mod config;
pub mod protocol;

pub use config::Config;
pub use protocol::{Connection, ConnectionId, RequestHandler, Server, ServerError};
