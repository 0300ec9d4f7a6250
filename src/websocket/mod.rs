pub mod hub;
pub mod handler;

pub use hub::{BroadcastHub, ClientHandle, ConnectionId};
pub use handler::{run_listener, STREAM_PATH};
