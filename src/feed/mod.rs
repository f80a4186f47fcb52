//! Realtime trade feed over the broker WebSocket
pub mod connection;
pub mod error;
pub mod frame;
pub mod heartbeat;

pub use connection::{ConnectionState, ConnectionSupervisor, FeedCommand, FeedConfig, FeedHandle};
pub use error::{FeedError, FeedResult};
pub use frame::{parse_frame, subscription_request, Frame, FrameContext, SessionCipher};
pub use heartbeat::Heartbeat;
