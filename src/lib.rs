//! tcpgate: a framed TCP connection server
//!
//! Clients exchange length-prefixed binary frames, each carrying a route id
//! that selects an async handler and a message id the transport never
//! interprets.
//!
//! Features:
//! - 12-byte big-endian frame header with a bounded body size
//! - One reader and one writer task per connection, ordered in both directions
//! - Connection ceiling and a hysteresis-based idle sweep
//! - Lifecycle hooks, named connection groups and built-in ping/shutdown routes
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod connection;
pub mod error;
pub mod group;
pub mod hook;
pub mod id;
pub mod manager;
pub mod message;
pub mod router;
pub mod server;
pub mod store;
pub mod system;

pub use config::{Config, ManagerConfig, ServerConfig};
pub use connection::{CloseReason, ConnStat, Connection};
pub use error::{
    ConfigError, ConnError, FrameError, GroupError, HandlerError, HookError, ManagerError,
    PoolError, RouterError,
};
pub use group::{ConnGroup, Group};
pub use hook::{ConnHook, LogHook};
pub use id::generate_conn_id;
pub use manager::{ConnManager, SweepReport};
pub use message::{Message, MessagePool};
pub use router::{RouteHandler, Router};
pub use server::Server;
pub use store::{DashStore, Store};
