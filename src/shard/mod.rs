//! Shard management module
//!
//! One [`ShardConnection`] per gateway session, grouped and started by a
//! [`ShardPool`].

mod connection;
mod pool;
mod session;
mod state;
mod transport;

pub use connection::{ShardConfig, ShardConnection, ShardInfo};
pub use pool::{
    check_session_budget, shard_index, startup_groups, ShardPool, ShardingMode,
    DEFAULT_GROUP_DELAY,
};
pub use session::{HeartbeatState, Session};
pub use state::{ShardState, ShardStatus};
pub use transport::{Connector, TungsteniteConnector, WsSink, WsStream};
