//! Sharded Discord gateway client
//!
//! - [`shard::ShardConnection`] drives one gateway session: hello,
//!   heartbeats, identify/resume and the reconnect rules for every close code
//! - [`shard::ShardPool`] decides which shards to run, paces their startup
//!   and routes guild-bound commands to the owning shard
//! - [`events::EventBus`] delivers shard events, with one-shot waits taking
//!   precedence over persistent listeners
//!
//! ```no_run
//! use shardwire::shard::{ShardConfig, ShardPool, ShardingMode, TungsteniteConnector};
//! use std::sync::Arc;
//! use twilight_model::gateway::Intents;
//!
//! # async fn demo(token: String) -> Result<(), shardwire::GatewayError> {
//! let http = twilight_http::Client::new(token.clone());
//! let pool = ShardPool::new(
//!     http,
//!     Arc::new(TungsteniteConnector),
//!     ShardConfig::new(token, Intents::GUILDS | Intents::GUILD_MESSAGES),
//!     ShardingMode::Auto,
//! );
//! pool.listen("MESSAGE_CREATE", |shard_id, dispatch| {
//!     println!("shard {shard_id}: {}", dispatch.data);
//! });
//! pool.run().await
//! # }
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod protocol;
pub mod shard;

pub use error::GatewayError;
