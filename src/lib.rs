//! Trade Replay WebSocket Server
//!
//! Replays a historical, timestamp-ordered trade sequence to WebSocket
//! subscribers, preserving the original inter-event timing (optionally
//! compressed by a speed factor and floored by a minimum delay) and grouping
//! same-timestamp trades into a single delivered batch.

pub mod batch;
pub mod config;
pub mod error;
pub mod replay;
pub mod server;
pub mod source;
pub mod subscriber;

pub use batch::{Batch, Batcher, Record};
pub use config::ReplayConfig;
pub use error::{ReplayError, Result};
pub use replay::{ReplayEngine, WireMessage};
pub use server::ReplayServer;
pub use source::{ParquetTradeSource, TradeSource};
pub use subscriber::{Subscriber, SubscriberRegistry};
