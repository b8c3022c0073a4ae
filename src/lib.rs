//! # PeerTalk
//!
//! A single-threaded, cooperatively-polled LAN messaging engine: peers find
//! each other over a UDP discovery protocol, then exchange messages over TCP
//! with priority queuing, automatic fragmentation of large payloads, and
//! flow-controlled backpressure. There is no internal threading and no async
//! runtime — callers drive everything by calling [`Context::poll`] (or the
//! lower-latency [`Context::poll_fast`]) from their own loop.
//!
//! The entry point is [`Context`]: construct one with [`Context::init`],
//! register callbacks with [`Context::set_callbacks`], then call
//! [`Context::start_discovery`]/[`Context::start_listening`] and drive it
//! with repeated [`Context::poll`] calls.

pub mod callbacks;
pub mod codec;
pub mod compat;
pub mod config;
pub mod context;
pub mod direct_buffer;
pub mod discovery;
pub mod error;
pub mod flow;
pub mod fragment;
pub mod logging;
pub mod peer;
pub mod queue;
pub mod stats;
pub mod transport;

pub use callbacks::Callbacks;
pub use config::{Config, FragmentationMode};
pub use context::{version, Context, PeerInfo, QueueStatus, VERSION};
pub use error::{Error, Result};
pub use peer::{Capabilities, PeerId, PeerState};
pub use queue::Priority;
pub use stats::GlobalStats;
