//! Core monitoring engine for a long-running ICMP reachability monitor
//! (see `SPEC_FULL.md` §1-§4). This crate has no knowledge of process
//! lifecycle: no signal handling, no daemonization, no CLI. A thin binary
//! crate (`pingwatch-daemon`) owns those concerns and drives
//! [`engine::Engine`] to completion, mirroring the teacher's
//! `zzping-lib`/`zzping-daemon` split.

pub mod alarm;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod notify;
pub mod registry;
pub mod socket;
pub mod stats;
pub mod status;
pub mod target;
pub mod timeseries;
pub mod wire;

pub use config::Config;
pub use engine::Engine;
pub use error::{CodecError, ConfigError, SocketError, TimeSeriesError};
