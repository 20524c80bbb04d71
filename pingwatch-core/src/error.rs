//! Error types for `pingwatch-core`.
//!
//! Each concern gets its own `thiserror`-derived enum, mirroring
//! `zzping-lib`'s `XError`/`DError` split: callers that just want to
//! propagate a failure use `?`, callers that want to report it to an
//! operator wrap it with `anyhow::Context`.

use std::net::AddrParseError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("packet too short: got {got} bytes, need at least {need}")]
    TooShort { got: usize, need: usize },
    #[error("IPv4 header length invalid (ihl={0})")]
    BadIhl(u8),
    #[error("unexpected ICMP type {0}, expected echo reply")]
    WrongIcmpType(u8),
    #[error("echo identifier {got} does not match our process identity {expected}")]
    AlienIdentifier { got: u16, expected: u16 },
    #[error("trace payload length mismatch: got {got}, expected {expected}")]
    PayloadLength { got: usize, expected: usize },
    #[error("pnet packet construction failed (buffer too small)")]
    PacketBuild,
}

#[derive(Error, Debug)]
pub enum SocketError {
    #[error("failed to create {family} raw ICMP socket: {source}")]
    Create {
        family: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind socket to {addr}: {source}")]
    Bind {
        addr: std::net::IpAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),
    #[error("recv failed: {0}")]
    Recv(#[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("target {name:?} has bad address {addr:?}: {source}")]
    BadAddress {
        name: String,
        addr: String,
        #[source]
        source: AddrParseError,
    },
    #[error("no usable targets in configuration")]
    NoTargets,
}

#[derive(Error, Debug)]
pub enum TimeSeriesError {
    #[error("time-series sink I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("time-series encode error: {0}")]
    Encode(#[from] rmp::encode::ValueWriteError),
}
