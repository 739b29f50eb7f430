//! Error taxonomy for the acquisition pipeline.
//!
//! Each layer gets its own enum so callers can match on the kind of failure
//! without downcasting; [`GatewayError`] composes them for the few call
//! sites (mainly startup) that need a single top-level error type.

use std::fmt;

/// Errors raised while establishing or using the BLE link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("BMS device not found")]
    DeviceNotFound,
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("failed to subscribe to notifications: {0}")]
    NotifySubscribeFailed(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("link lost: {0}")]
    LinkLost(String),
    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,
    #[error("connect refused: {0}")]
    ConnectRefused(String),
    #[error("{0}")]
    Other(String),
}

/// Errors raised while validating a D2-Modbus response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame shorter than minimum length")]
    ShortFrame,
    #[error("unexpected slave address")]
    WrongSlave,
    #[error("unexpected function code")]
    WrongFunction,
    #[error("declared payload length does not match frame length")]
    LengthMismatch,
    #[error("CRC check failed")]
    CrcMismatch,
    #[error("device reported exception code {0:#04x}")]
    ModbusException(u8),
}

/// Per-field decode outcomes. [`DecodeError::OutOfRangeValue`] is dropped
/// silently by callers; [`DecodeError::AllFieldsMissing`] promotes a
/// telemetry record's status to `no_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    OutOfRangeValue,
    AllFieldsMissing,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::OutOfRangeValue => write!(f, "decoded value out of accepted range"),
            DecodeError::AllFieldsMissing => write!(f, "no fields could be decoded"),
        }
    }
}

/// Errors raised by a downstream sink. These are always logged and never
/// abort the tick that produced them.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("durable store write failed: {0}")]
    StoreWriteFailed(String),
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),
    #[error("pub/sub publish failed: {0}")]
    PubSubPublishFailed(String),
    #[error("push send failed: {0}")]
    PushSendFailed(String),
}

/// Errors surfaced by the read-side Query Interface.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("backend unavailable")]
    DependencyUnavailable,
    #[error("not found")]
    NotFound,
}

/// Errors that can occur while loading configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Top-level error type for the few call sites (startup, composition root)
/// that need to flatten every layer into one `Result`.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("sink initialization failed: {0}")]
    SinkInit(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
