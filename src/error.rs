use crate::radio::SensorKind;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Empty radio frame")]
    Empty,
    #[error("Unknown sensor kind tag: {0}")]
    UnknownKind(u8),
    #[error("Size mismatch for {kind:?} frame: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        kind: SensorKind,
        expected: usize,
        actual: usize,
    },
    #[error("Non-finite value in {kind:?} frame")]
    NonFinite { kind: SensorKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid MAC address, expected six hex octets like aa:bb:cc:dd:ee:ff")]
pub struct MacParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("Event bus full, event dropped")]
    Full,
    #[error("Event bus closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport not connected")]
    NotConnected,
    #[error("Transport outbound queue full")]
    ChannelFull,
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Connectivity driver unavailable: {0}")]
    DriverUnavailable(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Invalid command JSON")]
    InvalidJson,
    #[error("Command exceeds {max} bytes")]
    TooLarge { max: usize },
}

#[derive(Debug, Error)]
pub enum SntpError {
    #[error("SNTP socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SNTP query timed out")]
    Timeout,
    #[error("SNTP response too short: {0} bytes")]
    ShortResponse(usize),
    #[error("SNTP server unsynchronized (stratum 0 / alarm)")]
    Unsynchronized,
    #[error("No SNTP server answered")]
    NoServerAnswered,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Link error: {0}")]
    Link(#[from] LinkError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Command error: {0}")]
    Command(#[from] CommandError),
    #[error("Time sync error: {0}")]
    Sntp(#[from] SntpError),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
