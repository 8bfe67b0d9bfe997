// src/core/errors.rs

//! Defines the primary error type for the control plane.

use std::sync::Arc;
use thiserror::Error;

/// The RFC 4271 NOTIFICATION error/suberror pair, carried end to end from a
/// codec validation failure through to the FSM's error-close handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BgpNotification {
    pub error: u8,
    pub suberror: u8,
}

impl BgpNotification {
    pub const MESSAGE_HEADER_ERROR: u8 = 1;
    pub const OPEN_MESSAGE_ERROR: u8 = 2;
    pub const UPDATE_MESSAGE_ERROR: u8 = 3;
    pub const HOLD_TIMER_EXPIRED: u8 = 4;
    pub const FSM_ERROR: u8 = 5;
    pub const CEASE: u8 = 6;

    pub const fn new(error: u8, suberror: u8) -> Self {
        Self { error, suberror }
    }
}

/// The main error enum for the control plane. Using `thiserror` allows clean
/// error definitions and automatic `From` trait implementations, mirroring
/// the error-handling discipline of the rest of this tree.
#[derive(Error, Debug, Clone)]
pub enum ControlPlaneError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("incomplete data in stream")]
    IncompleteData,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("DNS resolution failed for '{0}': {1}")]
    DnsFailure(String, String),

    #[error("kernel table driver failed: {0}")]
    KernelDriver(String),

    #[error("http client error: {0}")]
    HttpClient(String),

    #[error("malformed BGP message: {0}")]
    BgpMalformed(String),

    #[error("BGP protocol error: error={0} suberror={1}")]
    BgpProtocol(u8, u8),

    #[error("BGP session with peer {0} collided and lost")]
    BgpCollisionLost(String),

    #[error("config source error: {0}")]
    ConfigSource(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlPlaneError {
    pub fn bgp(n: BgpNotification) -> Self {
        ControlPlaneError::BgpProtocol(n.error, n.suberror)
    }

    /// Extracts the NOTIFICATION triple this error should be reported with,
    /// if it originates from a BGP protocol violation.
    pub fn as_bgp_notification(&self) -> Option<BgpNotification> {
        match self {
            ControlPlaneError::BgpProtocol(error, suberror) => {
                Some(BgpNotification::new(*error, *suberror))
            }
            _ => None,
        }
    }
}

impl From<std::io::Error> for ControlPlaneError {
    fn from(e: std::io::Error) -> Self {
        ControlPlaneError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for ControlPlaneError {
    fn from(e: reqwest::Error) -> Self {
        ControlPlaneError::HttpClient(e.to_string())
    }
}

impl From<serde_json::Error> for ControlPlaneError {
    fn from(e: serde_json::Error) -> Self {
        ControlPlaneError::Config(format!("invalid JSON: {e}"))
    }
}

impl From<toml::de::Error> for ControlPlaneError {
    fn from(e: toml::de::Error) -> Self {
        ControlPlaneError::Config(format!("invalid TOML: {e}"))
    }
}
