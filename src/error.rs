use ipnet::IpNet;
use thiserror::Error;

/// Failures at the device boundary. `Duplicate` is swallowed by the add
/// path; everything else propagates to the caller uninterpreted.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("entry already present on the device")]
    Duplicate,

    #[error("device response missing field `{0}`")]
    MissingField(&'static str),

    #[error("device reported dynamic entry with unusable timeout `{0}`")]
    InvalidTimeout(String),

    #[error("device returned status {status}: {detail}")]
    Api { status: u16, detail: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Construction-time configuration failures; the operator must fix the
/// config file, there is no recovery.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("conflicting whitelist/blacklist entry {0}")]
    Conflict(IpNet),

    #[error("unable to parse prefix/ip `{0}`")]
    BadPrefix(String),
}
