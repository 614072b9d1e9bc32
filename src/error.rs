//! Error types for yurt-lxd

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Could not reach the LXD daemon ({0}). Restart the yurt VM and try again")]
    Connection(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("LXD API error: {0}")]
    Api(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("LXD initialization failed: {0}. Restart the yurt VM and try again")]
    Bootstrap(String),

    #[error("Unsupported remote '{0}'. Known remotes: images, ubuntu")]
    UnsupportedRemote(String),

    #[error("Invalid instance name '{0}': use 1-63 letters, digits or dashes, starting with a letter and not ending with a dash")]
    InvalidName(String),

    #[error("Failed to launch instance {name}: {source}")]
    Launch {
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to {action} instance {name}: {source}")]
    InstanceAction {
        action: &'static str,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Unexpected response from LXD: {0}")]
    Protocol(String),

    #[error("VM command failed: {0}")]
    Command(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True if this error, or the error it wraps, is a not-found condition
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Launch { source, .. } | Error::InstanceAction { source, .. } => {
                source.is_not_found()
            }
            _ => false,
        }
    }

    /// True if the daemon could not be reached at all
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(_) => true,
            Error::Launch { source, .. } | Error::InstanceAction { source, .. } => {
                source.is_connection_error()
            }
            _ => false,
        }
    }

    /// Map a transport failure from the HTTP client
    pub fn from_http(err: reqwest::Error, context: &str) -> Self {
        if err.is_connect() || err.is_timeout() {
            Error::Connection(format!("{}: {}", context, err))
        } else if err.is_decode() {
            Error::Protocol(format!("{}: {}", context, err))
        } else {
            Error::Api(format!("{}: {}", context, err))
        }
    }
}
