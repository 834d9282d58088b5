use std::{io, net::SocketAddr, path::PathBuf};

use n0_error::stack_error;

/// Errors from establishing a tunnel through the upstream proxy.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum UpstreamError {
    /// Failed to open a TCP connection to the upstream proxy.
    #[error("failed to connect to upstream proxy {addr}")]
    Connect {
        /// The upstream address we dialed.
        addr: String,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The upstream proxy did not accept the TCP connection in time.
    #[error("timed out connecting to upstream proxy {addr}")]
    ConnectTimeout {
        /// The upstream address we dialed.
        addr: String,
    },

    /// The upstream proxy answered the handshake with something unexpected.
    #[error("upstream protocol error: {message}")]
    Protocol { message: String },

    /// The upstream proxy rejected our credentials.
    #[error("upstream rejected credentials: {message}")]
    Auth { message: String },

    /// Credentials cannot be encoded for the upstream protocol.
    #[error("invalid upstream credentials: {message}")]
    Credentials { message: String },

    /// The tunnel target cannot be sent to the upstream proxy.
    #[error("invalid tunnel target: {message}")]
    InvalidTarget { message: String },

    /// Reading or writing the handshake failed.
    #[error("io error during upstream handshake")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },
}

impl UpstreamError {
    /// Returns true if the upstream could not be reached.
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::ConnectTimeout { .. })
    }

    /// Returns true if the upstream answered with a malformed or negative response.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }

    /// Returns true if the upstream rejected our credentials.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

/// Errors from the local proxy server lifecycle.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ServerError {
    /// Failed to bind the local listener.
    #[error("failed to bind tcp listener to {addr}")]
    Bind {
        /// The address we tried to bind to.
        addr: SocketAddr,
        #[error(source, std_err)]
        source: io::Error,
    },
}

/// Errors from loading or validating upstream configuration.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path:?}")]
    Read {
        path: PathBuf,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The config file is not valid JSON for our schema.
    #[error("failed to parse config")]
    Parse {
        #[error(source, std_err)]
        source: serde_json::Error,
    },

    /// The configuration is incomplete or out of range.
    #[error("invalid config: {message}")]
    Invalid { message: String },
}
