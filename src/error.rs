use std::{fmt, io, time::Duration};

use thiserror::Error;

/// Stable, machine-readable failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    BlockedHost,
    ServerSocketTimeout,
    UnsupportedProtocol,
    InvalidRelay,
    NegotiationFailed,
    TlsFailure,
    IoFailure,
    HookFailure,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BlockedHost => "BLOCKED_HOST",
            ErrorCode::ServerSocketTimeout => "SERVER_SOCKET_TIMEOUT",
            ErrorCode::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            ErrorCode::InvalidRelay => "INVALID_RELAY",
            ErrorCode::NegotiationFailed => "NEGOTIATION_FAILED",
            ErrorCode::TlsFailure => "TLS_FAILURE",
            ErrorCode::IoFailure => "IO_FAILURE",
            ErrorCode::HookFailure => "HOOK_FAILURE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Blocked via DoH or DNS: {0}")]
    BlockedHost(String),

    #[error("Server socket timed out after {}ms", .0.as_millis())]
    ServerSocketTimeout(Duration),

    #[error("Non supported protocol [{0}]")]
    UnsupportedProtocol(String),

    #[error("Invalid relay: {0}")]
    InvalidRelay(String),

    #[error("{protocol} negotiation failed: {message}")]
    Negotiation {
        protocol: &'static str,
        message: String,
    },

    #[error("TLS configuration error: {0}")]
    TlsConfig(#[from] openssl::error::ErrorStack),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[from] openssl::ssl::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("Hook failed: {0:#}")]
    Hook(anyhow::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<TunnelError>,
    },
}

impl TunnelError {
    pub fn negotiation(protocol: &'static str, message: impl Into<String>) -> Self {
        TunnelError::Negotiation {
            protocol,
            message: message.into(),
        }
    }

    pub fn context(self, context: impl Into<String>) -> Self {
        TunnelError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            TunnelError::BlockedHost(_) => ErrorCode::BlockedHost,
            TunnelError::ServerSocketTimeout(_) => ErrorCode::ServerSocketTimeout,
            TunnelError::UnsupportedProtocol(_) => ErrorCode::UnsupportedProtocol,
            TunnelError::InvalidRelay(_) => ErrorCode::InvalidRelay,
            TunnelError::Negotiation { .. } => ErrorCode::NegotiationFailed,
            TunnelError::TlsConfig(_) | TunnelError::TlsHandshake(_) => ErrorCode::TlsFailure,
            TunnelError::Io(_) => ErrorCode::IoFailure,
            TunnelError::Hook(_) => ErrorCode::HookFailure,
            TunnelError::Context { source, .. } => source.code(),
        }
    }
}

pub type Result<T, E = TunnelError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_source_code() {
        let err = TunnelError::ServerSocketTimeout(Duration::from_secs(5)).context("trojan");
        assert_eq!(err.code(), ErrorCode::ServerSocketTimeout);
        assert_eq!(err.code().as_str(), "SERVER_SOCKET_TIMEOUT");
        assert_eq!(err.to_string(), "trojan: Server socket timed out after 5000ms");
    }

    #[test]
    fn unsupported_protocol_names_tag() {
        let err = TunnelError::UnsupportedProtocol("vmess".into());
        assert_eq!(err.to_string(), "Non supported protocol [vmess]");
        assert_eq!(err.code().as_str(), "UNSUPPORTED_PROTOCOL");
    }
}
