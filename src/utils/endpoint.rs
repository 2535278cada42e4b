//! Backend endpoint validation.
//!
//! The relay only ever dials out to the configured backend, so validation is
//! about catching misconfiguration early: the endpoint must be a WebSocket
//! URL with a host, and it must be encrypted unless it points at a loopback
//! host (local test backends).

use std::net::IpAddr;

use thiserror::Error;
use url::Url;

/// Errors that can occur during endpoint validation
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Invalid URL format: {0}")]
    InvalidFormat(#[from] url::ParseError),

    #[error("Endpoint scheme must be wss, got: {0}")]
    SecureSchemeRequired(String),

    #[error("Endpoint must have a host")]
    MissingHost,
}

/// Validate a backend endpoint URL.
///
/// `wss` is required; plain `ws` is accepted only for loopback hosts.
pub fn validate_backend_endpoint(endpoint: &str) -> Result<Url, EndpointError> {
    let url = Url::parse(endpoint)?;
    let host = url.host_str().ok_or(EndpointError::MissingHost)?.to_string();
    match url.scheme() {
        "wss" => Ok(url),
        "ws" if is_loopback_host(&host) => Ok(url),
        scheme => Err(EndpointError::SecureSchemeRequired(scheme.to_string())),
    }
}

fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wss_accepted() {
        assert!(validate_backend_endpoint("wss://backend.example.com/stream").is_ok());
    }

    #[test]
    fn test_plain_ws_rejected_for_remote_hosts() {
        match validate_backend_endpoint("ws://backend.example.com/stream") {
            Err(EndpointError::SecureSchemeRequired(scheme)) => assert_eq!(scheme, "ws"),
            other => panic!("Expected SecureSchemeRequired, got {other:?}"),
        }
    }

    #[test]
    fn test_plain_ws_accepted_for_loopback() {
        assert!(validate_backend_endpoint("ws://127.0.0.1:9020").is_ok());
        assert!(validate_backend_endpoint("ws://localhost:9020").is_ok());
        assert!(validate_backend_endpoint("ws://[::1]:9020").is_ok());
    }

    #[test]
    fn test_non_websocket_schemes_rejected() {
        assert!(validate_backend_endpoint("https://backend.example.com").is_err());
        assert!(validate_backend_endpoint("http://127.0.0.1").is_err());
    }

    #[test]
    fn test_malformed_url_rejected() {
        assert!(matches!(
            validate_backend_endpoint("not a url"),
            Err(EndpointError::InvalidFormat(_))
        ));
    }
}
