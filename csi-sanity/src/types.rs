//! Type-safe wrappers for harness inputs.
//!
//! Endpoint addresses arrive as strings from flags or test code and are
//! parsed once at the dial boundary. `Location` names the two provisioned
//! paths in logs and errors.

use std::fmt::{self, Display};
use std::path::PathBuf;
use std::str::FromStr;

// ============================================================================
// EndpointAddress
// ============================================================================

/// Where a plugin endpoint listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointAddress {
    /// Unix-domain socket at this path
    Unix(PathBuf),
    /// TCP endpoint, as an `http://` or `https://` URI
    Tcp(String),
}

impl EndpointAddress {
    pub fn is_unix(&self) -> bool {
        matches!(self, EndpointAddress::Unix(_))
    }
}

impl Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointAddress::Unix(path) => write!(f, "unix://{}", path.display()),
            EndpointAddress::Tcp(uri) => write!(f, "{}", uri),
        }
    }
}

impl FromStr for EndpointAddress {
    type Err = AddressParseError;

    /// Accepts `unix://PATH`, `unix:PATH`, a bare socket path,
    /// `tcp://HOST:PORT`, `dns:///HOST:PORT`, `http(s)://...` and `HOST:PORT`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressParseError::Empty);
        }

        if let Some(path) = s.strip_prefix("unix://").or_else(|| s.strip_prefix("unix:")) {
            return unix(path, s);
        }
        if let Some(hostport) = s.strip_prefix("tcp://") {
            return tcp(hostport, s);
        }
        if let Some(rest) = s.strip_prefix("dns:") {
            // dns:[//authority]/host:port
            let hostport = rest.rsplit('/').next().unwrap_or(rest);
            return tcp(hostport, s);
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(EndpointAddress::Tcp(s.to_string()));
        }
        if let Some((scheme, _)) = s.split_once("://") {
            return Err(AddressParseError::UnsupportedScheme(scheme.to_string()));
        }
        if s.starts_with('/') || s.starts_with('.') || !s.contains(':') {
            return unix(s, s);
        }
        tcp(s, s)
    }
}

fn unix(path: &str, original: &str) -> Result<EndpointAddress, AddressParseError> {
    if path.is_empty() {
        return Err(AddressParseError::Invalid(original.to_string()));
    }
    Ok(EndpointAddress::Unix(PathBuf::from(path)))
}

fn tcp(hostport: &str, original: &str) -> Result<EndpointAddress, AddressParseError> {
    match hostport.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(EndpointAddress::Tcp(format!("http://{}", hostport)))
        }
        _ => Err(AddressParseError::Invalid(original.to_string())),
    }
}

/// Error returned when parsing an invalid endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("endpoint address is empty")]
    Empty,
    #[error("unsupported endpoint scheme '{0}': expected unix, tcp, dns, http or https")]
    UnsupportedScheme(String),
    #[error("invalid endpoint address '{0}'")]
    Invalid(String),
}

// ============================================================================
// Location
// ============================================================================

/// One of the two filesystem locations provisioned per test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Mount target (NodePublishVolume target_path)
    Target,
    /// Staging directory (NodeStageVolume staging_target_path)
    Staging,
}

impl Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Target => write!(f, "target"),
            Location::Staging => write!(f, "staging"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_forms() {
        let expected = EndpointAddress::Unix(PathBuf::from("/var/run/csi.sock"));
        assert_eq!("unix:///var/run/csi.sock".parse::<EndpointAddress>(), Ok(expected.clone()));
        assert_eq!("unix:/var/run/csi.sock".parse::<EndpointAddress>(), Ok(expected.clone()));
        assert_eq!("/var/run/csi.sock".parse::<EndpointAddress>(), Ok(expected));
        assert_eq!(
            "csi.sock".parse::<EndpointAddress>(),
            Ok(EndpointAddress::Unix(PathBuf::from("csi.sock")))
        );
        assert_eq!(
            "./csi.sock".parse::<EndpointAddress>(),
            Ok(EndpointAddress::Unix(PathBuf::from("./csi.sock")))
        );
    }

    #[test]
    fn test_tcp_forms() {
        let expected = EndpointAddress::Tcp("http://127.0.0.1:10000".to_string());
        assert_eq!("127.0.0.1:10000".parse::<EndpointAddress>(), Ok(expected.clone()));
        assert_eq!("tcp://127.0.0.1:10000".parse::<EndpointAddress>(), Ok(expected.clone()));
        assert_eq!("dns:///127.0.0.1:10000".parse::<EndpointAddress>(), Ok(expected));
        assert_eq!(
            "https://csi.example.com:443".parse::<EndpointAddress>(),
            Ok(EndpointAddress::Tcp("https://csi.example.com:443".to_string()))
        );
        assert_eq!(
            "[::1]:50051".parse::<EndpointAddress>(),
            Ok(EndpointAddress::Tcp("http://[::1]:50051".to_string()))
        );
    }

    #[test]
    fn test_invalid_addresses() {
        assert_eq!("".parse::<EndpointAddress>(), Err(AddressParseError::Empty));
        assert_eq!("   ".parse::<EndpointAddress>(), Err(AddressParseError::Empty));
        assert_eq!(
            "ftp://host:21".parse::<EndpointAddress>(),
            Err(AddressParseError::UnsupportedScheme("ftp".to_string()))
        );
        assert!(matches!(
            "unix://".parse::<EndpointAddress>(),
            Err(AddressParseError::Invalid(_))
        ));
        assert!(matches!(
            "tcp://host:notaport".parse::<EndpointAddress>(),
            Err(AddressParseError::Invalid(_))
        ));
    }

    #[test]
    fn test_display() {
        let addr: EndpointAddress = "/tmp/csi.sock".parse().unwrap();
        assert!(addr.is_unix());
        assert_eq!(addr.to_string(), "unix:///tmp/csi.sock");
        assert_eq!(Location::Target.to_string(), "target");
        assert_eq!(Location::Staging.to_string(), "staging");
    }
}
