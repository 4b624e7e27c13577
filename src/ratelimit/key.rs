//! Client identity key generation and handling.

use std::net::{IpAddr, SocketAddr};

use crate::error::{GatekeeperError, Result};

/// Longest opaque identity accepted, in bytes.
pub const MAX_KEY_LEN: usize = 256;

/// A key that identifies one client for rate limiting.
///
/// Keys derived from network addresses use the IP only: the same client
/// connects from many ephemeral ports, and an IPv4 client seen through a
/// dual-stack socket shares its quota with the plain IPv4 form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    /// Create a key from an opaque identity string.
    ///
    /// Surrounding whitespace is trimmed. Empty identities and identities
    /// longer than [`MAX_KEY_LEN`] bytes are rejected.
    pub fn new(identity: &str) -> Result<Self> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(GatekeeperError::InvalidKey(
                "identity must not be empty".to_string(),
            ));
        }
        if identity.len() > MAX_KEY_LEN {
            return Err(GatekeeperError::InvalidKey(format!(
                "identity is {} bytes, at most {} allowed",
                identity.len(),
                MAX_KEY_LEN
            )));
        }
        Ok(Self(identity.to_string()))
    }

    /// Create a key from a client IP address.
    pub fn from_ip(ip: IpAddr) -> Self {
        Self(ip.to_canonical().to_string())
    }

    /// Create a key from a client socket address, dropping the port.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip())
    }

    /// Parse a line of input into a key.
    ///
    /// Socket addresses and IP addresses are normalised to their IP; anything
    /// else is kept as an opaque identity.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if let Ok(addr) = trimmed.parse::<SocketAddr>() {
            return Ok(Self::from_socket_addr(addr));
        }
        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(Self::from_ip(ip));
        }
        Self::new(trimmed)
    }

    /// The key as passed to the limiter.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<IpAddr> for ClientKey {
    fn from(ip: IpAddr) -> Self {
        Self::from_ip(ip)
    }
}

impl From<SocketAddr> for ClientKey {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

impl AsRef<str> for ClientKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
