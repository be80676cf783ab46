//! STUN/TURN server URIs
//!
//! Parses the `stun:` / `turn:` URI forms announced by the control plane.
//! TURN entries carry username/password inline after parsing.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// Which role a server plays for ICE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceUriKind {
    Stun,
    Turn,
}

/// A parsed STUN or TURN server URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceUri {
    pub kind: IceUriKind,
    pub host: String,
    pub port: u16,
    /// TURN credentials; always `None` for STUN
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

const DEFAULT_PORT: u16 = 3478;

impl IceUri {
    /// Parse a `stun:host[:port]` URI.
    pub fn parse_stun(uri: &str) -> ModelResult<Self> {
        let rest = uri
            .strip_prefix("stun:")
            .ok_or_else(|| ModelError::InvalidUri(uri.to_string()))?;
        let (host, port) = split_host_port(rest, uri)?;
        Ok(Self {
            kind: IceUriKind::Stun,
            host,
            port,
            username: None,
            password: None,
        })
    }

    /// Parse a `turn:host[:port]` URI and attach credentials.
    pub fn parse_turn(uri: &str, username: &str, password: &str) -> ModelResult<Self> {
        let rest = uri
            .strip_prefix("turn:")
            .ok_or_else(|| ModelError::InvalidUri(uri.to_string()))?;
        // transport query params are not used for addressing
        let rest = rest.split('?').next().unwrap_or(rest);
        let (host, port) = split_host_port(rest, uri)?;
        Ok(Self {
            kind: IceUriKind::Turn,
            host,
            port,
            username: Some(username.to_string()),
            password: Some(password.to_string()),
        })
    }

    /// host:port form suitable for socket address resolution
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn split_host_port(rest: &str, original: &str) -> ModelResult<(String, u16)> {
    if rest.is_empty() {
        return Err(ModelError::InvalidUri(original.to_string()));
    }
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| ModelError::InvalidUri(original.to_string()))?;
            if host.is_empty() {
                return Err(ModelError::InvalidUri(original.to_string()));
            }
            Ok((host.to_string(), port))
        }
        None => Ok((rest.to_string(), DEFAULT_PORT)),
    }
}

impl fmt::Display for IceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.kind {
            IceUriKind::Stun => "stun",
            IceUriKind::Turn => "turn",
        };
        write!(f, "{}:{}:{}", scheme, self.host, self.port)
    }
}
