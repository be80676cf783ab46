//! CIDR prefixes
//!
//! Minimal typed prefix used for peer allowed-IPs and routes.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// An IP network prefix, e.g. `10.0.0.0/24` or `fd00::/64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    /// Build a prefix; the address is masked to the network base.
    pub fn new(addr: IpAddr, prefix_len: u8) -> ModelResult<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(ModelError::InvalidPrefix {
                prefix: format!("{}/{}", addr, prefix_len),
                reason: format!("prefix length exceeds {}", max),
            });
        }
        Ok(Self {
            addr: mask(addr, prefix_len),
            prefix_len,
        })
    }

    /// Single-host prefix (/32 or /128)
    pub fn host(addr: IpAddr) -> Self {
        let prefix_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self { addr, prefix_len }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// True if `ip` falls inside this prefix. Mixed address families never match.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask(ip, self.prefix_len) == self.addr
            }
            _ => false,
        }
    }
}

fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let masked = if prefix_len == 0 {
                0
            } else {
                bits & (u32::MAX << (32 - prefix_len as u32))
            };
            IpAddr::V4(Ipv4Addr::from(masked))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let masked = if prefix_len == 0 {
                0
            } else {
                bits & (u128::MAX << (128 - prefix_len as u32))
            };
            IpAddr::V6(Ipv6Addr::from(masked))
        }
    }
}

impl FromStr for IpPrefix {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ModelError::InvalidPrefix {
            prefix: s.to_string(),
            reason: reason.to_string(),
        };

        match s.split_once('/') {
            Some((addr, len)) => {
                let addr: IpAddr = addr.parse().map_err(|_| invalid("bad address"))?;
                let prefix_len: u8 = len.parse().map_err(|_| invalid("bad prefix length"))?;
                Self::new(addr, prefix_len)
            }
            None => {
                let addr: IpAddr = s.parse().map_err(|_| invalid("bad address"))?;
                Ok(Self::host(addr))
            }
        }
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ModelError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(p: IpPrefix) -> String {
        p.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_mask() {
        let p: IpPrefix = "10.0.5.77/24".parse().unwrap();
        assert_eq!(p.to_string(), "10.0.5.0/24");
        assert!(p.contains("10.0.5.1".parse().unwrap()));
        assert!(!p.contains("10.0.6.1".parse().unwrap()));
    }

    #[test]
    fn host_prefix() {
        let p: IpPrefix = "10.0.0.2".parse().unwrap();
        assert_eq!(p.prefix_len(), 32);
        assert!(p.contains("10.0.0.2".parse().unwrap()));
        assert!(!p.contains("10.0.0.3".parse().unwrap()));
    }

    #[test]
    fn v6() {
        let p: IpPrefix = "fd00:abcd::/32".parse().unwrap();
        assert!(p.contains("fd00:abcd::1".parse().unwrap()));
        assert!(!p.contains("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn rejects_bad_input() {
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("not-an-ip/8".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn zero_length_matches_everything_v4() {
        let p: IpPrefix = "0.0.0.0/0".parse().unwrap();
        assert!(p.contains("203.0.113.9".parse().unwrap()));
        assert!(!p.contains("::1".parse().unwrap()));
    }
}
