//! RTP transport plumbing: UDP port reservation and RTP/RTCP demultiplexing.

pub mod demuxer;
pub mod ports;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use demuxer::{DemuxActivity, DemuxPorts, PacketKind, RtpDemuxer, RtpError};
pub use ports::{PortAllocator, PortProbe, PortSpan, UdpProbe};

/// Address family negotiated by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpFamily {
    #[serde(rename = "ipv4")]
    V4,
    #[serde(rename = "ipv6")]
    V6,
}

impl IpFamily {
    /// Wildcard address for binding.
    pub fn unspecified(self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// Loopback address the transcoder listens on.
    pub fn loopback(self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }
}

impl FromStr for IpFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ipv4" | "v4" | "4" => Ok(IpFamily::V4),
            "ipv6" | "v6" | "6" => Ok(IpFamily::V6),
            _ => Err(format!("Invalid IP family: {s}")),
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "ipv4"),
            IpFamily::V6 => write!(f, "ipv6"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_parsing() {
        assert_eq!("ipv4".parse::<IpFamily>(), Ok(IpFamily::V4));
        assert_eq!("IPv6".parse::<IpFamily>(), Ok(IpFamily::V6));
        assert!("ipx".parse::<IpFamily>().is_err());
    }

    #[test]
    fn test_family_serde_matches_session_layer() {
        assert_eq!(serde_json::to_string(&IpFamily::V6).unwrap(), "\"ipv6\"");
        let family: IpFamily = serde_json::from_str("\"ipv4\"").unwrap();
        assert_eq!(family, IpFamily::V4);
    }

    #[test]
    fn test_addresses_match_family() {
        assert!(IpFamily::V4.unspecified().is_ipv4());
        assert!(IpFamily::V6.loopback().is_loopback());
        assert!(IpFamily::V6.loopback().is_ipv6());
    }
}
