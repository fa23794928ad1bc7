//! Peer addressing and presence records.

use crate::error::ProtoError;
use crate::message::PeerInfo;
use flare_crypto::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Longest address accepted from the wire
pub const MAX_ADDR_LEN: usize = 512;

/// Component marking an address that goes through a relay circuit
pub const CIRCUIT_COMPONENT: &str = "p2p-circuit";

/// Presence namespace. Peers in different domains never see each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(String);

impl Domain {
    /// Create a domain from its tag
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The TCP transport domain
    #[must_use]
    pub fn tcp() -> Self {
        Self::new("TCP")
    }

    /// The UDP (QUIC) transport domain
    #[must_use]
    pub fn udp() -> Self {
        Self::new("UDP")
    }

    /// Domain tag
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Domain {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// A self-describing, slash-separated peer address such as
/// `/ip4/203.0.113.7/tcp/4001` or
/// `/ip4/198.51.100.1/tcp/4001/p2p/<relay>/p2p-circuit`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddr(String);

impl PeerAddr {
    /// Decode an address received from the wire
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::InvalidAddress`] if the bytes are not UTF-8 or
    /// do not form a valid address.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| ProtoError::InvalidAddress("address is not UTF-8".to_string()))?;
        text.parse()
    }

    /// Encode for the wire
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    /// Address text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn components(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split('/')
    }

    /// Whether the address traverses a relay circuit
    #[must_use]
    pub fn is_relayed(&self) -> bool {
        self.components().any(|c| c == CIRCUIT_COMPONENT)
    }

    /// Transport protocol of the leading `ip/transport` pair, if any
    #[must_use]
    pub fn transport(&self) -> Option<&str> {
        self.components()
            .nth(2)
            .filter(|proto| matches!(*proto, "tcp" | "udp"))
    }

    /// Socket address of the leading `/ip4|ip6/<ip>/tcp|udp/<port>` pair
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let mut parts = self.components();
        let family = parts.next()?;
        let ip: IpAddr = parts.next()?.parse().ok()?;
        let proto = parts.next()?;
        let port: u16 = parts.next()?.parse().ok()?;

        let family_ok = match family {
            "ip4" => ip.is_ipv4(),
            "ip6" => ip.is_ipv6(),
            _ => false,
        };
        (family_ok && matches!(proto, "tcp" | "udp")).then_some(SocketAddr::new(ip, port))
    }

    /// Build the address of a socket for the given transport
    #[must_use]
    pub fn from_socket_addr(addr: SocketAddr, transport: &str) -> Self {
        let family = if addr.is_ipv4() { "ip4" } else { "ip6" };
        Self(format!("/{family}/{}/{transport}/{}", addr.ip(), addr.port()))
    }

    /// Append a `/p2p/<id>` component
    #[must_use]
    pub fn with_peer(&self, peer: &PeerId) -> Self {
        Self(format!("{}/p2p/{peer}", self.0))
    }

    /// Circuit address through this relay address for `target`
    #[must_use]
    pub fn circuit(&self, relay: &PeerId, target: &PeerId) -> Self {
        Self(format!("{}/p2p/{relay}/{CIRCUIT_COMPONENT}/p2p/{target}", self.0))
    }
}

impl FromStr for PeerAddr {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > MAX_ADDR_LEN {
            return Err(ProtoError::InvalidAddress(format!(
                "address longer than {MAX_ADDR_LEN} bytes"
            )));
        }
        let Some(rest) = s.strip_prefix('/') else {
            return Err(ProtoError::InvalidAddress(format!("{s:?} does not start with '/'")));
        };
        if rest.split('/').any(str::is_empty) {
            return Err(ProtoError::InvalidAddress(format!("{s:?} has an empty component")));
        }
        if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ProtoError::InvalidAddress(format!("{s:?} contains whitespace")));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for PeerAddr {
    type Error = ProtoError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PeerAddr> for String {
    fn from(addr: PeerAddr) -> Self {
        addr.0
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peer together with the addresses it can be dialed on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    /// Peer identifier
    pub id: PeerId,
    /// Dialable addresses, without the trailing `/p2p/<id>`
    pub addrs: Vec<PeerAddr>,
}

impl AddrInfo {
    /// Parse an address of the form `<transport address>/p2p/<hex peer id>`
    ///
    /// # Errors
    ///
    /// Returns an error if the address is malformed or lacks a trailing peer
    /// id component.
    pub fn from_p2p_addr(s: &str) -> Result<Self, ProtoError> {
        let addr: PeerAddr = s.parse()?;
        let Some((transport, id)) = addr.as_str().rsplit_once("/p2p/") else {
            return Err(ProtoError::InvalidAddress(format!("{s:?} has no /p2p/<id> suffix")));
        };
        let id: PeerId = id.parse()?;
        let addrs = if transport.is_empty() {
            Vec::new()
        } else {
            vec![transport.parse()?]
        };
        Ok(Self { id, addrs })
    }
}

impl FromStr for AddrInfo {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_p2p_addr(s)
    }
}

impl fmt::Display for AddrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addrs.first() {
            Some(addr) => write!(f, "{}", addr.with_peer(&self.id)),
            None => write!(f, "/p2p/{}", self.id),
        }
    }
}

/// A reachable peer as stored by the presence directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    /// Human-readable nickname
    pub nick: String,
    /// Peer identifier
    pub peer_id: PeerId,
    /// Advertised addresses, in announce order
    pub addrs: Vec<PeerAddr>,
}

impl PresenceRecord {
    /// Where to dial this peer
    #[must_use]
    pub fn addr_info(&self) -> AddrInfo {
        AddrInfo {
            id: self.peer_id,
            addrs: self.addrs.clone(),
        }
    }

    /// Wire form of the record
    #[must_use]
    pub fn to_peer_info(&self) -> PeerInfo {
        PeerInfo {
            nick: self.nick.clone(),
            peer_id: self.peer_id.as_bytes().to_vec(),
            addrs: self.addrs.iter().map(PeerAddr::to_bytes).collect(),
        }
    }
}

impl TryFrom<PeerInfo> for PresenceRecord {
    type Error = ProtoError;

    fn try_from(info: PeerInfo) -> Result<Self, Self::Error> {
        let peer_id = PeerId::from_bytes(&info.peer_id)?;
        let addrs = info
            .addrs
            .iter()
            .map(|bytes| PeerAddr::from_bytes(bytes))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            nick: info.nick,
            peer_id,
            addrs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flare_crypto::Identity;
    use proptest::prelude::*;

    #[test]
    fn test_peer_addr_validation() {
        assert!("/ip4/127.0.0.1/tcp/4001".parse::<PeerAddr>().is_ok());
        assert!("ip4/127.0.0.1/tcp/4001".parse::<PeerAddr>().is_err());
        assert!("/ip4//tcp/4001".parse::<PeerAddr>().is_err());
        assert!("/ip4/127.0.0.1/tcp/4001/".parse::<PeerAddr>().is_err());
        assert!("/".parse::<PeerAddr>().is_err());
        assert!("/ip4/1.2.3.4 /tcp/1".parse::<PeerAddr>().is_err());
        assert!(PeerAddr::from_bytes(&[0x2f, 0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_relay_detection() {
        let relay = Identity::generate().peer_id();
        let target = Identity::generate().peer_id();
        let base: PeerAddr = "/ip4/198.51.100.1/tcp/4001".parse().unwrap();

        assert!(!base.is_relayed());
        assert!(base.circuit(&relay, &target).is_relayed());
    }

    #[test]
    fn test_socket_addr_extraction() {
        let addr: PeerAddr = "/ip4/203.0.113.7/udp/4001/quic".parse().unwrap();
        assert_eq!(addr.socket_addr(), Some("203.0.113.7:4001".parse().unwrap()));
        assert_eq!(addr.transport(), Some("udp"));

        let v6: PeerAddr = "/ip6/::1/tcp/80".parse().unwrap();
        assert_eq!(v6.socket_addr(), Some("[::1]:80".parse().unwrap()));

        let mismatched: PeerAddr = "/ip6/127.0.0.1/tcp/80".parse().unwrap();
        assert_eq!(mismatched.socket_addr(), None);

        let dns: PeerAddr = "/dns4/example.com/tcp/80".parse().unwrap();
        assert_eq!(dns.socket_addr(), None);
    }

    #[test]
    fn test_socket_addr_roundtrip() {
        let sock: SocketAddr = "192.0.2.10:9000".parse().unwrap();
        let addr = PeerAddr::from_socket_addr(sock, "tcp");
        assert_eq!(addr.as_str(), "/ip4/192.0.2.10/tcp/9000");
        assert_eq!(addr.socket_addr(), Some(sock));
    }

    #[test]
    fn test_addr_info_parse() {
        let id = Identity::generate().peer_id();
        let text = format!("/ip4/147.75.83.83/tcp/4001/p2p/{id}");
        let info: AddrInfo = text.parse().unwrap();

        assert_eq!(info.id, id);
        assert_eq!(info.addrs.len(), 1);
        assert_eq!(info.addrs[0].as_str(), "/ip4/147.75.83.83/tcp/4001");
        assert_eq!(info.to_string(), text);

        assert!("/ip4/147.75.83.83/tcp/4001".parse::<AddrInfo>().is_err());
        assert!("/ip4/147.75.83.83/tcp/4001/p2p/abcd".parse::<AddrInfo>().is_err());
    }

    #[test]
    fn test_record_rejects_bad_identity() {
        let info = PeerInfo {
            nick: "mallory".to_string(),
            peer_id: vec![1, 2, 3],
            addrs: vec![],
        };
        assert!(matches!(
            PresenceRecord::try_from(info),
            Err(ProtoError::InvalidPeerId(_))
        ));
    }

    #[test]
    fn test_record_rejects_bad_address() {
        let info = PeerInfo {
            nick: "mallory".to_string(),
            peer_id: vec![0u8; 32],
            addrs: vec![b"not an address".to_vec()],
        };
        assert!(matches!(
            PresenceRecord::try_from(info),
            Err(ProtoError::InvalidAddress(_))
        ));
    }

    fn arb_addr() -> impl Strategy<Value = PeerAddr> {
        (any::<[u8; 4]>(), any::<u16>(), prop::bool::ANY).prop_map(|(ip, port, tcp)| {
            let transport = if tcp { "tcp" } else { "udp" };
            PeerAddr::from_socket_addr(SocketAddr::from((ip, port)), transport)
        })
    }

    proptest! {
        #[test]
        fn prop_record_wire_roundtrip(
            nick in "\\PC{0,24}",
            id in any::<[u8; 32]>(),
            addrs in prop::collection::vec(arb_addr(), 0..6),
        ) {
            let record = PresenceRecord { nick, peer_id: PeerId::from(id), addrs };
            let decoded = PresenceRecord::try_from(record.to_peer_info()).unwrap();
            prop_assert_eq!(decoded, record);
        }
    }
}
