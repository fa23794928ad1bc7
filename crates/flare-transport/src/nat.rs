//! NAT type classification.
//!
//! Classification uses STUN binding requests (RFC 5389). Two servers that
//! see this host behind different mappings from the same local socket mean
//! the NAT allocates per destination (symmetric), which defeats hole
//! punching against arbitrary peers.

use flare_proto::Domain;
use rand::RngCore;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

/// STUN magic cookie
const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN header size
const HEADER_SIZE: usize = 20;

/// Binding request message type
const BINDING_REQUEST: u16 = 0x0001;

/// Binding success response message type
const BINDING_SUCCESS: u16 = 0x0101;

/// MAPPED-ADDRESS attribute
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;

/// XOR-MAPPED-ADDRESS attribute
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Per-query timeout
const STUN_TIMEOUT: Duration = Duration::from_secs(3);

/// NAT type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    /// No NAT detected, public IP address
    Open,
    /// Full Cone NAT - any external host can send to mapped port
    FullCone,
    /// Restricted Cone NAT - only contacted IPs can send
    RestrictedCone,
    /// Port Restricted Cone NAT - only contacted IP:port can send
    PortRestrictedCone,
    /// Symmetric NAT - different mapping per destination
    Symmetric,
    /// Unknown NAT type (detection inconclusive)
    Unknown,
}

impl NatType {
    /// Whether direct connections to arbitrary peers are hopeless
    #[must_use]
    pub fn is_symmetric(self) -> bool {
        self == Self::Symmetric
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "Open (No NAT)"),
            Self::FullCone => write!(f, "Full Cone NAT"),
            Self::RestrictedCone => write!(f, "Restricted Cone NAT"),
            Self::PortRestrictedCone => write!(f, "Port Restricted Cone NAT"),
            Self::Symmetric => write!(f, "Symmetric NAT"),
            Self::Unknown => write!(f, "Unknown NAT Type"),
        }
    }
}

/// Transport protocol a NAT classification applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatTransport {
    /// TCP mappings
    Tcp,
    /// UDP mappings
    Udp,
}

impl NatTransport {
    /// Transport whose NAT behaviour matters for a presence domain
    #[must_use]
    pub fn for_domain(domain: &Domain) -> Self {
        if domain.as_str().eq_ignore_ascii_case("TCP") {
            Self::Tcp
        } else {
            Self::Udp
        }
    }
}

/// NAT classification change reported by a host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatEvent {
    /// Transport the classification applies to
    pub transport: NatTransport,
    /// New classification
    pub nat_type: NatType,
}

/// NAT detection error
#[derive(Debug, thiserror::Error)]
pub enum NatError {
    /// I/O error during detection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// STUN server timeout
    #[error("STUN server timeout")]
    Timeout,
    /// Invalid response from STUN server
    #[error("Invalid STUN response")]
    InvalidResponse,
    /// No STUN servers available
    #[error("No STUN servers available")]
    NoServers,
}

fn binding_request(transaction_id: &[u8; 12]) -> [u8; HEADER_SIZE] {
    let mut bytes = [0u8; HEADER_SIZE];
    bytes[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // Length stays zero: no attributes
    bytes[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    bytes[8..20].copy_from_slice(transaction_id);
    bytes
}

fn decode_address(value: &[u8], xor: bool, transaction_id: &[u8; 12]) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        0x01 if value.len() >= 8 => {
            let mut octets: [u8; 4] = value[4..8].try_into().ok()?;
            if xor {
                for (b, m) in octets.iter_mut().zip(MAGIC_COOKIE.to_be_bytes()) {
                    *b ^= m;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x02 if value.len() >= 20 => {
            let mut octets: [u8; 16] = value[4..20].try_into().ok()?;
            if xor {
                let mut mask = [0u8; 16];
                mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                mask[4..].copy_from_slice(transaction_id);
                for (b, m) in octets.iter_mut().zip(mask) {
                    *b ^= m;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}

/// Extract the mapped address from a binding success response
fn parse_binding_response(bytes: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr, NatError> {
    if bytes.len() < HEADER_SIZE
        || u16::from_be_bytes([bytes[0], bytes[1]]) != BINDING_SUCCESS
        || u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) != MAGIC_COOKIE
        || &bytes[8..20] != transaction_id
    {
        return Err(NatError::InvalidResponse);
    }

    let length = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
    let end = (HEADER_SIZE + length).min(bytes.len());
    let mut offset = HEADER_SIZE;
    let mut fallback = None;

    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        let attr_len = usize::from(u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]));
        offset += 4;
        if offset + attr_len > end {
            break;
        }
        let value = &bytes[offset..offset + attr_len];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = decode_address(value, true, transaction_id) {
                    return Ok(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => fallback = decode_address(value, false, transaction_id),
            _ => {}
        }

        // Attributes are padded to 4-byte boundaries
        offset += attr_len.div_ceil(4) * 4;
    }

    fallback.ok_or(NatError::InvalidResponse)
}

/// Ask a STUN server which address it sees `socket` as
async fn mapped_address(socket: &UdpSocket, server: SocketAddr) -> Result<SocketAddr, NatError> {
    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction_id);

    socket
        .send_to(&binding_request(&transaction_id), server)
        .await?;

    let mut buf = [0u8; 1024];
    loop {
        let (len, from) = tokio::time::timeout(STUN_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| NatError::Timeout)??;
        if from != server {
            continue;
        }
        return parse_binding_response(&buf[..len], &transaction_id);
    }
}

fn is_public_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            !ipv4.is_private() && !ipv4.is_loopback() && !ipv4.is_link_local() && !ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => !ipv6.is_loopback() && !ipv6.is_multicast() && !ipv6.is_unspecified(),
    }
}

/// Classify the NAT in front of this host.
///
/// # Errors
///
/// Returns [`NatError::NoServers`] without servers, or the first STUN
/// failure encountered.
pub async fn detect(stun_servers: &[SocketAddr]) -> Result<NatType, NatError> {
    let Some(&primary) = stun_servers.first() else {
        return Err(NatError::NoServers);
    };

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let local = socket.local_addr()?;
    let external = mapped_address(&socket, primary).await?;

    if is_public_ip(&local.ip()) && local.ip() == external.ip() {
        return Ok(NatType::Open);
    }

    if let Some(&secondary) = stun_servers.get(1) {
        let external2 = mapped_address(&socket, secondary).await?;
        if external != external2 {
            return Ok(NatType::Symmetric);
        }
    } else {
        return Ok(NatType::Unknown);
    }

    let other = UdpSocket::bind("0.0.0.0:0").await?;
    let external3 = mapped_address(&other, primary).await?;
    if external.port() != external3.port() {
        return Ok(NatType::PortRestrictedCone);
    }

    // Telling full from restricted cone needs CHANGE-REQUEST support
    Ok(NatType::RestrictedCone)
}
