//! SOCKS5 client-side codec (RFC 1928 / RFC 1929)

use crate::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SOCKS5 version
pub const SOCKS5_VERSION: u8 = 0x05;

/// Authentication methods
pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_USERNAME_PASSWORD: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// Commands
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Reply codes
pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Address {
    /// Read `ATYP | ADDR | PORT` from a stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Self, u16)> {
        let mut atyp = [0u8; 1];
        reader.read_exact(&mut atyp).await?;

        match atyp[0] {
            ATYP_IPV4 => {
                let mut buf = [0u8; 6];
                reader.read_exact(&mut buf).await?;
                let addr = Address::Ipv4(Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]));
                Ok((addr, u16::from_be_bytes([buf[4], buf[5]])))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                reader.read_exact(&mut len).await?;
                let len = len[0] as usize;
                let mut buf = vec![0u8; len + 2];
                reader.read_exact(&mut buf).await?;
                let domain = String::from_utf8(buf[..len].to_vec())
                    .map_err(|e| Error::parse(format!("Invalid domain: {}", e)))?;
                Ok((Address::Domain(domain), u16::from_be_bytes([buf[len], buf[len + 1]])))
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 18];
                reader.read_exact(&mut buf).await?;
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[..16]);
                Ok((Address::Ipv6(Ipv6Addr::from(ip)), u16::from_be_bytes([buf[16], buf[17]])))
            }
            t => Err(Error::protocol(format!("Unknown address type: {}", t))),
        }
    }

    /// Append `ATYP | ADDR | PORT` to `buf`
    pub fn encode(&self, port: u16, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Address::Ipv4(ip) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Ipv6(ip) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Domain(domain) => {
                let bytes = domain.as_bytes();
                if bytes.len() > 255 {
                    return Err(Error::address("Domain name too long"));
                }
                buf.push(ATYP_DOMAIN);
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
        }
        buf.extend_from_slice(&port.to_be_bytes());
        Ok(())
    }

    pub fn to_ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Address::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Address::Domain(_) => None,
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

impl From<&str> for Address {
    fn from(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => ip.into(),
            Err(_) => Address::Domain(host.to_string()),
        }
    }
}

/// Client handshake: method negotiation, optional RFC 1929 auth, then one request.
/// Returns the bound address from the server reply.
pub async fn client_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    command: u8,
    target: &Address,
    port: u16,
    credentials: Option<(&str, &str)>,
) -> Result<(Address, u16)> {
    let greeting: &[u8] = if credentials.is_some() {
        &[SOCKS5_VERSION, 2, AUTH_NO_AUTH, AUTH_USERNAME_PASSWORD]
    } else {
        &[SOCKS5_VERSION, 1, AUTH_NO_AUTH]
    };
    stream
        .write_all(greeting)
        .await
        .map_err(|e| Error::connection(format!("Failed to send SOCKS5 greeting: {}", e)))?;

    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .map_err(|e| Error::connection(format!("Failed to read SOCKS5 response: {}", e)))?;
    if choice[0] != SOCKS5_VERSION {
        return Err(Error::protocol("Invalid SOCKS5 version"));
    }

    match (choice[1], credentials) {
        (AUTH_NO_AUTH, _) => {}
        (AUTH_USERNAME_PASSWORD, Some((user, pass))) => {
            authenticate(stream, user, pass).await?;
        }
        (AUTH_NO_ACCEPTABLE, _) => {
            return Err(Error::auth("No acceptable authentication method"));
        }
        (method, _) => {
            return Err(Error::protocol(format!(
                "Unsupported authentication method: {}",
                method
            )));
        }
    }

    let mut request = vec![SOCKS5_VERSION, command, 0x00];
    target.encode(port, &mut request)?;
    stream
        .write_all(&request)
        .await
        .map_err(|e| Error::connection(format!("Failed to send SOCKS5 request: {}", e)))?;

    let mut reply = [0u8; 3];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| Error::connection(format!("Failed to read SOCKS5 reply: {}", e)))?;
    if reply[0] != SOCKS5_VERSION {
        return Err(Error::protocol("Invalid SOCKS5 version in reply"));
    }
    if reply[1] != REP_SUCCEEDED {
        return Err(Error::connection(reply_error_message(reply[1])));
    }

    Address::read_from(stream).await
}

async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    username: &str,
    password: &str,
) -> Result<()> {
    if username.len() > 255 || password.len() > 255 {
        return Err(Error::auth("Username or password too long"));
    }

    let mut request = vec![0x01, username.len() as u8];
    request.extend_from_slice(username.as_bytes());
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());
    stream.write_all(&request).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[1] != 0x00 {
        return Err(Error::auth("Authentication failed"));
    }
    Ok(())
}

pub fn reply_error_message(code: u8) -> String {
    match code {
        REP_GENERAL_FAILURE => "General SOCKS server failure".to_string(),
        REP_CONNECTION_NOT_ALLOWED => "Connection not allowed by ruleset".to_string(),
        REP_NETWORK_UNREACHABLE => "Network unreachable".to_string(),
        REP_HOST_UNREACHABLE => "Host unreachable".to_string(),
        REP_CONNECTION_REFUSED => "Connection refused".to_string(),
        REP_TTL_EXPIRED => "TTL expired".to_string(),
        REP_COMMAND_NOT_SUPPORTED => "Command not supported".to_string(),
        REP_ADDRESS_TYPE_NOT_SUPPORTED => "Address type not supported".to_string(),
        _ => format!("Unknown error: {}", code),
    }
}

/// UDP relay header: `RSV(2) | FRAG | ATYP | ADDR | PORT`
#[derive(Debug)]
pub struct UdpHeader {
    pub frag: u8,
    pub address: Address,
    pub port: u16,
}

impl UdpHeader {
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 10 {
            return Err(Error::protocol("UDP header too short"));
        }
        let frag = data[2];

        let (address, addr_len) = match data[3] {
            ATYP_IPV4 => (
                Address::Ipv4(Ipv4Addr::new(data[4], data[5], data[6], data[7])),
                4,
            ),
            ATYP_DOMAIN => {
                let len = data[4] as usize;
                if data.len() < 7 + len {
                    return Err(Error::protocol("UDP header too short for domain"));
                }
                let domain = String::from_utf8_lossy(&data[5..5 + len]).to_string();
                (Address::Domain(domain), 1 + len)
            }
            ATYP_IPV6 => {
                if data.len() < 22 {
                    return Err(Error::protocol("UDP header too short for IPv6"));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[4..20]);
                (Address::Ipv6(Ipv6Addr::from(octets)), 16)
            }
            atyp => return Err(Error::protocol(format!("Unknown address type: {}", atyp))),
        };

        let port_offset = 4 + addr_len;
        let port = u16::from_be_bytes([data[port_offset], data[port_offset + 1]]);
        Ok((UdpHeader { frag, address, port }, port_offset + 2))
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&[0x00, 0x00, self.frag]);
        self.address.encode(self.port, buf)
    }

    /// Source socket address of a relayed datagram, if the server sent an IP
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address.to_ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}
