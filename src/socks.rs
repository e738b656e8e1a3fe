use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION5: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Human readable text for a SOCKS5 reply code
pub fn reply_text(code: u8) -> &'static str {
    match code {
        REP_SUCCESS => "succeeded",
        REP_GENERAL_FAILURE => "general SOCKS server failure",
        REP_CONNECTION_NOT_ALLOWED => "connection not allowed by ruleset",
        REP_NETWORK_UNREACHABLE => "network unreachable",
        REP_HOST_UNREACHABLE => "host unreachable",
        REP_CONNECTION_REFUSED => "connection refused",
        REP_TTL_EXPIRED => "TTL expired",
        REP_COMMAND_NOT_SUPPORTED => "command not supported",
        REP_ADDRESS_TYPE_NOT_SUPPORTED => "address type not supported",
        _ => "unassigned reply code",
    }
}

/// Error type for SOCKS5 protocol operations
#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    #[error("no authentication methods offered")]
    NoMethods,

    #[error("no acceptable authentication method among {0:?}")]
    NoAcceptableMethod(Vec<u8>),

    #[error("upstream selected unsupported auth method {0:#04x}")]
    UnexpectedMethod(u8),

    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Non-success reply code reported by the peer
    #[error("connection failed: reply code {0} ({})", reply_text(*.0))]
    Reply(u8),

    #[error("{stage}: {source}")]
    Io {
        stage: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Result type for SOCKS5 operations
pub type SocksResult<T> = Result<T, SocksError>;

impl SocksError {
    fn io(stage: &'static str) -> impl FnOnce(io::Error) -> SocksError {
        move |source| SocksError::Io { stage, source }
    }

    /// Reply code to send back to a client whose request produced this error
    pub fn reply_code(&self) -> u8 {
        match self {
            SocksError::Reply(code) => *code,
            SocksError::UnsupportedCommand(_) => REP_COMMAND_NOT_SUPPORTED,
            SocksError::UnsupportedAddressType(_) => REP_ADDRESS_TYPE_NOT_SUPPORTED,
            _ => REP_GENERAL_FAILURE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4,
    Ipv6,
    Domain,
}

impl AddressType {
    pub fn code(self) -> u8 {
        match self {
            AddressType::Ipv4 => ATYP_IPV4,
            AddressType::Ipv6 => ATYP_IPV6,
            AddressType::Domain => ATYP_DOMAIN,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            ATYP_IPV4 => Some(AddressType::Ipv4),
            ATYP_IPV6 => Some(AddressType::Ipv6),
            ATYP_DOMAIN => Some(AddressType::Domain),
            _ => None,
        }
    }
}

/// Destination requested by a client.
///
/// `raw` holds the address exactly as it appeared on the wire
/// (atyp, address bytes, port) and is what gets forwarded to upstreams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress {
    kind: AddressType,
    host: String,
    port: u16,
    raw: Bytes,
}

#[cfg(test)]
impl TargetAddress {
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let mut raw = BytesMut::with_capacity(19);
        let kind = match addr.ip() {
            IpAddr::V4(ip) => {
                raw.put_u8(AddressType::Ipv4.code());
                raw.put_slice(&ip.octets());
                AddressType::Ipv4
            }
            IpAddr::V6(ip) => {
                raw.put_u8(AddressType::Ipv6.code());
                raw.put_slice(&ip.octets());
                AddressType::Ipv6
            }
        };
        raw.put_u16(addr.port());
        Self {
            kind,
            host: addr.ip().to_string(),
            port: addr.port(),
            raw: raw.freeze(),
        }
    }

    /// `None` when the name does not fit the one-byte length prefix
    pub fn domain(host: &str, port: u16) -> Option<Self> {
        if host.len() > u8::MAX as usize {
            return None;
        }
        let mut raw = BytesMut::with_capacity(host.len() + 4);
        raw.put_u8(AddressType::Domain.code());
        raw.put_u8(host.len() as u8);
        raw.put_slice(host.as_bytes());
        raw.put_u16(port);
        Some(Self {
            kind: AddressType::Domain,
            host: host.to_string(),
            port,
            raw: raw.freeze(),
        })
    }
}

impl TargetAddress {

    /// Decode an address whose type byte has already been read
    pub async fn read_from<R>(reader: &mut R, atyp: u8) -> SocksResult<Self>
    where
        R: AsyncRead + Unpin,
    {
        let kind = AddressType::from_code(atyp).ok_or(SocksError::UnsupportedAddressType(atyp))?;
        let mut raw = BytesMut::with_capacity(19);
        raw.put_u8(atyp);

        let host = match kind {
            AddressType::Ipv4 => {
                let mut octets = [0u8; 4];
                reader
                    .read_exact(&mut octets)
                    .await
                    .map_err(SocksError::io("read IPv4 address"))?;
                raw.put_slice(&octets);
                Ipv4Addr::from(octets).to_string()
            }
            AddressType::Ipv6 => {
                let mut octets = [0u8; 16];
                reader
                    .read_exact(&mut octets)
                    .await
                    .map_err(SocksError::io("read IPv6 address"))?;
                raw.put_slice(&octets);
                Ipv6Addr::from(octets).to_string()
            }
            AddressType::Domain => {
                let len = reader
                    .read_u8()
                    .await
                    .map_err(SocksError::io("read domain length"))?;
                let mut name = vec![0u8; len as usize];
                reader
                    .read_exact(&mut name)
                    .await
                    .map_err(SocksError::io("read domain"))?;
                raw.put_u8(len);
                raw.put_slice(&name);
                String::from_utf8_lossy(&name).into_owned()
            }
        };

        let mut port = [0u8; 2];
        reader
            .read_exact(&mut port)
            .await
            .map_err(SocksError::io("read port"))?;
        raw.put_slice(&port);

        Ok(Self {
            kind,
            host,
            port: u16::from_be_bytes(port),
            raw: raw.freeze(),
        })
    }

    pub fn kind(&self) -> AddressType {
        self.kind
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AddressType::Ipv6 => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Server side method negotiation. Only "no authentication" is accepted.
pub async fn negotiate<S>(stream: &mut S) -> SocksResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream
        .read_exact(&mut header)
        .await
        .map_err(SocksError::io("read version and nmethods"))?;

    let [version, nmethods] = header;
    if version != VERSION5 {
        return Err(SocksError::UnsupportedVersion(version));
    }
    if nmethods == 0 {
        return Err(SocksError::NoMethods);
    }

    let mut methods = vec![0u8; nmethods as usize];
    stream
        .read_exact(&mut methods)
        .await
        .map_err(SocksError::io("read methods"))?;

    if !methods.contains(&METHOD_NO_AUTH) {
        // The connection is failed either way, a write error changes nothing
        let _ = stream.write_all(&[VERSION5, METHOD_NO_ACCEPTABLE]).await;
        return Err(SocksError::NoAcceptableMethod(methods));
    }

    stream
        .write_all(&[VERSION5, METHOD_NO_AUTH])
        .await
        .map_err(SocksError::io("write method selection"))
}

/// Read a client request. Only CONNECT is supported.
pub async fn read_request<R>(reader: &mut R) -> SocksResult<TargetAddress>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader
        .read_exact(&mut header)
        .await
        .map_err(SocksError::io("read request header"))?;

    let [version, cmd, _reserved, atyp] = header;
    if version != VERSION5 {
        return Err(SocksError::UnsupportedVersion(version));
    }
    if cmd != CMD_CONNECT {
        return Err(SocksError::UnsupportedCommand(cmd));
    }

    TargetAddress::read_from(reader, atyp).await
}

/// Encode a reply. IPv4-mappable bind addresses are sent in IPv4 form and a
/// missing bind address becomes `0.0.0.0:0`.
pub fn encode_reply(code: u8, bind: Option<SocketAddr>) -> Vec<u8> {
    let mut reply = Vec::with_capacity(22);
    reply.extend_from_slice(&[VERSION5, code, 0x00]);

    match bind {
        None => {
            reply.push(AddressType::Ipv4.code());
            reply.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
        Some(addr) => {
            let ip = match addr.ip() {
                IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
                v4 => v4,
            };
            match ip {
                IpAddr::V4(v4) => {
                    reply.push(AddressType::Ipv4.code());
                    reply.extend_from_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    reply.push(AddressType::Ipv6.code());
                    reply.extend_from_slice(&v6.octets());
                }
            }
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
    }

    reply
}

pub async fn send_reply<W>(writer: &mut W, code: u8, bind: Option<SocketAddr>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_reply(code, bind)).await
}

/// Client side negotiation against an upstream: offer no-auth only
pub async fn client_negotiate<S>(stream: &mut S) -> SocksResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[VERSION5, 1, METHOD_NO_AUTH])
        .await
        .map_err(SocksError::io("write negotiation"))?;

    let mut selection = [0u8; 2];
    stream
        .read_exact(&mut selection)
        .await
        .map_err(SocksError::io("read negotiation response"))?;

    match selection {
        [VERSION5, METHOD_NO_AUTH] => Ok(()),
        [VERSION5, method] => Err(SocksError::UnexpectedMethod(method)),
        [version, _] => Err(SocksError::UnsupportedVersion(version)),
    }
}

/// Client side CONNECT. The bind address in the reply is read and discarded.
pub async fn client_connect<S>(stream: &mut S, target: &TargetAddress) -> SocksResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = Vec::with_capacity(3 + target.raw().len());
    request.extend_from_slice(&[VERSION5, CMD_CONNECT, 0x00]);
    request.extend_from_slice(target.raw());
    stream
        .write_all(&request)
        .await
        .map_err(SocksError::io("write connect request"))?;

    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(SocksError::io("read reply header"))?;

    let [version, code, _reserved, atyp] = header;
    if version != VERSION5 {
        return Err(SocksError::UnsupportedVersion(version));
    }
    if code != REP_SUCCESS {
        return Err(SocksError::Reply(code));
    }

    let remaining = match atyp {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let len = stream
                .read_u8()
                .await
                .map_err(SocksError::io("read bind domain length"))?;
            len as usize + 2
        }
        other => return Err(SocksError::UnsupportedAddressType(other)),
    };
    let mut discard = vec![0u8; remaining];
    stream
        .read_exact(&mut discard)
        .await
        .map_err(SocksError::io("read bind address"))?;

    Ok(())
}
