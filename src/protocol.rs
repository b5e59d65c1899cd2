//! faultgate/src/protocol.rs
//! SOCKS5 negotiation: method selection, CONNECT request decoding, outbound dial.

use crate::resolver::{ResolveError, Resolver};
use crate::types::TargetAddr;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const SOCKS_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported SOCKS version {0:#04x}")]
    BadVersion(u8),
    #[error("client offered no acceptable auth method")]
    NoAcceptableMethod,
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("malformed address: {0}")]
    BadAddress(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Completes the SOCKS5 negotiation on an accepted socket and dials the
/// requested destination. Returns the outbound connection and the decoded
/// target descriptor; the caller never touches the SOCKS5 framing.
pub async fn handshake(
    inbound: &mut TcpStream,
    resolver: &Resolver,
) -> Result<(TcpStream, TargetAddr), ProtocolError> {
    negotiate_method(inbound).await?;
    let target = read_request(inbound, resolver).await?;
    match TcpStream::connect((target.ip, target.port)).await {
        Ok(outbound) => {
            let bound = outbound.local_addr()?;
            write_reply(inbound, REP_SUCCEEDED, bound).await?;
            Ok((outbound, target))
        }
        Err(e) => {
            write_reply(inbound, REP_CONNECTION_REFUSED, unspecified_addr()).await?;
            Err(e.into())
        }
    }
}

fn unspecified_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

/// Method negotiation: we only speak NO AUTH.
async fn negotiate_method<S>(stream: &mut S) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(ProtocolError::BadVersion(version));
    }
    let nmethods = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(ProtocolError::NoAcceptableMethod);
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

/// Decodes the request that follows method selection. Only CONNECT is
/// supported; domain addresses are resolved here so the pipeline always has
/// a concrete destination IP.
async fn read_request<S>(stream: &mut S, resolver: &Resolver) -> Result<TargetAddr, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let [version, command, _reserved, atyp] = head;
    if version != SOCKS_VERSION {
        return Err(ProtocolError::BadVersion(version));
    }
    if command != CMD_CONNECT {
        write_reply(stream, REP_COMMAND_NOT_SUPPORTED, unspecified_addr()).await?;
        return Err(ProtocolError::UnsupportedCommand(command));
    }

    let (fqdn, ip) = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            (String::new(), IpAddr::from(octets))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            (String::new(), IpAddr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let fqdn =
                String::from_utf8(name).map_err(|e| ProtocolError::BadAddress(e.to_string()))?;
            match resolver.resolve(&fqdn).await {
                Ok(ip) => (fqdn, ip),
                Err(e) => {
                    write_reply(stream, REP_HOST_UNREACHABLE, unspecified_addr()).await?;
                    return Err(e.into());
                }
            }
        }
        other => {
            return Err(ProtocolError::BadAddress(format!(
                "unknown address type {other:#04x}"
            )));
        }
    };
    let port = stream.read_u16().await?;

    Ok(TargetAddr {
        fqdn,
        ip,
        port,
        proxy_host: String::new(),
    })
}

async fn write_reply<S>(stream: &mut S, reply: u8, bound: SocketAddr) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut packet = vec![SOCKS_VERSION, reply, 0x00];
    match bound.ip() {
        IpAddr::V4(v4) => {
            packet.push(ATYP_IPV4);
            packet.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            packet.push(ATYP_IPV6);
            packet.extend_from_slice(&v6.octets());
        }
    }
    packet.extend_from_slice(&bound.port().to_be_bytes());
    stream.write_all(&packet).await
}
