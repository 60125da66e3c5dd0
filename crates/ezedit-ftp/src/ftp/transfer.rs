//! Passive-mode data channels (RFC 959 PASV, RFC 2428 EPSV).
//!
//! Only the TCP side lives here. Under `PROT P` the caller wraps the socket
//! in TLS once the server has answered the transfer command, since most
//! servers start their side of the handshake only then.

use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::protocol::{with_timeout, BoxedStream, ControlChannel};
use lazy_static::lazy_static;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

lazy_static! {
    static ref PASV_RE: Regex =
        Regex::new(r"\((\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})\)").unwrap();
    static ref EPSV_RE: Regex = Regex::new(r"\(\|\|\|(\d{1,5})\|\)").unwrap();
}

/// Where the data connection should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTarget {
    pub host: String,
    pub port: u16,
}

/// Negotiate a passive data connection and connect to it.
///
/// Tries `PASV` first and falls back to `EPSV` when the server rejects it.
pub async fn open_passive(
    ctrl: &mut ControlChannel,
    control_host: &str,
    control_peer: Option<IpAddr>,
    data_timeout: Duration,
) -> FtpResult<BoxedStream> {
    let target = match ctrl.expect_ok("PASV").await {
        Ok(resp) => {
            let advertised = parse_pasv_response(&resp.text())?;
            pasv_target(advertised, control_host, control_peer)
        }
        Err(e) if e.kind == FtpErrorKind::CommandRejected => {
            log::debug!("PASV rejected ({}), trying EPSV", e);
            let resp = ctrl.expect_ok("EPSV").await?;
            DataTarget {
                host: control_peer
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| control_host.to_string()),
                port: parse_epsv_response(&resp.text())?,
            }
        }
        Err(e) => return Err(e),
    };

    log::debug!("Opening data channel to {}:{}", target.host, target.port);
    let tcp = with_timeout(data_timeout, "Data channel connect", async {
        TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| {
                FtpError::data_channel(format!(
                    "Data connect to {}:{} failed: {}",
                    target.host, target.port, e
                ))
            })
    })
    .await
    .map_err(|e| match e.kind {
        FtpErrorKind::Timeout => FtpError::data_channel(e.message),
        _ => e,
    })?;

    tcp.set_nodelay(true).ok();
    Ok(Box::new(tcp))
}

/// Parse `(h1,h2,h3,h4,p1,p2)` from a 227 reply.
pub fn parse_pasv_response(text: &str) -> FtpResult<SocketAddr> {
    let caps = PASV_RE
        .captures(text)
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse PASV reply: {}", text)))?;

    let mut nums = [0u8; 6];
    for (i, slot) in nums.iter_mut().enumerate() {
        *slot = caps[i + 1]
            .parse::<u8>()
            .map_err(|_| FtpError::protocol_error("PASV number out of range"))?;
    }

    let ip = Ipv4Addr::new(nums[0], nums[1], nums[2], nums[3]);
    let port = u16::from(nums[4]) * 256 + u16::from(nums[5]);
    Ok(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Parse `(|||port|)` from a 229 reply.
pub fn parse_epsv_response(text: &str) -> FtpResult<u16> {
    let caps = EPSV_RE
        .captures(text)
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse EPSV reply: {}", text)))?;
    caps[1]
        .parse::<u16>()
        .map_err(|_| FtpError::protocol_error("EPSV port out of range"))
}

/// Pick the host to dial for a PASV reply.
///
/// Servers behind NAT often advertise `0.0.0.0` or their private address;
/// in both cases the control connection's peer is the reachable one.
pub fn pasv_target(advertised: SocketAddr, control_host: &str, control_peer: Option<IpAddr>) -> DataTarget {
    let fallback = || {
        control_peer
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| control_host.to_string())
    };
    let ip = advertised.ip();
    let host = if ip.is_unspecified() {
        fallback()
    } else if is_internal(ip) && control_peer.is_some_and(|peer| !is_internal(peer)) {
        log::debug!("Server advertised internal address {}, using control peer", ip);
        fallback()
    } else {
        ip.to_string()
    };
    DataTarget {
        host,
        port: advertised.port(),
    }
}

fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Drain a data stream to EOF.
pub async fn read_all(mut stream: BoxedStream, limit: Duration) -> FtpResult<Vec<u8>> {
    with_timeout(limit, "Data transfer", async move {
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .await
            .map_err(|e| FtpError::transfer_failed(format!("Reading data channel: {}", e)))?;
        Ok(buf)
    })
    .await
}

/// Write `data` and close the stream so the server sees EOF.
pub async fn write_all(mut stream: BoxedStream, data: &[u8], limit: Duration) -> FtpResult<u64> {
    with_timeout(limit, "Data transfer", async move {
        stream
            .write_all(data)
            .await
            .map_err(|e| FtpError::transfer_failed(format!("Writing data channel: {}", e)))?;
        stream
            .shutdown()
            .await
            .map_err(|e| FtpError::transfer_failed(format!("Closing data channel: {}", e)))?;
        Ok(data.len() as u64)
    })
    .await
}
