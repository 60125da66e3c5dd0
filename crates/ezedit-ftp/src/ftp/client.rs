//! Concrete FTP session over TCP, with optional explicit or implicit TLS.
//!
//! Lifecycle: TCP connect → (implicit TLS) → banner → (AUTH TLS, PBSZ,
//! PROT P) → USER/PASS → TYPE I → PWD.

use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::parser;
use crate::ftp::protocol::{check_command, with_timeout, BoxedStream, ControlChannel};
use crate::ftp::session::{FtpConnector, FtpSession};
use crate::ftp::tls::FtpTls;
use crate::ftp::transfer;
use crate::ftp::types::*;
use async_trait::async_trait;
use std::net::IpAddr;
use tokio::net::TcpStream;

/// A logged-in FTP session.
pub struct FtpClient {
    ctrl: ControlChannel,
    config: FtpConnectionConfig,
    tls: Option<FtpTls>,
    peer: Option<IpAddr>,
    banner: String,
    cwd: String,
}

impl FtpClient {
    /// Establish and authenticate a new session.
    pub async fn connect(config: &FtpConnectionConfig) -> FtpResult<Self> {
        config.validate()?;
        let key = config.key();
        let addr = format!("{}:{}", config.host, config.port);

        let tcp = with_timeout(config.connect_timeout(), "TCP connect", async {
            TcpStream::connect((config.host.as_str(), config.port))
                .await
                .map_err(|e| FtpError::host_unreachable(format!("TCP connect to {}: {}", addr, e)))
        })
        .await
        .map_err(|e| match e.kind {
            FtpErrorKind::Timeout => FtpError::host_unreachable(e.message),
            _ => e,
        })
        .map_err(|e| e.with_connection(&key))?;

        tcp.set_nodelay(true).ok();
        let peer = tcp.peer_addr().ok().map(|a| a.ip());

        let tls = if config.security.is_secure() {
            Some(FtpTls::new(&config.host, config.accept_invalid_certs)?)
        } else {
            None
        };

        let mut stream: BoxedStream = Box::new(tcp);
        if let (FtpSecurityMode::Implicit, Some(tls)) = (config.security, tls.as_ref()) {
            stream = tls.wrap(stream, "Implicit").await?;
        }

        let mut ctrl = ControlChannel::new(stream, config.data_timeout());
        let banner = ctrl.read_response().await?;
        if !banner.is_completion() {
            return Err(FtpError::from_reply(banner.code, &banner.text()).with_connection(&key));
        }

        // ── Explicit FTPS: AUTH TLS ──────────────────────────────
        if let (FtpSecurityMode::Explicit, Some(tls)) = (config.security, tls.as_ref()) {
            let resp = ctrl.execute("AUTH TLS").await?;
            if !resp.is_completion() {
                return Err(FtpError::tls_failed(format!(
                    "AUTH TLS rejected: {}",
                    resp.text()
                ))
                .with_code(resp.code)
                .with_connection(&key));
            }
            let timeout = ctrl.timeout();
            let upgraded = tls.wrap(ctrl.into_inner(), "Explicit").await?;
            ctrl = ControlChannel::new(upgraded, timeout);
        }
        if tls.is_some() {
            ctrl.expect_ok("PBSZ 0").await?;
            ctrl.expect_ok("PROT P").await?;
        }

        // ── Authenticate ─────────────────────────────────────────
        login(&mut ctrl, config).await.map_err(|e| e.with_connection(&key))?;

        ctrl.expect_ok("TYPE I").await?;

        let cwd = match ctrl.expect_ok("PWD").await {
            Ok(resp) => parse_pwd(&resp.text()).unwrap_or_else(|_| "/".into()),
            Err(_) => "/".into(),
        };

        log::info!(
            "FTP session {} established ({:?}), cwd {}",
            key,
            config.security,
            cwd
        );

        Ok(Self {
            ctrl,
            config: config.clone(),
            tls,
            peer,
            banner: banner.text(),
            cwd,
        })
    }

    pub fn banner(&self) -> &str {
        &self.banner
    }

    pub fn current_directory(&self) -> &str {
        &self.cwd
    }

    async fn open_data(&mut self) -> FtpResult<BoxedStream> {
        transfer::open_passive(
            &mut self.ctrl,
            &self.config.host,
            self.peer,
            self.config.data_timeout(),
        )
        .await
    }

    /// Issue a transfer command on an already-open data connection and wait
    /// for the server to accept it.
    async fn start_transfer(&mut self, data: BoxedStream, cmd: &str) -> FtpResult<BoxedStream> {
        let resp = self.ctrl.execute(cmd).await?;
        if !resp.is_preliminary() && !resp.is_completion() {
            return Err(FtpError::from_reply(resp.code, &resp.text()));
        }
        match &self.tls {
            Some(tls) => tls.wrap(data, "Data channel").await,
            None => Ok(data),
        }
    }

    /// Open a data channel, run `cmd`, and collect everything the server sends.
    async fn retrieve(&mut self, cmd: &str) -> FtpResult<Vec<u8>> {
        check_command(cmd)?;
        let data = self.open_data().await?;
        let data = self.start_transfer(data, cmd).await?;
        let body = transfer::read_all(data, self.config.data_timeout()).await?;
        self.ctrl.expect_completion().await?;
        Ok(body)
    }
}

async fn login(ctrl: &mut ControlChannel, config: &FtpConnectionConfig) -> FtpResult<()> {
    let user = ctrl.execute(&format!("USER {}", config.username)).await?;
    let done = if user.is_intermediate() {
        ctrl.execute(&format!("PASS {}", config.password)).await?
    } else {
        user
    };
    if done.is_completion() {
        return Ok(());
    }
    let err = FtpError::from_reply(done.code, &done.text());
    match err.kind {
        // Some servers answer a bad login with 5xx codes other than 530.
        FtpErrorKind::CommandRejected | FtpErrorKind::PermissionDenied => Err(FtpError::auth_failed(
            format!("Login failed: {}", done.text()),
        )
        .with_code(done.code)),
        _ => Err(err),
    }
}

/// Parse `257 "/some/path"` into the path string.
fn parse_pwd(text: &str) -> FtpResult<String> {
    let start = text
        .find('"')
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse PWD: {}", text)))?;
    let rest = &text[start + 1..];
    // Embedded quotes are doubled (RFC 959 appendix II).
    let mut path = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                path.push('"');
                chars.next();
            } else {
                return Ok(path);
            }
        } else {
            path.push(c);
        }
    }
    Err(FtpError::protocol_error(format!("Cannot parse PWD: {}", text)))
}

#[async_trait]
impl FtpSession for FtpClient {
    async fn noop(&mut self) -> FtpResult<()> {
        self.ctrl.expect_ok("NOOP").await?;
        Ok(())
    }

    async fn pwd(&mut self) -> FtpResult<String> {
        let resp = self.ctrl.expect_ok("PWD").await?;
        self.cwd = parse_pwd(&resp.text())?;
        Ok(self.cwd.clone())
    }

    async fn list(&mut self, path: &str) -> FtpResult<Vec<FtpEntry>> {
        let cmd = if path.is_empty() {
            "LIST".to_string()
        } else {
            format!("LIST {}", path)
        };
        let body = self.retrieve(&cmd).await?;
        Ok(parser::parse_listing(&String::from_utf8_lossy(&body)))
    }

    async fn download(&mut self, path: &str) -> FtpResult<Vec<u8>> {
        let body = self.retrieve(&format!("RETR {}", path)).await?;
        log::debug!("Downloaded {} ({} bytes)", path, body.len());
        Ok(body)
    }

    async fn upload(&mut self, path: &str, data: &[u8]) -> FtpResult<u64> {
        let cmd = format!("STOR {}", path);
        check_command(&cmd)?;
        let stream = self.open_data().await?;
        let stream = self.start_transfer(stream, &cmd).await?;
        let written = transfer::write_all(stream, data, self.config.data_timeout()).await?;
        self.ctrl.expect_completion().await?;
        log::debug!("Uploaded {} ({} bytes)", path, written);
        Ok(written)
    }

    async fn mkdir(&mut self, path: &str) -> FtpResult<()> {
        self.ctrl.expect_ok(&format!("MKD {}", path)).await?;
        Ok(())
    }

    async fn delete(&mut self, path: &str) -> FtpResult<()> {
        self.ctrl.expect_ok(&format!("DELE {}", path)).await?;
        Ok(())
    }

    async fn quit(&mut self) -> FtpResult<()> {
        self.ctrl.execute("QUIT").await?;
        log::info!("FTP session {} closed", self.config.key());
        Ok(())
    }
}

/// Opens real [`FtpClient`] sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl FtpConnector for TcpConnector {
    async fn connect(&self, config: &FtpConnectionConfig) -> FtpResult<Box<dyn FtpSession>> {
        let client = FtpClient::connect(config).await?;
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pwd_reply() {
        assert_eq!(
            parse_pwd("257 \"/home/site\" is the current directory").unwrap(),
            "/home/site"
        );
        assert_eq!(parse_pwd("257 \"/a \"\"quoted\"\" dir\"").unwrap(), "/a \"quoted\" dir");
        assert!(parse_pwd("257 no quotes").is_err());
    }
}
