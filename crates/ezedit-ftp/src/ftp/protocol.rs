//! Control-channel command/reply codec (RFC 959 §4).
//!
//! Handles:
//! - Sending FTP commands terminated with `\r\n`
//! - Reading single-line and multi-line replies
//! - Parsing the 3-digit reply code

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::FtpResponse;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Anything the control or data channel can run over: plain TCP, TLS, or an
/// in-memory pipe in tests.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> IoStream for T {}

pub type BoxedStream = Box<dyn IoStream>;

/// Run `fut` under `limit`, mapping expiry to a `Timeout` error.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> FtpResult<T>
where
    F: Future<Output = FtpResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(FtpError::timeout(format!(
            "{} timed out after {}ms",
            what,
            limit.as_millis()
        ))),
    }
}

/// The FTP control connection.
pub struct ControlChannel {
    stream: BufReader<BoxedStream>,
    timeout: Duration,
}

impl ControlChannel {
    pub fn new(stream: BoxedStream, timeout: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            timeout,
        }
    }

    /// Give back the raw stream, e.g. to wrap it in TLS after `AUTH TLS`.
    pub fn into_inner(self) -> BoxedStream {
        self.stream.into_inner()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a raw FTP command (without the trailing CRLF).
    ///
    /// Commands carrying CR, LF or NUL are refused before anything is
    /// written, so the channel stays in sync.
    pub async fn send_command(&mut self, cmd: &str) -> FtpResult<()> {
        check_command(cmd)?;
        let line = format!("{}\r\n", cmd);
        let stream = self.stream.get_mut();
        with_timeout(self.timeout, "Sending command", async {
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await?;
            Ok(())
        })
        .await?;
        log::trace!(">>> {}", redact(cmd));
        Ok(())
    }

    async fn read_line_raw(&mut self) -> FtpResult<String> {
        let mut buf = String::new();
        let reader = &mut self.stream;
        let n = with_timeout(self.timeout, "Waiting for reply", async {
            Ok(reader.read_line(&mut buf).await?)
        })
        .await?;
        if n == 0 {
            return Err(FtpError::disconnected("Server closed connection"));
        }
        Ok(buf)
    }

    /// Read a complete FTP reply (possibly multi-line).
    ///
    /// Multi-line replies look like:
    /// ```text
    /// 220-Welcome to my FTP server
    /// 220-This is line 2
    /// 220 End of greeting
    /// ```
    pub async fn read_response(&mut self) -> FtpResult<FtpResponse> {
        let first = self.read_line_raw().await?;
        let first = trim_eol(&first);
        let code = parse_code(first)?;
        let mut lines = vec![first.to_string()];

        if first.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{} ", code);
            loop {
                let next = self.read_line_raw().await?;
                let next = trim_eol(&next);
                lines.push(next.to_string());
                if next.starts_with(&terminator) || next == terminator.trim_end() {
                    break;
                }
            }
        }

        let resp = FtpResponse { code, lines };
        log::trace!(
            "<<< {}",
            resp.lines.last().map(String::as_str).unwrap_or_default()
        );
        Ok(resp)
    }

    /// Send a command and return the reply.
    pub async fn execute(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        self.send_command(cmd).await?;
        self.read_response().await
    }

    /// Send a command and require a 2xx reply.
    pub async fn expect_ok(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        let resp = self.execute(cmd).await?;
        if !resp.is_completion() {
            return Err(FtpError::from_reply(resp.code, &resp.text()));
        }
        Ok(resp)
    }

    /// Read a reply and require a 2xx code (e.g. after a data transfer).
    pub async fn expect_completion(&mut self) -> FtpResult<FtpResponse> {
        let resp = self.read_response().await?;
        if !resp.is_completion() {
            return Err(FtpError::from_reply(resp.code, &resp.text()));
        }
        Ok(resp)
    }
}

/// A command must fit on one control line.
pub(crate) fn check_command(cmd: &str) -> FtpResult<()> {
    if cmd.contains(['\r', '\n', '\0']) {
        return Err(FtpError::invalid_config(format!(
            "Refusing command with embedded line break or NUL: {:?}",
            redact(cmd)
        )));
    }
    Ok(())
}

fn trim_eol(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

/// Parse the 3-digit reply code from the start of a line.
pub fn parse_code(line: &str) -> FtpResult<u16> {
    let digits = line
        .get(..3)
        .ok_or_else(|| FtpError::protocol_error(format!("Reply too short: '{}'", line)))?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FtpError::protocol_error(format!(
            "Invalid reply code in: '{}'",
            line
        )));
    }
    digits
        .parse::<u16>()
        .map_err(|_| FtpError::protocol_error(format!("Invalid reply code in: '{}'", line)))
}

/// Keep passwords out of the wire log.
fn redact(cmd: &str) -> &str {
    if cmd
        .as_bytes()
        .get(..5)
        .is_some_and(|p| p.eq_ignore_ascii_case(b"PASS "))
    {
        "PASS ***"
    } else {
        cmd
    }
}
