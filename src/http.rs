//! Minimal HTTP/1.1 helper on top of [`TcpSocket`].
//!
//! Builds request lines and header blocks and moves raw bytes; the body is
//! streamed by the caller. Response handling is limited to grabbing the first
//! non-empty chunk, which is enough to inspect the status line. This is not a
//! general HTTP reader and does not try to be one.

use core::str::FromStr;

#[cfg(feature = "defmt")]
use defmt::{debug, error, info};
use embassy_time::{Duration, Instant, Timer};
use heapless::{String, format};
#[cfg(not(feature = "defmt"))]
use log::{debug, error, info};

use crate::error::Error;
use crate::sara::socket::TcpSocket;

pub const HOST_SIZE: usize = 48;
/// Longest header block we assemble.
pub const HEADER_SIZE: usize = 256;
pub const REQUEST_SIZE: usize = 320;
const RESPONSE_POLL: Duration = Duration::from_millis(50);

/// An HTTP endpoint plus the request plumbing to talk to it.
pub struct HttpClient {
    host: String<HOST_SIZE>,
    port: u16,
}

impl HttpClient {
    pub fn new(host: &str, port: u16) -> crate::Result<Self> {
        Ok(Self {
            host: String::from_str(host).map_err(|_| Error::BufferTooSmallError)?,
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// `"{method} {path} HTTP/1.1\r\n{headers}"`.
    ///
    /// The caller provides a complete header block ending in the blank line.
    pub fn request(
        method: &str,
        path: &str,
        headers: &str,
    ) -> crate::Result<String<REQUEST_SIZE>> {
        format!(REQUEST_SIZE; "{method} {path} HTTP/1.1\r\n{headers}")
            .map_err(|_| Error::BufferTooSmallError)
    }

    /// The canonical header block for a raw-body POST upload.
    pub fn post_headers(&self, content_length: u64) -> crate::Result<String<HEADER_SIZE>> {
        format!(HEADER_SIZE;
            "Host: {}\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.host,
            content_length
        )
        .map_err(|_| Error::BufferTooSmallError)
    }

    /// Creates and connects a socket to the configured endpoint.
    pub async fn open<S: TcpSocket>(&self, socket: &mut S) -> crate::Result<u8> {
        let sock = socket.socket_create().await.inspect_err(|_| error!("socket_create failed"))?;
        if let Err(err) = socket.socket_connect(sock, &self.host, self.port).await {
            error!("socket_connect failed");
            let _ = socket.socket_close(sock).await;
            return Err(err);
        }
        info!("Connected: host {}, port {}", self.host.as_str(), self.port);
        Ok(sock)
    }

    /// Sends the request line and headers; the body follows separately.
    pub async fn send_header<S: TcpSocket>(
        &self,
        socket: &mut S,
        sock: u8,
        method: &str,
        path: &str,
        headers: &str,
    ) -> crate::Result<()> {
        if headers.is_empty() {
            error!("header is empty");
            return Err(Error::ParseError);
        }
        let request = Self::request(method, path, headers)?;
        let sent = socket.socket_send(sock, request.as_bytes()).await?;
        if sent != request.len() {
            error!("header send failed");
            return Err(Error::ModemError);
        }
        debug!("headers sent, {} bytes", sent);
        Ok(())
    }

    pub async fn send_body<S: TcpSocket>(
        &self,
        socket: &mut S,
        sock: u8,
        data: &[u8],
    ) -> crate::Result<usize> {
        socket.socket_send(sock, data).await
    }

    /// Polls the receive path until the first non-empty chunk or the
    /// deadline; `Ok(0)` on timeout. Sufficient for status-line inspection.
    pub async fn read_response<S: TcpSocket>(
        &self,
        socket: &mut S,
        sock: u8,
        timeout: Duration,
        out: &mut [u8],
    ) -> crate::Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            let read = socket.socket_recv(sock, out).await?;
            if read > 0 {
                return Ok(read);
            }
            if Instant::now() >= deadline {
                return Ok(0);
            }
            Timer::after(RESPONSE_POLL).await;
        }
    }

    pub async fn close<S: TcpSocket>(&self, socket: &mut S, sock: u8) {
        let _ = socket.socket_close(sock).await;
    }
}

#[cfg(test)]
mod test_http {
    use super::*;

    #[test]
    fn test_request_line() -> crate::Result<()> {
        let request = HttpClient::request("POST", "/", "Host: example.com\r\n\r\n")?;
        assert_eq!(request, "POST / HTTP/1.1\r\nHost: example.com\r\n\r\n");
        Ok(())
    }

    #[test]
    fn test_post_headers() -> crate::Result<()> {
        let client = HttpClient::new("harvest-files.soracom.io", 80)?;
        let headers = client.post_headers(3072)?;
        assert!(headers.starts_with("Host: harvest-files.soracom.io\r\n"));
        assert!(headers.contains("Content-Length: 3072\r\n"));
        assert!(headers.contains("Connection: close\r\n"));
        assert!(headers.ends_with("\r\n\r\n"));
        Ok(())
    }
}
