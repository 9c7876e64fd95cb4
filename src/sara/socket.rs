//! Modem-mediated TCP socket with a URC-driven receive path.
//!
//! One socket is active at a time. The send path speaks the `USOWR` prompt
//! protocol and retries partial and zero-length writes; the receive path is
//! driven by `+UUSORD` notifications, which trigger `USORD` reads whose
//! payloads land in the local receive buffer. `+UUSOCL` from the modem
//! invalidates the active socket; the caller notices on its next operation.

#[cfg(feature = "defmt")]
use defmt::{debug, error, info, warn};
use embassy_time::{Duration, Instant, Timer};
use heapless::format;
#[cfg(not(feature = "defmt"))]
use log::{debug, error, info, warn};

use crate::at::response::{AT_COMMAND_SIZE, AtResponse};
use crate::at::uart::{AT_DEFAULT_TIMEOUT, Rx, Tx, WaitPoll};
use crate::at::urc;
use crate::error::Error;
use crate::sara::StatusLed;
use crate::sara::modem::SaraModem;

/// Capacity of the local receive buffer.
pub const RX_BUFFER_SIZE: usize = 2048;

const USOCR_TIMEOUT: Duration = Duration::from_secs(5);
const USOCO_TIMEOUT: Duration = Duration::from_secs(15);
const USOWR_TIMEOUT: Duration = Duration::from_secs(1);
const USOCL_TIMEOUT: Duration = Duration::from_secs(5);
const UUSORD_WAIT: Duration = Duration::from_secs(3);
const SEND_RETRIES: u8 = 20;

/// TCP socket operations offered by a cellular modem.
///
/// The seam between the networking core and its consumers (the HTTP client
/// and the uploader); test doubles implement it directly.
pub trait TcpSocket {
    /// Creates a TCP socket and returns its id.
    fn socket_create(&mut self) -> impl core::future::Future<Output = crate::Result<u8>>;

    /// Connects the socket to `host:port`.
    fn socket_connect(
        &mut self,
        sock: u8,
        host: &str,
        port: u16,
    ) -> impl core::future::Future<Output = crate::Result<()>>;

    /// Sends all of `data`; a success means every byte was accepted.
    fn socket_send(
        &mut self,
        sock: u8,
        data: &[u8],
    ) -> impl core::future::Future<Output = crate::Result<usize>>;

    /// Receives up to `buf.len()` bytes; `Ok(0)` when nothing arrived.
    fn socket_recv(
        &mut self,
        sock: u8,
        buf: &mut [u8],
    ) -> impl core::future::Future<Output = crate::Result<usize>>;

    /// Closes the socket. Closing an already-closed socket is a no-op.
    fn socket_close(&mut self, sock: u8) -> impl core::future::Future<Output = crate::Result<()>>;
}

/// Position of the cooperative `socket_connect_step` sequence.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SocketConnectState {
    #[default]
    Idle,
    UsocoWait,
    Done,
}

impl<T: Tx, R: Rx, L: StatusLed> SaraModem<T, R, L> {
    pub fn active_socket(&self) -> Option<u8> {
        self.active_socket
    }

    /// Bytes buffered locally for the active socket.
    pub fn rx_available(&self) -> usize {
        self.rx_buffer.len()
    }

    pub fn clear_rx(&mut self) {
        self.rx_buffer.clear();
    }

    pub(crate) async fn create(&mut self) -> crate::Result<u8> {
        let response = self
            .at
            .call_at("+USOCR=6", USOCR_TIMEOUT)
            .await
            .inspect_err(|_| error!("USOCR failed"))?;
        let sock = response
            .first("+USOCR:")?
            .parse1::<u8>(0)
            .inspect_err(|_| error!("Failed to parse socket id"))?;
        debug!("Got socket id {}", sock);
        Ok(sock)
    }

    pub(crate) async fn connect_socket(
        &mut self,
        sock: u8,
        host: &str,
        port: u16,
    ) -> crate::Result<()> {
        let cmd = format!(AT_COMMAND_SIZE; "+USOCO={sock},\"{host}\",{port}")
            .map_err(|_| Error::BufferTooSmallError)?;
        match self.at.call_at(&cmd, USOCO_TIMEOUT).await {
            Ok(response) if response.contains("+UUSOCL") => {
                error!("USOCO: socket closed early");
                let _ = self.close_socket(sock).await;
                Err(Error::SocketClosedError)
            }
            Ok(_) => {
                self.active_socket = Some(sock);
                self.socket_state = SocketConnectState::Done;
                info!("Socket connected: {}", sock);
                Ok(())
            }
            Err(err) => {
                error!("USOCO failed");
                let _ = self.close_socket(sock).await;
                Err(err)
            }
        }
    }

    /// Cooperative variant of the socket connect.
    ///
    /// Returns `Ok(true)` when connected, `Ok(false)` while waiting. An early
    /// `+UUSOCL` from the modem or the 15 s deadline tears the socket down
    /// and surfaces as `Err`.
    pub async fn socket_connect_step(
        &mut self,
        sock: u8,
        host: &str,
        port: u16,
    ) -> crate::Result<bool> {
        match self.socket_state {
            SocketConnectState::Idle => {
                let cmd = format!(AT_COMMAND_SIZE; "+USOCO={sock},\"{host}\",{port}")
                    .map_err(|_| Error::BufferTooSmallError)?;
                self.at.dispatch(&cmd, "OK", USOCO_TIMEOUT).await?;
                self.socket_state = SocketConnectState::UsocoWait;
                self.socket_start = Instant::now();
                Ok(false)
            }

            SocketConnectState::UsocoWait => {
                if self.at.pending_contains("+UUSOCL") {
                    self.at.abort_wait();
                    return self.usoco_failed(sock, Error::SocketClosedError).await;
                }
                match self.at.poll_wait().await {
                    Ok(WaitPoll::Ready(response)) => {
                        if response.contains("+UUSOCL") {
                            return self.usoco_failed(sock, Error::SocketClosedError).await;
                        }
                        self.active_socket = Some(sock);
                        self.socket_state = SocketConnectState::Done;
                        info!("Socket connected: {}", sock);
                        Ok(true)
                    }
                    Ok(WaitPoll::Pending) => Ok(false),
                    Err(Error::TimeoutError) => {
                        self.usoco_failed(sock, Error::TimeoutError).await
                    }
                    Err(err) => Err(err),
                }
            }

            SocketConnectState::Done => Ok(true),
        }
    }

    async fn usoco_failed(&mut self, sock: u8, err: Error) -> crate::Result<bool> {
        error!("USOCO failed: {}", err);
        self.socket_state = SocketConnectState::Idle;
        let _ = self.close_socket(sock).await;
        Err(err)
    }

    /// Sends all of `data`, iterating `USOWR` prompt writes.
    ///
    /// Either every byte is accepted by the modem, in order, or the last
    /// error is returned after the retry budget is spent. Never reports a
    /// partial length to the caller.
    pub(crate) async fn send(&mut self, sock: u8, data: &[u8]) -> crate::Result<usize> {
        if self.active_socket != Some(sock) {
            error!("send: socket not connected");
            return Err(Error::SocketClosedError);
        }

        let mut total = 0;
        while total < data.len() {
            let mut retries: u8 = 0;
            loop {
                let remaining = &data[total..];
                match self.send_once(sock, remaining).await {
                    Ok(0) => {
                        retries += 1;
                        if retries >= SEND_RETRIES {
                            error!("socket_send failed after retries");
                            return Err(Error::TimeoutError);
                        }
                        debug!("USOWR: sent=0, retry after 100ms");
                        Timer::after_millis(100).await;
                    }
                    Ok(written) => {
                        if written < remaining.len() {
                            warn!("USOWR: partial send {}/{}", written, remaining.len());
                            Timer::after_secs(1).await;
                        }
                        total += written;
                        break;
                    }
                    Err(err) => {
                        retries += 1;
                        if retries >= SEND_RETRIES {
                            error!("socket_send failed after retries");
                            return Err(err);
                        }
                        let pause = 200 + u64::from(retries) * 200;
                        debug!("send failed, retry {}/{} after {}ms", retries, SEND_RETRIES, pause);
                        Timer::after_millis(pause).await;
                    }
                }
            }
        }
        Ok(total)
    }

    /// One `USOWR` exchange; returns how many bytes the modem accepted.
    async fn send_once(&mut self, sock: u8, data: &[u8]) -> crate::Result<usize> {
        let cmd = format!(AT_COMMAND_SIZE; "+USOWR={sock},{}", data.len())
            .map_err(|_| Error::BufferTooSmallError)?;
        let response = self.at.call_prompt(&cmd, "@", data, USOWR_TIMEOUT).await?;
        let (_, written) = response.first("+USOWR:")?.parse2::<u8, usize>([0, 1])?;
        if written > data.len() {
            // The modem may not accept more than was announced.
            return Err(Error::ParseError);
        }
        Ok(written)
    }

    /// Receives buffered bytes, waiting for a `+UUSORD` notification when the
    /// local buffer is empty.
    pub(crate) async fn recv(&mut self, sock: u8, buf: &mut [u8]) -> crate::Result<usize> {
        if !self.rx_buffer.is_empty() {
            return Ok(self.pop_rx(buf));
        }
        if self.active_socket != Some(sock) {
            return Ok(0);
        }

        let response = match self.at.wait_response("+UUSORD:", UUSORD_WAIT).await {
            Ok(response) => response,
            Err(Error::TimeoutError) => return Ok(0),
            Err(err) => return Err(err),
        };
        self.process_urcs(sock, &response).await?;
        Ok(self.pop_rx(buf))
    }

    /// Feeds an accumulated buffer through the URC demux: every `+UUSORD`
    /// for this socket triggers a `USORD` read whose payload is appended to
    /// the receive buffer; `+UUSOCL` invalidates the active socket.
    pub(crate) async fn process_urcs(
        &mut self,
        sock: u8,
        response: &AtResponse,
    ) -> crate::Result<()> {
        let events = urc::scan(response.as_bytes(), &self.urc_handlers);

        for event in &events.data_available {
            if event.socket != sock || event.length == 0 {
                continue;
            }
            let cmd = format!(AT_COMMAND_SIZE; "+USORD={},{}", event.socket, event.length)
                .map_err(|_| Error::BufferTooSmallError)?;
            let read = match self.at.call_at(&cmd, AT_DEFAULT_TIMEOUT).await {
                Ok(read) => read,
                Err(_) => {
                    warn!("USORD read failed");
                    continue;
                }
            };
            match urc::extract_usord_payload(read.as_bytes()) {
                Ok(payload) => {
                    for &byte in payload {
                        self.rx_buffer.push_back(byte).map_err(|_| Error::BufferTooSmallError)?;
                    }
                }
                Err(_) => warn!("USORD payload parse error"),
            }
            // The read itself may carry further URC lines.
            let inner = urc::scan(read.as_bytes(), &self.urc_handlers);
            for &closed in &inner.closed {
                self.mark_closed(closed);
            }
        }

        for &closed in &events.closed {
            self.mark_closed(closed);
        }
        Ok(())
    }

    fn mark_closed(&mut self, sock: u8) {
        if self.active_socket == Some(sock) {
            warn!("Modem closed socket {}", sock);
            self.active_socket = None;
        }
    }

    fn pop_rx(&mut self, buf: &mut [u8]) -> usize {
        let mut count = 0;
        for slot in buf.iter_mut() {
            match self.rx_buffer.pop_front() {
                Some(byte) => {
                    *slot = byte;
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    pub(crate) async fn close_socket(&mut self, sock: u8) -> crate::Result<()> {
        let cmd = format!(AT_COMMAND_SIZE; "+USOCL={sock}")
            .map_err(|_| Error::BufferTooSmallError)?;
        if self.at.call_at(&cmd, USOCL_TIMEOUT).await.is_err() {
            error!("USOCL: timeout");
        }
        if self.active_socket == Some(sock) {
            self.active_socket = None;
        }
        self.rx_buffer.clear();
        self.socket_state = SocketConnectState::Idle;
        Ok(())
    }
}

impl<T: Tx, R: Rx, L: StatusLed> TcpSocket for SaraModem<T, R, L> {
    async fn socket_create(&mut self) -> crate::Result<u8> {
        self.create().await
    }

    async fn socket_connect(&mut self, sock: u8, host: &str, port: u16) -> crate::Result<()> {
        self.connect_socket(sock, host, port).await
    }

    async fn socket_send(&mut self, sock: u8, data: &[u8]) -> crate::Result<usize> {
        self.send(sock, data).await
    }

    async fn socket_recv(&mut self, sock: u8, buf: &mut [u8]) -> crate::Result<usize> {
        self.recv(sock, buf).await
    }

    async fn socket_close(&mut self, sock: u8) -> crate::Result<()> {
        self.close_socket(sock).await
    }
}
