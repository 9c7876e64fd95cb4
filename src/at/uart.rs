//! AT-command transport over a full-duplex UART.
//!
//! The modem may emit bytes at any time, so the transport never assumes the
//! RX line is quiet. Every exchange accumulates raw bytes until a terminator,
//! an error marker or a deadline. Two waiting modes exist: the synchronous
//! [`AtUart::wait_response`] loop, and a cooperative pending wait armed by
//! [`AtUart::dispatch`] and probed by [`AtUart::poll_wait`], which returns
//! control to the caller between polls. The cooperative wait is the only
//! suspension mechanism available to the connection state machine.

use core::str::FromStr;
#[cfg(feature = "defmt")]
use defmt::{debug, warn};
use embassy_time::{Duration, Instant, Timer};
use heapless::{String, Vec, format};
#[cfg(not(feature = "defmt"))]
use log::{debug, warn};

use crate::at::response::{AT_BUF_SIZE, AT_COMMAND_SIZE, AtResponse, find_bytes};
use crate::error::Error;

/// Cadence of the synchronous wait loop.
const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Timeout for exchanges that do not specify their own.
pub const AT_DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
const EXPECTED_SIZE: usize = 16;
const RX_CHUNK: usize = 256;

/// A trait for writing to a UART.
///
/// One call is one logical message to the modem; implementations must not
/// split it unless the link enforces a maximum chunk size.
pub trait Tx {
    fn write(&mut self, buffer: &[u8]) -> impl core::future::Future<Output = crate::Result<()>>;
}

/// A trait for reading from a UART without blocking.
///
/// Returns immediately with whatever the driver has buffered; `Ok(0)` when
/// the line is idle. All waiting happens in [`AtUart`].
pub trait Rx {
    fn read_available(
        &mut self,
        buf: &mut [u8],
    ) -> impl core::future::Future<Output = crate::Result<usize>>;
}

/// Outcome of probing a cooperative wait.
#[derive(Debug, PartialEq, Eq)]
pub enum WaitPoll {
    /// The expected bytes arrived; the accumulated exchange is attached.
    Ready(AtResponse),
    /// Nothing conclusive yet, probe again later.
    Pending,
}

struct PendingWait {
    expected: String<EXPECTED_SIZE>,
    deadline: Instant,
    buffer: Vec<u8, AT_BUF_SIZE>,
}

/// A UART speaking the AT command protocol.
///
/// The transport owns the serial link exclusively and serializes exchanges:
/// no command is written before the previous one terminated or timed out.
/// It knows nothing about sockets or network registration.
pub struct AtUart<T: Tx, R: Rx> {
    tx: T,
    rx: R,
    pending: Option<PendingWait>,
    last_response: Vec<u8, AT_BUF_SIZE>,
}

impl<T: Tx, R: Rx> AtUart<T, R> {
    pub fn new(tx: T, rx: R) -> Self {
        Self {
            tx,
            rx,
            pending: None,
            last_response: Vec::new(),
        }
    }

    /// The accumulated bytes of the last failed wait.
    ///
    /// Kept for post-mortem inspection, e.g. a `SIM failure` phrase inside a
    /// `+CME ERROR` reply.
    pub fn last_response(&self) -> &[u8] {
        &self.last_response
    }

    async fn write(&mut self, message: &[u8]) -> crate::Result<()> {
        self.tx.write(message).await.map_err(|_| Error::UartWriteError)
    }

    async fn write_at(&mut self, cmd: &str) -> crate::Result<()> {
        let framed =
            format!(AT_COMMAND_SIZE; "AT{cmd}\r\n").map_err(|_| Error::BufferTooSmallError)?;
        debug!("[SEND] AT{}", cmd);
        self.write(framed.as_bytes()).await
    }

    /// Appends all currently buffered RX bytes to `buf`.
    async fn drain_into(&mut self, buf: &mut Vec<u8, AT_BUF_SIZE>) -> crate::Result<()> {
        let mut chunk = [0u8; RX_CHUNK];
        loop {
            let read = self
                .rx
                .read_available(&mut chunk)
                .await
                .map_err(|_| Error::UartReadError)?;
            if read == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..read]).map_err(|_| Error::BufferTooSmallError)?;
        }
    }

    /// Reads and drops any bytes the modem sent outside of an exchange.
    pub async fn flush_rx(&mut self) -> crate::Result<usize> {
        let mut chunk = [0u8; RX_CHUNK];
        let mut total = 0;
        loop {
            let read = self
                .rx
                .read_available(&mut chunk)
                .await
                .map_err(|_| Error::UartReadError)?;
            if read == 0 {
                return Ok(total);
            }
            total += read;
        }
    }

    /// Synchronous accumulation loop.
    ///
    /// Polls the UART every 20 ms, appending to a scratch buffer. Returns as
    /// soon as `expected` appears; fails once an error marker appears or the
    /// timeout elapses.
    pub async fn wait_response(
        &mut self,
        expected: &str,
        timeout: Duration,
    ) -> crate::Result<AtResponse> {
        let deadline = Instant::now() + timeout;
        let mut buffer = Vec::new();
        loop {
            self.drain_into(&mut buffer).await?;
            if let Some(err) = error_in(&buffer) {
                warn!("[RECV] modem error: {}", err);
                self.last_response = buffer;
                return Err(err);
            }
            if find_bytes(&buffer, expected.as_bytes()).is_some() {
                return Ok(AtResponse::new(buffer));
            }
            if Instant::now() >= deadline {
                self.last_response = buffer;
                return Err(Error::TimeoutError);
            }
            Timer::after(POLL_INTERVAL).await;
        }
    }

    /// Writes `AT{cmd}` and waits for the final `OK`.
    pub async fn call_at(&mut self, cmd: &str, timeout: Duration) -> crate::Result<AtResponse> {
        let start = Instant::now();
        self.pending = None;
        self.write_at(cmd).await?;
        let response = self.wait_response("OK", timeout).await?;
        debug!("AT{}: OK, took {}ms", cmd, (Instant::now() - start).as_millis());
        Ok(response)
    }

    /// [`Self::call_at`] with bounded linear retries.
    pub async fn call_at_retry(
        &mut self,
        cmd: &str,
        timeout: Duration,
        retries: u8,
        retry_delay: Duration,
    ) -> crate::Result<AtResponse> {
        let mut last = Error::NoResponse;
        for attempt in 1..=retries {
            match self.call_at(cmd, timeout).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    last = err;
                    if attempt < retries {
                        Timer::after(retry_delay).await;
                    }
                }
            }
        }
        Err(last)
    }

    /// A prompt write: `AT{cmd}`, wait for the prompt bytes, then the payload.
    ///
    /// The payload goes out in a single write. After the prompt the modem
    /// consumes exactly the announced number of bytes.
    pub async fn call_prompt(
        &mut self,
        cmd: &str,
        prompt: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> crate::Result<AtResponse> {
        self.pending = None;
        self.write_at(cmd).await?;
        self.wait_response(prompt, timeout).await?;
        debug!("[SEND-DATA] {} bytes", payload.len());
        self.write(payload).await?;
        self.wait_response("OK", timeout).await
    }

    /// Writes `AT{cmd}` and arms a cooperative wait instead of blocking.
    ///
    /// The caller makes progress by calling [`Self::poll_wait`].
    pub async fn dispatch(
        &mut self,
        cmd: &str,
        expected: &str,
        timeout: Duration,
    ) -> crate::Result<()> {
        self.write_at(cmd).await?;
        self.start_wait(expected, timeout)
    }

    /// Arms a cooperative wait, replacing any previous one.
    pub fn start_wait(&mut self, expected: &str, timeout: Duration) -> crate::Result<()> {
        let expected = String::from_str(expected).map_err(|_| Error::BufferTooSmallError)?;
        self.pending = Some(PendingWait {
            expected,
            deadline: Instant::now() + timeout,
            buffer: Vec::new(),
        });
        Ok(())
    }

    /// Probes the armed wait without sleeping.
    ///
    /// Drains whatever the modem has sent so far, then reports
    /// [`WaitPoll::Ready`] on a match, [`WaitPoll::Pending`] while inconclusive,
    /// or [`Error::TimeoutError`] once the deadline passed. Both terminal
    /// outcomes clear the armed wait.
    pub async fn poll_wait(&mut self) -> crate::Result<WaitPoll> {
        let Some(mut wait) = self.pending.take() else {
            return Err(Error::NoResponse);
        };
        self.drain_into(&mut wait.buffer).await?;
        if find_bytes(&wait.buffer, wait.expected.as_bytes()).is_some() {
            return Ok(WaitPoll::Ready(AtResponse::new(wait.buffer)));
        }
        if Instant::now() >= wait.deadline {
            self.last_response = wait.buffer;
            return Err(Error::TimeoutError);
        }
        self.pending = Some(wait);
        Ok(WaitPoll::Pending)
    }

    /// Whether the pending wait has accumulated `needle` so far.
    pub fn pending_contains(&self, needle: &str) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|wait| find_bytes(&wait.buffer, needle.as_bytes()).is_some())
    }

    /// Drops the armed wait, if any.
    pub fn abort_wait(&mut self) {
        self.pending = None;
    }
}

/// Classifies error markers in an accumulated buffer.
fn error_in(buffer: &[u8]) -> Option<Error> {
    if let Some(pos) = find_bytes(buffer, b"+CME ERROR") {
        return Some(Error::CmeError(error_code(&buffer[pos..])));
    }
    if let Some(pos) = find_bytes(buffer, b"+CMS ERROR") {
        return Some(Error::CmsError(error_code(&buffer[pos..])));
    }
    if find_bytes(buffer, b"ERROR").is_some() {
        return Some(Error::AtErrorResponse);
    }
    None
}

/// The numeric code after `+CME ERROR:`, 0 when absent or verbose.
fn error_code(tail: &[u8]) -> u16 {
    let Some(colon) = tail.iter().position(|&byte| byte == b':') else {
        return 0;
    };
    let mut code: u16 = 0;
    let mut seen = false;
    for &byte in &tail[colon + 1..] {
        match byte {
            b' ' if !seen => {}
            b'0'..=b'9' => {
                seen = true;
                code = code.saturating_mul(10).saturating_add(u16::from(byte - b'0'));
            }
            _ => break,
        }
    }
    code
}

/// A scripted UART shared by a [`Tx`] and [`Rx`] pair, to be used in tests.
///
/// Each script entry pairs the exact bytes the driver is expected to write
/// with the bytes the fake modem feeds back. Unsolicited traffic is pushed
/// with [`FakeUart::inject`].
pub struct FakeUart {
    script: Vec<(&'static [u8], &'static [u8]), 40>,
    cursor: usize,
    rx: heapless::Deque<u8, AT_BUF_SIZE>,
}

impl FakeUart {
    pub fn new(script: &[(&'static [u8], &'static [u8])]) -> Self {
        Self {
            script: Vec::from_slice(script).unwrap(),
            cursor: 0,
            rx: heapless::Deque::new(),
        }
    }

    /// Queues unsolicited bytes, as if the modem had sent a URC.
    pub fn inject(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.rx.push_back(byte).unwrap();
        }
    }

    pub fn all_consumed(&self) -> bool {
        self.cursor == self.script.len()
    }

    fn handle_write(&mut self, buffer: &[u8]) {
        let Some(&(expected, reply)) = self.script.get(self.cursor) else {
            panic!("unexpected write past end of script");
        };
        assert_eq!(
            expected,
            buffer,
            "script entry {} mismatch: expected {:?}, got {:?}",
            self.cursor,
            core::str::from_utf8(expected),
            core::str::from_utf8(buffer)
        );
        self.cursor += 1;
        self.inject(reply);
    }

    fn pop_into(&mut self, buf: &mut [u8]) -> usize {
        let mut count = 0;
        for slot in buf.iter_mut() {
            match self.rx.pop_front() {
                Some(byte) => {
                    *slot = byte;
                    count += 1;
                }
                None => break,
            }
        }
        count
    }
}

impl Tx for &core::cell::RefCell<FakeUart> {
    async fn write(&mut self, buffer: &[u8]) -> crate::Result<()> {
        self.borrow_mut().handle_write(buffer);
        Ok(())
    }
}

impl Rx for &core::cell::RefCell<FakeUart> {
    async fn read_available(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        Ok(self.borrow_mut().pop_into(buf))
    }
}

#[cfg(test)]
mod test_uart {
    use super::*;
    use core::cell::RefCell;
    use embassy_futures::block_on;

    fn uart(
        fake: &RefCell<FakeUart>,
    ) -> AtUart<&'_ RefCell<FakeUart>, &'_ RefCell<FakeUart>> {
        AtUart::new(fake, fake)
    }

    #[test]
    fn test_call_at_ok() -> crate::Result<()> {
        let fake = RefCell::new(FakeUart::new(&[(
            b"AT+USOCR=6\r\n".as_slice(),
            b"\r\n+USOCR: 0\r\nOK\r\n".as_slice(),
        )]));
        let mut at = uart(&fake);
        let response = block_on(at.call_at("+USOCR=6", AT_DEFAULT_TIMEOUT))?;
        assert_eq!(response.first("+USOCR:")?.parse1::<u8>(0)?, 0);
        assert!(fake.borrow().all_consumed());
        Ok(())
    }

    #[test]
    fn test_cme_error_classified() {
        let fake = RefCell::new(FakeUart::new(&[(
            b"AT+CIMI\r\n".as_slice(),
            b"\r\n+CME ERROR: 10\r\n".as_slice(),
        )]));
        let mut at = uart(&fake);
        let err = block_on(at.call_at("+CIMI", AT_DEFAULT_TIMEOUT)).unwrap_err();
        assert_eq!(err, Error::CmeError(10));
        assert!(at.last_response().starts_with(b"\r\n+CME ERROR"));
    }

    #[test]
    fn test_plain_error_classified() {
        let fake = RefCell::new(FakeUart::new(&[(
            b"AT+CGATT?\r\n".as_slice(),
            b"\r\nERROR\r\n".as_slice(),
        )]));
        let mut at = uart(&fake);
        let err = block_on(at.call_at("+CGATT?", AT_DEFAULT_TIMEOUT)).unwrap_err();
        assert_eq!(err, Error::AtErrorResponse);
    }

    #[test]
    fn test_prompt_write() -> crate::Result<()> {
        let fake = RefCell::new(FakeUart::new(&[
            (b"AT+USOWR=0,5\r\n".as_slice(), b"@".as_slice()),
            (b"hello".as_slice(), b"\r\n+USOWR: 0,5\r\nOK\r\n".as_slice()),
        ]));
        let mut at = uart(&fake);
        let response =
            block_on(at.call_prompt("+USOWR=0,5", "@", b"hello", Duration::from_secs(1)))?;
        let (sock, written) = response.first("+USOWR:")?.parse2::<u8, usize>([0, 1])?;
        assert_eq!((sock, written), (0, 5));
        assert!(fake.borrow().all_consumed());
        Ok(())
    }

    #[test]
    fn test_poll_wait_pending_then_ready() -> crate::Result<()> {
        let fake = RefCell::new(FakeUart::new(&[(
            b"AT+COPS=0\r\n".as_slice(),
            b"".as_slice(),
        )]));
        let mut at = uart(&fake);
        block_on(at.dispatch("+COPS=0", "OK", Duration::from_secs(5)))?;
        assert_eq!(block_on(at.poll_wait())?, WaitPoll::Pending);
        fake.borrow_mut().inject(b"\r\nOK\r\n");
        match block_on(at.poll_wait())? {
            WaitPoll::Ready(response) => assert!(response.contains("OK")),
            WaitPoll::Pending => panic!("expected a match"),
        }
        Ok(())
    }

    #[test]
    fn test_poll_wait_accumulates_across_probes() -> crate::Result<()> {
        let fake = RefCell::new(FakeUart::new(&[(
            b"AT+CEREG?\r\n".as_slice(),
            b"\r\n+CEREG: 0,1".as_slice(),
        )]));
        let mut at = uart(&fake);
        block_on(at.dispatch("+CEREG?", "OK", Duration::from_secs(5)))?;
        assert_eq!(block_on(at.poll_wait())?, WaitPoll::Pending);
        assert!(at.pending_contains("+CEREG: 0,1"));
        fake.borrow_mut().inject(b"\r\nOK\r\n");
        match block_on(at.poll_wait())? {
            WaitPoll::Ready(response) => assert!(response.contains("+CEREG: 0,1")),
            WaitPoll::Pending => panic!("expected a match"),
        }
        Ok(())
    }

    #[test]
    fn test_error_code_parsing() {
        assert_eq!(error_code(b"+CME ERROR: 100"), 100);
        assert_eq!(error_code(b"+CME ERROR: SIM failure"), 0);
        assert_eq!(error_code(b"+CME ERROR"), 0);
    }
}
