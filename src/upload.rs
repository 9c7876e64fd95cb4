//! Non-blocking chunked file uploader.
//!
//! A `tick()`-driven state machine that POSTs an on-disk file to a fixed
//! endpoint over the modem socket. Each tick performs one state action and
//! returns; failures are converted into bounded retries, cool-down waits or
//! an abort. The machine never takes the process down with it: after any
//! terminal failure it parks in [`UploadState::Wait`] and starts over from
//! [`UploadState::Prepare`].

use core::str::FromStr;

#[cfg(feature = "defmt")]
use defmt::{debug, error, info, warn};
use embassy_time::{Duration, Instant, Timer};
use heapless::{String, Vec};
#[cfg(not(feature = "defmt"))]
use log::{debug, error, info, warn};

use crate::http::HttpClient;
use crate::sara::socket::TcpSocket;

/// Bytes read from the file and sent per chunk.
pub const CHUNK_SIZE: usize = 1024;
const FILE_RETRIES: u8 = 5;
const FILE_RETRY_PAUSE: Duration = Duration::from_millis(50);
const HEADER_RETRIES: u8 = 3;
const SEND_RETRIES: u8 = 20;
const FILENAME_SIZE: usize = 64;
const STATUS_SIZE: usize = 256;

/// Filesystem access needed by the uploader.
///
/// Synchronous on purpose: SD-card reads block briefly and the uploader
/// budgets for that between ticks.
pub trait FileStore {
    type File;

    /// Size of the file in bytes.
    fn file_size(&mut self, path: &str) -> crate::Result<u64>;

    fn open(&mut self, path: &str) -> crate::Result<Self::File>;

    /// Reads up to `buf.len()` bytes; `Ok(0)` means end of file.
    fn read(&mut self, file: &mut Self::File, buf: &mut [u8]) -> crate::Result<usize>;

    fn close(&mut self, file: Self::File);
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UploadState {
    #[default]
    Idle,
    Prepare,
    Open,
    Sending,
    Closing,
    Done,
    Abort,
    Wait,
}

/// Endpoint and pacing of the uploader.
///
/// The wait durations carry their production defaults; tests compress them.
#[derive(Clone)]
pub struct UploadConfig {
    pub host: String<48>,
    pub port: u16,
    pub path: String<32>,
    /// Cool-down after the file could not be opened.
    pub prepare_wait: Duration,
    /// Cool-down after an abort.
    pub abort_wait: Duration,
    /// Pause between header retries.
    pub header_cooldown: Duration,
    /// How long to wait for the HTTP response.
    pub response_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            host: String::from_str("harvest-files.soracom.io").unwrap(),
            port: 80,
            path: String::from_str("/").unwrap(),
            prepare_wait: Duration::from_secs(60),
            abort_wait: Duration::from_secs(300),
            header_cooldown: Duration::from_secs(3),
            response_timeout: Duration::from_secs(10),
        }
    }
}

/// Chunked file-to-socket uploader.
///
/// Owns the file handle and the socket for the duration of an upload; every
/// transition into `Idle`, `Wait` (via abort) or `Abort` closes what it owns.
pub struct Uploader<F: FileStore> {
    config: UploadConfig,
    http: HttpClient,
    state: UploadState,
    filename: String<FILENAME_SIZE>,
    file: Option<F::File>,
    filesize: u64,
    sock: Option<u8>,
    buf: [u8; CHUNK_SIZE],
    buf_len: usize,
    buf_offset: usize,
    sent_bytes: u64,
    retry: u8,
    header_retry: u8,
    next_time: Instant,
    reset_on_resume: bool,
    status: Vec<u8, STATUS_SIZE>,
}

impl<F: FileStore> Uploader<F> {
    pub fn new(config: UploadConfig) -> crate::Result<Self> {
        let http = HttpClient::new(&config.host, config.port)?;
        Ok(Self {
            config,
            http,
            state: UploadState::Idle,
            filename: String::new(),
            file: None,
            filesize: 0,
            sock: None,
            buf: [0; CHUNK_SIZE],
            buf_len: 0,
            buf_offset: 0,
            sent_bytes: 0,
            retry: 0,
            header_retry: 0,
            next_time: Instant::now(),
            reset_on_resume: false,
            status: Vec::new(),
        })
    }

    /// Starts an upload. Rejected unless the machine is idle.
    pub fn start(&mut self, filename: &str) -> bool {
        if self.state != UploadState::Idle {
            warn!("start called but uploader is busy");
            return false;
        }
        self.filename = match String::from_str(filename) {
            Ok(filename) => filename,
            Err(_) => {
                error!("filename too long");
                return false;
            }
        };
        self.sent_bytes = 0;
        self.state = UploadState::Prepare;
        true
    }

    pub fn is_busy(&self) -> bool {
        self.state != UploadState::Idle
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    /// `(sent, total)` byte counts of the current upload.
    pub fn progress(&self) -> (u64, u64) {
        (self.sent_bytes, self.filesize)
    }

    /// First bytes of the last HTTP response, empty when none arrived.
    pub fn last_status(&self) -> &[u8] {
        &self.status
    }

    /// Performs one state action and returns the state the machine is in
    /// afterwards.
    pub async fn tick<S: TcpSocket>(&mut self, socket: &mut S, fs: &mut F) -> UploadState {
        match self.state {
            UploadState::Idle => {}
            UploadState::Prepare => self.prepare(fs).await,
            UploadState::Open => self.open(socket).await,
            UploadState::Sending => self.send_chunk(socket, fs).await,
            UploadState::Closing => self.read_status(socket).await,
            UploadState::Done => self.finish(socket, fs).await,
            UploadState::Abort => self.abort(socket, fs).await,
            UploadState::Wait => self.wait(),
        }
        self.state
    }

    async fn prepare(&mut self, fs: &mut F) {
        debug!("PREPARE start");
        if let Some(file) = self.file.take() {
            fs.close(file);
        }

        for attempt in 1..=FILE_RETRIES {
            match self.stat_and_open(fs) {
                Ok(None) => {
                    warn!("file size is zero");
                    self.state = UploadState::Done;
                    return;
                }
                Ok(Some(file)) => {
                    debug!("PREPARE stat ok, size={}", self.filesize);
                    self.file = Some(file);
                    self.state = UploadState::Open;
                    return;
                }
                Err(_) => {
                    warn!("PREPARE attempt {}/{} failed", attempt, FILE_RETRIES);
                    Timer::after(FILE_RETRY_PAUSE).await;
                }
            }
        }

        error!("PREPARE failed after retries");
        self.enter_wait(self.config.prepare_wait, true);
    }

    fn stat_and_open(&mut self, fs: &mut F) -> crate::Result<Option<F::File>> {
        self.filesize = fs.file_size(&self.filename)?;
        if self.filesize == 0 {
            return Ok(None);
        }
        Ok(Some(fs.open(&self.filename)?))
    }

    async fn open<S: TcpSocket>(&mut self, socket: &mut S) {
        debug!("OPEN: sending headers");
        match self.post(socket).await {
            Ok(sock) => {
                self.sock = Some(sock);
                self.buf_len = 0;
                self.buf_offset = 0;
                self.sent_bytes = 0;
                self.retry = 0;
                info!("Upload start");
                self.state = UploadState::Sending;
            }
            Err(_) => {
                self.header_retry += 1;
                warn!("OPEN failed, retry={}", self.header_retry);
                if self.header_retry >= HEADER_RETRIES {
                    self.state = UploadState::Abort;
                } else {
                    self.enter_wait(self.config.header_cooldown, false);
                }
            }
        }
    }

    async fn post<S: TcpSocket>(&mut self, socket: &mut S) -> crate::Result<u8> {
        let sock = self.http.open(socket).await?;
        let result = match self.http.post_headers(self.filesize) {
            Ok(headers) => {
                self.http.send_header(socket, sock, "POST", &self.config.path, &headers).await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            self.http.close(socket, sock).await;
            return Err(err);
        }
        Ok(sock)
    }

    async fn send_chunk<S: TcpSocket>(&mut self, socket: &mut S, fs: &mut F) {
        if self.buf_offset >= self.buf_len {
            let Some(file) = self.file.as_mut() else {
                error!("SENDING without an open file");
                self.state = UploadState::Abort;
                return;
            };
            match fs.read(file, &mut self.buf) {
                Ok(0) => {
                    info!("Upload finished {}/{}", self.sent_bytes, self.filesize);
                    self.state = UploadState::Closing;
                    return;
                }
                Ok(read) => {
                    self.buf_len = read;
                    self.buf_offset = 0;
                }
                Err(_) => {
                    self.retry += 1;
                    warn!("file read failed, retry={}", self.retry);
                    if self.retry >= SEND_RETRIES {
                        self.state = UploadState::Abort;
                    }
                    return;
                }
            }
        }

        let Some(sock) = self.sock else {
            error!("SENDING without an open socket");
            self.state = UploadState::Abort;
            return;
        };
        match socket.socket_send(sock, &self.buf[self.buf_offset..self.buf_len]).await {
            Ok(sent) if sent > 0 => {
                self.buf_offset += sent;
                self.sent_bytes += sent as u64;
                self.retry = 0;
                debug!("SEND {}/{}", self.sent_bytes, self.filesize);
            }
            _ => {
                self.retry += 1;
                warn!("SEND failed, retry={}", self.retry);
                if self.retry >= SEND_RETRIES {
                    self.state = UploadState::Abort;
                }
            }
        }
    }

    async fn read_status<S: TcpSocket>(&mut self, socket: &mut S) {
        debug!("CLOSING: waiting for response");
        self.status.clear();
        if let Some(sock) = self.sock {
            let mut out = [0u8; STATUS_SIZE];
            match self
                .http
                .read_response(socket, sock, self.config.response_timeout, &mut out)
                .await
            {
                Ok(read) => {
                    let _ = self.status.extend_from_slice(&out[..read]);
                }
                Err(_) => warn!("response read error"),
            }
        }
        self.state = UploadState::Done;
    }

    async fn finish<S: TcpSocket>(&mut self, socket: &mut S, fs: &mut F) {
        if let Some(file) = self.file.take() {
            fs.close(file);
        }
        if self.status.starts_with(b"HTTP/1.1 200") || self.status.starts_with(b"HTTP/1.1 201") {
            info!("HTTP response OK");
        } else {
            warn!("HTTP response NG");
        }
        if let Some(sock) = self.sock.take() {
            self.http.close(socket, sock).await;
        }
        self.state = UploadState::Idle;
    }

    async fn abort<S: TcpSocket>(&mut self, socket: &mut S, fs: &mut F) {
        error!("ABORT: sent {}/{}", self.sent_bytes, self.filesize);
        if let Some(file) = self.file.take() {
            fs.close(file);
        }
        if let Some(sock) = self.sock.take() {
            self.http.close(socket, sock).await;
        }
        self.enter_wait(self.config.abort_wait, true);
    }

    fn wait(&mut self) {
        if Instant::now() >= self.next_time {
            debug!("WAIT over, back to PREPARE");
            if self.reset_on_resume {
                self.retry = 0;
                self.header_retry = 0;
            }
            self.state = UploadState::Prepare;
        }
    }

    /// Parks the machine until `wait` from now.
    ///
    /// `reset_counters` distinguishes the long recovery waits, which start
    /// the retry budgets over, from the short header cool-down, which must
    /// not (three consecutive header failures have to reach the abort).
    fn enter_wait(&mut self, wait: Duration, reset_counters: bool) {
        self.next_time = Instant::now() + wait;
        self.reset_on_resume = reset_counters;
        self.state = UploadState::Wait;
    }
}
