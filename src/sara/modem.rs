//! Modem core: initialization, model detection, info queries and RTC setup.

use core::{fmt::Display, str::FromStr};

use chrono::{Datelike, NaiveDateTime, TimeDelta, Timelike};
#[cfg(feature = "defmt")]
use defmt::{debug, error, info, warn};
use embassy_time::{Duration, Instant, Timer};
use heapless::{Deque, String, Vec};
#[cfg(not(feature = "defmt"))]
use log::{debug, error, info, warn};

use crate::at::uart::{AT_DEFAULT_TIMEOUT, AtUart, Rx, Tx};
use crate::at::urc::{MAX_URC_HANDLERS, UrcHandler};
use crate::error::Error;
use crate::sara::connection::ConnectState;
use crate::sara::socket::{RX_BUFFER_SIZE, SocketConnectState};
use crate::sara::{ModemModel, Rtc, StatusLed};
use crate::time;

const INIT_ATTEMPTS: u8 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);
const RTC_ATTEMPTS: u8 = 5;
const IMSI_RETRIES: u8 = 2;
const IMEI_RETRIES: u8 = 3;
const DIGITS_SIZE: usize = 20;

/// IMSI read from the SIM, or why it could not be read.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Imsi {
    Digits(String<DIGITS_SIZE>),
    SimFailure,
    Unknown,
}

impl Display for Imsi {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Imsi::Digits(digits) => write!(f, "{}", digits),
            Imsi::SimFailure => write!(f, "SIM_FAIL"),
            Imsi::Unknown => write!(f, "UNKNOWN_IMSI"),
        }
    }
}

/// IMEI of the module, or the sentinel when it could not be read.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Imei {
    Digits(String<DIGITS_SIZE>),
    Unknown,
}

impl Display for Imei {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Imei::Digits(digits) => write!(f, "{}", digits),
            Imei::Unknown => write!(f, "IMEI_UNKNOWN"),
        }
    }
}

/// A SARA-R410/R510 modem on a UART.
///
/// All state lives here: the transport with its pending wait, the detected
/// model, cached SIM/module identifiers, the connection sequence position and
/// the single active TCP socket with its receive buffer.
pub struct SaraModem<T: Tx, R: Rx, L: StatusLed> {
    pub(crate) at: AtUart<T, R>,
    pub(crate) led: L,
    pub(crate) model: ModemModel,
    pub(crate) initialized: bool,
    pub(crate) rtc_set: bool,
    imsi: Option<Imsi>,
    imei: Option<Imei>,
    rssi: Option<i32>,
    pub(crate) connect_state: ConnectState,
    pub(crate) connect_start: Instant,
    pub(crate) socket_state: SocketConnectState,
    pub(crate) socket_start: Instant,
    pub(crate) active_socket: Option<u8>,
    pub(crate) rx_buffer: Deque<u8, RX_BUFFER_SIZE>,
    pub(crate) urc_handlers: Vec<UrcHandler, MAX_URC_HANDLERS>,
}

impl<T: Tx, R: Rx, L: StatusLed> SaraModem<T, R, L> {
    pub fn new(tx: T, rx: R, led: L) -> Self {
        Self {
            at: AtUart::new(tx, rx),
            led,
            model: ModemModel::Unknown,
            initialized: false,
            rtc_set: false,
            imsi: None,
            imei: None,
            rssi: None,
            connect_state: ConnectState::Idle,
            connect_start: Instant::now(),
            socket_state: SocketConnectState::Idle,
            socket_start: Instant::now(),
            active_socket: None,
            rx_buffer: Deque::new(),
            urc_handlers: Vec::new(),
        }
    }

    pub fn model(&self) -> ModemModel {
        self.model
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn rtc_set(&self) -> bool {
        self.rtc_set
    }

    /// Registers a handler for URCs the core ignores (`+CSCON`, `+CEREG`,
    /// `+CGEV`, ...).
    pub fn register_urc_handler(&mut self, handler: UrcHandler) -> crate::Result<()> {
        self.urc_handlers.push(handler).map_err(|_| Error::BufferTooSmallError)
    }

    /// Initializes the modem and detects the model.
    ///
    /// Idempotent: once initialized, only drains stray RX bytes.
    pub async fn initialize(&mut self) -> crate::Result<()> {
        if self.initialized {
            debug!("Modem already initialized");
            let stray = self.at.flush_rx().await?;
            if stray > 0 {
                warn!("Dropped {} stray bytes from the modem", stray);
            }
            return Ok(());
        }

        info!("Modem initializing");
        self.at.call_at_retry("", AT_DEFAULT_TIMEOUT, 7, RETRY_DELAY).await?;

        for attempt in 1..=INIT_ATTEMPTS {
            info!("Initialization attempt {}/{}", attempt, INIT_ATTEMPTS);
            Timer::after_secs(1).await;

            let response = match self
                .at
                .call_at_retry("I", Duration::from_secs(15), 3, RETRY_DELAY)
                .await
            {
                Ok(response) => response,
                Err(_) => {
                    error!("ATI command failed");
                    continue;
                }
            };
            self.model = ModemModel::from_ati(&response);
            if self.model == ModemModel::Unknown {
                error!("Unknown modem model");
            }
            info!("Detected modem: {}", self.model);

            Timer::after_secs(1).await;
            if self.at.call_at("+CFUN=0", Duration::from_secs(15)).await.is_err() {
                error!("Timeout at AT+CFUN=0");
                continue;
            }

            self.initialized = true;
            info!("Modem initialized");
            return Ok(());
        }

        error!("Modem failed to initialize after retries");
        Err(Error::NoResponse)
    }

    /// Re-detects the model via `ATI` when it is still unknown.
    pub async fn detected_model(&mut self) -> crate::Result<ModemModel> {
        if self.model == ModemModel::Unknown {
            let response = self.at.call_at("I", Duration::from_secs(20)).await?;
            self.model = ModemModel::from_ati(&response);
            if self.model == ModemModel::Unknown {
                error!("Unknown modem model");
            }
            info!("Detected modem: {}", self.model);
        }
        Ok(self.model)
    }

    /// Returns the IMSI of the SIM card, cached after the first read.
    pub async fn get_imsi(&mut self) -> Imsi {
        if let Some(imsi) = &self.imsi {
            return imsi.clone();
        }

        for _ in 0..IMSI_RETRIES {
            match self.at.call_at("+CIMI", Duration::from_secs(3)).await {
                Ok(response) => {
                    if let Some(digits) = response.digit_line(15)
                        && let Ok(digits) = String::from_str(digits)
                    {
                        let imsi = Imsi::Digits(digits);
                        self.imsi = Some(imsi.clone());
                        return imsi;
                    }
                    if response.contains("SIM failure") {
                        warn!("SIM failure detected");
                        self.imsi = Some(Imsi::SimFailure);
                        return Imsi::SimFailure;
                    }
                }
                Err(_) => {
                    let raw = self.at.last_response();
                    if crate::at::response::find_bytes(raw, b"SIM failure").is_some() {
                        warn!("SIM failure detected");
                        self.imsi = Some(Imsi::SimFailure);
                        return Imsi::SimFailure;
                    }
                }
            }
            Timer::after_secs(1).await;
        }

        self.imsi = Some(Imsi::Unknown);
        Imsi::Unknown
    }

    /// Returns the IMEI of the module, cached after the first read.
    pub async fn get_imei(&mut self) -> Imei {
        if let Some(imei) = &self.imei {
            return imei.clone();
        }

        for _ in 0..IMEI_RETRIES {
            if let Ok(response) = self.at.call_at("+CGSN", Duration::from_secs(3)).await
                && let Some(digits) = response.digit_line(14)
                && let Ok(digits) = String::from_str(digits)
            {
                let imei = Imei::Digits(digits);
                self.imei = Some(imei.clone());
                return imei;
            }
            Timer::after_secs(1).await;
        }

        self.imei = Some(Imei::Unknown);
        Imei::Unknown
    }

    /// Queries `AT+CSQ` and stores the RSSI.
    pub async fn get_signal_strength(&mut self) -> crate::Result<i32> {
        let response = self.at.call_at("+CSQ", Duration::from_secs(3)).await?;
        let rssi = response.first("+CSQ:")?.parse1::<i32>(0)?;
        self.rssi = Some(rssi);
        Ok(rssi)
    }

    pub fn rssi(&self) -> Option<i32> {
        self.rssi
    }

    /// Reads network time via `AT+CCLK?` and shifts it by the model offset.
    pub async fn get_time(&mut self) -> crate::Result<NaiveDateTime> {
        let response = match self.at.call_at("+CCLK?", Duration::from_secs(3)).await {
            Ok(response) => response,
            Err(err) => {
                error!("get_time read failed");
                Timer::after_secs(1).await;
                return Err(err);
            }
        };
        let line = response.first("+CCLK:").map_err(|err| {
            warn!("get_time failed: +CCLK not found");
            err
        })?;
        let values = line.values();
        let quoted = values.first().ok_or(Error::ParseError)?;
        let naive = time::parse_cclk(quoted)?;
        Ok(naive + TimeDelta::hours(self.model.clock_offset_hours()))
    }

    /// Programs the RTC from network time, normalized through the epoch.
    pub async fn init_rtc<RT: Rtc>(&mut self, rtc: &mut RT) -> crate::Result<()> {
        for attempt in 1..=RTC_ATTEMPTS {
            let datetime = match self.get_time().await {
                Ok(datetime) => datetime,
                Err(_) => {
                    warn!("get_time failed ({}/{})", attempt, RTC_ATTEMPTS);
                    Timer::after_secs(2).await;
                    continue;
                }
            };

            let datetime = match time::datetime_from_epoch(datetime.and_utc().timestamp()) {
                Ok(datetime) => datetime,
                Err(_) => {
                    warn!("RTC init failed ({}/{})", attempt, RTC_ATTEMPTS);
                    Timer::after_secs(2).await;
                    continue;
                }
            };

            match rtc.set_datetime(&datetime) {
                Ok(()) => {
                    self.rtc_set = true;
                    info!(
                        "RTC initialized: {}-{}-{} {}:{}:{}",
                        datetime.year(),
                        datetime.month(),
                        datetime.day(),
                        datetime.hour(),
                        datetime.minute(),
                        datetime.second()
                    );
                    return Ok(());
                }
                Err(_) => {
                    warn!("RTC init failed ({}/{})", attempt, RTC_ATTEMPTS);
                    Timer::after_secs(2).await;
                }
            }
        }
        error!("RTC initialization failed");
        Err(Error::NoResponse)
    }

    /// Puts the modem into low power (`AT+CFUN=0`).
    pub async fn deactivate(&mut self) {
        let _ = self.at.call_at("+CFUN=0", Duration::from_secs(2)).await;
        info!("Modem set to low power (CFUN=0)");
    }

    /// Detaches from the network and resets the connection sequence.
    pub async fn disconnect(&mut self) -> crate::Result<()> {
        Timer::after_secs(1).await;
        let result = self.at.call_at("+CFUN=0", Duration::from_secs(30)).await;
        self.connect_state = ConnectState::Idle;
        match result {
            Ok(_) => {
                info!("Modem CFUN=0 OK");
                Ok(())
            }
            Err(err) => {
                error!("disconnect: AT+CFUN=0 failed");
                Err(err)
            }
        }
    }
}
