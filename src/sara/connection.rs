//! Registration, attach and PDP activation as a single-step state machine.
//!
//! [`SaraModem::connect_step`] performs at most one AT dispatch or one
//! cooperative wait probe per call and returns `Ok(false)` while the sequence
//! is progressing. The caller keeps the machine alive by calling it
//! repeatedly; time spent in any state is bounded by that state's timeout.
//! Model differences (CGDCONT PDP type, the R510 `UPSD`/`UPSDA` activation,
//! pacing of the radio resets) are pure functions of the detected model.

use core::str::FromStr;

#[cfg(feature = "defmt")]
use defmt::{error, info, warn};
use embassy_time::{Duration, Instant, Timer};
use heapless::{String, format};
#[cfg(not(feature = "defmt"))]
use log::{error, info, warn};

use crate::at::response::AT_COMMAND_SIZE;
use crate::at::uart::{AT_DEFAULT_TIMEOUT, Rx, Tx, WaitPoll};
use crate::error::Error;
use crate::sara::modem::SaraModem;
use crate::sara::{ModemModel, Rtc, StatusLed};

// Per-state timeouts of the connection sequence.
const UMNOPROF_TIMEOUT: Duration = Duration::from_secs(20);
const CFUN15_TIMEOUT: Duration = Duration::from_secs(60);
const COPS2_TIMEOUT: Duration = Duration::from_secs(120);
const CGDCONT_TIMEOUT: Duration = Duration::from_secs(60);
const COPS0_TIMEOUT: Duration = Duration::from_secs(20);
const CFUN16_TIMEOUT: Duration = Duration::from_secs(40);
const CFUN0_TIMEOUT: Duration = Duration::from_secs(40);
const R510_CGDCONT_TIMEOUT: Duration = Duration::from_secs(20);
const CFUN1_TIMEOUT: Duration = Duration::from_secs(20);
const CEREG_TIMEOUT: Duration = Duration::from_millis(1200);
const CGATT_TIMEOUT: Duration = Duration::from_secs(30);
const UPSD_TIMEOUT: Duration = Duration::from_secs(20);

/// `connect` drives `connect_step` at this pace for up to ~30 s.
const CONNECT_STEPS: u32 = 300;
const CONNECT_PACE: Duration = Duration::from_millis(100);

/// Position in the connection sequence.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectState {
    #[default]
    Idle,
    UmnoprofWait,
    R410Cfun15Send,
    R410Cfun15Wait,
    R410Cops2Send,
    R410Cops2Wait,
    R410CgdcontSend,
    R410CgdcontWait,
    R410DoneWait,
    R510Cfun16Send,
    R510Cfun16Wait,
    R510Cfun0Delay,
    R510Cfun0Send,
    R510Cfun0Wait,
    R510CgdcontSend,
    R510CgdcontWait,
    R510Cfun1Send,
    R510Cfun1Wait,
    CeregSend,
    CeregWait,
    CgattSend,
    CgattWait,
    Upsd0Send,
    Upsd0Wait,
    Upsd100Send,
    Upsd100Wait,
    UpsdaSend,
    UpsdaWait,
    Done,
}

/// APN, credentials and pacing of the connection sequence.
///
/// The pacing delays carry their production defaults; tests compress them.
/// The per-state timeouts are not configurable.
#[derive(Clone)]
pub struct NetworkConfig {
    pub apn: String<30>,
    pub user: String<30>,
    pub password: String<30>,
    /// PDP context id used in `CGDCONT`/`UAUTHREQ`.
    pub pdp_context: u8,
    /// Settle time before `AT+CFUN=15` on the R410.
    pub cfun_settle: Duration,
    /// Settle time before `AT+COPS=2` (R410) and before `AT+CFUN=0` (R510).
    pub radio_settle: Duration,
    /// Pause between CEREG/CGATT status polls.
    pub status_poll: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            apn: String::from_str("soracom.io").unwrap(),
            user: String::from_str("sora").unwrap(),
            password: String::from_str("sora").unwrap(),
            pdp_context: 1,
            cfun_settle: Duration::from_secs(2),
            radio_settle: Duration::from_secs(10),
            status_poll: Duration::from_secs(1),
        }
    }
}

impl<T: Tx, R: Rx, L: StatusLed> SaraModem<T, R, L> {
    pub fn connect_state(&self) -> ConnectState {
        self.connect_state
    }

    fn enter(&mut self, state: ConnectState) {
        self.connect_state = state;
        self.connect_start = Instant::now();
    }

    /// Advances the connection sequence by one step.
    ///
    /// Returns `Ok(true)` once registered, attached and (on the R510)
    /// activated; `Ok(false)` while still progressing. A fatal failure turns
    /// the diagnostic LED on, resets the sequence to idle and surfaces as
    /// `Err`; the caller is expected to start over.
    pub async fn connect_step(&mut self, config: &NetworkConfig) -> crate::Result<bool> {
        match self.connect_step_inner(config).await {
            Ok(done) => Ok(done),
            Err(err) => {
                self.led.on();
                self.enter(ConnectState::Idle);
                Err(err)
            }
        }
    }

    async fn connect_step_inner(&mut self, config: &NetworkConfig) -> crate::Result<bool> {
        let now = Instant::now();
        match self.connect_state {
            ConnectState::Idle => {
                info!("Starting connection sequence");
                // MNO profile 20: NTT DOCOMO
                self.at.dispatch("+UMNOPROF=20", "OK", UMNOPROF_TIMEOUT).await?;
                self.enter(ConnectState::UmnoprofWait);
            }

            ConnectState::UmnoprofWait => match self.at.poll_wait().await {
                Ok(WaitPoll::Ready(_)) => {
                    let next = if self.model == ModemModel::R410 {
                        ConnectState::R410Cfun15Send
                    } else {
                        ConnectState::R510Cfun16Send
                    };
                    self.enter(next);
                }
                Ok(WaitPoll::Pending) => {}
                Err(Error::TimeoutError) => {
                    error!("Timeout UMNOPROF");
                    self.disconnect().await?;
                    return Err(Error::TimeoutError);
                }
                Err(err) => return Err(err),
            },

            // R410: radio off, deregister, define context, auth, reattach.
            ConnectState::R410Cfun15Send => {
                if now - self.connect_start > config.cfun_settle {
                    self.at.dispatch("+CFUN=15", "OK", CFUN15_TIMEOUT).await?;
                    self.enter(ConnectState::R410Cfun15Wait);
                }
            }

            ConnectState::R410Cfun15Wait => match self.at.poll_wait().await {
                Ok(WaitPoll::Ready(_)) => self.enter(ConnectState::R410Cops2Send),
                Ok(WaitPoll::Pending) => {}
                Err(Error::TimeoutError) => {
                    error!("Timeout CFUN=15");
                    return Err(Error::TimeoutError);
                }
                Err(err) => return Err(err),
            },

            ConnectState::R410Cops2Send => {
                if now - self.connect_start > config.radio_settle {
                    self.at.dispatch("+COPS=2", "OK", COPS2_TIMEOUT).await?;
                    self.enter(ConnectState::R410Cops2Wait);
                }
            }

            ConnectState::R410Cops2Wait => match self.at.poll_wait().await {
                Ok(WaitPoll::Ready(_)) => self.enter(ConnectState::R410CgdcontSend),
                Ok(WaitPoll::Pending) => {}
                Err(Error::TimeoutError) => {
                    warn!("Timeout COPS=2, retrying");
                    self.enter(ConnectState::R410Cops2Send);
                }
                Err(err) => return Err(err),
            },

            ConnectState::R410CgdcontSend => {
                let cmd = format!(AT_COMMAND_SIZE;
                    "+CGDCONT={},\"{}\",\"{}\"",
                    config.pdp_context,
                    self.model.pdp_type(),
                    config.apn
                )
                .map_err(|_| Error::BufferTooSmallError)?;
                self.at.dispatch(&cmd, "OK", CGDCONT_TIMEOUT).await?;
                self.enter(ConnectState::R410CgdcontWait);
            }

            ConnectState::R410CgdcontWait => match self.at.poll_wait().await {
                Ok(WaitPoll::Ready(_)) => {
                    let auth = format!(AT_COMMAND_SIZE;
                        "+UAUTHREQ={},1,\"{}\",\"{}\"",
                        config.pdp_context,
                        config.user,
                        config.password
                    )
                    .map_err(|_| Error::BufferTooSmallError)?;
                    if let Err(err) = self.at.call_at(&auth, AT_DEFAULT_TIMEOUT).await {
                        error!("Failed UAUTHREQ");
                        return Err(err);
                    }
                    self.at.dispatch("+COPS=0", "OK", COPS0_TIMEOUT).await?;
                    self.enter(ConnectState::R410DoneWait);
                }
                Ok(WaitPoll::Pending) => {}
                Err(Error::TimeoutError) => {
                    error!("Timeout CGDCONT");
                    return Err(Error::TimeoutError);
                }
                Err(err) => return Err(err),
            },

            ConnectState::R410DoneWait => match self.at.poll_wait().await {
                Ok(WaitPoll::Ready(_)) => {
                    info!("R410 connection complete");
                    self.enter(ConnectState::CeregSend);
                }
                Ok(WaitPoll::Pending) => {}
                Err(Error::TimeoutError) => {
                    error!("Timeout final COPS=0");
                    return Err(Error::TimeoutError);
                }
                Err(err) => return Err(err),
            },

            // R510: radio reset, define context, radio back on.
            ConnectState::R510Cfun16Send => {
                self.at.dispatch("+CFUN=16", "OK", CFUN16_TIMEOUT).await?;
                self.enter(ConnectState::R510Cfun16Wait);
            }

            ConnectState::R510Cfun16Wait => match self.at.poll_wait().await {
                Ok(WaitPoll::Ready(_)) => self.enter(ConnectState::R510Cfun0Delay),
                Ok(WaitPoll::Pending) => {}
                Err(Error::TimeoutError) => {
                    error!("Timeout AT+CFUN=16");
                    return Err(Error::TimeoutError);
                }
                Err(err) => return Err(err),
            },

            ConnectState::R510Cfun0Delay => {
                if now - self.connect_start > config.radio_settle {
                    self.connect_state = ConnectState::R510Cfun0Send;
                }
            }

            ConnectState::R510Cfun0Send => {
                self.at.dispatch("+CFUN=0", "OK", CFUN0_TIMEOUT).await?;
                self.enter(ConnectState::R510Cfun0Wait);
            }

            ConnectState::R510Cfun0Wait => match self.at.poll_wait().await {
                Ok(WaitPoll::Ready(_)) => self.enter(ConnectState::R510CgdcontSend),
                Ok(WaitPoll::Pending) => {}
                Err(Error::TimeoutError) => {
                    error!("Timeout AT+CFUN=0");
                    return Err(Error::TimeoutError);
                }
                Err(err) => return Err(err),
            },

            ConnectState::R510CgdcontSend => {
                let cmd = format!(AT_COMMAND_SIZE;
                    "+CGDCONT={},\"{}\",\"{}\"",
                    config.pdp_context,
                    self.model.pdp_type(),
                    config.apn
                )
                .map_err(|_| Error::BufferTooSmallError)?;
                self.at.dispatch(&cmd, "OK", R510_CGDCONT_TIMEOUT).await?;
                self.enter(ConnectState::R510CgdcontWait);
            }

            ConnectState::R510CgdcontWait => match self.at.poll_wait().await {
                Ok(WaitPoll::Ready(_)) => self.enter(ConnectState::R510Cfun1Send),
                Ok(WaitPoll::Pending) => {}
                Err(Error::TimeoutError) => {
                    error!("Failed CGDCONT");
                    return Err(Error::TimeoutError);
                }
                Err(err) => return Err(err),
            },

            ConnectState::R510Cfun1Send => {
                self.at.dispatch("+CFUN=1", "OK", CFUN1_TIMEOUT).await?;
                self.enter(ConnectState::R510Cfun1Wait);
            }

            ConnectState::R510Cfun1Wait => match self.at.poll_wait().await {
                Ok(WaitPoll::Ready(_)) => self.enter(ConnectState::CeregSend),
                Ok(WaitPoll::Pending) => {}
                Err(Error::TimeoutError) => {
                    error!("Timeout AT+CFUN=1");
                    return Err(Error::TimeoutError);
                }
                Err(err) => return Err(err),
            },

            // Common tail: poll registration, then attach.
            ConnectState::CeregSend => {
                if now - self.connect_start > config.status_poll {
                    self.at.dispatch("+CEREG?", "OK", CEREG_TIMEOUT).await?;
                    self.enter(ConnectState::CeregWait);
                }
            }

            ConnectState::CeregWait => match self.at.poll_wait().await {
                Ok(WaitPoll::Ready(response)) => {
                    if response.contains("+CEREG: 0,1") || response.contains("+CEREG: 0,5") {
                        info!("Registered to network");
                        self.enter(ConnectState::CgattSend);
                    } else {
                        self.enter(ConnectState::CeregSend);
                    }
                }
                Ok(WaitPoll::Pending) => {}
                Err(Error::TimeoutError) => {
                    warn!("Timeout CEREG");
                    self.enter(ConnectState::CeregSend);
                }
                Err(err) => return Err(err),
            },

            ConnectState::CgattSend => {
                if now - self.connect_start > config.status_poll {
                    self.at.dispatch("+CGATT?", "OK", CGATT_TIMEOUT).await?;
                    self.enter(ConnectState::CgattWait);
                }
            }

            ConnectState::CgattWait => match self.at.poll_wait().await {
                Ok(WaitPoll::Ready(response)) => {
                    if response.contains("+CGATT: 1") {
                        info!("Attached to network");
                        if self.model.has_internal_stack() {
                            self.enter(ConnectState::Upsd0Send);
                        } else {
                            self.connect_state = ConnectState::Done;
                        }
                    } else {
                        self.enter(ConnectState::CgattSend);
                    }
                }
                Ok(WaitPoll::Pending) => {}
                Err(Error::TimeoutError) => {
                    warn!("Timeout CGATT");
                    self.enter(ConnectState::CgattSend);
                }
                Err(err) => return Err(err),
            },

            // R510 internal profile activation.
            ConnectState::Upsd0Send => {
                self.at.dispatch("+UPSD=0,0,0", "OK", UPSD_TIMEOUT).await?;
                self.enter(ConnectState::Upsd0Wait);
            }

            ConnectState::Upsd0Wait => match self.at.poll_wait().await {
                Ok(WaitPoll::Ready(_)) => self.enter(ConnectState::Upsd100Send),
                Ok(WaitPoll::Pending) => {}
                Err(Error::TimeoutError) => {
                    error!("Timeout AT+UPSD=0,0,0");
                    return Err(Error::TimeoutError);
                }
                Err(err) => return Err(err),
            },

            ConnectState::Upsd100Send => {
                self.at.dispatch("+UPSD=0,100,1", "OK", UPSD_TIMEOUT).await?;
                self.enter(ConnectState::Upsd100Wait);
            }

            ConnectState::Upsd100Wait => match self.at.poll_wait().await {
                Ok(WaitPoll::Ready(_)) => self.enter(ConnectState::UpsdaSend),
                Ok(WaitPoll::Pending) => {}
                Err(Error::TimeoutError) => {
                    error!("Timeout AT+UPSD=0,100,1");
                    return Err(Error::TimeoutError);
                }
                Err(err) => return Err(err),
            },

            ConnectState::UpsdaSend => {
                self.at.dispatch("+UPSDA=0,3", "OK", UPSD_TIMEOUT).await?;
                self.enter(ConnectState::UpsdaWait);
            }

            ConnectState::UpsdaWait => match self.at.poll_wait().await {
                Ok(WaitPoll::Ready(_)) => self.connect_state = ConnectState::Done,
                Ok(WaitPoll::Pending) => {}
                Err(Error::TimeoutError) => {
                    error!("Timeout AT+UPSDA=0,3");
                    return Err(Error::TimeoutError);
                }
                Err(err) => return Err(err),
            },

            ConnectState::Done => return Ok(true),
        }
        Ok(false)
    }

    /// Initializes, drives [`Self::connect_step`] to completion and programs
    /// the RTC. Bounded to roughly 30 seconds.
    pub async fn connect<RT: Rtc>(
        &mut self,
        config: &NetworkConfig,
        rtc: &mut RT,
    ) -> crate::Result<()> {
        self.initialize().await?;
        for _ in 0..CONNECT_STEPS {
            if self.connect_step(config).await? {
                Timer::after(CONNECT_PACE).await;
                self.init_rtc(rtc).await?;
                info!("Successfully connected");
                return Ok(());
            }
            Timer::after(CONNECT_PACE).await;
        }
        Err(Error::RegistrationTimeout)
    }
}
