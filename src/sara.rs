//! Driver for u-blox SARA-R410/R510 LTE modules.
//!
//! [`modem::SaraModem`] owns the AT transport and carries all modem state:
//! detected model, registration progress, the active socket and its receive
//! buffer. The connection sequence lives in [`connection`], the TCP socket
//! operations in [`socket`].

use core::fmt::Display;

use crate::at::response::AtResponse;

pub mod connection;
pub mod modem;
pub mod socket;

/// Modem model detected from the `ATI` reply.
///
/// The two models differ in their PDP type, their post-attach activation
/// sequence and how `AT+CCLK?` readings relate to local time; all of those
/// are pure functions of this value.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModemModel {
    #[default]
    Unknown,
    R410,
    R510,
}

impl ModemModel {
    pub(crate) fn from_ati(response: &AtResponse) -> Self {
        if response.contains("R510") {
            ModemModel::R510
        } else if response.contains("R410") {
            ModemModel::R410
        } else {
            ModemModel::Unknown
        }
    }

    /// PDP type used in `AT+CGDCONT` for this model.
    pub fn pdp_type(self) -> &'static str {
        match self {
            ModemModel::R510 => "IPV4V6",
            _ => "IP",
        }
    }

    /// Hours to add to an `AT+CCLK?` reading.
    ///
    /// The R410 reports UTC in local form and needs the JST shift; the R510
    /// already reports local time.
    pub fn clock_offset_hours(self) -> i64 {
        match self {
            ModemModel::R410 => 9,
            _ => 0,
        }
    }

    /// Whether the internal IP stack profile must be activated after attach
    /// (the `UPSD`/`UPSDA` sequence).
    pub fn has_internal_stack(self) -> bool {
        self == ModemModel::R510
    }
}

impl Display for ModemModel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ModemModel::Unknown => write!(f, "unknown"),
            ModemModel::R410 => write!(f, "R410"),
            ModemModel::R510 => write!(f, "R510"),
        }
    }
}

/// Diagnostic LED driven when the connection sequence fails fatally.
pub trait StatusLed {
    fn on(&mut self);
    fn off(&mut self);
}

/// LED stub for builds without a diagnostic LED.
pub struct NoLed;

impl StatusLed for NoLed {
    fn on(&mut self) {}
    fn off(&mut self) {}
}

/// Real-time clock programmed from network time after a connect.
pub trait Rtc {
    fn set_datetime(&mut self, datetime: &chrono::NaiveDateTime) -> crate::Result<()>;
}
