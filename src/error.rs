use thiserror::Error;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum Error {
    #[error("Timed out waiting for the modem")]
    TimeoutError,
    #[error("Modem replied ERROR")]
    AtErrorResponse,
    #[error("Modem replied +CME ERROR {0}")]
    CmeError(u16),
    #[error("Modem replied +CMS ERROR {0}")]
    CmsError(u16),
    #[error("No response from the modem")]
    NoResponse,
    #[error("Inconsistent AT response")]
    ModemError,
    #[error("Cannot parse string as the given type")]
    ParseError,
    #[error("Buffer too small")]
    BufferTooSmallError,
    #[error("String is not valid UTF-8")]
    StringEncodingError,
    #[error("UART read failed")]
    UartReadError,
    #[error("UART write failed")]
    UartWriteError,
    #[error("Modem closed the socket")]
    SocketClosedError,
    #[error("Network registration timed out")]
    RegistrationTimeout,
    #[error("Filesystem operation failed")]
    ResourceUnavailable,
    #[error("Retry budget exhausted, upload aborted")]
    Aborted,
}
