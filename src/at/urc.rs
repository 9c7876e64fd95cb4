//! Unsolicited result code demultiplexing.
//!
//! The modem interleaves URCs with command replies. After an exchange
//! completes, its accumulated buffer is scanned line by line for the socket
//! URCs the core acts on (`+UUSORD`, `+UUSOCL`); every other `+...` line is
//! offered to the registered handler list. Socket read payloads are extracted
//! index-based, because CR/LF inside a `+USORD` payload is data, not
//! structure.

#[cfg(feature = "defmt")]
use defmt::{debug, warn};
use heapless::Vec;
#[cfg(not(feature = "defmt"))]
use log::{debug, warn};

use crate::at::response::{CommandResponse, find_bytes};
use crate::error::Error;

/// A handler for URCs the core does not act on (`+CSCON`, `+CEREG`, `+CGEV`,
/// ...). Returns `true` when the URC was claimed.
pub type UrcHandler = fn(&CommandResponse) -> bool;

pub const MAX_URC_HANDLERS: usize = 4;
const MAX_DATA_EVENTS: usize = 8;
const MAX_CLOSE_EVENTS: usize = 4;

/// `+UUSORD: <socket>,<length>`: bytes ready to be read from the modem.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataAvailable {
    pub socket: u8,
    pub length: usize,
}

/// Socket events found in one accumulated buffer.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UrcScan {
    pub data_available: Vec<DataAvailable, MAX_DATA_EVENTS>,
    pub closed: Vec<u8, MAX_CLOSE_EVENTS>,
}

/// Scans an accumulated buffer for URC lines.
///
/// Lines that parse as `+UUSORD`/`+UUSOCL` are collected; other command
/// responses run through `handlers` until one claims them.
pub fn scan(buffer: &[u8], handlers: &[UrcHandler]) -> UrcScan {
    let mut events = UrcScan::default();
    for line in buffer.split(|&byte| byte == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Ok(text) = core::str::from_utf8(line) else {
            continue;
        };
        let text = text.trim();
        if !text.starts_with('+') {
            continue;
        }
        let Ok(response) = CommandResponse::new(text) else {
            continue;
        };
        match response.command() {
            "UUSORD" => match response.parse2::<u8, usize>([0, 1]) {
                Ok((socket, length)) => {
                    let _ = events.data_available.push(DataAvailable { socket, length });
                }
                Err(_) => warn!("Malformed +UUSORD line"),
            },
            "UUSOCL" => match response.parse1::<u8>(0) {
                Ok(socket) => {
                    let _ = events.closed.push(socket);
                }
                Err(_) => warn!("Malformed +UUSOCL line"),
            },
            _ => {
                for handler in handlers {
                    if handler(&response) {
                        debug!("URC claimed by handler");
                        break;
                    }
                }
            }
        }
    }
    events
}

/// Extracts the payload of a `+USORD: <sock>,<len>,"<data>"` reply.
///
/// The payload starts right after the first double quote following the
/// header and runs for exactly `<len>` bytes; the byte after it must be the
/// closing quote. The scan is index-based so CR/LF bytes inside the payload
/// survive.
pub fn extract_usord_payload(response: &[u8]) -> crate::Result<&[u8]> {
    let key = b"+USORD:";
    let start = find_bytes(response, key).ok_or(Error::ParseError)?;
    let header = &response[start + key.len()..];
    let quote = find_bytes(header, b"\"").ok_or(Error::ParseError)?;

    let meta = core::str::from_utf8(&header[..quote]).map_err(|_| Error::StringEncodingError)?;
    let mut fields = meta.trim().trim_end_matches(',').split(',');
    let _sock: u8 = parse_field(&mut fields)?;
    let length: usize = parse_field(&mut fields)?;

    let payload = header.get(quote + 1..quote + 1 + length).ok_or(Error::ParseError)?;
    if header.get(quote + 1 + length) != Some(&b'"') {
        return Err(Error::ParseError);
    }
    Ok(payload)
}

fn parse_field<'a, T: core::str::FromStr>(
    fields: &mut impl Iterator<Item = &'a str>,
) -> crate::Result<T> {
    fields.next().ok_or(Error::ParseError)?.trim().parse().map_err(|_| Error::ParseError)
}

#[cfg(test)]
mod test_urc {
    use super::*;

    #[test]
    fn test_scan_collects_socket_events() {
        let events = scan(b"\r\n+UUSORD: 0,25\r\n+UUSOCL: 1\r\nOK\r\n", &[]);
        assert_eq!(
            events.data_available.as_slice(),
            &[DataAvailable {
                socket: 0,
                length: 25
            }]
        );
        assert_eq!(events.closed.as_slice(), &[1]);
    }

    #[test]
    fn test_scan_runs_handlers() {
        fn claim_cscon(response: &CommandResponse) -> bool {
            response.command() == "CSCON"
        }
        let events = scan(b"+CSCON: 1\r\n+UUSORD: 2,3\r\n", &[claim_cscon]);
        assert_eq!(
            events.data_available.as_slice(),
            &[DataAvailable {
                socket: 2,
                length: 3
            }]
        );
    }

    #[test]
    fn test_extract_payload_with_crlf_inside() -> crate::Result<()> {
        let payload = extract_usord_payload(b"\r\n+USORD: 0,5,\"a\r\nbc\"\r\nOK\r\n")?;
        assert_eq!(payload, b"a\r\nbc");
        Ok(())
    }

    #[test]
    fn test_extract_payload_mismatched_length() {
        assert_eq!(
            extract_usord_payload(b"+USORD: 0,9,\"abc\"\r\nOK\r\n").unwrap_err(),
            Error::ParseError
        );
        assert_eq!(
            extract_usord_payload(b"+USORD: 0,4,\"abc\"\r\n").unwrap_err(),
            Error::ParseError
        );
    }

    #[test]
    fn test_extract_payload_missing_quote() {
        assert_eq!(
            extract_usord_payload(b"+USORD: 0,3\r\nOK\r\n").unwrap_err(),
            Error::ParseError
        );
    }
}
