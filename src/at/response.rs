use core::{fmt::Display, str::FromStr};
use heapless::{String, Vec};

use crate::error::Error;

/// Longest single AT command or response line we handle.
pub const AT_COMMAND_SIZE: usize = 120;
/// Accumulation buffer for one AT exchange, URC lines included.
pub const AT_BUF_SIZE: usize = 1024;
const AT_VALUE_COUNT: usize = 8;

/// Finds `needle` in `haystack`, byte-wise.
pub(crate) fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// A single `+PREFIX: <values>` line of a modem reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandResponse {
    line: String<AT_COMMAND_SIZE>,
    prefix_end: usize,
}

impl CommandResponse {
    pub fn new(line: &str) -> crate::Result<Self> {
        let (prefix, rest) = Self::split_at_response(line).ok_or(Error::ParseError)?;
        Self::split_values(rest)?;
        Ok(Self {
            line: String::from_str(line).map_err(|_| Error::BufferTooSmallError)?,
            prefix_end: 1 + prefix.len(),
        })
    }

    /// The command this line responds to, without the leading `+`.
    pub fn command(&self) -> &str {
        &self.line[1..self.prefix_end]
    }

    pub fn values(&self) -> Vec<&str, AT_VALUE_COUNT> {
        Self::split_values(&self.line[self.prefix_end + 2..]).unwrap_or_default()
    }

    fn split_at_response(line: &str) -> Option<(&str, &str)> {
        if line.starts_with('+')
            && let Some(colon) = line.find(": ")
        {
            return Some((&line[1..colon], &line[colon + 2..]));
        }
        None
    }

    /// Splits the value list of an AT response.
    ///
    /// Double quotes around strings are dropped and commas inside them are
    /// kept, so `1,"a,b",15` parses into `["1", "a,b", "15"]`.
    fn split_values(mut rest: &str) -> Result<Vec<&str, AT_VALUE_COUNT>, Error> {
        let mut values = Vec::new();
        while !rest.is_empty() {
            let consumed = if rest.starts_with('"') {
                let end = rest.find("\",").unwrap_or(rest.len() - 1);
                if end == rest.len() - 1 && !rest.ends_with('"') {
                    return Err(Error::ParseError);
                }
                values.push(&rest[1..end]).map_err(|_| Error::BufferTooSmallError)?;
                end + 1
            } else {
                let end = rest.find(',').unwrap_or(rest.len());
                values.push(&rest[..end]).map_err(|_| Error::BufferTooSmallError)?;
                end
            };
            if consumed >= rest.len() {
                break;
            }
            rest = &rest[consumed + 1..];
        }
        Ok(values)
    }

    fn value(&self, idx: usize) -> crate::Result<String<AT_COMMAND_SIZE>> {
        let values = self.values();
        let value = values.get(idx).ok_or(Error::ModemError)?;
        String::from_str(value).map_err(|_| Error::BufferTooSmallError)
    }

    /// Parses the value at position `idx`.
    pub fn parse1<T: FromStr>(&self, idx: usize) -> crate::Result<T> {
        self.value(idx)?.parse().map_err(|_| Error::ParseError)
    }

    /// Parses the values at the two given positions.
    pub fn parse2<T: FromStr, U: FromStr>(&self, indices: [usize; 2]) -> crate::Result<(T, U)> {
        Ok((self.parse1(indices[0])?, self.parse1(indices[1])?))
    }

    pub fn parse_values<T: FromStr>(&self) -> crate::Result<Vec<T, AT_VALUE_COUNT>> {
        self.values()
            .iter()
            .map(|value| value.parse().map_err(|_| Error::ParseError))
            .collect()
    }
}

impl Display for CommandResponse {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.line.trim())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for CommandResponse {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", self.line.as_str())
    }
}

/// The raw bytes accumulated during one AT exchange.
///
/// URC lines interleaved with the reply are kept verbatim so that the demux
/// can process them after the exchange completes. Socket payloads may contain
/// CR/LF bytes, which is why the accessors below never assume the buffer is
/// line-structured text.
#[derive(Debug, PartialEq, Eq)]
pub struct AtResponse {
    raw: Vec<u8, AT_BUF_SIZE>,
}

impl AtResponse {
    pub fn new(raw: Vec<u8, AT_BUF_SIZE>) -> Self {
        Self { raw }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn contains(&self, needle: &str) -> bool {
        find_bytes(&self.raw, needle.as_bytes()).is_some()
    }

    /// CR/LF-separated lines of the response, empty ones skipped.
    pub fn lines(&self) -> impl Iterator<Item = &[u8]> {
        self.raw
            .split(|&byte| byte == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| !line.is_empty())
    }

    /// The first line starting with `prefix`, e.g. `+USOCR:`.
    pub fn first(&self, prefix: &str) -> crate::Result<CommandResponse> {
        self.lines()
            .filter_map(|line| core::str::from_utf8(line).ok())
            .map(str::trim)
            .find(|line| line.starts_with(prefix))
            .ok_or(Error::ModemError)
            .and_then(CommandResponse::new)
    }

    /// The first line that is all digits and at least `min_len` long.
    ///
    /// IMSI and IMEI replies are bare digit lines between echoes and the
    /// final `OK`.
    pub fn digit_line(&self, min_len: usize) -> Option<&str> {
        self.lines()
            .filter_map(|line| core::str::from_utf8(line).ok())
            .map(str::trim)
            .find(|line| line.len() >= min_len && line.bytes().all(|byte| byte.is_ascii_digit()))
    }
}

#[cfg(test)]
mod test_response {
    use super::*;

    #[test]
    fn test_split_at_response() {
        assert_eq!(
            CommandResponse::split_at_response("+USOCR: 0"),
            Some(("USOCR", "0"))
        );
        assert_eq!(CommandResponse::split_at_response("USOCR: 0"), None);
        assert_eq!(CommandResponse::split_at_response("+USOCR 0"), None);
    }

    #[test]
    fn test_split_values() -> crate::Result<()> {
        let values = CommandResponse::split_values("1,\"a,b\",\"cell\",-7,20")?;
        assert_eq!(&values, &["1", "a,b", "cell", "-7", "20"]);

        let unterminated = CommandResponse::split_values("1,\"a,b\",\"cell");
        assert_eq!(unterminated.unwrap_err(), Error::ParseError);
        Ok(())
    }

    #[test]
    fn test_parse_values() -> crate::Result<()> {
        let response = CommandResponse::new("+USOWR: 0,1000")?;
        assert_eq!(response.command(), "USOWR");
        let (sock, written) = response.parse2::<u8, usize>([0, 1])?;
        assert_eq!(sock, 0);
        assert_eq!(written, 1000);

        let response = CommandResponse::new("+CSQ: 24,99")?;
        assert_eq!(response.parse1::<i32>(0)?, 24);
        Ok(())
    }

    #[test]
    fn test_quoted_value_keeps_commas() -> crate::Result<()> {
        let response = CommandResponse::new("+CCLK: \"25/08/01,12:34:56+36\"")?;
        assert_eq!(response.values().as_slice(), &["25/08/01,12:34:56+36"]);
        Ok(())
    }

    #[test]
    fn test_at_response_accessors() -> crate::Result<()> {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"AT+USOCR=6\r\n+USOCR: 2\r\nOK\r\n").unwrap();
        let response = AtResponse::new(raw);
        assert!(response.contains("OK"));
        assert_eq!(response.first("+USOCR:")?.parse1::<u8>(0)?, 2);

        let mut raw = Vec::new();
        raw.extend_from_slice(b"\r\n440103213456789\r\nOK\r\n").unwrap();
        let response = AtResponse::new(raw);
        assert_eq!(response.digit_line(15), Some("440103213456789"));
        assert_eq!(response.digit_line(16), None);
        Ok(())
    }
}
