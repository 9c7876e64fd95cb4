//! Calendar helpers for network time.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::error::Error;

/// Converts an epoch timestamp to a calendar date-time.
pub fn datetime_from_epoch(secs: i64) -> crate::Result<NaiveDateTime> {
    Ok(DateTime::from_timestamp(secs, 0).ok_or(Error::ParseError)?.naive_utc())
}

/// Parses the quoted payload of `+CCLK: "yy/MM/dd,HH:mm:ss±zz"`.
///
/// Two-digit years mean 2000 + yy. The timezone suffix is tolerated and
/// dropped; the model-specific offset is the caller's business.
pub fn parse_cclk(value: &str) -> crate::Result<NaiveDateTime> {
    let (date_part, time_part) = value.split_once(',').ok_or(Error::ParseError)?;

    let mut date_fields = date_part.split('/');
    let year: i32 = parse_field(&mut date_fields)?;
    let month: u32 = parse_field(&mut date_fields)?;
    let day: u32 = parse_field(&mut date_fields)?;
    let year = if year < 2000 { 2000 + year } else { year };

    let time_core = time_part.split(['+', '-']).next().ok_or(Error::ParseError)?;
    let mut time_fields = time_core.split(':');
    let hour: u32 = parse_field(&mut time_fields)?;
    let minute: u32 = parse_field(&mut time_fields)?;
    let second: u32 = parse_field(&mut time_fields)?;

    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or(Error::ParseError)?
        .and_hms_opt(hour, minute, second)
        .ok_or(Error::ParseError)
}

fn parse_field<'a, T: core::str::FromStr>(
    fields: &mut impl Iterator<Item = &'a str>,
) -> crate::Result<T> {
    fields.next().ok_or(Error::ParseError)?.trim().parse().map_err(|_| Error::ParseError)
}
