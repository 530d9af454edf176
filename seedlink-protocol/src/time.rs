//! Timestamps for TIME/DATA windows, record start times, and INFO output.
//!
//! Handles three textual forms and one binary one:
//! - v3 TIME command: `"YYYY,M,D,h,m,s"`
//! - v4 DATA window: `"YYYY-MM-DDThh:mm:ssZ"` (fractional seconds ignored)
//! - INFO display: `"YYYY/MM/DD hh:mm:ss"`
//! - miniSEED v2 BTime: day-of-year based, payload bytes 20..30

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeedlinkError};

/// Comparable timestamp represented as seconds since Unix epoch (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp {
    seconds: i64,
}

impl Timestamp {
    pub const EPOCH: Self = Self { seconds: 0 };

    pub fn from_unix_seconds(seconds: i64) -> Self {
        Self { seconds }
    }

    pub fn unix_seconds(self) -> i64 {
        self.seconds
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let seconds = match time.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        };
        Self { seconds }
    }

    /// Parse either the v3 comma form or the v4 ISO form.
    pub fn parse(s: &str) -> Result<Self> {
        let parsed = if s.contains(',') {
            Self::from_time_command(s)
        } else {
            Self::from_iso(s)
        };
        parsed.ok_or_else(|| SeedlinkError::InvalidTime(s.to_owned()))
    }

    /// Parse TIME command format: `"2024,1,15,10,30,45"`.
    ///
    /// Fields: year, month, day, hour, minute, second.
    pub fn from_time_command(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 6 {
            return None;
        }
        let year: i64 = parts[0].parse().ok()?;
        let month: u32 = parts[1].parse().ok()?;
        let day: u32 = parts[2].parse().ok()?;
        let hour: u32 = parts[3].parse().ok()?;
        let minute: u32 = parts[4].parse().ok()?;
        let second: u32 = parts[5].parse().ok()?;
        Self::from_civil(year, month, day, hour, minute, second)
    }

    /// Parse ISO-8601 UTC: `"2024-01-15T10:30:45Z"`, `"2024-01-15T10:30:45.5"`.
    pub fn from_iso(s: &str) -> Option<Self> {
        let s = s.trim_end_matches('Z');
        let (date, time) = s.split_once('T')?;

        let mut d = date.split('-');
        let year: i64 = d.next()?.parse().ok()?;
        let month: u32 = d.next()?.parse().ok()?;
        let day: u32 = d.next()?.parse().ok()?;
        if d.next().is_some() {
            return None;
        }

        let time = time.split('.').next()?;
        let mut t = time.split(':');
        let hour: u32 = t.next()?.parse().ok()?;
        let minute: u32 = t.next()?.parse().ok()?;
        let second: u32 = t.next().map(|s| s.parse()).transpose().ok()?.unwrap_or(0);
        if t.next().is_some() {
            return None;
        }
        Self::from_civil(year, month, day, hour, minute, second)
    }

    /// Parse miniSEED v2 BTime from payload bytes 20..30.
    ///
    /// BTime layout (big-endian):
    /// - bytes 20..22: year (u16)
    /// - bytes 22..24: day-of-year (u16)
    /// - byte 24: hour, byte 25: minute, byte 26: second
    /// - bytes 28..30: 1/10000 s ticks (ignored for comparison)
    pub fn from_mseed_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() < 30 {
            return None;
        }
        let year = u16::from_be_bytes([payload[20], payload[21]]) as i64;
        let doy = u16::from_be_bytes([payload[22], payload[23]]) as u32;
        let hour = payload[24] as u32;
        let minute = payload[25] as u32;
        let second = payload[26] as u32;

        if year == 0 || doy == 0 || doy > 366 || hour > 23 || minute > 59 || second > 59 {
            return None;
        }

        Some(Self::from_components(year, doy, hour, minute, second))
    }

    /// Write this time as a miniSEED v2 BTime into payload bytes 20..30.
    ///
    /// Does nothing for payloads shorter than a fixed header.
    pub fn write_mseed_btime(self, payload: &mut [u8]) {
        if payload.len() < 30 {
            return;
        }
        let (year, month, day, hour, minute, second) = self.civil();
        let doy = month_day_to_doy(year, month, day).unwrap_or(1) as u16;
        payload[20..22].copy_from_slice(&(year as u16).to_be_bytes());
        payload[22..24].copy_from_slice(&doy.to_be_bytes());
        payload[24] = hour as u8;
        payload[25] = minute as u8;
        payload[26] = second as u8;
        payload[27] = 0;
        payload[28..30].copy_from_slice(&0u16.to_be_bytes());
    }

    /// `"2024,1,15,10,30,45"`
    pub fn to_time_command(self) -> String {
        let (y, mo, d, h, mi, s) = self.civil();
        format!("{y},{mo},{d},{h},{mi},{s}")
    }

    /// `"2024-01-15T10:30:45Z"`
    pub fn to_iso(self) -> String {
        let (y, mo, d, h, mi, s) = self.civil();
        format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}Z")
    }

    /// `"2024/01/15 10:30:45"`, the form used in INFO documents.
    pub fn to_display(self) -> String {
        let (y, mo, d, h, mi, s) = self.civil();
        format!("{y:04}/{mo:02}/{d:02} {h:02}:{mi:02}:{s:02}")
    }

    fn from_civil(
        year: i64,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
    ) -> Option<Self> {
        if hour > 23 || minute > 59 || second > 59 {
            return None;
        }
        let doy = month_day_to_doy(year, month, day)?;
        Some(Self::from_components(year, doy, hour, minute, second))
    }

    /// Build a timestamp from year, day-of-year, and time components.
    fn from_components(year: i64, doy: u32, hour: u32, minute: u32, second: u32) -> Self {
        let mut days: i64 = 0;
        if year >= 1970 {
            for y in 1970..year {
                days += days_in_year(y);
            }
        } else {
            for y in year..1970 {
                days -= days_in_year(y);
            }
        }
        days += (doy as i64) - 1;

        let seconds = days * 86400 + (hour as i64) * 3600 + (minute as i64) * 60 + (second as i64);
        Self { seconds }
    }

    /// Split into (year, month, day, hour, minute, second), UTC.
    fn civil(self) -> (i64, u32, u32, u32, u32, u32) {
        let mut days = self.seconds.div_euclid(86400);
        let time_of_day = self.seconds.rem_euclid(86400);

        let mut year = 1970i64;
        while days < 0 {
            year -= 1;
            days += days_in_year(year);
        }
        while days >= days_in_year(year) {
            days -= days_in_year(year);
            year += 1;
        }

        let mut month = 1u32;
        for len in month_lengths(year) {
            if days < len as i64 {
                break;
            }
            days -= len as i64;
            month += 1;
        }

        (
            year,
            month,
            days as u32 + 1,
            (time_of_day / 3600) as u32,
            ((time_of_day % 3600) / 60) as u32,
            (time_of_day % 60) as u32,
        )
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_iso())
    }
}

fn is_leap(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

fn days_in_year(y: i64) -> i64 {
    if is_leap(y) { 366 } else { 365 }
}

fn month_lengths(year: i64) -> [u32; 12] {
    let feb = if is_leap(year) { 29 } else { 28 };
    [31, feb, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
}

/// Convert month (1-12) and day (1-31) to day-of-year (1-366).
fn month_day_to_doy(year: i64, month: u32, day: u32) -> Option<u32> {
    if !(1..=12).contains(&month) {
        return None;
    }
    let lengths = month_lengths(year);
    if day < 1 || day > lengths[(month - 1) as usize] {
        return None;
    }
    Some(day + lengths.iter().take((month - 1) as usize).sum::<u32>())
}

/// Inclusive time window attached to a station selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: Timestamp,
    pub end: Option<Timestamp>,
}

impl TimeWindow {
    /// Parse TIME/DATA window arguments.
    pub fn parse(start: &str, end: Option<&str>) -> Result<Self> {
        Ok(Self {
            start: Timestamp::parse(start)?,
            end: end.map(Timestamp::parse).transpose()?,
        })
    }

    /// `start <= ts`, and `ts <= end` when an end is set.
    pub fn contains(&self, ts: Timestamp) -> bool {
        if ts < self.start {
            return false;
        }
        if let Some(end) = self.end
            && ts > end
        {
            return false;
        }
        true
    }

    /// Whether `ts` lies past the end of the window.
    pub fn is_past(&self, ts: Timestamp) -> bool {
        self.end.is_some_and(|end| ts > end)
    }
}
