//! Text helpers shared by the scheduler output parsers.

use thiserror::Error;

/// Why a time string from a job listing could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeParseError {
    #[error("Wrong number of pieces (expected 3) for time string '{0}'")]
    WrongPieces(String),

    #[error("Not a valid number of {field}: '{value}'")]
    InvalidNumber { field: &'static str, value: String },

    #[error("Time string '{0}' does not fit in a number of seconds")]
    Overflow(String),
}

fn number(field: &'static str, value: &str) -> Result<u64, TimeParseError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| TimeParseError::InvalidNumber {
            field,
            value: value.to_string(),
        })
}

fn total_seconds(value: &str, parts: &[(u64, u64)]) -> Result<u64, TimeParseError> {
    parts
        .iter()
        .try_fold(0u64, |total, &(amount, unit)| {
            amount.checked_mul(unit)?.checked_add(total)
        })
        .ok_or_else(|| TimeParseError::Overflow(value.to_string()))
}

/// Decode a `ps` time column of the form `[[days-]hours:]minutes:seconds`.
///
/// The string is split on `:` or `.` and must yield exactly three pieces; an
/// optional `days-` prefix is stripped from the first one.
pub fn parse_ps_time(value: &str) -> Result<u64, TimeParseError> {
    let pieces: Vec<&str> = value.split([':', '.']).collect();
    if pieces.len() != 3 {
        return Err(TimeParseError::WrongPieces(value.to_string()));
    }

    let (days, hours) = match pieces[0].split_once('-') {
        Some((days, hours)) => (number("days", days)?, hours),
        None => (0, pieces[0]),
    };
    let hours = number("hours", hours)?;
    let minutes = number("minutes", pieces[1])?;
    let seconds = number("seconds", pieces[2])?;

    total_seconds(value, &[(days, 86400), (hours, 3600), (minutes, 60), (seconds, 1)])
}

/// Decode a PBS `HH:MM:SS` walltime. Hours may exceed 24.
pub fn parse_walltime(value: &str) -> Result<u64, TimeParseError> {
    let pieces: Vec<&str> = value.trim().split(':').collect();
    if pieces.len() != 3 {
        return Err(TimeParseError::WrongPieces(value.to_string()));
    }
    let hours = number("hours", pieces[0])?;
    let minutes = number("minutes", pieces[1])?;
    let seconds = number("seconds", pieces[2])?;
    total_seconds(value, &[(hours, 3600), (minutes, 60), (seconds, 1)])
}

/// Render seconds as `HH:MM:SS` for PBS resource directives.
pub fn format_walltime(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

/// Split a listing line into columns separated by runs of whitespace.
pub fn split_columns(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}
