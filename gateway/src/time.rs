use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

// RFC3339 with exactly three fractional digits, always in UTC
const RFC3339_MILLIS: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

pub trait TimeSource {
    // Return an RFC3339 timestamp with millisecond precision
    fn current_time(&self) -> String;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> String {
        format_millis(OffsetDateTime::now_utc())
    }
}

pub fn format_millis(time: OffsetDateTime) -> String {
    let utc = time.to_offset(time::UtcOffset::UTC);
    utc.format(RFC3339_MILLIS)
        .unwrap_or_else(|_| utc.unix_timestamp().to_string())
}
