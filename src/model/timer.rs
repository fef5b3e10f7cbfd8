//! Timer trigger specifications and ISO-8601 duration parsing.

use chrono::{DateTime, Duration, Utc};
use nom::{
    bytes::complete::tag,
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, opt, recognize},
    sequence::{pair, preceded, terminated, tuple},
    IResult,
};

/// When a timer trigger becomes due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerSpec {
    /// Relative to the moment monitoring starts.
    Duration { ms: u64 },
    /// Absolute deadline.
    Date(DateTime<Utc>),
}

impl TimerSpec {
    /// Deadline for a timer armed at `armed_at`.
    pub fn expires_at(&self, armed_at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimerSpec::Duration { ms } => {
                let ms = i64::try_from(*ms).unwrap_or(i64::MAX);
                Duration::try_milliseconds(ms)
                    .and_then(|d| armed_at.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
            TimerSpec::Date(at) => *at,
        }
    }
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_timer_date(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| format!("invalid timer date '{s}': {e}"))
}

/// Parse an ISO-8601 duration (`P1DT2H`, `PT5M`, `PT0.5S`, `P2W`) into milliseconds.
pub fn parse_iso8601_duration(s: &str) -> Result<u64, String> {
    let input = s.trim();
    let parsed = all_consuming(duration)(input)
        .map(|(_, parts)| parts)
        .map_err(|_| format!("invalid ISO-8601 duration '{s}'"))?;

    let DurationParts {
        weeks,
        days,
        hours,
        minutes,
        seconds_ms,
        has_any,
    } = parsed;
    if !has_any {
        return Err(format!("ISO-8601 duration '{s}' has no components"));
    }

    let total = weeks
        .checked_mul(7 * 24 * 3_600_000)
        .and_then(|w| days.checked_mul(24 * 3_600_000).and_then(|d| w.checked_add(d)))
        .and_then(|t| hours.checked_mul(3_600_000).and_then(|h| t.checked_add(h)))
        .and_then(|t| minutes.checked_mul(60_000).and_then(|m| t.checked_add(m)))
        .and_then(|t| t.checked_add(seconds_ms))
        .ok_or_else(|| format!("ISO-8601 duration '{s}' overflows"))?;
    Ok(total)
}

struct DurationParts {
    weeks: u64,
    days: u64,
    hours: u64,
    minutes: u64,
    seconds_ms: u64,
    has_any: bool,
}

fn count(unit: char, input: &str) -> IResult<&str, u64> {
    terminated(map_res(digit1, |d: &str| d.parse::<u64>()), char(unit))(input)
}

/// Seconds with an optional fraction, in milliseconds (`1.5S` -> 1500).
fn seconds(input: &str) -> IResult<&str, u64> {
    map_res(
        terminated(
            recognize(pair(digit1, opt(pair(char('.'), digit1)))),
            char('S'),
        ),
        |s: &str| -> Result<u64, String> {
            let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
            let whole: u64 = whole.parse().map_err(|e| format!("{e}"))?;
            let mut frac_ms = 0u64;
            for (i, c) in frac.chars().take(3).enumerate() {
                let digit = u64::from(c.to_digit(10).unwrap_or(0));
                frac_ms += digit * 10u64.pow(2 - i as u32);
            }
            whole
                .checked_mul(1000)
                .and_then(|w| w.checked_add(frac_ms))
                .ok_or_else(|| "seconds overflow".to_string())
        },
    )(input)
}

fn duration(input: &str) -> IResult<&str, DurationParts> {
    let (input, _) = char('P')(input)?;
    let (input, (weeks, days)) = pair(opt(|i| count('W', i)), opt(|i| count('D', i)))(input)?;
    let (input, time) = opt(preceded(
        tag("T"),
        tuple((
            opt(|i| count('H', i)),
            opt(|i| count('M', i)),
            opt(seconds),
        )),
    ))(input)?;
    let (hours, minutes, secs) = time.unwrap_or((None, None, None));
    let has_any = [weeks, days, hours, minutes, secs]
        .iter()
        .any(|p| p.is_some());
    Ok((
        input,
        DurationParts {
            weeks: weeks.unwrap_or(0),
            days: days.unwrap_or(0),
            hours: hours.unwrap_or(0),
            minutes: minutes.unwrap_or(0),
            seconds_ms: secs.unwrap_or(0),
            has_any,
        },
    ))
}
