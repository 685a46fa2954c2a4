use crate::errors::{CalibError, CalibResult};
use crate::state::SettlementPeriod;
use chrono::{DateTime, DurationRound, NaiveDate, TimeDelta, Utc};
use smallvec::SmallVec;

/// Options expire at 08:00 UTC on the expiry date. Daily feature rows are
/// stamped at the same hour (the 08:00-08:00 averaging day).
const EXPIRY_HOUR_UTC: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

/// A parsed `BASE-EXPIRY-STRIKE-TYPE` option instrument, e.g. `BTC-23DEC24-95500-C`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Instrument {
    pub base: String,
    pub expiry: NaiveDate,
    pub strike: f64,
    pub option_type: OptionType,
}

#[inline]
fn tokens(name: &str) -> SmallVec<[&str; 4]> {
    name.split('-').collect()
}

/// The strike token: second-to-last hyphen-delimited token. `None` for
/// names with fewer than three tokens (e.g. perpetuals).
pub fn extract_strike(name: &str) -> Option<&str> {
    let parts = tokens(name);
    if parts.len() >= 3 {
        Some(parts[parts.len() - 2])
    } else {
        None
    }
}

impl Instrument {
    pub fn parse(name: &str) -> CalibResult<Self> {
        let parts = tokens(name);
        let [base, expiry, strike, kind] = parts.as_slice() else {
            return Err(CalibError::Parse(format!("not an option instrument: {name}")));
        };

        let expiry = NaiveDate::parse_from_str(expiry, "%d%b%y")
            .map_err(|e| CalibError::Parse(format!("{name}: expiry {expiry}: {e}")))?;
        let strike = strike
            .parse::<f64>()
            .map_err(|e| CalibError::Parse(format!("{name}: strike {strike}: {e}")))?;
        if !(strike > 0.0) {
            return Err(CalibError::Parse(format!("{name}: non-positive strike")));
        }
        let option_type = match *kind {
            "C" => OptionType::Call,
            "P" => OptionType::Put,
            other => return Err(CalibError::Parse(format!("{name}: option type {other}"))),
        };

        Ok(Self {
            base: (*base).to_string(),
            expiry,
            strike,
            option_type,
        })
    }

    pub fn expiration_timestamp_ms(&self) -> Option<i64> {
        self.expiry
            .and_hms_opt(EXPIRY_HOUR_UTC, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
    }
}

/// Instrument life over remaining life at the trade: 1 at listing, growing
/// toward expiry. `None` at or after expiry, or for a non-positive life.
pub fn inverse_time_to_expiry(trade_ms: i64, creation_ms: i64, expiration_ms: i64) -> Option<f64> {
    let life = expiration_ms - creation_ms;
    let remaining = expiration_ms - trade_ms;
    if life <= 0 || remaining <= 0 {
        return None;
    }
    Some(life as f64 / remaining as f64)
}

/// Nearest full hour; half past rounds up.
pub fn round_to_nearest_hour(dt: DateTime<Utc>) -> Option<DateTime<Utc>> {
    dt.duration_round(TimeDelta::hours(1)).ok()
}

/// Nearest midnight (UTC); noon rounds up.
pub fn round_to_nearest_day(dt: DateTime<Utc>) -> Option<DateTime<Utc>> {
    dt.duration_round(TimeDelta::days(1)).ok()
}

/// Timestamp (ms) of the feature row a trade is matched to: the nearest
/// hour for day options, the nearest day anchored at 08:00 UTC for week and
/// month options.
pub fn feature_timestamp_ms(period: SettlementPeriod, trade_ms: i64) -> Option<i64> {
    let dt = DateTime::<Utc>::from_timestamp_millis(trade_ms)?;
    let rounded = match period {
        SettlementPeriod::Day => round_to_nearest_hour(dt)?,
        SettlementPeriod::Week | SettlementPeriod::Month => {
            round_to_nearest_day(dt)? + TimeDelta::hours(i64::from(EXPIRY_HOUR_UTC))
        }
    };
    Some(rounded.timestamp_millis())
}
