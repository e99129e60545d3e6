use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Bar period of a market data subscription.
///
/// Serialises as its canonical short form (eg/ `"1m"`, `"1h"`), matching the deploy spec
/// wire format.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Granularity {
    Second1,
    Minute1,
    Minute5,
    Minute15,
    Minute30,
    Hour1,
    Hour4,
    Day1,
}

impl Granularity {
    /// Wall-clock length of one bar period.
    pub fn duration(&self) -> Duration {
        match self {
            Granularity::Second1 => Duration::seconds(1),
            Granularity::Minute1 => Duration::minutes(1),
            Granularity::Minute5 => Duration::minutes(5),
            Granularity::Minute15 => Duration::minutes(15),
            Granularity::Minute30 => Duration::minutes(30),
            Granularity::Hour1 => Duration::hours(1),
            Granularity::Hour4 => Duration::hours(4),
            Granularity::Day1 => Duration::days(1),
        }
    }

    /// First bar boundary strictly after `time`, aligned to epoch multiples of the period.
    pub fn next_boundary(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let period = self.duration().num_seconds();
        let elapsed = time.timestamp();
        let next = (elapsed.div_euclid(period) + 1) * period;
        Utc.timestamp_opt(next, 0)
            .single()
            .expect("bar boundary timestamps are valid")
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Second1 => "1s",
            Granularity::Minute1 => "1m",
            Granularity::Minute5 => "5m",
            Granularity::Minute15 => "15m",
            Granularity::Minute30 => "30m",
            Granularity::Hour1 => "1h",
            Granularity::Hour4 => "4h",
            Granularity::Day1 => "1d",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("unsupported granularity: {0}")]
pub struct ParseGranularityError(pub String);

impl FromStr for Granularity {
    type Err = ParseGranularityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1s" => Ok(Granularity::Second1),
            "1m" => Ok(Granularity::Minute1),
            "5m" => Ok(Granularity::Minute5),
            "15m" => Ok(Granularity::Minute15),
            "30m" => Ok(Granularity::Minute30),
            "1h" => Ok(Granularity::Hour1),
            "4h" => Ok(Granularity::Hour4),
            "1d" => Ok(Granularity::Day1),
            other => Err(ParseGranularityError(other.to_owned())),
        }
    }
}

impl Serialize for Granularity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Granularity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parse_round_trips_display() {
        for raw in ["1s", "1m", "5m", "15m", "30m", "1h", "4h", "1d"] {
            let granularity: Granularity = raw.parse().unwrap();
            assert_eq!(granularity.to_string(), raw);
        }
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!("2m".parse::<Granularity>().is_err());
        assert!("".parse::<Granularity>().is_err());
    }

    #[test]
    fn next_boundary_aligns_to_period() {
        let time = Utc.with_ymd_and_hms(2024, 1, 1, 10, 3, 27).unwrap();

        assert_eq!(
            Granularity::Minute1.next_boundary(time),
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 4, 0).unwrap()
        );
        assert_eq!(
            Granularity::Minute5.next_boundary(time),
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 5, 0).unwrap()
        );
        assert_eq!(
            Granularity::Hour1.next_boundary(time),
            Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap()
        );
    }

    #[test]
    fn next_boundary_of_exact_boundary_is_next_period() {
        let boundary = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert_eq!(
            Granularity::Minute1.next_boundary(boundary),
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 1, 0).unwrap()
        );
    }

    #[test]
    fn serde_uses_short_form() {
        let json = serde_json::to_string(&Granularity::Minute5).unwrap();
        assert_eq!(json, "\"5m\"");
        let back: Granularity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Granularity::Minute5);
    }
}
