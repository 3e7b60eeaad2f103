//! UTC timestamp with a fixed millisecond text format

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Timestamp rendered as `2006-01-02T15:04:05.000Z`.
///
/// The text form sorts lexicographically in time order, so it is safe to
/// embed into store keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcTime(DateTime<Utc>);

impl UtcTime {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(at)
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for UtcTime {
    fn from(at: DateTime<Utc>) -> Self {
        Self(at)
    }
}

impl Display for UtcTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl FromStr for UtcTime {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc)))
    }
}

impl Serialize for UtcTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UtcTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        let at: UtcTime = "2010-01-01T01:02:03.456789Z".parse().unwrap();
        assert_eq!(at.to_string(), "2010-01-01T01:02:03.456Z");

        let whole: UtcTime = "2010-01-01T01:02:03Z".parse().unwrap();
        assert_eq!(whole.to_string(), "2010-01-01T01:02:03.000Z");
    }

    #[test]
    fn test_json() {
        let at: UtcTime = "2010-01-01T01:02:03.000Z".parse().unwrap();
        let json = serde_json::to_string(&at).unwrap();
        assert_eq!(json, "\"2010-01-01T01:02:03.000Z\"");
        let back: UtcTime = serde_json::from_str(&json).unwrap();
        assert_eq!(back, at);
        assert!(serde_json::from_str::<UtcTime>("\"yesterday\"").is_err());
    }
}
