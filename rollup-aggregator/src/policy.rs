//! Aggregation policies and versioned policy sets.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::time::duration_nanos;

/// The unit in which aggregated values are stored.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum TimeUnit {
    /// Nanosecond precision.
    Nanosecond,
    /// Microsecond precision.
    Microsecond,
    /// Millisecond precision.
    Millisecond,
    /// Second precision.
    Second,
    /// Minute precision.
    Minute,
    /// Hour precision.
    Hour,
}

impl TimeUnit {
    const ALL: [TimeUnit; 6] = [
        TimeUnit::Hour,
        TimeUnit::Minute,
        TimeUnit::Second,
        TimeUnit::Millisecond,
        TimeUnit::Microsecond,
        TimeUnit::Nanosecond,
    ];

    /// Returns the length of one unit.
    pub const fn duration(self) -> Duration {
        match self {
            TimeUnit::Nanosecond => Duration::from_nanos(1),
            TimeUnit::Microsecond => Duration::from_micros(1),
            TimeUnit::Millisecond => Duration::from_millis(1),
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(60 * 60),
        }
    }

    /// Returns the suffix used when formatting durations in this unit.
    pub const fn suffix(self) -> &'static str {
        match self {
            TimeUnit::Nanosecond => "ns",
            TimeUnit::Microsecond => "us",
            TimeUnit::Millisecond => "ms",
            TimeUnit::Second => "s",
            TimeUnit::Minute => "m",
            TimeUnit::Hour => "h",
        }
    }

    /// Returns the largest unit that evenly divides the given duration.
    pub fn largest_dividing(duration: Duration) -> Self {
        let nanos = duration.as_nanos();
        Self::ALL
            .into_iter()
            .find(|unit| nanos != 0 && nanos % unit.duration().as_nanos() == 0)
            .unwrap_or(TimeUnit::Nanosecond)
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "1{}", self.suffix())
    }
}

/// The width of an aggregation window and the precision of the stored values.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Resolution {
    /// Width of each aggregation window.
    pub window: Duration,
    /// Storage precision of the aggregated values.
    pub precision: TimeUnit,
}

/// Describes how a metric is aggregated and for how long the results are retained.
///
/// Policies compare structurally over window, precision and retention.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Policy {
    /// The aggregation resolution.
    pub resolution: Resolution,
    /// How long the aggregated values are kept downstream.
    pub retention: Duration,
}

impl Policy {
    /// Creates a policy with an explicit storage precision.
    pub fn new(window: Duration, precision: TimeUnit, retention: Duration) -> Self {
        Self {
            resolution: Resolution { window, precision },
            retention,
        }
    }

    /// Creates a policy whose precision is the largest unit dividing the window.
    pub fn with_window(window: Duration, retention: Duration) -> Self {
        Self::new(window, TimeUnit::largest_dividing(window), retention)
    }

    /// Returns the aggregation window width.
    pub fn window(&self) -> Duration {
        self.resolution.window
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}",
            FormatDuration(self.resolution.window),
            self.resolution.precision,
            FormatDuration(self.retention)
        )
    }
}

/// An error returned when parsing a [`Policy`] from a string.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParsePolicyError {
    /// The string is not of the form `<window>[@<precision>]:<retention>`.
    #[error("policy must be of the form `<window>[@<precision>]:<retention>`")]
    InvalidFormat,
    /// A duration component could not be parsed.
    #[error("invalid duration `{0}`")]
    InvalidDuration(String),
    /// The precision is not a single unit, such as `1s`.
    #[error("invalid precision `{0}`")]
    InvalidPrecision(String),
}

impl FromStr for Policy {
    type Err = ParsePolicyError;

    /// Parses policies such as `10s:6h` or `1m@1s:2d`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (resolution, retention) = s.split_once(':').ok_or(ParsePolicyError::InvalidFormat)?;
        let retention = parse_duration(retention)?;

        match resolution.split_once('@') {
            Some((window, precision)) => {
                let window = parse_duration(window)?;
                let unit = TimeUnit::ALL
                    .into_iter()
                    .find(|unit| precision == unit.to_string())
                    .ok_or_else(|| ParsePolicyError::InvalidPrecision(precision.to_owned()))?;
                Ok(Self::new(window, unit, retention))
            }
            None => Ok(Self::with_window(parse_duration(resolution)?, retention)),
        }
    }
}

/// Parses durations such as `10s`, `1m`, `6h` or `2d`.
fn parse_duration(s: &str) -> Result<Duration, ParsePolicyError> {
    let invalid = || ParsePolicyError::InvalidDuration(s.to_owned());

    let split = s.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value.parse().map_err(|_| invalid())?;

    let secs = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(invalid)
    };

    match unit {
        "ns" => Ok(Duration::from_nanos(value)),
        "us" => Ok(Duration::from_micros(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => secs(60),
        "h" => secs(60 * 60),
        "d" => secs(24 * 60 * 60),
        _ => Err(invalid()),
    }
}

/// Formats a duration in the largest unit that divides it evenly.
pub(crate) struct FormatDuration(pub Duration);

impl fmt::Display for FormatDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_zero() {
            return f.write_str("0s");
        }

        let unit = TimeUnit::largest_dividing(self.0);
        let count = self.0.as_nanos() / unit.duration().as_nanos();
        write!(f, "{count}{}", unit.suffix())
    }
}

/// A policy set together with its version and the time it takes effect.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionedPolicies {
    /// Monotonic version of the policy set.
    pub version: u32,
    /// UNIX timestamp in nanoseconds from which the policy set applies.
    pub cutover_nanos: i64,
    /// The ordered policies.
    pub policies: Vec<Policy>,
}

impl VersionedPolicies {
    /// Creates a new versioned policy set.
    pub fn new(version: u32, cutover_nanos: i64, policies: Vec<Policy>) -> Self {
        Self {
            version,
            cutover_nanos,
            policies,
        }
    }

    /// Creates a versioned policy set that took effect a given duration before `now_nanos`.
    pub fn effective_since(
        version: u32,
        now_nanos: i64,
        ago: Duration,
        policies: Vec<Policy>,
    ) -> Self {
        Self::new(version, now_nanos - duration_nanos(ago), policies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_policy() {
        let policy: Policy = "10s:6h".parse().unwrap();
        assert_eq!(
            policy,
            Policy::new(
                Duration::from_secs(10),
                TimeUnit::Second,
                Duration::from_secs(6 * 3600)
            )
        );

        let policy: Policy = "10m@1s:30d".parse().unwrap();
        assert_eq!(policy.resolution.precision, TimeUnit::Second);
        assert_eq!(policy.retention, Duration::from_secs(720 * 3600));
    }

    #[test]
    fn test_parse_policy_errors() {
        assert_eq!(
            "10s".parse::<Policy>(),
            Err(ParsePolicyError::InvalidFormat)
        );
        assert_eq!(
            "10x:6h".parse::<Policy>(),
            Err(ParsePolicyError::InvalidDuration("10x".to_owned()))
        );
        assert_eq!(
            "10s@2s:6h".parse::<Policy>(),
            Err(ParsePolicyError::InvalidPrecision("2s".to_owned()))
        );
    }

    #[test]
    fn test_parse_policy_overflow() {
        assert_eq!(
            "10s:999999999999999999d".parse::<Policy>(),
            Err(ParsePolicyError::InvalidDuration(
                "999999999999999999d".to_owned()
            ))
        );
        assert_eq!(
            "999999999999999999h:1d".parse::<Policy>(),
            Err(ParsePolicyError::InvalidDuration(
                "999999999999999999h".to_owned()
            ))
        );
    }

    #[test]
    fn test_display_policy() {
        let policies: Vec<String> = ["10s:6h", "1m:2d", "10m:30d", "500ms:1h"]
            .iter()
            .map(|s| s.parse::<Policy>().unwrap().to_string())
            .collect();

        insta::assert_debug_snapshot!(policies, @r###"
        [
            "10s@1s:6h",
            "1m@1m:48h",
            "10m@1m:720h",
            "500ms@1ms:1h",
        ]
        "###);
    }

    #[test]
    fn test_policy_equality_is_structural() {
        let a = Policy::with_window(Duration::from_secs(60), Duration::from_secs(3600));
        let b = Policy::new(
            Duration::from_secs(60),
            TimeUnit::Second,
            Duration::from_secs(3600),
        );
        assert_ne!(a, b);
        assert_eq!(a, "1m:1h".parse().unwrap());
    }
}
