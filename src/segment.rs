//! Execution segments: deterministic fractional shares of a test.
//!
//! A run configured with segment `[from, to)` executes `⌊n·to⌋ − ⌊n·from⌋` of
//! any integer quantity `n` (VUs, iterations). The formula telescopes, so the
//! parts of a partition always add up to exactly `n`.

use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// A reduced rational number in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fraction {
    num: u64,
    den: u64,
}

impl Fraction {
    pub const ZERO: Fraction = Fraction { num: 0, den: 1 };
    pub const ONE: Fraction = Fraction { num: 1, den: 1 };

    pub fn new(num: u64, den: u64) -> Result<Self, ConfigError> {
        if den == 0 {
            return Err(ConfigError::InvalidSegment(format!("{num}/{den} has a zero denominator")));
        }
        if num > den {
            return Err(ConfigError::InvalidSegment(format!("{num}/{den} is greater than 1")));
        }
        let g = gcd(num, den).max(1);
        Ok(Self {
            num: num / g,
            den: den / g,
        })
    }

    /// `⌊n · self⌋`
    pub fn floor_mul(self, n: u64) -> u64 {
        (n as u128 * self.num as u128 / self.den as u128) as u64
    }

    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl Ord for Fraction {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.num as u128 * other.den as u128).cmp(&(other.num as u128 * self.den as u128))
    }
}

impl PartialOrd for Fraction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

fn parse_decimal(s: &str) -> Option<(u64, u64)> {
    let (int, frac) = s.split_once('.').unwrap_or((s, ""));
    if int.is_empty() && frac.is_empty() {
        return None;
    }
    if !int.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) || frac.len() > 18 {
        return None;
    }
    let den = 10u64.pow(frac.len() as u32);
    let int: u64 = if int.is_empty() { 0 } else { int.parse().ok()? };
    let frac: u64 = if frac.is_empty() { 0 } else { frac.parse().ok()? };
    Some((int.checked_mul(den)?.checked_add(frac)?, den))
}

impl FromStr for Fraction {
    type Err = ConfigError;

    /// Accepts `1/3`, `0.25` and `25%`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ConfigError::InvalidSegment(format!("`{s}` is not a valid fraction"));
        if let Some((num, den)) = s.split_once('/') {
            let num = num.trim().parse().map_err(|_| invalid())?;
            let den = den.trim().parse().map_err(|_| invalid())?;
            return Self::new(num, den);
        }
        if let Some(pct) = s.strip_suffix('%') {
            let (num, den) = parse_decimal(pct.trim()).ok_or_else(invalid)?;
            let den = den.checked_mul(100).ok_or_else(invalid)?;
            return Self::new(num, den);
        }
        let (num, den) = parse_decimal(s).ok_or_else(invalid)?;
        Self::new(num, den)
    }
}

/// Half-open interval `[from, to)` of the whole workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionSegment {
    from: Fraction,
    to: Fraction,
}

impl Default for ExecutionSegment {
    fn default() -> Self {
        Self::full()
    }
}

impl ExecutionSegment {
    pub fn new(from: Fraction, to: Fraction) -> Result<Self, ConfigError> {
        if from >= to {
            return Err(ConfigError::InvalidSegment(format!(
                "segment start {from} must be lower than its end {to}"
            )));
        }
        Ok(Self { from, to })
    }

    pub fn full() -> Self {
        Self {
            from: Fraction::ZERO,
            to: Fraction::ONE,
        }
    }

    pub fn from(&self) -> Fraction {
        self.from
    }

    pub fn to(&self) -> Fraction {
        self.to
    }

    pub fn is_full(&self) -> bool {
        self.from == Fraction::ZERO && self.to == Fraction::ONE
    }

    pub fn length(&self) -> f64 {
        self.to.as_f64() - self.from.as_f64()
    }

    /// This segment's share of an integer quantity.
    pub fn scale(&self, n: u64) -> u64 {
        self.to.floor_mul(n) - self.from.floor_mul(n)
    }

    /// This segment's share of a continuous rate.
    pub fn scale_rate(&self, rate: f64) -> f64 {
        rate * self.length()
    }
}

impl FromStr for ExecutionSegment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((from, to)) => Self::new(from.parse()?, to.parse()?),
            None => Self::new(Fraction::ZERO, s.parse()?),
        }
    }
}

impl fmt::Display for ExecutionSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.from, self.to)
    }
}

impl Serialize for ExecutionSegment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExecutionSegment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The partition of `[0, 1)` shared by every cooperating instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSegmentSequence {
    points: Vec<Fraction>,
}

impl ExecutionSegmentSequence {
    pub fn new(points: Vec<Fraction>) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidSegment(format!("sequence {reason}"));
        match (points.first(), points.last()) {
            (Some(first), Some(last)) if points.len() >= 2 => {
                if *first != Fraction::ZERO {
                    return Err(invalid("must start at 0"));
                }
                if *last != Fraction::ONE {
                    return Err(invalid("must end at 1"));
                }
            }
            _ => return Err(invalid("needs at least two points")),
        }
        if points.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("must be strictly increasing"));
        }
        Ok(Self { points })
    }

    pub fn segments(&self) -> Vec<ExecutionSegment> {
        self.points
            .windows(2)
            .map(|w| ExecutionSegment {
                from: w[0],
                to: w[1],
            })
            .collect()
    }

    pub fn contains(&self, segment: &ExecutionSegment) -> bool {
        self.segments().iter().any(|s| s == segment)
    }
}

impl FromStr for ExecutionSegmentSequence {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let points = s
            .split(',')
            .map(str::parse)
            .collect::<Result<Vec<Fraction>, _>>()?;
        Self::new(points)
    }
}

impl fmt::Display for ExecutionSegmentSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let points: Vec<String> = self.points.iter().map(ToString::to_string).collect();
        f.write_str(&points.join(","))
    }
}

impl Serialize for ExecutionSegmentSequence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExecutionSegmentSequence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
