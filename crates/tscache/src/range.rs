//! Closed-interval algebra over revision numbers.
//!
//! Ranges are closed numeric intervals over IEEE-754 doubles including ±∞.
//! The planner uses `+∞` as the open-top sentinel for unbounded requests.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A closed interval `[min, max]`, or the distinguished empty range.
///
/// The empty range is canonically `[+∞, -∞]` so that `add_value` extends it
/// without a special case. Boundaries of an empty range are undefined.
#[derive(Clone, Copy, Debug)]
pub struct Range {
    min: f64,
    max: f64,
}

impl Range {
    /// The range with no values.
    pub const fn empty() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    /// Lower bound; undefined when empty.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Upper bound; undefined when empty.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Extend the interval to include `value`; the empty range becomes
    /// `[value, value]`.
    pub fn add_value(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// `max - min` for non-empty ranges, 0 otherwise.
    pub fn duration(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.max - self.min
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        !self.is_empty() && value >= self.min && value <= self.max
    }

    /// `[max(mins), min(maxes)]`; empty when either operand is empty or the
    /// bounds cross.
    pub fn intersection(&self, other: &Range) -> Range {
        let candidate = Range::new(self.min.max(other.min), self.max.min(other.max));
        if candidate.is_empty() {
            Range::empty()
        } else {
            candidate
        }
    }

    /// `self \ other` as 0, 1, or 2 closed ranges.
    ///
    /// An `other` strictly inside `self` yields two ranges that each touch
    /// `other`'s boundary, even when `other` is a single point.
    pub fn difference(&self, other: &Range) -> Vec<Range> {
        if self.is_empty() {
            return Vec::new();
        }
        if self.intersection(other).is_empty() {
            return vec![*self];
        }
        let mut out = Vec::with_capacity(2);
        if other.min > self.min {
            out.push(Range::new(self.min, other.min));
        }
        if other.max < self.max {
            out.push(Range::new(other.max, self.max));
        }
        out
    }

    /// The sorted, coalesced union of `sorted ∪ {self}`.
    ///
    /// `sorted` must be disjoint and ascending by min. Adjacent or
    /// overlapping ranges merge, so the output never contains two ranges
    /// that touch. Merging a range already present is a no-op.
    pub fn merge_into(&self, sorted: &[Range]) -> Vec<Range> {
        let mut out = Vec::with_capacity(sorted.len() + 1);
        let mut pending = if self.is_empty() { None } else { Some(*self) };
        for range in sorted {
            if range.is_empty() {
                continue;
            }
            match pending {
                Some(p) if range.min > p.max => {
                    out.push(p);
                    out.push(*range);
                    pending = None;
                }
                Some(p) if range.max < p.min => out.push(*range),
                Some(p) => {
                    pending = Some(Range::new(p.min.min(range.min), p.max.max(range.max)));
                }
                None => out.push(*range),
            }
        }
        if let Some(p) = pending {
            out.push(p);
        }
        out
    }
}

impl PartialEq for Range {
    fn eq(&self, other: &Self) -> bool {
        (self.is_empty() && other.is_empty()) || (self.min == other.min && self.max == other.max)
    }
}

/// JSON has no Infinity literal: unbounded ends persist as explicit nulls,
/// while the empty range omits both keys and round-trips as `{}`.
#[derive(Default, Serialize, Deserialize)]
struct RangeRepr {
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    min: Option<Option<f64>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    max: Option<Option<f64>>,
}

/// Distinguish an explicit null (unbounded end) from a missing key (empty
/// range); serde's default `Option` handling collapses the two.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Option<f64>>, D::Error> {
    Option::<f64>::deserialize(deserializer).map(Some)
}

fn bound_repr(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

impl Serialize for Range {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = if self.is_empty() {
            RangeRepr::default()
        } else {
            RangeRepr {
                min: Some(bound_repr(self.min)),
                max: Some(bound_repr(self.max)),
            }
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Range {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = RangeRepr::deserialize(deserializer)?;
        match (repr.min, repr.max) {
            (None, None) => Ok(Range::empty()),
            (Some(min), Some(max)) => Ok(Range::new(
                min.unwrap_or(f64::NEG_INFINITY),
                max.unwrap_or(f64::INFINITY),
            )),
            _ => Err(D::Error::custom("range requires both min and max, or neither")),
        }
    }
}
