//! # Aggregation
//!
//! Point types shared with the timeseries backend and the reduction of a
//! windowed summary to the single value a client asked for.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// One raw sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawPoint {
    /// Nanoseconds since the Unix epoch.
    pub time: i64,
    pub value: f64,
}

/// Statistical summary of one window.
///
/// The backend keeps count and mean, never the sum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatPoint {
    /// Window start, nanoseconds since the Unix epoch.
    pub time: i64,
    pub min: f64,
    pub mean: f64,
    pub max: f64,
    pub count: u64,
}

/// Aggregation requested for a data frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggFunc {
    #[default]
    Raw,
    Mean,
    Min,
    Max,
    Count,
    Sum,
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => write!(f, "RAW"),
            Self::Mean => write!(f, "MEAN"),
            Self::Min => write!(f, "MIN"),
            Self::Max => write!(f, "MAX"),
            Self::Count => write!(f, "COUNT"),
            Self::Sum => write!(f, "SUM"),
        }
    }
}

/// Reduce a window summary to the requested aggregate.
///
/// Empty windows yield NaN for MEAN/MIN/MAX so they are never mistaken for a
/// zero reading. Kinds that are not window reductions fall back to the mean.
pub fn select_value(point: &StatPoint, agg: AggFunc) -> f64 {
    let populated = point.count > 0;
    match agg {
        AggFunc::Mean if populated => point.mean,
        AggFunc::Min if populated => point.min,
        AggFunc::Max if populated => point.max,
        AggFunc::Mean | AggFunc::Min | AggFunc::Max => f64::NAN,
        AggFunc::Count => point.count as f64,
        AggFunc::Sum => point.count as f64 * point.mean,
        AggFunc::Raw => point.mean,
    }
}

/// Backend precision hint for a window: `max(log2(window_ns) - 5, 30)`,
/// truncated to an integer.
pub fn suggested_accuracy(window: Duration) -> u8 {
    let depth = (window.as_nanos() as f64).log2();
    (depth - 5.0).max(30.0) as u8
}
