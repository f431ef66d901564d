//! Distance metric implementations for HNSW construction and search.
//!
//! Supports three distance functions: squared Euclidean (L2), angular, and dot
//! product. Every metric returns a value where **lower is closer**, so a single
//! ordering drives all heaps and neighbor selection.
//!
//! Angular vectors are normalized once on the way in (both stored vectors and
//! queries), which turns the angular distance into `1 - dot`.

use crate::error::{IndexError, Result};
use crate::hnsw::simd;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// Distance metric used for vector similarity computation.
///
/// Selected once at index creation; an index never mixes metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Squared Euclidean distance (L2²). Range: \[0, ∞).
    L2,
    /// Angular distance `1 - cos(a, b)` over normalized vectors. Range: \[0, 2\].
    Angular,
    /// Negative inner product: `-dot(a, b)`. Lower = higher similarity.
    Dot,
}

impl DistanceMetric {
    /// Compute the distance between two prepared vectors.
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::L2 => simd::euclidean_sq_f32(a, b),
            DistanceMetric::Angular => {
                let dot = simd::dot_product_f32(a, b);
                (1.0 - dot.clamp(-1.0, 1.0)).max(0.0)
            }
            DistanceMetric::Dot => -simd::dot_product_f32(a, b),
        }
    }

    /// Bring a raw vector into the form the metric stores and compares.
    ///
    /// Angular vectors are L2-normalized and a zero vector is rejected with
    /// [`IndexError::ZeroNormVector`]. Other metrics borrow the input unchanged.
    pub fn prepare<'a>(&self, vector: &'a [f32]) -> Result<Cow<'a, [f32]>> {
        match self {
            DistanceMetric::Angular => {
                let norm_sq: f32 = vector.iter().map(|&x| x * x).sum();
                if norm_sq == 0.0 {
                    return Err(IndexError::ZeroNormVector);
                }
                let inv = 1.0 / norm_sq.sqrt();
                Ok(Cow::Owned(vector.iter().map(|&x| x * inv).collect()))
            }
            DistanceMetric::L2 | DistanceMetric::Dot => Ok(Cow::Borrowed(vector)),
        }
    }

    /// Tag written to the model header.
    pub fn to_tag(self) -> u32 {
        match self {
            DistanceMetric::L2 => 0,
            DistanceMetric::Angular => 1,
            DistanceMetric::Dot => 2,
        }
    }

    /// Inverse of [`to_tag`](Self::to_tag). Unknown tags yield `None`.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(DistanceMetric::L2),
            1 => Some(DistanceMetric::Angular),
            2 => Some(DistanceMetric::Dot),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::L2 => "l2",
            DistanceMetric::Angular => "angular",
            DistanceMetric::Dot => "dot",
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "l2" | "euclidean" => Ok(DistanceMetric::L2),
            "angular" | "cosine" => Ok(DistanceMetric::Angular),
            "dot" | "dot_product" => Ok(DistanceMetric::Dot),
            other => Err(IndexError::InvalidConfig(format!(
                "unknown distance metric '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_is_squared() {
        let d = DistanceMetric::L2.distance(&[0.0, 0.0, 0.0], &[3.0, 4.0, 0.0]);
        assert!((d - 25.0).abs() < 1e-6, "squared euclidean should be 25, got {d}");
    }

    #[test]
    fn test_dot_is_negated() {
        let d = DistanceMetric::Dot.distance(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]);
        assert!((d + 32.0).abs() < 1e-6, "negative dot product should be -32, got {d}");
    }

    #[test]
    fn test_angular_orthogonal_and_identical() {
        let m = DistanceMetric::Angular;
        let a = m.prepare(&[2.0, 0.0, 0.0]).unwrap();
        let b = m.prepare(&[0.0, 5.0, 0.0]).unwrap();
        assert!((m.distance(&a, &b) - 1.0).abs() < 1e-6);
        assert!(m.distance(&a, &a) < 1e-6);
    }

    #[test]
    fn test_angular_opposite_is_two() {
        let m = DistanceMetric::Angular;
        let a = m.prepare(&[1.0, 1.0]).unwrap();
        let b = m.prepare(&[-1.0, -1.0]).unwrap();
        assert!((m.distance(&a, &b) - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_angular_rejects_zero_vector() {
        let err = DistanceMetric::Angular.prepare(&[0.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(err, IndexError::ZeroNormVector));
    }

    #[test]
    fn test_prepare_borrows_for_l2_and_dot() {
        let v = [1.0, 2.0];
        assert!(matches!(DistanceMetric::L2.prepare(&v).unwrap(), Cow::Borrowed(_)));
        assert!(matches!(DistanceMetric::Dot.prepare(&v).unwrap(), Cow::Borrowed(_)));
    }

    #[test]
    fn test_parse_aliases_and_tags() {
        assert_eq!("euclidean".parse::<DistanceMetric>().unwrap(), DistanceMetric::L2);
        assert_eq!("Angular".parse::<DistanceMetric>().unwrap(), DistanceMetric::Angular);
        assert_eq!("cosine".parse::<DistanceMetric>().unwrap(), DistanceMetric::Angular);
        assert!("manhattan".parse::<DistanceMetric>().is_err());
        for m in [DistanceMetric::L2, DistanceMetric::Angular, DistanceMetric::Dot] {
            assert_eq!(DistanceMetric::from_tag(m.to_tag()), Some(m));
        }
        assert_eq!(DistanceMetric::from_tag(7), None);
    }
}
