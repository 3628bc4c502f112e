//! Normalization helpers for composite inputs
//!
//! Every sub-score entering the composite lives in [0, 100]. Out-of-range
//! inputs are capped, never rejected; NaN counts as 0.

/// Cap a score into [0, 100]
pub fn cap_score(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

/// Scale a ratio-like input (volume / mcap, ...) into a capped score
pub fn cap_ratio_score(ratio: f64, scale: f64) -> f64 {
    cap_score(ratio * scale)
}

/// Scale a [0, 1] fraction to [0, 100]
pub fn fraction_to_score(fraction: f64) -> f64 {
    cap_score(fraction * 100.0)
}

/// Round to one decimal place
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_score() {
        assert_eq!(cap_score(-5.0), 0.0);
        assert_eq!(cap_score(42.5), 42.5);
        assert_eq!(cap_score(250.0), 100.0);
        assert_eq!(cap_score(f64::NAN), 0.0);
        assert_eq!(cap_score(f64::INFINITY), 100.0);
    }

    #[test]
    fn test_ratio_capped_not_rejected() {
        // volume 3x mcap at scale 80 would be 240
        assert_eq!(cap_ratio_score(3.0, 80.0), 100.0);
        assert_eq!(cap_ratio_score(0.25, 80.0), 20.0);
    }

    #[test]
    fn test_round1() {
        assert_eq!(round1(63.449), 63.4);
        assert_eq!(round1(63.45000001), 63.5);
        assert_eq!(fraction_to_score(0.375), 37.5);
    }
}
