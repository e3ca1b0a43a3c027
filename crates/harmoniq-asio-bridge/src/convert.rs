//! Float <-> 32-bit fixed-point sample conversion.
//! No allocations or locks; used on the callback thread.

use serde::{Deserialize, Serialize};

/// Full-scale value of a 32-bit fixed-point sample (2^31 - 1).
pub const FIXED_SCALE: f64 = 2_147_483_647.0;

/// What happens to float samples outside `[-1.0, 1.0)` on the way to fixed-point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Truncate through 64 bits and keep the low 32 bits. Out-of-range input
    /// wraps around, bit-compatible with drivers that cast without checks.
    #[default]
    Wrap,
    /// Saturate to `i32::MIN..=i32::MAX`.
    Clamp,
}

#[inline(always)]
pub fn float_to_fixed(sample: f32, policy: OverflowPolicy) -> i32 {
    let scaled = f64::from(sample) * FIXED_SCALE;
    match policy {
        OverflowPolicy::Wrap => scaled as i64 as i32,
        OverflowPolicy::Clamp => scaled as i32,
    }
}

#[inline(always)]
pub fn fixed_to_float(sample: i32) -> f32 {
    (f64::from(sample) / FIXED_SCALE) as f32
}

#[inline(always)]
pub fn convert_to_fixed(src: &[f32], dst: &mut [i32], policy: OverflowPolicy) {
    for (out, &sample) in dst.iter_mut().zip(src) {
        *out = float_to_fixed(sample, policy);
    }
}

#[inline(always)]
pub fn convert_to_float(src: &[i32], dst: &mut [f32]) {
    for (out, &sample) in dst.iter_mut().zip(src) {
        *out = fixed_to_float(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const STEP: f64 = 1.0 / FIXED_SCALE;

    #[test]
    fn half_scale_truncates() {
        assert_eq!(float_to_fixed(0.5, OverflowPolicy::Wrap), 1_073_741_823);
        assert_eq!(float_to_fixed(-0.5, OverflowPolicy::Wrap), -1_073_741_823);
        assert_eq!(float_to_fixed(0.0, OverflowPolicy::Wrap), 0);
    }

    #[test]
    fn half_scale_returns_within_float_rounding() {
        let exact = f64::from(1_073_741_823i32) / FIXED_SCALE;
        assert_eq!(exact, 0.499_999_999_767_169_36);
        let back = fixed_to_float(1_073_741_823);
        assert!((back - 0.5).abs() <= f32::EPSILON);
    }

    #[test]
    fn full_scale_stays_in_range() {
        assert_eq!(float_to_fixed(1.0, OverflowPolicy::Wrap), i32::MAX);
        assert_eq!(float_to_fixed(-1.0, OverflowPolicy::Wrap), -i32::MAX);
    }

    #[test]
    fn over_range_wraps_by_default() {
        let wrapped = float_to_fixed(1.5, OverflowPolicy::Wrap);
        assert!(wrapped < 0, "1.5 should wrap negative, got {wrapped}");
        assert_eq!(wrapped, (1.5f64 * FIXED_SCALE) as i64 as i32);
    }

    #[test]
    fn over_range_saturates_when_clamping() {
        assert_eq!(float_to_fixed(1.5, OverflowPolicy::Clamp), i32::MAX);
        assert_eq!(float_to_fixed(-3.0, OverflowPolicy::Clamp), i32::MIN);
    }

    #[test]
    fn nan_is_silent() {
        assert_eq!(float_to_fixed(f32::NAN, OverflowPolicy::Wrap), 0);
        assert_eq!(float_to_fixed(f32::NAN, OverflowPolicy::Clamp), 0);
    }

    #[test]
    fn slices_convert_pairwise() {
        let src = [0.0f32, 0.25, -0.25, 0.75];
        let mut fixed = [0i32; 4];
        convert_to_fixed(&src, &mut fixed, OverflowPolicy::Wrap);
        let mut back = [1.0f32; 4];
        convert_to_float(&fixed, &mut back);
        for (a, b) in src.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    proptest! {
        #[test]
        fn round_trip_within_one_step(x in -1.0f32..1.0f32) {
            let fixed = float_to_fixed(x, OverflowPolicy::Wrap);
            let back = f64::from(fixed) / FIXED_SCALE;
            prop_assert!((back - f64::from(x)).abs() <= STEP + f64::EPSILON);
        }

        #[test]
        fn policies_agree_in_range(x in -1.0f32..1.0f32) {
            prop_assert_eq!(
                float_to_fixed(x, OverflowPolicy::Wrap),
                float_to_fixed(x, OverflowPolicy::Clamp)
            );
        }
    }
}
