//! AMD64 CPU feature detection.
//!
//! Detection runs once per process and is cached in a `OnceLock`. The
//! `no-simd` cargo feature pins the result to the x86-64 baseline so the
//! word-compare paths can be exercised on any machine.

use std::sync::OnceLock;

bitflags::bitflags! {
    /// Instruction set extensions code generation may use.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CpuFeatures: u16 {
        /// Baseline for every x86-64 CPU.
        const SSE2 = 1 << 0;
        /// `ptest`.
        const SSE4_1 = 1 << 1;
        const POPCNT = 1 << 2;
        /// VEX encoding, 128/256-bit `vptest`.
        const AVX = 1 << 3;
        /// 256-bit integer ops (`vpxor ymm`).
        const AVX2 = 1 << 4;
        const BMI2 = 1 << 5;
    }
}

impl CpuFeatures {
    /// What every x86-64 CPU has.
    pub const BASELINE: CpuFeatures = CpuFeatures::SSE2;

    /// Detect the running CPU.
    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Self {
        let mut features = CpuFeatures::BASELINE;
        if is_x86_feature_detected!("sse4.1") {
            features |= CpuFeatures::SSE4_1;
        }
        if is_x86_feature_detected!("popcnt") {
            features |= CpuFeatures::POPCNT;
        }
        if is_x86_feature_detected!("avx") {
            features |= CpuFeatures::AVX;
        }
        if is_x86_feature_detected!("avx2") {
            features |= CpuFeatures::AVX2;
        }
        if is_x86_feature_detected!("bmi2") {
            features |= CpuFeatures::BMI2;
        }
        features
    }

    /// Cross-compiling from another architecture: assume the baseline.
    #[cfg(not(target_arch = "x86_64"))]
    pub fn detect() -> Self {
        CpuFeatures::BASELINE
    }
}

static CPU_FEATURES: OnceLock<CpuFeatures> = OnceLock::new();

/// Cached features of the host CPU.
#[inline]
pub fn cpu_features() -> CpuFeatures {
    *CPU_FEATURES.get_or_init(|| {
        let features = if cfg!(feature = "no-simd") {
            CpuFeatures::BASELINE
        } else {
            CpuFeatures::detect()
        };
        log::debug!("amd64 cpu features: {features:?}");
        features
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_is_cached() {
        assert_eq!(cpu_features(), cpu_features());
        assert!(cpu_features().contains(CpuFeatures::SSE2));
    }

    #[test]
    fn test_avx2_implies_avx_on_real_hardware() {
        let f = CpuFeatures::detect();
        if f.contains(CpuFeatures::AVX2) {
            assert!(f.contains(CpuFeatures::AVX));
        }
    }
}
