//! Cycle counter and its calibration
//!
//! On x86_64 the counter is the TSC, read with fences so that the measured
//! region cannot leak past either end: `lfence; rdtsc; lfence` to start and
//! `rdtscp; lfence` to stop. On aarch64 it is the virtual counter
//! `cntvct_el0` behind an `isb`. Other targets fall back to a nanosecond
//! clock, which calibrates to roughly 1000 cycles per microsecond.

use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A monotonic counter read around a measured region.
pub trait CycleTimer {
    /// Read the counter before the measured region.
    fn start(&self) -> u64;
    /// Read the counter after the measured region.
    fn stop(&self) -> u64;
}

/// The hardware counter of the running CPU
#[derive(Clone, Copy, Debug, Default)]
pub struct HardwareTimer;

#[cfg(target_arch = "x86_64")]
impl CycleTimer for HardwareTimer {
    #[inline(always)]
    fn start(&self) -> u64 {
        use core::arch::x86_64::{_mm_lfence, _rdtsc};
        unsafe {
            _mm_lfence();
            let cycles = _rdtsc();
            _mm_lfence();
            cycles
        }
    }

    #[inline(always)]
    fn stop(&self) -> u64 {
        use core::arch::x86_64::{__rdtscp, _mm_lfence};
        let mut aux = 0u32;
        unsafe {
            let cycles = __rdtscp(&mut aux);
            _mm_lfence();
            cycles
        }
    }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn read_cntvct() -> u64 {
    let val: u64;
    unsafe {
        core::arch::asm!("isb", "mrs {}, cntvct_el0", out(reg) val, options(nostack));
    }
    val
}

#[cfg(target_arch = "aarch64")]
impl CycleTimer for HardwareTimer {
    #[inline(always)]
    fn start(&self) -> u64 {
        read_cntvct()
    }

    #[inline(always)]
    fn stop(&self) -> u64 {
        read_cntvct()
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn monotonic_ns() -> u64 {
    use std::sync::OnceLock;
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    ORIGIN.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
impl CycleTimer for HardwareTimer {
    fn start(&self) -> u64 {
        monotonic_ns()
    }

    fn stop(&self) -> u64 {
        monotonic_ns()
    }
}

/// Counter frequency in cycles per microsecond
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Calibration {
    cycles_per_usec: f64,
}

impl Calibration {
    /// Measurement window used by [`Calibration::measure`] callers by default.
    pub const DEFAULT_WINDOW: Duration = Duration::from_millis(100);

    /// Use a known frequency. Non-finite or non-positive values are rejected.
    pub fn fixed(cycles_per_usec: f64) -> Option<Self> {
        (cycles_per_usec.is_finite() && cycles_per_usec > 0.0).then_some(Self { cycles_per_usec })
    }

    /// Count cycles against the monotonic clock over `window`.
    pub fn measure<T: CycleTimer>(timer: &T, window: Duration) -> Self {
        let begin = Instant::now();
        let start = timer.start();
        while begin.elapsed() < window {
            std::hint::spin_loop();
        }
        let cycles = timer.stop().saturating_sub(start);
        let usecs = begin.elapsed().as_secs_f64() * 1e6;

        let cycles_per_usec = if usecs > 0.0 && cycles > 0 {
            cycles as f64 / usecs
        } else {
            warn!("Cycle counter did not advance during calibration; assuming 1 cycle/ns");
            1000.0
        };
        debug!(
            "Calibrated {:.3} cycles/usec over {:?} ({} cycles)",
            cycles_per_usec, window, cycles
        );

        if let Some(mhz) = cpuinfo_mhz() {
            let drift = (mhz - cycles_per_usec).abs() / mhz;
            if drift > 0.01 {
                debug!(
                    "Measured {:.3} MHz differs from /proc/cpuinfo {:.3} MHz by {:.1}%",
                    cycles_per_usec,
                    mhz,
                    drift * 100.0
                );
            }
        }
        Self { cycles_per_usec }
    }

    pub fn cycles_per_usec(&self) -> f64 {
        self.cycles_per_usec
    }

    /// Convert a cycle count to nanoseconds.
    pub fn cycles_to_ns(&self, cycles: u64) -> f64 {
        cycles as f64 * 1000.0 / self.cycles_per_usec
    }
}

/// Clock frequency reported by the kernel for the first CPU, in MHz.
pub fn cpuinfo_mhz() -> Option<f64> {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    parse_cpu_mhz(&cpuinfo)
}

fn parse_cpu_mhz(cpuinfo: &str) -> Option<f64> {
    cpuinfo
        .lines()
        .filter(|line| line.starts_with("cpu MHz"))
        .find_map(|line| line.split(':').nth(1)?.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_is_monotonic() {
        let timer = HardwareTimer;
        let start = timer.start();
        let mut sum = 0u64;
        for i in 0..10_000u64 {
            sum = std::hint::black_box(sum.wrapping_add(i));
        }
        let stop = timer.stop();
        assert!(stop >= start);
        assert!(sum > 0);
    }

    #[test]
    fn test_measure_is_positive() {
        let calibration = Calibration::measure(&HardwareTimer, Duration::from_millis(10));
        assert!(calibration.cycles_per_usec() > 0.0);
    }

    #[test]
    fn test_conversion() {
        let calibration = Calibration::fixed(2000.0).unwrap();
        assert_eq!(calibration.cycles_to_ns(0), 0.0);
        assert_eq!(calibration.cycles_to_ns(2000), 1000.0);
        assert!(calibration.cycles_to_ns(3000) > calibration.cycles_to_ns(2999));
        assert!(Calibration::fixed(0.0).is_none());
        assert!(Calibration::fixed(f64::NAN).is_none());
    }

    struct FrozenTimer;

    impl CycleTimer for FrozenTimer {
        fn start(&self) -> u64 {
            42
        }
        fn stop(&self) -> u64 {
            42
        }
    }

    #[test]
    fn test_frozen_counter_falls_back() {
        let calibration = Calibration::measure(&FrozenTimer, Duration::from_millis(1));
        assert_eq!(calibration.cycles_per_usec(), 1000.0);
    }

    #[test]
    fn test_parse_cpu_mhz() {
        let cpuinfo = "processor\t: 0\nmodel name\t: Test CPU\ncpu MHz\t\t: 2399.998\n";
        assert_eq!(parse_cpu_mhz(cpuinfo), Some(2399.998));
        assert_eq!(parse_cpu_mhz("processor\t: 0\n"), None);
    }
}
