//! Capacity Calculator
//!
//! Pure mapping from (license count, CPU count, worker-per-CPU ratio) to the
//! target worker count. No side effects; everything else in the controller
//! derives its sizing decisions from this one function.

use crate::license::LicenseCount;

/// Compute the desired number of workers.
///
/// `min(license_count, ceil(cpu_count * worker_per_cpu))`, clamped to 0.
/// An unlimited license caps only on CPU capacity. A ratio of 0 (or a
/// license count of 0) yields 0 workers: the system degrades to accepting
/// no work rather than erroring.
pub fn compute_target(license_count: LicenseCount, cpu_count: usize, worker_per_cpu: f64) -> usize {
    if !worker_per_cpu.is_finite() || worker_per_cpu <= 0.0 {
        return 0;
    }

    let by_cpu = (cpu_count as f64 * worker_per_cpu).ceil() as usize;

    match license_count {
        LicenseCount::Unlimited => by_cpu,
        LicenseCount::Limited(n) => by_cpu.min(usize::try_from(n).unwrap_or(usize::MAX)),
    }
}

/// Detect the host CPU count, falling back to 1 if detection fails.
pub fn detect_cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
