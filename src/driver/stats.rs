//! 周期统计
//!
//! 在实时周期内收集统计信息，所有操作都是 lock-free 的

use std::sync::atomic::{AtomicU64, Ordering};

use super::cycle::CycleRecord;

/// 周期统计收集器
#[derive(Debug)]
pub struct CycleStats {
    cycle_count: AtomicU64,
    null_cycle_count: AtomicU64,
    failed_count: AtomicU64,
    xrun_count: AtomicU64,

    // 周期耗时（微秒）
    min_duration_us: AtomicU64,
    max_duration_us: AtomicU64,
    total_duration_us: AtomicU64,

    max_delayed_us: AtomicU64,
    last_begin_us: AtomicU64,
}

impl CycleStats {
    pub fn new() -> Self {
        Self {
            cycle_count: AtomicU64::new(0),
            null_cycle_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            xrun_count: AtomicU64::new(0),
            min_duration_us: AtomicU64::new(u64::MAX),
            max_duration_us: AtomicU64::new(0),
            total_duration_us: AtomicU64::new(0),
            max_delayed_us: AtomicU64::new(0),
            last_begin_us: AtomicU64::new(0),
        }
    }

    /// 在周期结束时调用
    #[inline]
    pub fn on_cycle(&self, record: &CycleRecord) {
        self.cycle_count.fetch_add(1, Ordering::Relaxed);
        if record.null {
            self.null_cycle_count.fetch_add(1, Ordering::Relaxed);
        }
        if record.failed {
            self.failed_count.fetch_add(1, Ordering::Relaxed);
        }

        let duration = record.duration_us();
        self.min_duration_us.fetch_min(duration, Ordering::Relaxed);
        self.max_duration_us.fetch_max(duration, Ordering::Relaxed);
        self.total_duration_us
            .fetch_add(duration, Ordering::Relaxed);
        self.max_delayed_us
            .fetch_max(record.delayed_us as u64, Ordering::Relaxed);
        self.last_begin_us
            .store(record.begin_us, Ordering::Relaxed);
    }

    /// 记录 XRun
    #[inline]
    pub fn record_xrun(&self) {
        self.xrun_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn cycle_count(&self) -> u64 {
        self.cycle_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn xrun_count(&self) -> u64 {
        self.xrun_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn failed_count(&self) -> u64 {
        self.failed_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn null_cycle_count(&self) -> u64 {
        self.null_cycle_count.load(Ordering::Relaxed)
    }

    /// 最近一个周期的开始时间（监控线程用来判断驱动是否还活着）
    #[inline]
    pub fn last_begin_us(&self) -> u64 {
        self.last_begin_us.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self, period_us: u64) -> StatsReport {
        let cycles = self.cycle_count();
        let (min, avg) = if cycles == 0 {
            (0, 0)
        } else {
            (
                self.min_duration_us.load(Ordering::Relaxed),
                self.total_duration_us.load(Ordering::Relaxed) / cycles,
            )
        };

        StatsReport {
            period_us,
            cycle_count: cycles,
            null_cycle_count: self.null_cycle_count(),
            failed_count: self.failed_count(),
            xrun_count: self.xrun_count(),
            min_duration_us: min,
            max_duration_us: self.max_duration_us.load(Ordering::Relaxed),
            avg_duration_us: avg,
            max_delayed_us: self.max_delayed_us.load(Ordering::Relaxed),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.cycle_count.store(0, Ordering::Relaxed);
        self.null_cycle_count.store(0, Ordering::Relaxed);
        self.failed_count.store(0, Ordering::Relaxed);
        self.xrun_count.store(0, Ordering::Relaxed);
        self.min_duration_us.store(u64::MAX, Ordering::Relaxed);
        self.max_duration_us.store(0, Ordering::Relaxed);
        self.total_duration_us.store(0, Ordering::Relaxed);
        self.max_delayed_us.store(0, Ordering::Relaxed);
        self.last_begin_us.store(0, Ordering::Relaxed);
    }
}

impl Default for CycleStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsReport {
    pub period_us: u64,
    pub cycle_count: u64,
    pub null_cycle_count: u64,
    pub failed_count: u64,
    pub xrun_count: u64,
    pub min_duration_us: u64,
    pub max_duration_us: u64,
    pub avg_duration_us: u64,
    pub max_delayed_us: u64,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Driver Cycle Statistics")?;
        writeln!(f, "=======================")?;
        writeln!(f, "Total cycles: {}", self.cycle_count)?;
        writeln!(f, "  Null cycles: {}", self.null_cycle_count)?;
        writeln!(f, "  Failed cycles: {}", self.failed_count)?;
        writeln!(f)?;

        writeln!(f, "Cycle Timing:")?;
        writeln!(
            f,
            "  Period: {:.2} ms",
            self.period_us as f64 / 1_000.0
        )?;
        writeln!(f, "  Measured:")?;
        writeln!(f, "    Min: {:.3} ms", self.min_duration_us as f64 / 1_000.0)?;
        writeln!(f, "    Max: {:.3} ms", self.max_duration_us as f64 / 1_000.0)?;
        writeln!(f, "    Avg: {:.3} ms", self.avg_duration_us as f64 / 1_000.0)?;

        let load_pct = if self.period_us > 0 {
            self.avg_duration_us as f64 / self.period_us as f64 * 100.0
        } else {
            0.0
        };
        writeln!(f, "  Load: {:.1}%", load_pct)?;
        writeln!(f)?;

        writeln!(f, "XRuns: {}", self.xrun_count)?;
        writeln!(
            f,
            "Max delay: {:.3} ms",
            self.max_delayed_us as f64 / 1_000.0
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(begin: u64, end: u64, delayed: f32) -> CycleRecord {
        CycleRecord {
            begin_us: begin,
            end_us: end,
            delayed_us: delayed,
            ..CycleRecord::default()
        }
    }

    #[test]
    fn test_report_aggregates() {
        let stats = CycleStats::new();
        stats.on_cycle(&record(0, 100, 0.0));
        stats.on_cycle(&record(1_000, 1_300, 0.0));
        stats.on_cycle(&CycleRecord {
            failed: true,
            null: true,
            ..record(2_000, 3_200, 200.0)
        });
        stats.record_xrun();

        let report = stats.report(1_000);
        assert_eq!(report.cycle_count, 3);
        assert_eq!(report.null_cycle_count, 1);
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.xrun_count, 1);
        assert_eq!(report.min_duration_us, 100);
        assert_eq!(report.max_duration_us, 1_200);
        assert_eq!(report.avg_duration_us, 533);
        assert_eq!(report.max_delayed_us, 200);

        let text = report.to_string();
        assert!(text.contains("XRuns: 1"));
    }

    #[test]
    fn test_empty_report_and_reset() {
        let stats = CycleStats::new();
        assert_eq!(stats.report(500).min_duration_us, 0);

        stats.on_cycle(&record(0, 10, 0.0));
        stats.reset();
        let report = stats.report(500);
        assert_eq!(report.cycle_count, 0);
        assert_eq!(report.max_duration_us, 0);
    }
}
