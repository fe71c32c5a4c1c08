//! 单调时钟与睡眠
//!
//! 驱动周期的时间基准：微秒级单调时钟（CLOCK_MONOTONIC）和睡眠原语。
//! 驱动通过 [`Clock`] trait 注入时钟，测试中用 [`ManualClock`] 精确控制时间。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// 获取当前单调时间（微秒）
#[cfg(unix)]
#[inline]
pub fn get_microseconds() -> u64 {
    // SAFETY: timespec 全零合法；clock_gettime 只写入 ts
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if result != 0 {
        return fallback_microseconds();
    }
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

#[cfg(not(unix))]
#[inline]
pub fn get_microseconds() -> u64 {
    fallback_microseconds()
}

/// 进程内第一次调用时的时间点作为零点
fn fallback_microseconds() -> u64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    ORIGIN.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// 睡眠指定微秒数
#[inline]
pub fn sleep_us(usec: u64) {
    if usec > 0 {
        std::thread::sleep(Duration::from_micros(usec));
    }
}

/// 一个周期的名义时长（微秒）：`buffer_size / sample_rate` 秒
#[inline]
pub fn period_usecs(buffer_size: u32, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    buffer_size as u64 * 1_000_000 / sample_rate as u64
}

/// 驱动使用的时间源
pub trait Clock: Send + Sync {
    /// 当前单调时间（微秒）
    fn now_us(&self) -> u64;

    /// 睡眠指定微秒数
    fn sleep_us(&self, usec: u64);
}

/// 系统单调时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    #[inline]
    fn now_us(&self) -> u64 {
        get_microseconds()
    }

    #[inline]
    fn sleep_us(&self, usec: u64) {
        sleep_us(usec)
    }
}

/// 手动推进的时钟
///
/// `sleep_us` 直接把时间向前推，不真正睡眠。用于确定性测试和离线模拟。
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now: AtomicU64::new(start_us),
        }
    }

    /// 把时间推进 `usec` 微秒
    pub fn advance(&self, usec: u64) {
        self.now.fetch_add(usec, Ordering::AcqRel);
    }

    /// 把时间设置到绝对值（不允许倒退）
    pub fn set(&self, now_us: u64) {
        self.now.fetch_max(now_us, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn sleep_us(&self, usec: u64) {
        self.advance(usec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_usecs() {
        assert_eq!(period_usecs(1024, 48_000), 21_333);
        assert_eq!(period_usecs(48, 48_000), 1_000);
        assert_eq!(period_usecs(256, 0), 0);
    }

    #[test]
    fn test_monotonic_advances() {
        let clock = MonotonicClock;
        let t1 = clock.now_us();
        clock.sleep_us(10_000);
        let t2 = clock.now_us();

        // 至少 8ms
        assert!(
            t2 - t1 >= 8_000,
            "expected at least 8ms, got {}us",
            t2 - t1
        );
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_us(), 1_000);

        clock.sleep_us(250);
        assert_eq!(clock.now_us(), 1_250);

        clock.set(1_100);
        assert_eq!(clock.now_us(), 1_250, "manual clock must not go backwards");

        clock.set(5_000);
        assert_eq!(clock.now_us(), 5_000);
    }
}
