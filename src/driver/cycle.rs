//! 周期计时
//!
//! 以理想时间表而不是实际观测来推算下一周期：
//! `inc_time` 每次只把期望开始时间推进一个名义周期，
//! 因此实际开始时间落后期望值超过一个周期，就说明丢了一个周期（XRun）。

/// 周期计时器
#[derive(Debug, Clone)]
pub struct CycleTimer {
    period_us: u64,
    begin_us: u64,
    end_us: u64,
    expected_begin_us: Option<u64>,
    delayed_us: f32,
}

impl CycleTimer {
    pub fn new(period_us: u64) -> Self {
        Self {
            period_us,
            begin_us: 0,
            end_us: 0,
            expected_begin_us: None,
            delayed_us: 0.0,
        }
    }

    /// 名义周期（微秒）
    #[inline]
    pub fn period_us(&self) -> u64 {
        self.period_us
    }

    /// 重新协商后更换周期；时间表从下一个周期重新对齐
    pub fn set_period(&mut self, period_us: u64) {
        self.period_us = period_us;
        self.expected_begin_us = None;
    }

    /// 忘掉时间表（启动或恢复时调用）
    pub fn reset(&mut self) {
        self.expected_begin_us = None;
        self.delayed_us = 0.0;
    }

    /// 本周期开始时间
    #[inline]
    pub fn begin_us(&self) -> u64 {
        self.begin_us
    }

    /// 最近一次结束时间
    #[inline]
    pub fn end_us(&self) -> u64 {
        self.end_us
    }

    /// 本周期超出名义周期的微秒数
    #[inline]
    pub fn delayed_us(&self) -> f32 {
        self.delayed_us
    }

    /// 理想时间表上的本周期（或下一周期）开始时间
    #[inline]
    pub fn expected_begin_us(&self) -> Option<u64> {
        self.expected_begin_us
    }

    /// 记录周期开始
    ///
    /// 如果比时间表晚了一个周期以上，返回落后的微秒数，并把时间表重新对齐到现在。
    pub fn take_begin_time(&mut self, now_us: u64) -> Option<u64> {
        self.begin_us = now_us;
        match self.expected_begin_us {
            None => {
                self.expected_begin_us = Some(now_us);
                None
            }
            Some(expected) if self.period_us > 0 && now_us >= expected + self.period_us => {
                self.expected_begin_us = Some(now_us);
                Some(now_us - expected)
            }
            Some(_) => None,
        }
    }

    /// 记录周期结束，返回本周期超出名义周期的微秒数（未超出为 0）
    pub fn take_end_time(&mut self, now_us: u64) -> f32 {
        self.end_us = now_us;
        let duration = now_us.saturating_sub(self.begin_us);
        self.delayed_us = duration.saturating_sub(self.period_us) as f32;
        self.delayed_us
    }

    /// 把期望开始时间推进恰好一个名义周期
    pub fn inc_time(&mut self) {
        let base = self.expected_begin_us.unwrap_or(self.begin_us);
        self.expected_begin_us = Some(base + self.period_us);
    }
}

/// 单个周期的记录，可以通过 ring buffer 从实时线程送到监控线程
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CycleRecord {
    pub begin_us: u64,
    pub end_us: u64,
    pub delayed_us: f32,
    pub xrun: bool,
    pub failed: bool,
    /// 没有设备 I/O 的空周期
    pub null: bool,
}

const FLAG_XRUN: u8 = 1;
const FLAG_FAILED: u8 = 1 << 1;
const FLAG_NULL: u8 = 1 << 2;

impl CycleRecord {
    /// 编码后的固定长度（小端）
    pub const ENCODED_LEN: usize = 24;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..8].copy_from_slice(&self.begin_us.to_le_bytes());
        out[8..16].copy_from_slice(&self.end_us.to_le_bytes());
        out[16..20].copy_from_slice(&self.delayed_us.to_le_bytes());
        let mut flags = 0u8;
        if self.xrun {
            flags |= FLAG_XRUN;
        }
        if self.failed {
            flags |= FLAG_FAILED;
        }
        if self.null {
            flags |= FLAG_NULL;
        }
        out[20] = flags;
        out
    }

    pub fn decode(bytes: &[u8; Self::ENCODED_LEN]) -> Self {
        let mut u64_bytes = [0u8; 8];
        u64_bytes.copy_from_slice(&bytes[0..8]);
        let begin_us = u64::from_le_bytes(u64_bytes);
        u64_bytes.copy_from_slice(&bytes[8..16]);
        let end_us = u64::from_le_bytes(u64_bytes);
        let mut f32_bytes = [0u8; 4];
        f32_bytes.copy_from_slice(&bytes[16..20]);
        let flags = bytes[20];

        Self {
            begin_us,
            end_us,
            delayed_us: f32::from_le_bytes(f32_bytes),
            xrun: flags & FLAG_XRUN != 0,
            failed: flags & FLAG_FAILED != 0,
            null: flags & FLAG_NULL != 0,
        }
    }

    /// 周期实际耗时
    #[inline]
    pub fn duration_us(&self) -> u64 {
        self.end_us.saturating_sub(self.begin_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: u64 = 1_000;

    #[test]
    fn test_inc_time_ignores_jitter() {
        let mut timer = CycleTimer::new(P);
        let start = 10_000;
        let jitter = [0u64, 130, 7, 480, 999, 0, 250, 60];

        timer.take_begin_time(start);
        timer.take_end_time(start + 200);
        timer.inc_time();
        assert_eq!(timer.expected_begin_us(), Some(start + P));

        for (i, &j) in jitter.iter().enumerate() {
            let expected = timer.expected_begin_us().unwrap();
            assert_eq!(expected, start + (i as u64 + 1) * P);

            let begin = expected + j;
            assert_eq!(timer.take_begin_time(begin), None);
            timer.take_end_time(begin + 300);
            timer.inc_time();
            assert_eq!(timer.expected_begin_us(), Some(expected + P));
        }
    }

    #[test]
    fn test_delayed_only_when_over_period() {
        let mut timer = CycleTimer::new(P);

        timer.take_begin_time(0);
        assert_eq!(timer.take_end_time(P - 1), 0.0);
        timer.inc_time();

        timer.take_begin_time(P);
        assert_eq!(timer.take_end_time(2 * P), 0.0);
        timer.inc_time();

        timer.take_begin_time(2 * P);
        assert_eq!(timer.take_end_time(3 * P + 250), 250.0);
        assert_eq!(timer.delayed_us(), 250.0);
    }

    #[test]
    fn test_lost_cycle_detected_and_resynced() {
        let mut timer = CycleTimer::new(P);
        timer.take_begin_time(0);
        timer.take_end_time(100);
        timer.inc_time();

        // 整整丢了两个周期
        assert_eq!(timer.take_begin_time(3 * P + 10), Some(2 * P + 10));
        timer.take_end_time(3 * P + 100);
        timer.inc_time();
        assert_eq!(timer.expected_begin_us(), Some(4 * P + 10));

        // 晚了不到一个周期不算丢周期
        assert_eq!(timer.take_begin_time(4 * P + 900), None);
    }

    #[test]
    fn test_set_period_realigns() {
        let mut timer = CycleTimer::new(P);
        timer.take_begin_time(0);
        timer.inc_time();

        timer.set_period(2 * P);
        assert_eq!(timer.expected_begin_us(), None);
        assert_eq!(timer.take_begin_time(50 * P), None);
        timer.inc_time();
        assert_eq!(timer.expected_begin_us(), Some(52 * P));
    }

    #[test]
    fn test_record_encoding() {
        let record = CycleRecord {
            begin_us: 123_456_789,
            end_us: 123_460_000,
            delayed_us: 12.5,
            xrun: true,
            failed: false,
            null: true,
        };
        let bytes = record.encode();
        assert_eq!(CycleRecord::decode(&bytes), record);
        assert_eq!(record.duration_us(), 3_211);
    }
}
