//! 客户端同步原语
//!
//! 每个客户端一个 wait/signal 句柄，驱动每周期用它释放和回收客户端。
//! [`AtomicSynchro`] 是纯原子实现：计数信号量 + 自旋/让出退避，不使用 Mutex，
//! 避免实时线程和普通线程之间的优先级反转。

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

/// 等待/唤醒原语
pub trait Synchro: Send + Sync {
    /// 唤醒一个等待者
    fn signal(&self) -> bool;

    /// 等待信号
    fn wait(&self) -> bool;

    /// 最多等待 `usec` 微秒，超时返回 false
    fn timed_wait(&self, usec: u64) -> bool;

    /// flush 模式下（freewheel）signal 不计数，wait 立即返回
    fn set_flush(&self, flush: bool);

    fn is_flushing(&self) -> bool;
}

/// 按 [`RefNum`](super::RefNum) 索引的同步表
pub type SynchroTable = Arc<[Arc<dyn Synchro>]>;

/// 创建含 `clients` 个 [`AtomicSynchro`] 的同步表
pub fn synchro_table(clients: usize) -> SynchroTable {
    (0..clients)
        .map(|_| Arc::new(AtomicSynchro::new()) as Arc<dyn Synchro>)
        .collect()
}

/// 原子计数信号量
#[derive(Debug, Default)]
pub struct AtomicSynchro {
    count: AtomicU32,
    flush: AtomicBool,
}

impl AtomicSynchro {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尚未被消费的信号数
    pub fn pending(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    fn try_take(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let backoff = Backoff::new();
        loop {
            if self.flush.load(Ordering::Acquire) || self.try_take() {
                return true;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
            if backoff.is_completed() {
                thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }
}

impl Synchro for AtomicSynchro {
    fn signal(&self) -> bool {
        if !self.flush.load(Ordering::Acquire) {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
        true
    }

    fn wait(&self) -> bool {
        self.wait_until(None)
    }

    fn timed_wait(&self, usec: u64) -> bool {
        self.wait_until(Some(Instant::now() + Duration::from_micros(usec)))
    }

    fn set_flush(&self, flush: bool) {
        self.flush.store(flush, Ordering::Release);
        if flush {
            self.count.store(0, Ordering::Release);
        }
    }

    fn is_flushing(&self) -> bool {
        self.flush.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_then_wait() {
        let s = AtomicSynchro::new();
        assert!(s.signal());
        assert!(s.signal());
        assert_eq!(s.pending(), 2);
        assert!(s.wait());
        assert!(s.timed_wait(0));
        assert_eq!(s.pending(), 0);
    }

    #[test]
    fn test_timed_wait_times_out() {
        let s = AtomicSynchro::new();
        let start = Instant::now();
        assert!(!s.timed_wait(5_000));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_flush_releases_waiters() {
        let s = AtomicSynchro::new();
        s.set_flush(true);
        assert!(s.is_flushing());
        assert!(s.signal());
        assert_eq!(s.pending(), 0);
        assert!(s.timed_wait(1_000_000));

        s.set_flush(false);
        assert!(!s.timed_wait(1_000));
    }

    #[test]
    fn test_cross_thread_signal() {
        let s = Arc::new(AtomicSynchro::new());
        let waiter = {
            let s = Arc::clone(&s);
            thread::spawn(move || s.timed_wait(2_000_000))
        };
        thread::sleep(Duration::from_millis(5));
        s.signal();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_table_size() {
        let table = synchro_table(4);
        assert_eq!(table.len(), 4);
        table[2].signal();
        assert!(table[2].timed_wait(0));
        assert!(!table[1].timed_wait(0));
    }
}
