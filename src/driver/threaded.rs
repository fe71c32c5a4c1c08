//! 驱动线程
//!
//! 在独立（可选实时优先级）线程上循环调用 master 驱动的 `process`。
//! 驱动还没启动或已经停止时改跑 `process_null`，让客户端继续收到周期。
//! 每个周期的 [`CycleRecord`] 可以通过 ring buffer 送给监控线程，
//! 写不下就丢弃，驱动线程从不等待读端。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::audio::ring_buffer::Writer;
use crate::audio::timing::sleep_us;

use super::{CycleRecord, DriverError, DriverHandle};

/// 驱动线程参数
#[derive(Debug, Clone)]
pub struct ThreadOptions {
    /// 线程名
    pub name: String,
    /// SCHED_FIFO 优先级；None 表示普通调度
    pub priority: Option<i32>,
    /// 运行这么多个周期后自行退出
    pub max_cycles: Option<u64>,
}

impl Default for ThreadOptions {
    fn default() -> Self {
        Self {
            name: "driver".to_string(),
            priority: None,
            max_cycles: None,
        }
    }
}

/// 可以从别的线程（包括信号处理函数）请求停止
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// 运行中的驱动线程
pub struct ThreadedDriver {
    driver: DriverHandle,
    stop: StopHandle,
    thread: Option<JoinHandle<u64>>,
}

impl ThreadedDriver {
    /// 启动驱动线程
    ///
    /// `tap` 不为 None 时，每个周期的记录都会写进去。
    /// 挂在 master 上的 slave 只能由 master 的周期驱动，不能单独起线程。
    pub fn spawn(
        driver: DriverHandle,
        options: ThreadOptions,
        tap: Option<Writer>,
    ) -> Result<Self, DriverError> {
        if let Some(master) = driver.lock()?.slave_of() {
            return Err(DriverError::DrivenByMaster(master));
        }

        let stop = StopHandle(Arc::new(AtomicBool::new(false)));
        let thread_stop = stop.clone();
        let thread_driver = driver.clone();
        let name = options.name.clone();

        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || run(thread_driver, options, thread_stop, tap))
            .map_err(DriverError::Spawn)?;

        log::info!("Driver thread for {} spawned", driver.id());
        Ok(Self {
            driver,
            stop,
            thread: Some(thread),
        })
    }

    pub fn driver(&self) -> &DriverHandle {
        &self.driver
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// 线程仍在运行
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// 请求停止并等待线程退出，返回运行过的周期数
    pub fn stop(self) -> Result<u64, DriverError> {
        self.stop.request_stop();
        self.join()
    }

    /// 等待线程自行退出（`max_cycles` 或外部请求停止）
    pub fn join(mut self) -> Result<u64, DriverError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| DriverError::ThreadPanicked),
            None => Ok(0),
        }
    }
}

impl Drop for ThreadedDriver {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.stop.request_stop();
            if thread.join().is_err() {
                log::error!("Driver thread panicked");
            }
        }
    }
}

/// 线程主循环
fn run(
    driver: DriverHandle,
    options: ThreadOptions,
    stop: StopHandle,
    mut tap: Option<Writer>,
) -> u64 {
    if let Some(priority) = options.priority {
        match acquire_real_time(priority) {
            Ok(()) => log::info!("Driver thread running SCHED_FIFO priority {}", priority),
            Err(e) => log::warn!("Cannot use real-time scheduling (priority {}): {}", priority, e),
        }
    }

    match driver.lock() {
        Ok(mut d) => {
            if !d.init() {
                log::error!("Driver {} init failed", d.name());
                return 0;
            }
        }
        Err(e) => {
            log::error!("Driver thread cannot start: {}", e);
            return 0;
        }
    }

    let mut cycles = 0u64;
    while !stop.is_stop_requested() {
        if options.max_cycles.is_some_and(|max| cycles >= max) {
            break;
        }

        let (record, idle_us) = {
            let mut d = match driver.lock() {
                Ok(d) => d,
                Err(e) => {
                    log::error!("Driver thread exiting: {}", e);
                    break;
                }
            };

            match d.process() {
                Ok(()) => (Some(d.last_cycle()), 0),
                Err(e @ DriverError::DrivenByMaster(_)) => {
                    log::warn!("Driver thread exiting: {}", e);
                    break;
                }
                Err(DriverError::InvalidState { .. }) => match d.process_null() {
                    Ok(()) => (Some(d.last_cycle()), d.period_usecs()),
                    Err(DriverError::InvalidState { .. }) => (None, d.period_usecs()),
                    Err(e) => {
                        log::debug!("Null cycle failed: {}", e);
                        (Some(d.last_cycle()), d.period_usecs())
                    }
                },
                Err(e) => {
                    log::debug!("Cycle failed: {}", e);
                    (Some(d.last_cycle()), 0)
                }
            }
        };

        if let Some(record) = record {
            cycles += 1;
            if let Some(writer) = tap.as_mut() {
                publish(writer, &record);
            }
        }

        // 没有设备节拍时按名义周期空转
        if idle_us > 0 {
            sleep_us(idle_us);
        }
    }

    log::info!("Driver thread stopped after {} cycles", cycles);
    cycles
}

/// 只写完整记录；空间不够就丢弃
fn publish(writer: &mut Writer, record: &CycleRecord) -> bool {
    if writer.write_space() < CycleRecord::ENCODED_LEN {
        return false;
    }
    writer.write(&record.encode()) == CycleRecord::ENCODED_LEN
}

#[cfg(unix)]
fn acquire_real_time(priority: i32) -> std::io::Result<()> {
    // SAFETY: sched_param 是纯数据结构，全零是合法值
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = priority;
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::from_raw_os_error(rc))
    }
}

#[cfg(not(unix))]
fn acquire_real_time(_priority: i32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "real-time scheduling not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::RingBuffer;
    use crate::driver::{Driver, DriverInterface, DummyBackend};
    use crate::engine::{Engine, EngineControl, LocalEngine};

    fn dummy_driver(engine: &Arc<LocalEngine>, name: &str) -> Driver<DummyBackend> {
        let dyn_engine: Arc<dyn Engine> = engine.clone();
        Driver::new(name, "", dyn_engine, engine.synchro_table(), DummyBackend::new()).unwrap()
    }

    fn small_engine() -> Arc<LocalEngine> {
        // 64 帧 @ 64 kHz = 1 ms 周期
        let control = EngineControl {
            buffer_size: 64,
            sample_rate: 64_000,
            real_time: false,
            timeout_usecs: 100_000,
            ..EngineControl::default()
        };
        Arc::new(LocalEngine::new(control, 8))
    }

    #[test]
    fn test_runs_cycles_and_taps_records() {
        let engine = small_engine();
        let mut master = dummy_driver(&engine, "system");
        master.open().unwrap();
        master.attach().unwrap();
        master.start().unwrap();
        master.set_master(true);

        let mut slave = dummy_driver(&engine, "net");
        slave.open().unwrap();
        slave.attach().unwrap();
        slave.start().unwrap();
        master.add_slave(DriverHandle::new(slave)).unwrap();

        let handle = DriverHandle::new(master);
        let (writer, mut reader) = RingBuffer::new(4096).unwrap().split();
        let options = ThreadOptions {
            name: "test-driver".into(),
            max_cycles: Some(10),
            ..ThreadOptions::default()
        };

        let thread = ThreadedDriver::spawn(handle.clone(), options, Some(writer)).unwrap();
        let cycles = thread.join().unwrap();
        assert_eq!(cycles, 10);

        // 主驱动和 slave 各推动一次图
        assert_eq!(engine.cycle_count(), 20);
        assert_eq!(handle.lock().unwrap().stats().cycle_count(), 10);

        let mut buf = [0u8; CycleRecord::ENCODED_LEN];
        let mut last_begin = 0;
        for _ in 0..10 {
            assert_eq!(reader.read(&mut buf), CycleRecord::ENCODED_LEN);
            let record = CycleRecord::decode(&buf);
            assert!(!record.null);
            assert!(record.begin_us >= last_begin);
            last_begin = record.begin_us;
        }
        assert_eq!(reader.read_space(), 0);
    }

    #[test]
    fn test_stopped_driver_runs_null_cycles() {
        let engine = small_engine();
        let mut master = dummy_driver(&engine, "system");
        master.open().unwrap();
        master.attach().unwrap();

        let handle = DriverHandle::new(master);
        let options = ThreadOptions {
            max_cycles: Some(3),
            ..ThreadOptions::default()
        };
        let thread = ThreadedDriver::spawn(handle.clone(), options, None).unwrap();
        assert_eq!(thread.join().unwrap(), 3);

        let driver = handle.lock().unwrap();
        assert_eq!(driver.stats().null_cycle_count(), 3);
        assert!(driver.last_cycle().null);
    }

    #[test]
    fn test_stop_request_ends_thread() {
        let engine = small_engine();
        let mut master = dummy_driver(&engine, "system");
        master.open().unwrap();
        master.attach().unwrap();
        master.start().unwrap();

        let thread =
            ThreadedDriver::spawn(DriverHandle::new(master), ThreadOptions::default(), None)
                .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(thread.is_running());
        let cycles = thread.stop().unwrap();
        assert!(cycles > 0);
    }

    #[test]
    fn test_slave_cannot_get_own_thread() {
        let engine = small_engine();
        let mut master = dummy_driver(&engine, "system");
        master.open().unwrap();
        master.attach().unwrap();
        master.set_master(true);

        let mut slave = dummy_driver(&engine, "net");
        slave.open().unwrap();
        slave.attach().unwrap();
        slave.start().unwrap();
        let slave = DriverHandle::new(slave);
        master.add_slave(slave.clone()).unwrap();

        let err = ThreadedDriver::spawn(slave.clone(), ThreadOptions::default(), None);
        assert!(matches!(err, Err(DriverError::DrivenByMaster(id)) if id == master.id()));

        // 摘下之后可以独立运行
        master.remove_slave(slave.id()).unwrap();
        let options = ThreadOptions {
            max_cycles: Some(2),
            ..ThreadOptions::default()
        };
        let thread = ThreadedDriver::spawn(slave.clone(), options, None).unwrap();
        assert_eq!(thread.join().unwrap(), 2);
        assert_eq!(slave.lock().unwrap().stats().cycle_count(), 2);
    }

    #[test]
    fn test_full_tap_drops_records() {
        let (mut writer, reader) = RingBuffer::new(32).unwrap().split();
        let record = CycleRecord::default();
        assert!(publish(&mut writer, &record));
        // 32 字节容量只能放下一条
        assert!(!publish(&mut writer, &record));
        assert_eq!(reader.read_space(), CycleRecord::ENCODED_LEN);
    }
}
