//! 音频驱动
//!
//! 包含：
//! - [`DriverInterface`]: 任何后端或组合驱动都要满足的能力集合
//! - [`Backend`]: 设备相关的部分（open / read / write / start / stop）
//! - [`Driver`]: 通用实现，负责状态机、master/slave 组合、周期计时和通知
//! - [`DriverHandle`]: 可共享的驱动引用，slave 列表里保存的就是它
//!
//! 后端和 master/slave 行为正交：任何 `Driver<B>` 都可以当 master，也可以当别人的 slave。

pub mod base;
pub mod cycle;
pub mod dummy;
pub mod error;
pub mod params;
pub mod stats;
pub mod threaded;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use crate::audio::timing::Clock;
use crate::engine::{ClientControl, Notification, RefNum};

pub use base::Driver;
pub use cycle::{CycleRecord, CycleTimer};
pub use dummy::DummyBackend;
pub use error::DriverError;
pub use params::{ClientName, DriverParams, CLIENT_NAME_SIZE};
pub use stats::{CycleStats, StatsReport};
pub use threaded::{StopHandle, ThreadOptions, ThreadedDriver};

/// 驱动生命周期状态
///
/// `Closed → Opened → Attached → Started ⇄ Stopped → Detached → Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverState {
    Closed,
    Opened,
    Attached,
    Started,
    Stopped,
    Detached,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Opened => "opened",
            Self::Attached => "attached",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Detached => "detached",
        };
        f.write_str(s)
    }
}

/// 驱动实例的唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverId(u64);

impl DriverId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver-{}", self.0)
    }
}

/// 传给后端的周期上下文
pub struct CycleContext<'a> {
    /// 理想时间表上本周期的开始时间（第一次周期为 None）
    pub expected_begin_us: Option<u64>,
    pub period_us: u64,
    pub buffer_size: u32,
    pub sample_rate: u32,
    pub clock: &'a dyn Clock,
}

/// 设备后端
///
/// 只负责和设备打交道；状态机、计时、通知和 slave 组合由 [`Driver`] 完成。
/// `read` / `write` 在实时线程上调用，不得分配或加锁。
pub trait Backend: Send {
    /// 按协商好的参数打开设备
    fn open(&mut self, _params: &DriverParams) -> Result<(), DriverError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn start(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    /// 读取一个周期的采集数据（阻塞式设备在这里等待硬件）
    fn read(&mut self, cycle: &CycleContext<'_>) -> Result<(), DriverError>;

    /// 写出一个周期的回放数据
    fn write(&mut self, cycle: &CycleContext<'_>) -> Result<(), DriverError>;

    fn is_fixed_buffer_size(&self) -> bool {
        true
    }

    fn set_buffer_size(&mut self, _buffer_size: u32) -> Result<(), DriverError> {
        Ok(())
    }

    fn set_sample_rate(&mut self, _sample_rate: u32) -> Result<(), DriverError> {
        Ok(())
    }
}

/// 驱动能力集合
pub trait DriverInterface: Send {
    fn id(&self) -> DriverId;

    fn name(&self) -> &str;

    fn state(&self) -> DriverState;

    /// 使用引擎当前参数打开
    fn open(&mut self) -> Result<(), DriverError>;

    /// 使用完整参数打开
    fn open_with(&mut self, params: &DriverParams) -> Result<(), DriverError>;

    fn close(&mut self) -> Result<(), DriverError>;

    /// 作为内部客户端注册到引擎
    fn attach(&mut self) -> Result<(), DriverError>;

    fn detach(&mut self) -> Result<(), DriverError>;

    fn read(&mut self) -> Result<(), DriverError>;

    fn write(&mut self) -> Result<(), DriverError>;

    fn start(&mut self) -> Result<(), DriverError>;

    fn stop(&mut self) -> Result<(), DriverError>;

    fn is_fixed_buffer_size(&self) -> bool;

    fn set_buffer_size(&mut self, buffer_size: u32) -> Result<(), DriverError>;

    fn set_sample_rate(&mut self, sample_rate: u32) -> Result<(), DriverError>;

    /// 完整周期：设备 I/O + 图调度 + slave
    fn process(&mut self) -> Result<(), DriverError>;

    /// 没有设备 I/O 的周期，客户端通知照常推进
    fn process_null(&mut self) -> Result<(), DriverError>;

    fn set_master(&mut self, on: bool);

    fn is_master(&self) -> bool;

    fn add_slave(&mut self, slave: DriverHandle) -> Result<(), DriverError>;

    /// 移除 slave；不存在时返回 None，不算错误
    fn remove_slave(&mut self, id: DriverId) -> Option<DriverHandle>;

    /// 按加入顺序运行所有 slave 的一个周期（只有 master 可以调用）
    fn process_slaves(&mut self) -> Result<(), DriverError>;

    /// 作为 `master` 的 slave 运行一个周期；`null` 为 true 时运行空周期
    ///
    /// 只接受当前拥有它的 master，其他调用方得到 `DrivenByMaster`。
    fn process_as_slave(&mut self, master: DriverId, null: bool) -> Result<(), DriverError>;

    /// 当前拥有该驱动的 master
    fn slave_of(&self) -> Option<DriverId>;

    /// 由 master 在 add/remove slave 时设置
    fn set_slave_of(&mut self, master: Option<DriverId>);

    fn slaves(&self) -> &[DriverHandle];

    fn is_real_time(&self) -> bool;

    /// 引擎把事件投递给该驱动拥有的客户端
    fn client_notify(
        &mut self,
        refnum: RefNum,
        name: &str,
        notify: Notification,
        sync: bool,
        value1: i32,
        value2: i32,
    ) -> Result<(), DriverError>;

    fn client_control(&self) -> &ClientControl;

    /// 名义周期（微秒）
    fn period_usecs(&self) -> u64;

    /// 最近一个周期的记录
    fn last_cycle(&self) -> CycleRecord;

    fn stats(&self) -> &Arc<CycleStats>;

    /// 驱动线程启动时调用一次（阻塞式驱动在这里做线程相关的初始化）
    fn init(&mut self) -> bool {
        true
    }
}

/// 可共享的驱动引用
///
/// 组合操作（add/remove slave、start/stop slave）在非实时线程上短暂加锁；
/// 实时线程只用 `try_lock`，拿不到锁时本周期该 slave 失败而不是等待。
#[derive(Clone)]
pub struct DriverHandle {
    id: DriverId,
    driver: Arc<Mutex<dyn DriverInterface>>,
}

impl DriverHandle {
    pub fn new<D: DriverInterface + 'static>(driver: D) -> Self {
        Self {
            id: driver.id(),
            driver: Arc::new(Mutex::new(driver)),
        }
    }

    #[inline]
    pub fn id(&self) -> DriverId {
        self.id
    }

    /// 阻塞加锁（非实时线程）
    pub fn lock(&self) -> Result<MutexGuard<'_, dyn DriverInterface + 'static>, DriverError> {
        self.driver.lock().map_err(|_| DriverError::Poisoned)
    }

    /// 非阻塞加锁（实时线程）
    #[inline]
    pub fn try_lock(&self) -> Result<MutexGuard<'_, dyn DriverInterface + 'static>, DriverError> {
        match self.driver.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(DriverError::SlaveBusy),
            Err(TryLockError::Poisoned(_)) => Err(DriverError::Poisoned),
        }
    }
}

impl fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverHandle").field("id", &self.id).finish()
    }
}
