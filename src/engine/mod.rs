//! 引擎侧协作接口
//!
//! 驱动不拥有引擎、图管理器和同步表，它们都是更长寿命的共享服务，
//! 在构造驱动时注入（测试可以注入替身）。
//!
//! - [`Engine`]: 客户端注册、每周期处理、XRun / buffer size / sample rate 广播
//! - [`GraphManager`]: 释放并回收由驱动喂数据的客户端
//! - [`Synchro`]: 每个客户端的等待/唤醒原语，按 [`RefNum`] 索引

pub mod local;
pub mod synchro;

use std::fmt;
use std::sync::Arc;

use crate::audio::timing::period_usecs;
use crate::driver::ClientName;

pub use local::{LocalEngine, LocalGraph};
pub use synchro::{synchro_table, AtomicSynchro, Synchro, SynchroTable};

/// 客户端引用号（同步表下标）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefNum(pub usize);

impl fmt::Display for RefNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 引擎错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("no free client slot for \"{0}\"")]
    NoFreeRefNum(String),
    #[error("client name \"{0}\" is already registered")]
    NameInUse(String),
    #[error("unknown client refnum {0}")]
    UnknownRefNum(RefNum),
    #[error("client \"{0}\" is not registered with the engine")]
    NotRegistered(String),
    #[error("graph did not finish within {0} us")]
    Timeout(u64),
}

/// 引擎全局参数快照
///
/// 驱动在 open 时读取，重新协商 buffer size / sample rate 时更新自己的副本
/// 并通知引擎。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineControl {
    /// 每周期帧数
    pub buffer_size: u32,
    /// 采样率（Hz）
    pub sample_rate: u32,
    /// 是否以实时调度运行
    pub real_time: bool,
    /// 实时线程优先级（SCHED_FIFO）
    pub priority: i32,
    /// 等待客户端完成一个周期的超时（微秒）
    pub timeout_usecs: u64,
}

impl EngineControl {
    /// 名义周期（微秒）
    #[inline]
    pub fn period_usecs(&self) -> u64 {
        period_usecs(self.buffer_size, self.sample_rate)
    }
}

impl Default for EngineControl {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            sample_rate: 48_000,
            real_time: true,
            priority: 10,
            timeout_usecs: 2_000_000,
        }
    }
}

/// 驱动作为内部客户端的控制记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientControl {
    pub name: ClientName,
    pub refnum: Option<RefNum>,
    pub active: bool,
}

impl ClientControl {
    pub fn new(name: ClientName) -> Self {
        Self {
            name,
            refnum: None,
            active: false,
        }
    }
}

/// 发给单个客户端的事件类型
///
/// 数值编码是稳定的，便于跨进程传递。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notification {
    AddClient = 0,
    RemoveClient = 1,
    ActivateClient = 2,
    XRun = 3,
    GraphOrder = 4,
    BufferSize = 5,
    SampleRate = 6,
    StartFreewheel = 7,
    StopFreewheel = 8,
    PortRegistrationOn = 9,
    PortRegistrationOff = 10,
    PortConnect = 11,
    PortDisconnect = 12,
    RealTime = 13,
    ShutDown = 14,
}

impl TryFrom<i32> for Notification {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Self::AddClient,
            1 => Self::RemoveClient,
            2 => Self::ActivateClient,
            3 => Self::XRun,
            4 => Self::GraphOrder,
            5 => Self::BufferSize,
            6 => Self::SampleRate,
            7 => Self::StartFreewheel,
            8 => Self::StopFreewheel,
            9 => Self::PortRegistrationOn,
            10 => Self::PortRegistrationOff,
            11 => Self::PortConnect,
            12 => Self::PortDisconnect,
            13 => Self::RealTime,
            14 => Self::ShutDown,
            other => return Err(other),
        })
    }
}

/// 驱动看到的引擎
///
/// `process` 与 `notify_xrun` 在实时线程上调用，实现不得阻塞。
pub trait Engine: Send + Sync {
    /// 当前引擎参数
    fn control(&self) -> EngineControl;

    /// 图管理器（驱动只做透传）
    fn graph_manager(&self) -> Arc<dyn GraphManager>;

    /// 注册一个内部客户端，返回其引用号
    fn client_open(&self, name: &str) -> Result<RefNum, EngineError>;

    /// 注销客户端
    fn client_close(&self, refnum: RefNum) -> Result<(), EngineError>;

    /// 运行一个周期的图调度，返回 false 表示本周期图没有按时切换
    fn process(&self, cycle_begin_us: u64, prev_cycle_end_us: u64) -> bool;

    /// 驱动检测到 XRun
    fn notify_xrun(&self, callback_usecs: u64, delayed_usecs: f32);

    /// 驱动重新协商了 buffer size
    fn notify_buffer_size(&self, buffer_size: u32);

    /// 驱动重新协商了采样率
    fn notify_sample_rate(&self, sample_rate: u32);
}

/// 图管理器：按客户端同步原语释放/回收一个周期的处理
pub trait GraphManager: Send + Sync {
    /// 唤醒由该驱动喂数据的客户端
    fn resume_ref_num(
        &self,
        control: &ClientControl,
        table: &SynchroTable,
    ) -> Result<(), EngineError>;

    /// 等待图在超时内完成本周期
    fn suspend_ref_num(
        &self,
        control: &ClientControl,
        table: &SynchroTable,
        timeout_usecs: u64,
    ) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_codes() {
        for code in 0..15 {
            let n = Notification::try_from(code).unwrap();
            assert_eq!(n as i32, code);
        }
        assert_eq!(Notification::try_from(15), Err(15));
        assert_eq!(Notification::try_from(-1), Err(-1));
    }

    #[test]
    fn test_default_control_period() {
        let control = EngineControl::default();
        assert_eq!(control.period_usecs(), 21_333);

        let small = EngineControl {
            buffer_size: 64,
            sample_rate: 32_000,
            ..EngineControl::default()
        };
        assert_eq!(small.period_usecs(), 2_000);
    }
}
