//! 驱动错误

use crate::engine::EngineError;

use super::{DriverId, DriverState};

/// 驱动错误
///
/// - 配置错误（名字过长、固定 buffer size 等）在 open / set_* 时立即返回
/// - 设备读写失败只让本周期失败，周期本身照常完成
/// - XRun 不是错误，只通知引擎
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("name \"{name}\" is longer than {max} bytes")]
    NameTooLong { name: String, max: usize },

    #[error("cannot {op} while driver is {state}")]
    InvalidState {
        op: &'static str,
        state: DriverState,
    },

    #[error("buffer size is fixed at {current} frames, cannot change to {requested}")]
    FixedBufferSize { current: u32, requested: u32 },

    #[error("invalid buffer size {0}")]
    InvalidBufferSize(u32),

    #[error("invalid sample rate {0}")]
    InvalidSampleRate(u32),

    #[error("driver {0} is already a slave of this driver")]
    DuplicateSlave(DriverId),

    #[error("driver {0} cannot be its own slave")]
    SlaveIsSelf(DriverId),

    #[error("driver {0} is not a master and cannot own slaves")]
    NotMaster(DriverId),

    #[error("driver is a slave of {0} and only runs inside its cycle")]
    DrivenByMaster(DriverId),

    #[error("driver is not a slave of {0}")]
    NotSlaveOf(DriverId),

    #[error("device read failed (code {0})")]
    Read(i32),

    #[error("device write failed (code {0})")]
    Write(i32),

    #[error("{failed} of {total} slave drivers failed this cycle")]
    SlavesFailed { failed: usize, total: usize },

    #[error("slave driver is locked by another thread")]
    SlaveBusy,

    #[error("driver lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to spawn driver thread")]
    Spawn(#[source] std::io::Error),

    #[error("driver thread panicked")]
    ThreadPanicked,
}
