//! 音频核心模块
//!
//! 包含：
//! - Ring Buffer: Lock-free 字节数据传递（实时线程 ⇄ 非实时线程）
//! - Timing: 单调微秒时钟与睡眠

pub mod ring_buffer;
pub mod timing;

pub use ring_buffer::{Reader, RingBuffer, RingBufferError, Writer};
pub use timing::{get_microseconds, sleep_us, Clock, ManualClock, MonotonicClock};
