//! Cycle Driver Library
//!
//! Real-time audio driver core: the driver cycle with master/slave
//! composition, xrun detection and engine notifications, plus a lock-free
//! single-producer single-consumer byte ring buffer.

pub mod audio;
pub mod driver;
pub mod engine;
