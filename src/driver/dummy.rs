//! 无硬件的模拟设备
//!
//! 以时钟而不是声卡为节拍：`read` 睡到时间表上的周期开始时间再返回，
//! 相当于一个按名义周期阻塞的设备。采集端产生静音，回放端只计数。

use super::{Backend, CycleContext, DriverError, DriverParams};

/// 模拟后端
#[derive(Debug, Default)]
pub struct DummyBackend {
    capture: Vec<Vec<f32>>,
    playback: Vec<Vec<f32>>,
    buffer_size: usize,
    running: bool,

    // 每 N 个周期模拟一次读失败（0 = 不失败）
    fail_every: u64,
    // write 中模拟的处理耗时
    work_us: u64,

    cycles: u64,
    frames_read: u64,
    frames_written: u64,
}

impl DummyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每 `n` 个周期让 `read` 失败一次
    pub fn with_fail_every(mut self, n: u64) -> Self {
        self.fail_every = n;
        self
    }

    /// 每个周期在 `write` 里额外消耗 `usec` 微秒
    pub fn with_work_us(mut self, usec: u64) -> Self {
        self.work_us = usec;
        self
    }

    pub fn set_work_us(&mut self, usec: u64) {
        self.work_us = usec;
    }

    pub fn capture_channels(&self) -> usize {
        self.capture.len()
    }

    pub fn playback_channels(&self) -> usize {
        self.playback.len()
    }

    /// 单个通道的缓冲区帧数
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// 采集通道数据（静音）
    pub fn capture_buffer(&self, channel: usize) -> Option<&[f32]> {
        self.capture.get(channel).map(Vec::as_slice)
    }

    /// 回放通道数据，上层在周期内填写
    pub fn playback_buffer_mut(&mut self, channel: usize) -> Option<&mut [f32]> {
        self.playback.get_mut(channel).map(Vec::as_mut_slice)
    }

    fn allocate(&mut self, inchannels: usize, outchannels: usize, buffer_size: usize) {
        self.buffer_size = buffer_size;
        self.capture = vec![vec![0.0; buffer_size]; inchannels];
        self.playback = vec![vec![0.0; buffer_size]; outchannels];
    }
}

impl Backend for DummyBackend {
    fn open(&mut self, params: &DriverParams) -> Result<(), DriverError> {
        let inchannels = if params.capturing {
            params.inchannels as usize
        } else {
            0
        };
        let outchannels = if params.playing {
            params.outchannels as usize
        } else {
            0
        };
        self.allocate(inchannels, outchannels, params.buffer_size as usize);
        self.cycles = 0;
        log::debug!(
            "Dummy device opened: {} in / {} out, {} frames",
            inchannels,
            outchannels,
            params.buffer_size
        );
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.capture.clear();
        self.playback.clear();
        self.running = false;
        Ok(())
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.running = false;
        Ok(())
    }

    fn read(&mut self, cycle: &CycleContext<'_>) -> Result<(), DriverError> {
        if let Some(expected) = cycle.expected_begin_us {
            let now = cycle.clock.now_us();
            if expected > now {
                cycle.clock.sleep_us(expected - now);
            }
        }

        self.cycles += 1;
        if self.fail_every > 0 && self.cycles % self.fail_every == 0 {
            return Err(DriverError::Read(-1));
        }

        for channel in &mut self.capture {
            channel.fill(0.0);
        }
        self.frames_read += self.buffer_size as u64;
        Ok(())
    }

    fn write(&mut self, cycle: &CycleContext<'_>) -> Result<(), DriverError> {
        if self.work_us > 0 {
            cycle.clock.sleep_us(self.work_us);
        }
        self.frames_written += self.buffer_size as u64;
        Ok(())
    }

    fn is_fixed_buffer_size(&self) -> bool {
        false
    }

    fn set_buffer_size(&mut self, buffer_size: u32) -> Result<(), DriverError> {
        let (inchannels, outchannels) = (self.capture.len(), self.playback.len());
        self.allocate(inchannels, outchannels, buffer_size as usize);
        Ok(())
    }
}
