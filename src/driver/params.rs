//! 驱动名称与 open 参数

use std::fmt;

use crate::engine::EngineControl;

use super::DriverError;

/// 客户端/设备名最大长度（字节）
pub const CLIENT_NAME_SIZE: usize = 64;

/// 有长度上限的不可变名字
///
/// 超长直接拒绝，不做截断。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ClientName(Box<str>);

impl ClientName {
    pub fn new(name: &str) -> Result<Self, DriverError> {
        if name.len() > CLIENT_NAME_SIZE {
            return Err(DriverError::NameTooLong {
                name: name.to_string(),
                max: CLIENT_NAME_SIZE,
            });
        }
        Ok(Self(name.into()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<&str> for ClientName {
    type Error = DriverError;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}

impl AsRef<str> for ClientName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 完整 open 参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverParams {
    /// 每周期帧数
    pub buffer_size: u32,
    /// 采样率（Hz）
    pub sample_rate: u32,
    /// 是否启用采集
    pub capturing: bool,
    /// 是否启用回放
    pub playing: bool,
    pub inchannels: u32,
    pub outchannels: u32,
    /// 输入直通监听
    pub monitor: bool,
    pub capture_driver_name: String,
    pub playback_driver_name: String,
    /// 额外采集延迟（帧）
    pub capture_latency: u32,
    /// 额外回放延迟（帧）
    pub playback_latency: u32,
}

impl DriverParams {
    /// 以引擎当前的 buffer size / sample rate 为基础
    pub fn from_control(control: &EngineControl) -> Self {
        Self {
            buffer_size: control.buffer_size,
            sample_rate: control.sample_rate,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(ClientName, ClientName), DriverError> {
        if self.buffer_size == 0 {
            return Err(DriverError::InvalidBufferSize(self.buffer_size));
        }
        if self.sample_rate == 0 {
            return Err(DriverError::InvalidSampleRate(self.sample_rate));
        }
        let capture = ClientName::new(&self.capture_driver_name)?;
        let playback = ClientName::new(&self.playback_driver_name)?;
        Ok((capture, playback))
    }
}

impl Default for DriverParams {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            sample_rate: 48_000,
            capturing: true,
            playing: true,
            inchannels: 2,
            outchannels: 2,
            monitor: false,
            capture_driver_name: String::new(),
            playback_driver_name: String::new(),
            capture_latency: 0,
            playback_latency: 0,
        }
    }
}
