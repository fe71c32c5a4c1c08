//! 驱动通用实现
//!
//! `Driver<B>` 把设备后端 `B` 包装成完整的 [`DriverInterface`]：
//!
//! - 状态机：`Closed → Opened → Attached → Started ⇄ Stopped → Detached → Closed`
//! - master/slave 组合：slave 按加入顺序运行，单个 slave 失败不影响后面的 slave
//! - 周期计时：按理想时间表检测丢周期和超时周期，作为 XRun 通知引擎
//! - 通知：XRun / buffer size / sample rate 转发给引擎
//!
//! 一个周期（`process`）的顺序：
//! 1. 后端 `read`（阻塞式设备在这里等硬件）
//! 2. 记录开始时间
//! 3. 引擎 `process`，图管理器唤醒客户端
//! 4. master 驱动所有 slave
//! 5. 等待图完成，后端 `write`
//! 6. 记录结束时间，推进时间表
//!
//! 设备读写失败只让本周期返回错误，计时和通知照常完成。

use std::sync::Arc;

use crate::audio::timing::{Clock, MonotonicClock};
use crate::engine::{
    ClientControl, Engine, EngineControl, EngineError, GraphManager, Notification, RefNum,
    SynchroTable,
};

use super::cycle::{CycleRecord, CycleTimer};
use super::params::{ClientName, DriverParams};
use super::stats::CycleStats;
use super::{
    Backend, CycleContext, DriverError, DriverHandle, DriverId, DriverInterface, DriverState,
};

/// 通用驱动
pub struct Driver<B: Backend> {
    id: DriverId,
    alias_name: ClientName,
    capture_driver_name: ClientName,
    playback_driver_name: ClientName,
    capture_latency: u32,
    playback_latency: u32,
    params: Option<DriverParams>,

    timer: CycleTimer,
    last_cycle: CycleRecord,
    stats: Arc<CycleStats>,

    engine: Arc<dyn Engine>,
    graph_manager: Arc<dyn GraphManager>,
    synchro_table: SynchroTable,
    control: EngineControl,
    client_control: ClientControl,
    clock: Arc<dyn Clock>,

    slaves: Vec<DriverHandle>,
    is_master: bool,
    // 拥有本驱动的 master；设置后只能在 master 的周期内运行
    slave_of: Option<DriverId>,
    state: DriverState,

    backend: B,
}

impl<B: Backend> Driver<B> {
    /// 创建绑定到引擎和同步表的驱动
    ///
    /// 名字超过 [`CLIENT_NAME_SIZE`](super::CLIENT_NAME_SIZE) 时返回 `NameTooLong`。
    pub fn new(
        name: &str,
        alias: &str,
        engine: Arc<dyn Engine>,
        synchro_table: SynchroTable,
        backend: B,
    ) -> Result<Self, DriverError> {
        let name = ClientName::new(name)?;
        let alias_name = ClientName::new(alias)?;
        let control = engine.control();
        let graph_manager = engine.graph_manager();

        Ok(Self {
            id: DriverId::next(),
            alias_name,
            capture_driver_name: ClientName::default(),
            playback_driver_name: ClientName::default(),
            capture_latency: 0,
            playback_latency: 0,
            params: None,
            timer: CycleTimer::new(control.period_usecs()),
            last_cycle: CycleRecord::default(),
            stats: Arc::new(CycleStats::new()),
            engine,
            graph_manager,
            synchro_table,
            control,
            client_control: ClientControl::new(name),
            clock: Arc::new(MonotonicClock),
            slaves: Vec::new(),
            is_master: false,
            slave_of: None,
            state: DriverState::Closed,
            backend,
        })
    }

    /// 替换时间源（测试和离线模拟）
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn alias(&self) -> &str {
        self.alias_name.as_str()
    }

    pub fn capture_driver_name(&self) -> &str {
        self.capture_driver_name.as_str()
    }

    pub fn playback_driver_name(&self) -> &str {
        self.playback_driver_name.as_str()
    }

    pub fn capture_latency(&self) -> u32 {
        self.capture_latency
    }

    pub fn playback_latency(&self) -> u32 {
        self.playback_latency
    }

    /// 协商后的参数（未打开时为 None）
    pub fn params(&self) -> Option<&DriverParams> {
        self.params.as_ref()
    }

    /// 驱动持有的引擎参数副本
    pub fn engine_control(&self) -> &EngineControl {
        &self.control
    }

    pub fn timer(&self) -> &CycleTimer {
        &self.timer
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn require(&self, op: &'static str, allowed: &[DriverState]) -> Result<(), DriverError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(DriverError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    /// 调用后端读写；上下文只借用计时器、参数和时钟
    fn device_io(&mut self, write: bool) -> Result<(), DriverError> {
        let ctx = CycleContext {
            expected_begin_us: self.timer.expected_begin_us(),
            period_us: self.timer.period_us(),
            buffer_size: self.control.buffer_size,
            sample_rate: self.control.sample_rate,
            clock: self.clock.as_ref(),
        };
        if write {
            self.backend.write(&ctx)
        } else {
            self.backend.read(&ctx)
        }
    }

    /// 记录周期开始；丢周期时通知 XRun
    fn cycle_take_begin_time(&mut self) -> bool {
        let now = self.clock.now_us();
        match self.timer.take_begin_time(now) {
            Some(gap) => {
                self.notify_xrun(now, gap as f32);
                true
            }
            None => false,
        }
    }

    /// 记录周期结束；超出名义周期时通知 XRun
    fn cycle_take_end_time(&mut self) -> bool {
        let now = self.clock.now_us();
        let delayed = self.timer.take_end_time(now);
        if delayed > 0.0 {
            self.notify_xrun(self.timer.begin_us(), delayed);
            true
        } else {
            false
        }
    }

    fn cycle_inc_time(&mut self) {
        self.timer.inc_time();
    }

    fn finish_cycle(&mut self, xrun: bool, failed: bool, null: bool) {
        self.last_cycle = CycleRecord {
            begin_us: self.timer.begin_us(),
            end_us: self.timer.end_us(),
            delayed_us: self.timer.delayed_us(),
            xrun,
            failed,
            null,
        };
        self.stats.on_cycle(&self.last_cycle);
    }

    /// freewheel 时把驱动自己的同步原语切到 flush 模式
    fn setup_driver_sync(&self, refnum: RefNum, freewheel: bool) -> Result<(), DriverError> {
        let synchro = self
            .synchro_table
            .get(refnum.0)
            .ok_or(EngineError::UnknownRefNum(refnum))?;
        synchro.set_flush(freewheel);
        log::debug!(
            "Driver {} sync {} for {}",
            self.name(),
            if freewheel { "flushing" } else { "restored" },
            refnum
        );
        Ok(())
    }

    fn notify_xrun(&self, callback_usecs: u64, delayed_usecs: f32) {
        self.stats.record_xrun();
        self.engine.notify_xrun(callback_usecs, delayed_usecs);
    }

    fn notify_buffer_size(&self, buffer_size: u32) {
        self.engine.notify_buffer_size(buffer_size);
    }

    fn notify_sample_rate(&self, sample_rate: u32) {
        self.engine.notify_sample_rate(sample_rate);
    }

    /// 运行所有 slave；`null` 为 true 时运行它们的空周期
    fn run_slaves(&self, null: bool) -> Result<(), DriverError> {
        let total = self.slaves.len();
        let mut failed = 0;

        for slave in &self.slaves {
            let result = slave
                .try_lock()
                .and_then(|mut driver| driver.process_as_slave(self.id, null));
            if let Err(e) = result {
                failed += 1;
                log::debug!("Slave {} cycle failed: {}", slave.id(), e);
            }
        }

        if failed > 0 {
            Err(DriverError::SlavesFailed { failed, total })
        } else {
            Ok(())
        }
    }

    /// 把重新协商的参数推给所有 slave，保持同一节拍
    fn sync_slaves(
        &self,
        what: &str,
        apply: impl Fn(&mut (dyn DriverInterface + 'static)) -> Result<(), DriverError>,
    ) -> Result<(), DriverError> {
        let total = self.slaves.len();
        let mut failed = 0;

        for slave in &self.slaves {
            if let Err(e) = slave.lock().and_then(|mut driver| apply(&mut *driver)) {
                failed += 1;
                log::warn!("Slave {} did not follow {} change: {}", slave.id(), what, e);
            }
        }

        if failed > 0 {
            Err(DriverError::SlavesFailed { failed, total })
        } else {
            Ok(())
        }
    }

    fn run_cycle(&mut self) -> Result<(), DriverError> {
        self.require("process", &[DriverState::Started])?;

        let mut first_error = None;

        let read = self.device_io(false);
        keep_first(&mut first_error, read);

        let mut xrun = self.cycle_take_begin_time();

        let graph = self.run_graph(false);
        keep_first(&mut first_error, graph);

        let write = self.device_io(true);
        keep_first(&mut first_error, write);

        xrun |= self.cycle_take_end_time();
        self.cycle_inc_time();
        self.finish_cycle(xrun, first_error.is_some(), false);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn run_null_cycle(&mut self) -> Result<(), DriverError> {
        self.require(
            "process_null",
            &[
                DriverState::Attached,
                DriverState::Started,
                DriverState::Stopped,
            ],
        )?;

        let now = self.clock.now_us();
        self.timer.take_begin_time(now);

        let result = self.run_graph(true);

        let now = self.clock.now_us();
        self.timer.take_end_time(now);
        self.cycle_inc_time();
        self.finish_cycle(false, result.is_err(), true);
        result
    }

    /// 唤醒客户端、驱动 slave，再等待图完成
    fn run_graph(&self, null: bool) -> Result<(), DriverError> {
        let begin = self.timer.begin_us();
        let prev_end = self.timer.end_us();
        if !self.engine.process(begin, prev_end) {
            log::debug!("Driver {}: engine process error", self.name());
        }

        self.graph_manager
            .resume_ref_num(&self.client_control, &self.synchro_table)?;

        let slaves = if self.is_master {
            self.run_slaves(null)
        } else {
            Ok(())
        };

        self.graph_manager.suspend_ref_num(
            &self.client_control,
            &self.synchro_table,
            self.control.timeout_usecs,
        )?;
        slaves
    }
}

/// 保留第一个错误
fn keep_first(first: &mut Option<DriverError>, result: Result<(), DriverError>) {
    if let Err(e) = result {
        if first.is_none() {
            *first = Some(e);
        }
    }
}

impl<B: Backend> DriverInterface for Driver<B> {
    fn id(&self) -> DriverId {
        self.id
    }

    fn name(&self) -> &str {
        self.client_control.name.as_str()
    }

    fn state(&self) -> DriverState {
        self.state
    }

    fn open(&mut self) -> Result<(), DriverError> {
        let params = DriverParams::from_control(&self.engine.control());
        self.open_with(&params)
    }

    fn open_with(&mut self, params: &DriverParams) -> Result<(), DriverError> {
        self.require("open", &[DriverState::Closed])?;
        let (capture_name, playback_name) = params.validate()?;

        self.backend.open(params)?;

        self.capture_driver_name = capture_name;
        self.playback_driver_name = playback_name;
        self.capture_latency = params.capture_latency;
        self.playback_latency = params.playback_latency;

        let engine_control = self.engine.control();
        self.control = EngineControl {
            buffer_size: params.buffer_size,
            sample_rate: params.sample_rate,
            ..engine_control
        };
        self.timer.set_period(self.control.period_usecs());
        self.params = Some(params.clone());
        self.state = DriverState::Opened;

        if engine_control.buffer_size != params.buffer_size {
            self.notify_buffer_size(params.buffer_size);
        }
        if engine_control.sample_rate != params.sample_rate {
            self.notify_sample_rate(params.sample_rate);
        }

        log::info!(
            "Driver {} opened: {} frames @ {} Hz, capture {} ({}ch, latency {}), playback {} ({}ch, latency {})",
            self.name(),
            params.buffer_size,
            params.sample_rate,
            params.capturing,
            params.inchannels,
            params.capture_latency,
            params.playing,
            params.outchannels,
            params.playback_latency
        );
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        match self.state {
            DriverState::Closed => Ok(()),
            DriverState::Opened | DriverState::Detached => {
                self.backend.close()?;
                self.params = None;
                self.state = DriverState::Closed;
                log::info!("Driver {} closed", self.name());
                Ok(())
            }
            state => Err(DriverError::InvalidState { op: "close", state }),
        }
    }

    fn attach(&mut self) -> Result<(), DriverError> {
        self.require("attach", &[DriverState::Opened, DriverState::Detached])?;

        let refnum = self.engine.client_open(self.client_control.name.as_str())?;
        self.client_control.refnum = Some(refnum);
        self.client_control.active = true;
        self.state = DriverState::Attached;
        log::debug!("Driver {} attached as {}", self.name(), refnum);
        Ok(())
    }

    fn detach(&mut self) -> Result<(), DriverError> {
        self.require("detach", &[DriverState::Attached, DriverState::Stopped])?;

        if let Some(refnum) = self.client_control.refnum.take() {
            self.engine.client_close(refnum)?;
        }
        self.client_control.active = false;
        self.state = DriverState::Detached;
        log::debug!("Driver {} detached", self.name());
        Ok(())
    }

    fn read(&mut self) -> Result<(), DriverError> {
        self.require("read", &[DriverState::Started])?;
        self.device_io(false)
    }

    fn write(&mut self) -> Result<(), DriverError> {
        self.require("write", &[DriverState::Started])?;
        self.device_io(true)
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.require("start", &[DriverState::Attached, DriverState::Stopped])?;
        self.backend.start()?;
        self.timer.reset();
        self.state = DriverState::Started;
        log::info!("Driver {} started", self.name());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.require("stop", &[DriverState::Started])?;
        self.backend.stop()?;
        self.state = DriverState::Stopped;
        log::info!("Driver {} stopped", self.name());
        Ok(())
    }

    fn is_fixed_buffer_size(&self) -> bool {
        self.backend.is_fixed_buffer_size()
    }

    fn set_buffer_size(&mut self, buffer_size: u32) -> Result<(), DriverError> {
        if buffer_size == 0 {
            return Err(DriverError::InvalidBufferSize(buffer_size));
        }
        if buffer_size == self.control.buffer_size {
            return Ok(());
        }
        if self.backend.is_fixed_buffer_size() {
            return Err(DriverError::FixedBufferSize {
                current: self.control.buffer_size,
                requested: buffer_size,
            });
        }

        self.backend.set_buffer_size(buffer_size)?;
        self.control.buffer_size = buffer_size;
        self.timer.set_period(self.control.period_usecs());
        if let Some(params) = self.params.as_mut() {
            params.buffer_size = buffer_size;
        }
        log::info!("Driver {} buffer size now {} frames", self.name(), buffer_size);

        let slaves = self.sync_slaves("buffer size", |d| d.set_buffer_size(buffer_size));
        // slave 的变化由 master 统一通知
        if self.slave_of.is_none() {
            self.notify_buffer_size(buffer_size);
        }
        slaves
    }

    fn set_sample_rate(&mut self, sample_rate: u32) -> Result<(), DriverError> {
        if sample_rate == 0 {
            return Err(DriverError::InvalidSampleRate(sample_rate));
        }
        if sample_rate == self.control.sample_rate {
            return Ok(());
        }

        self.backend.set_sample_rate(sample_rate)?;
        self.control.sample_rate = sample_rate;
        self.timer.set_period(self.control.period_usecs());
        if let Some(params) = self.params.as_mut() {
            params.sample_rate = sample_rate;
        }
        log::info!("Driver {} sample rate now {} Hz", self.name(), sample_rate);

        let slaves = self.sync_slaves("sample rate", |d| d.set_sample_rate(sample_rate));
        if self.slave_of.is_none() {
            self.notify_sample_rate(sample_rate);
        }
        slaves
    }

    fn process(&mut self) -> Result<(), DriverError> {
        if let Some(master) = self.slave_of {
            return Err(DriverError::DrivenByMaster(master));
        }
        self.run_cycle()
    }

    fn process_null(&mut self) -> Result<(), DriverError> {
        if let Some(master) = self.slave_of {
            return Err(DriverError::DrivenByMaster(master));
        }
        self.run_null_cycle()
    }

    fn process_as_slave(&mut self, master: DriverId, null: bool) -> Result<(), DriverError> {
        match self.slave_of {
            Some(owner) if owner == master => {
                if null {
                    self.run_null_cycle()
                } else {
                    self.run_cycle()
                }
            }
            Some(owner) => Err(DriverError::DrivenByMaster(owner)),
            None => Err(DriverError::NotSlaveOf(master)),
        }
    }

    fn slave_of(&self) -> Option<DriverId> {
        self.slave_of
    }

    fn set_slave_of(&mut self, master: Option<DriverId>) {
        self.slave_of = master;
    }

    fn set_master(&mut self, on: bool) {
        self.is_master = on;
    }

    fn is_master(&self) -> bool {
        self.is_master
    }

    fn add_slave(&mut self, slave: DriverHandle) -> Result<(), DriverError> {
        if !self.is_master {
            return Err(DriverError::NotMaster(self.id));
        }
        if slave.id() == self.id {
            return Err(DriverError::SlaveIsSelf(self.id));
        }
        if self.slaves.iter().any(|s| s.id() == slave.id()) {
            return Err(DriverError::DuplicateSlave(slave.id()));
        }

        {
            let mut driver = slave.lock()?;
            if let Some(owner) = driver.slave_of() {
                return Err(DriverError::DrivenByMaster(owner));
            }
            driver.set_slave_of(Some(self.id));

            // slave 跟随 master 的节拍
            let synced = driver
                .set_sample_rate(self.control.sample_rate)
                .and_then(|()| driver.set_buffer_size(self.control.buffer_size));
            if let Err(e) = synced {
                driver.set_slave_of(None);
                return Err(e);
            }
        }

        log::debug!("Driver {} adds slave {}", self.name(), slave.id());
        self.slaves.push(slave);
        Ok(())
    }

    fn remove_slave(&mut self, id: DriverId) -> Option<DriverHandle> {
        let pos = self.slaves.iter().position(|s| s.id() == id)?;
        let slave = self.slaves.remove(pos);
        match slave.lock() {
            Ok(mut driver) => driver.set_slave_of(None),
            Err(e) => log::warn!("Slave {} not released: {}", id, e),
        }
        log::debug!("Driver {} removes slave {}", self.name(), id);
        Some(slave)
    }

    fn process_slaves(&mut self) -> Result<(), DriverError> {
        if !self.is_master {
            return Err(DriverError::NotMaster(self.id));
        }
        self.run_slaves(false)
    }

    fn slaves(&self) -> &[DriverHandle] {
        &self.slaves
    }

    fn is_real_time(&self) -> bool {
        self.control.real_time
    }

    fn client_notify(
        &mut self,
        refnum: RefNum,
        name: &str,
        notify: Notification,
        sync: bool,
        value1: i32,
        value2: i32,
    ) -> Result<(), DriverError> {
        log::debug!(
            "Driver {} notified {:?} for {} ({}) sync={} value1={} value2={}",
            self.name(),
            notify,
            name,
            refnum,
            sync,
            value1,
            value2
        );

        match notify {
            Notification::StartFreewheel | Notification::StopFreewheel => {
                let own = self
                    .client_control
                    .refnum
                    .ok_or_else(|| EngineError::NotRegistered(self.name().to_string()))?;
                self.setup_driver_sync(own, notify == Notification::StartFreewheel)
            }
            _ => Ok(()),
        }
    }

    fn client_control(&self) -> &ClientControl {
        &self.client_control
    }

    fn period_usecs(&self) -> u64 {
        self.timer.period_us()
    }

    fn last_cycle(&self) -> CycleRecord {
        self.last_cycle
    }

    fn stats(&self) -> &Arc<CycleStats> {
        &self.stats
    }
}

impl<B: Backend> Drop for Driver<B> {
    fn drop(&mut self) {
        if self.state == DriverState::Started {
            if let Err(e) = self.stop() {
                log::warn!("Driver {} stop on drop failed: {}", self.name(), e);
            }
        }
        if matches!(self.state, DriverState::Attached | DriverState::Stopped) {
            if let Err(e) = self.detach() {
                log::warn!("Driver {} detach on drop failed: {}", self.name(), e);
            }
        }
        if let Err(e) = self.close() {
            log::warn!("Driver {} close on drop failed: {}", self.name(), e);
        }

        for slave in self.slaves.drain(..) {
            match slave.try_lock() {
                Ok(mut driver) => driver.set_slave_of(None),
                Err(e) => log::debug!("Slave {} not released on drop: {}", slave.id(), e),
            }
        }
    }
}
