//! 进程内引擎
//!
//! 固定大小的客户端表 + 回环图：resume 唤醒驱动自己的同步原语，
//! suspend 再把它收回来，相当于一个没有外部客户端的图。
//! 命令行和测试都用它来驱动真实的周期。

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    synchro_table, ClientControl, Engine, EngineControl, EngineError, GraphManager, RefNum,
    SynchroTable,
};

/// 回环图管理器
#[derive(Debug, Default)]
pub struct LocalGraph;

impl LocalGraph {
    fn slot<'a>(
        control: &ClientControl,
        table: &'a SynchroTable,
    ) -> Result<&'a dyn super::Synchro, EngineError> {
        let refnum = control
            .refnum
            .ok_or_else(|| EngineError::NotRegistered(control.name.to_string()))?;
        table
            .get(refnum.0)
            .map(|s| s.as_ref())
            .ok_or(EngineError::UnknownRefNum(refnum))
    }
}

impl GraphManager for LocalGraph {
    fn resume_ref_num(
        &self,
        control: &ClientControl,
        table: &SynchroTable,
    ) -> Result<(), EngineError> {
        Self::slot(control, table)?.signal();
        Ok(())
    }

    fn suspend_ref_num(
        &self,
        control: &ClientControl,
        table: &SynchroTable,
        timeout_usecs: u64,
    ) -> Result<(), EngineError> {
        if Self::slot(control, table)?.timed_wait(timeout_usecs) {
            Ok(())
        } else {
            Err(EngineError::Timeout(timeout_usecs))
        }
    }
}

/// 进程内引擎
pub struct LocalEngine {
    control: Mutex<EngineControl>,
    clients: Mutex<Vec<Option<String>>>,
    graph: Arc<LocalGraph>,
    table: SynchroTable,

    cycles: AtomicU64,
    xruns: AtomicU64,
    // f32 位模式
    last_xrun_delay: AtomicU32,
    last_xrun_usecs: AtomicU64,
    buffer_size_changes: AtomicU64,
    sample_rate_changes: AtomicU64,
}

impl LocalEngine {
    /// 创建最多容纳 `max_clients` 个客户端的引擎
    pub fn new(control: EngineControl, max_clients: usize) -> Self {
        Self {
            control: Mutex::new(control),
            clients: Mutex::new(vec![None; max_clients]),
            graph: Arc::new(LocalGraph),
            table: synchro_table(max_clients),
            cycles: AtomicU64::new(0),
            xruns: AtomicU64::new(0),
            last_xrun_delay: AtomicU32::new(0),
            last_xrun_usecs: AtomicU64::new(0),
            buffer_size_changes: AtomicU64::new(0),
            sample_rate_changes: AtomicU64::new(0),
        }
    }

    /// 引擎持有的同步表（注入到驱动）
    pub fn synchro_table(&self) -> SynchroTable {
        Arc::clone(&self.table)
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn xrun_count(&self) -> u64 {
        self.xruns.load(Ordering::Relaxed)
    }

    /// 最近一次 XRun 的 (周期开始时间, 延迟微秒)
    pub fn last_xrun(&self) -> Option<(u64, f32)> {
        if self.xrun_count() == 0 {
            return None;
        }
        Some((
            self.last_xrun_usecs.load(Ordering::Relaxed),
            f32::from_bits(self.last_xrun_delay.load(Ordering::Relaxed)),
        ))
    }

    pub fn buffer_size_changes(&self) -> u64 {
        self.buffer_size_changes.load(Ordering::Relaxed)
    }

    pub fn sample_rate_changes(&self) -> u64 {
        self.sample_rate_changes.load(Ordering::Relaxed)
    }

    /// 已注册客户端的名字
    pub fn client_name(&self, refnum: RefNum) -> Option<String> {
        self.lock_clients().get(refnum.0).cloned().flatten()
    }

    /// 已注册客户端数
    pub fn client_count(&self) -> usize {
        self.lock_clients().iter().filter(|c| c.is_some()).count()
    }

    fn lock_control(&self) -> MutexGuard<'_, EngineControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_clients(&self) -> MutexGuard<'_, Vec<Option<String>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Engine for LocalEngine {
    fn control(&self) -> EngineControl {
        *self.lock_control()
    }

    fn graph_manager(&self) -> Arc<dyn GraphManager> {
        self.graph.clone()
    }

    fn client_open(&self, name: &str) -> Result<RefNum, EngineError> {
        let mut clients = self.lock_clients();
        if clients.iter().flatten().any(|existing| existing == name) {
            return Err(EngineError::NameInUse(name.to_string()));
        }
        let slot = clients
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| EngineError::NoFreeRefNum(name.to_string()))?;
        clients[slot] = Some(name.to_string());

        // 新客户端从干净的同步状态开始
        self.table[slot].set_flush(true);
        self.table[slot].set_flush(false);

        log::info!("Client \"{}\" registered as {}", name, RefNum(slot));
        Ok(RefNum(slot))
    }

    fn client_close(&self, refnum: RefNum) -> Result<(), EngineError> {
        let mut clients = self.lock_clients();
        let slot = clients
            .get_mut(refnum.0)
            .ok_or(EngineError::UnknownRefNum(refnum))?;
        match slot.take() {
            Some(name) => {
                log::info!("Client \"{}\" ({}) unregistered", name, refnum);
                Ok(())
            }
            None => Err(EngineError::UnknownRefNum(refnum)),
        }
    }

    fn process(&self, _cycle_begin_us: u64, _prev_cycle_end_us: u64) -> bool {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn notify_xrun(&self, callback_usecs: u64, delayed_usecs: f32) {
        self.last_xrun_usecs.store(callback_usecs, Ordering::Relaxed);
        self.last_xrun_delay
            .store(delayed_usecs.to_bits(), Ordering::Relaxed);
        self.xruns.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "XRun at {} us, delayed {:.0} us",
            callback_usecs,
            delayed_usecs
        );
    }

    fn notify_buffer_size(&self, buffer_size: u32) {
        self.lock_control().buffer_size = buffer_size;
        self.buffer_size_changes.fetch_add(1, Ordering::Relaxed);
        log::info!("Engine buffer size now {} frames", buffer_size);
    }

    fn notify_sample_rate(&self, sample_rate: u32) {
        self.lock_control().sample_rate = sample_rate;
        self.sample_rate_changes.fetch_add(1, Ordering::Relaxed);
        log::info!("Engine sample rate now {} Hz", sample_rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ClientName;

    fn control_for(engine: &LocalEngine, name: &str) -> ClientControl {
        let mut control = ClientControl::new(ClientName::new(name).unwrap());
        control.refnum = Some(engine.client_open(name).unwrap());
        control.active = true;
        control
    }

    #[test]
    fn test_client_slots() {
        let engine = LocalEngine::new(EngineControl::default(), 2);
        let a = engine.client_open("a").unwrap();
        let b = engine.client_open("b").unwrap();
        assert_ne!(a, b);
        assert_eq!(engine.client_count(), 2);

        assert_eq!(
            engine.client_open("c"),
            Err(EngineError::NoFreeRefNum("c".into()))
        );
        assert_eq!(
            engine.client_open("a"),
            Err(EngineError::NameInUse("a".into()))
        );

        engine.client_close(a).unwrap();
        assert_eq!(engine.client_name(a), None);
        assert_eq!(engine.client_close(a), Err(EngineError::UnknownRefNum(a)));
        assert_eq!(engine.client_open("c").unwrap(), a);
    }

    #[test]
    fn test_loopback_graph_cycle() {
        let engine = LocalEngine::new(EngineControl::default(), 4);
        let table = engine.synchro_table();
        let control = control_for(&engine, "system");
        let graph = engine.graph_manager();

        graph.resume_ref_num(&control, &table).unwrap();
        graph.suspend_ref_num(&control, &table, 1_000).unwrap();
        assert_eq!(
            graph.suspend_ref_num(&control, &table, 1_000),
            Err(EngineError::Timeout(1_000))
        );
    }

    #[test]
    fn test_graph_requires_registration() {
        let engine = LocalEngine::new(EngineControl::default(), 1);
        let table = engine.synchro_table();
        let control = ClientControl::new(ClientName::new("ghost").unwrap());
        assert_eq!(
            engine.graph_manager().resume_ref_num(&control, &table),
            Err(EngineError::NotRegistered("ghost".into()))
        );
    }

    #[test]
    fn test_notifications_update_control() {
        let engine = LocalEngine::new(EngineControl::default(), 1);
        engine.notify_buffer_size(256);
        engine.notify_sample_rate(96_000);
        engine.notify_xrun(1_234, 56.0);

        let control = engine.control();
        assert_eq!(control.buffer_size, 256);
        assert_eq!(control.sample_rate, 96_000);
        assert_eq!(engine.buffer_size_changes(), 1);
        assert_eq!(engine.sample_rate_changes(), 1);
        assert_eq!(engine.last_xrun(), Some((1_234, 56.0)));
    }
}
