//! Cycle Driver - 驱动周期演示与压力测试
//!
//! - `run`: 在进程内引擎上运行一个 master 模拟驱动（可带若干 slave），
//!   通过 ring buffer 监控每个周期，结束时打印统计
//! - `ring`: 双线程 ring buffer 吞吐和数据完整性测试

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};

use cycle_driver::audio::{Reader, RingBuffer};
use cycle_driver::driver::{
    CycleRecord, Driver, DriverHandle, DriverInterface, DriverState, DummyBackend, ThreadOptions,
    ThreadedDriver,
};
use cycle_driver::engine::{Engine, EngineControl, LocalEngine};

#[derive(Parser)]
#[command(name = "cycle-driver")]
#[command(about = "Real-time audio driver cycle core", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated master driver (and optional slaves) on a local engine
    Run(RunArgs),

    /// Stress the SPSC ring buffer between two threads
    Ring(RingArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Frames per cycle
    #[arg(short, long, default_value = "256")]
    buffer_size: u32,

    /// Sample rate in Hz
    #[arg(short = 'r', long, default_value = "48000")]
    sample_rate: u32,

    /// Number of slave drivers driven by the master
    #[arg(long, default_value = "0")]
    slaves: usize,

    /// Stop after this many cycles (default: run until Ctrl+C)
    #[arg(short = 'n', long)]
    cycles: Option<u64>,

    /// Request SCHED_FIFO scheduling for the driver thread
    #[arg(long)]
    realtime: bool,

    /// Real-time priority
    #[arg(long, default_value = "70")]
    priority: i32,

    /// Simulated processing time per cycle in microseconds
    #[arg(long, default_value = "0")]
    load_us: u64,

    /// Make every Nth device read fail (0 = never)
    #[arg(long, default_value = "0")]
    fail_every: u64,

    /// Master driver client name
    #[arg(long, default_value = "system")]
    name: String,

    /// Monitor ring buffer size in bytes
    #[arg(long, default_value = "65536")]
    monitor_buffer: usize,
}

#[derive(Args)]
struct RingArgs {
    /// Ring buffer size in bytes (rounded up to a power of two)
    #[arg(short, long, default_value = "65536")]
    size: usize,

    /// Total bytes to transfer
    #[arg(short, long, default_value = "268435456")]
    bytes: u64,

    /// Writer chunk size in bytes
    #[arg(short, long, default_value = "4096")]
    chunk: usize,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Run(ref args) => run_driver(args),
        Commands::Ring(ref args) => ring_stress(args),
    }
}

/// 监控线程看到的周期汇总
#[derive(Debug, Default)]
struct Monitor {
    records: u64,
    xruns: u64,
    failed: u64,
    null: u64,
}

impl Monitor {
    /// 取走 ring buffer 里所有完整记录
    fn drain(&mut self, reader: &mut Reader) {
        let mut buf = [0u8; CycleRecord::ENCODED_LEN];
        while reader.read_space() >= CycleRecord::ENCODED_LEN {
            reader.read(&mut buf);
            let record = CycleRecord::decode(&buf);
            self.records += 1;
            if record.null {
                self.null += 1;
            }
            if record.failed {
                self.failed += 1;
            }
            if record.xrun {
                self.xruns += 1;
                log::warn!(
                    "XRun: cycle at {} us took {} us (delayed {:.0} us)",
                    record.begin_us,
                    record.duration_us(),
                    record.delayed_us
                );
            }
        }
    }
}

fn run_driver(args: &RunArgs) -> anyhow::Result<()> {
    let control = EngineControl {
        buffer_size: args.buffer_size,
        sample_rate: args.sample_rate,
        real_time: args.realtime,
        priority: args.priority,
        ..EngineControl::default()
    };
    let engine = Arc::new(LocalEngine::new(control, args.slaves + 1));
    let dyn_engine: Arc<dyn Engine> = engine.clone();

    let backend = DummyBackend::new()
        .with_work_us(args.load_us)
        .with_fail_every(args.fail_every);
    let mut master = Driver::new(
        &args.name,
        "master",
        Arc::clone(&dyn_engine),
        engine.synchro_table(),
        backend,
    )?;
    master.open()?;
    master.attach()?;
    master.set_master(true);

    for i in 0..args.slaves {
        let name = format!("{}-slave-{}", args.name, i + 1);
        let mut slave = Driver::new(
            &name,
            "slave",
            Arc::clone(&dyn_engine),
            engine.synchro_table(),
            DummyBackend::new(),
        )?;
        slave.open()?;
        slave.attach()?;
        slave.start()?;
        master.add_slave(DriverHandle::new(slave))?;
    }

    master.start()?;
    let period_us = master.period_usecs();
    let stats = Arc::clone(master.stats());
    let handle = DriverHandle::new(master);

    let ring = RingBuffer::new(args.monitor_buffer)?;
    if let Err(e) = ring.mlock() {
        log::debug!("Monitor ring buffer stays unlocked: {}", e);
    }
    let (writer, mut reader) = ring.split();

    let options = ThreadOptions {
        name: "driver".to_string(),
        priority: args.realtime.then_some(args.priority),
        max_cycles: args.cycles,
    };
    let thread = ThreadedDriver::spawn(handle.clone(), options, Some(writer))?;

    let stop = thread.stop_handle();
    ctrlc::set_handler(move || stop.request_stop())?;

    println!("Cycle Driver");
    println!(
        "  {} frames @ {} Hz, period {:.3} ms, {} slave(s)",
        args.buffer_size,
        args.sample_rate,
        period_us as f64 / 1_000.0,
        args.slaves
    );
    println!("Press Ctrl+C to stop.\n");

    let mut monitor = Monitor::default();
    while thread.is_running() {
        monitor.drain(&mut reader);
        std::thread::sleep(Duration::from_millis(50));
    }
    let cycles = thread.join()?;
    monitor.drain(&mut reader);

    teardown(&handle)?;

    println!("\n{}", stats.report(period_us));
    println!(
        "Monitor: {} of {} cycles seen, {} xrun(s), {} failed, {} null",
        monitor.records, cycles, monitor.xruns, monitor.failed, monitor.null
    );
    println!("Engine: {} graph cycle(s)", engine.cycle_count());
    Ok(())
}

/// 停止并注销 master 和所有 slave
fn teardown(handle: &DriverHandle) -> anyhow::Result<()> {
    let mut master = handle.lock()?;
    if master.state() == DriverState::Started {
        master.stop()?;
    }

    let ids: Vec<_> = master.slaves().iter().map(DriverHandle::id).collect();
    for id in ids {
        if let Some(slave) = master.remove_slave(id) {
            let mut slave = slave.lock()?;
            if slave.state() == DriverState::Started {
                slave.stop()?;
            }
            slave.detach()?;
            slave.close()?;
        }
    }

    master.detach()?;
    master.close()?;
    Ok(())
}

fn pattern(offset: u64) -> u8 {
    (offset % 251) as u8
}

fn ring_stress(args: &RingArgs) -> anyhow::Result<()> {
    let ring = RingBuffer::new(args.size)?;
    let capacity = ring.capacity();
    let (mut writer, mut reader) = ring.split();
    let total = args.bytes;
    let chunk = args.chunk.max(1);

    println!(
        "Ring buffer stress: {} bytes through {} byte buffer, {} byte chunks",
        total, capacity, chunk
    );

    let start = Instant::now();
    let producer = std::thread::Builder::new()
        .name("ring-writer".to_string())
        .spawn(move || {
            let mut block = vec![0u8; chunk];
            let mut sent = 0u64;
            while sent < total {
                let n = (chunk as u64).min(total - sent) as usize;
                for (i, b) in block[..n].iter_mut().enumerate() {
                    *b = pattern(sent + i as u64);
                }
                let mut off = 0;
                while off < n {
                    let written = writer.write(&block[off..n]);
                    if written == 0 {
                        std::thread::yield_now();
                    }
                    off += written;
                }
                sent += n as u64;
            }
        })?;

    let mut received = 0u64;
    let mut corrupted = 0u64;
    while received < total {
        let n = {
            let [first, second] = reader.read_vector();
            for (i, &byte) in first.iter().chain(second.iter()).enumerate() {
                if byte != pattern(received + i as u64) {
                    corrupted += 1;
                }
            }
            first.len() + second.len()
        };
        if n == 0 {
            std::thread::yield_now();
            continue;
        }
        reader.read_advance(n);
        received += n as u64;
    }

    producer
        .join()
        .map_err(|_| anyhow::anyhow!("ring writer thread panicked"))?;

    let elapsed = start.elapsed();
    let mib = received as f64 / (1024.0 * 1024.0);
    println!(
        "Transferred {:.1} MiB in {:.3} s ({:.1} MiB/s)",
        mib,
        elapsed.as_secs_f64(),
        mib / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    if corrupted > 0 {
        anyhow::bail!("{} corrupted bytes", corrupted);
    }
    println!("All bytes verified.");
    Ok(())
}
