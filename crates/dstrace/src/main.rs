use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{debug, info, warn};

use debug_store::sim::SimPlatform;
use debug_store::{
    BtsRecord, CpuFeatures, DebugStore, DsConfiguration, ModelPreset, Target, Task, BTS_KERNEL,
    BTS_TIMESTAMPS, BTS_USER, CORE2_ATOM, CORE_I7, NETBURST, PENTIUM_M,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Model {
    Netburst,
    PentiumM,
    Core2,
    CoreI7,
}

impl Model {
    fn preset(self) -> &'static ModelPreset {
        match self {
            Model::Netburst => &NETBURST,
            Model::PentiumM => &PENTIUM_M,
            Model::Core2 => &CORE2_ATOM,
            Model::CoreI7 => &CORE_I7,
        }
    }
}

/// Branch trace store demo on a simulated CPU
#[derive(Debug, Parser)]
#[command(name = "dstrace")]
struct Command {
    /// Verbose debug output
    #[arg(short, long)]
    verbose: bool,

    #[arg(long, value_enum, default_value = "core2")]
    model: Model,

    /// Use 4-byte descriptor fields
    #[arg(long)]
    narrow: bool,

    /// Number of simulated CPUs
    #[arg(long, default_value = "1")]
    cpus: usize,

    /// Trace the task with this pid instead of the current CPU
    #[arg(long)]
    pid: Option<u32>,

    /// Trace buffer size in bytes
    #[arg(long, default_value = "256")]
    buffer_size: usize,

    /// Number of branch records to write
    #[arg(short, long, default_value = "8")]
    records: u64,

    /// Records before the end of the buffer at which overflow is signalled
    #[arg(long)]
    threshold: Option<usize>,

    /// Record task switches in the trace
    #[arg(long)]
    timestamps: bool,
}

fn format_record(record: &BtsRecord) -> String {
    match record {
        BtsRecord::Invalid => "-".to_string(),
        BtsRecord::Branch { from, to } => format!("branch {:#x} -> {:#x}", from, to),
        BtsRecord::TaskArrives { clock, pid } => format!("arrive pid={} clock={}", pid, clock),
        BtsRecord::TaskDeparts { clock, pid } => format!("depart pid={} clock={}", pid, clock),
        BtsRecord::Event {
            qualifier,
            clock,
            pid,
        } => format!("event {:#x} pid={} clock={}", qualifier, pid, clock),
    }
}

fn main() -> Result<()> {
    let opts = Command::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if opts.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let config = DsConfiguration::configure(
        opts.model.preset(),
        CpuFeatures {
            dtes64: !opts.narrow,
            bts: true,
            pebs: true,
        },
    );
    let platform = Arc::new(SimPlatform::new(opts.cpus));
    let store = DebugStore::new(config, opts.cpus, platform.clone())
        .context("Failed to set up the debug store")?;

    let mut flags = BTS_KERNEL | BTS_USER;
    if opts.timestamps {
        flags |= BTS_TIMESTAMPS;
    }

    let idle = Task::new(0);
    let traced = opts.pid.map(Task::new);
    platform.set_current(0, Some(idle.pid()));

    let target = match &traced {
        Some(task) => Target::Task(task.clone()),
        None => Target::CurrentCpu,
    };
    let mut tracer = store
        .request_bts_tracer(&target, vec![0; opts.buffer_size], None, opts.threshold, flags)
        .context("Failed to request a bts tracer")?;

    let trace = *tracer.trace();
    info!(
        "{} records of {} bytes at {:#x}, threshold {:#x}",
        trace.n, trace.size, trace.begin, trace.ith
    );

    if let Some(task) = &traced {
        platform.context_switch(&store, &idle, task);
    }

    for i in 0..opts.records {
        let branch = BtsRecord::Branch {
            from: 0x40_1000 + i * 0x10,
            to: 0x40_2000 + i * 0x10,
        };
        let written = store
            .write_bts_record(&tracer, &branch)
            .with_context(|| format!("Failed to write record {}", i))?;
        if written < store.format().record_size() {
            warn!("Record {} written short: {} bytes", i, written);
        }
        debug!("Wrote record {}", i);
    }

    if let Some(task) = &traced {
        platform.context_switch(&store, task, &idle);
    }

    let top = store.read_bts_trace(&mut tracer).top;
    let records = tracer.records().context("Failed to decode the trace")?;
    for (slot, record) in records.iter().enumerate() {
        let address = trace.begin + (slot * trace.size) as u64;
        let marker = if address == top { ">" } else { " " };
        println!("{} {:#010x} {}", marker, address, format_record(record));
    }

    store
        .release_bts_tracer(tracer)
        .context("Failed to release the bts tracer")?;
    info!(
        "Released tracer after {} context switches",
        platform.context_switches()
    );

    Ok(())
}
