//! In-memory platform.
//!
//! Useful for testing and for driving the Debug Store without hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::{DebugStore, Msr, Pid, Scheduler, Task};

/// Clock advance per read of the trace clock, in nanoseconds
const CLOCK_TICK_NS: u64 = 1_000;

#[derive(Default)]
struct State {
    cpu: usize,
    pid: Option<Pid>,
    /// Register files, one per CPU
    registers: Vec<HashMap<u32, u64>>,
    /// Pids waited for, in order
    waits: Vec<Pid>,
    switches: u64,
}

/// A platform with per-CPU register files and a settable current task
pub struct SimPlatform {
    state: Mutex<State>,
    clock: AtomicU64,
}

impl SimPlatform {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            state: Mutex::new(State {
                registers: vec![HashMap::new(); nr_cpus.max(1)],
                ..Default::default()
            }),
            clock: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `pid` the task running on `cpu`, and `cpu` the executing one.
    pub fn set_current(&self, cpu: usize, pid: Option<Pid>) {
        let mut state = self.lock();
        state.cpu = cpu;
        state.pid = pid;
    }

    /// Value of `msr` on `cpu`
    pub fn register(&self, cpu: usize, msr: u32) -> u64 {
        self.lock()
            .registers
            .get(cpu)
            .and_then(|registers| registers.get(&msr).copied())
            .unwrap_or(0)
    }

    /// Pids passed to [`Scheduler::wait_task_context_switch`]
    pub fn waited_for(&self) -> Vec<Pid> {
        self.lock().waits.clone()
    }

    pub fn context_switches(&self) -> u64 {
        self.lock().switches
    }

    /// Switches the executing CPU from `prev` to `next`.
    pub fn context_switch<P>(&self, store: &DebugStore<P>, prev: &Task, next: &Task)
    where
        P: crate::Platform,
    {
        store.on_context_switch(prev, next);

        let mut state = self.lock();
        state.pid = Some(next.pid());
        state.switches += 1;
    }
}

impl Msr for SimPlatform {
    fn read_msr(&self, msr: u32) -> u64 {
        let state = self.lock();
        state.registers[state.cpu].get(&msr).copied().unwrap_or(0)
    }

    fn write_msr(&self, msr: u32, value: u64) {
        let mut state = self.lock();
        let cpu = state.cpu;
        state.registers[cpu].insert(msr, value);
    }
}

impl Scheduler for SimPlatform {
    fn current_pid(&self) -> Option<Pid> {
        self.lock().pid
    }

    fn current_cpu(&self) -> usize {
        self.lock().cpu
    }

    fn wait_task_context_switch(&self, task: &Task) {
        // Simulated tasks never run concurrently, so they are always switched out.
        debug!("Waiting for task {} to be switched out", task.pid());
        self.lock().waits.push(task.pid());
    }

    fn clock(&self) -> u64 {
        self.clock.fetch_add(CLOCK_TICK_NS, Ordering::Relaxed) + CLOCK_TICK_NS
    }
}
