use crate::context::{Pid, Task};

/// Linear address of the DS area
pub const MSR_IA32_DS_AREA: u32 = 0x600;

/// Debug control, holding the BTS enable bits
pub const MSR_IA32_DEBUGCTLMSR: u32 = 0x1d9;

/// Model-specific register access on the executing CPU
pub trait Msr {
    fn read_msr(&self, msr: u32) -> u64;

    fn write_msr(&self, msr: u32, value: u64);

    /// Orders all preceding memory writes before any later register write.
    fn serialize(&self) {}
}

/// Scheduler state the Debug Store depends on
pub trait Scheduler {
    /// Pid of the task running on the executing CPU, if any
    fn current_pid(&self) -> Option<Pid>;

    /// Index of the executing CPU
    fn current_cpu(&self) -> usize;

    /// Blocks until `task` has been switched out at least once.
    fn wait_task_context_switch(&self, task: &Task);

    /// Global trace clock used for task-switch timestamps
    fn clock(&self) -> u64;
}

/// Everything a [`crate::DebugStore`] needs from its host
pub trait Platform: Msr + Scheduler + Send + Sync {}

impl<T: Msr + Scheduler + Send + Sync> Platform for T {}
