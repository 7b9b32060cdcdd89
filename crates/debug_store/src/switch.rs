use log::warn;

use crate::context::DsContext;
use crate::{
    BtsRecord, DebugStore, Platform, Qualifier, Task, BTS_TIMESTAMPS, MSR_IA32_DEBUGCTLMSR,
    MSR_IA32_DS_AREA,
};

impl<P: Platform> DebugStore<P> {
    /// Writes a task-switch event into the context's BTS buffer if its
    /// master collects timestamps.
    fn take_timestamp(&self, context: &DsContext, task: &Task, clock: u64, arrives: bool) {
        let mut inner = context.lock();
        if !inner
            .master(Qualifier::Bts)
            .is_some_and(|master| master.flags & BTS_TIMESTAMPS != 0)
        {
            return;
        }

        let pid = u64::from(task.pid());
        let record = if arrives {
            BtsRecord::TaskArrives { clock, pid }
        } else {
            BtsRecord::TaskDeparts { clock, pid }
        };

        match self.format.encode(&record) {
            Ok(raw) => {
                inner.write(Qualifier::Bts, self.format.record_size(), raw.as_bytes());
            }
            Err(err) => warn!("Failed to timestamp task {}: {}", task.pid(), err),
        }
    }

    /// Hands the DS registers over from `prev` to `next`.
    ///
    /// Called by the scheduler with preemption disabled; never blocks.
    pub fn on_context_switch(&self, prev: &Task, next: &Task) {
        let prev_ctx = prev.context();
        let next_ctx = next.context();
        let debugctlmsr = next.debugctlmsr();

        // Both events of one switch carry the same time.
        let clock = if prev_ctx.is_some() || next_ctx.is_some() {
            self.platform.clock()
        } else {
            0
        };

        if let Some(context) = &prev_ctx {
            self.platform.write_msr(MSR_IA32_DEBUGCTLMSR, 0);
            self.take_timestamp(context, prev, clock, false);
        }

        if let Some(context) = &next_ctx {
            self.take_timestamp(context, next, clock, true);
            self.platform
                .write_msr(MSR_IA32_DS_AREA, context.ds_address());
        }

        self.platform.write_msr(MSR_IA32_DEBUGCTLMSR, debugctlmsr);
    }

    /// Clears the DS state a forked task inherited from its parent.
    pub fn copy_thread_ds_state(&self, child: &Task) {
        let mut thread = child.lock_thread();
        thread.ds_ctx = None;
        thread.ds_area_msr = false;
        thread.debugctlmsr = 0;
        thread.debugctl_msr = false;
    }

    /// Detaches the DS context slot of an exiting task.
    ///
    /// Tracers still holding the context keep it alive until released.
    pub fn exit_thread_ds_state(&self, task: &Task) {
        let _registry = self.lock_registry();
        let mut thread = task.lock_thread();
        if thread.ds_ctx.take().is_some() {
            warn!("Task {} exits with tracers attached", task.pid());
        }
        thread.ds_area_msr = false;
    }
}
