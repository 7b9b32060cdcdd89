use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, warn};

use crate::area::{DsArea, Window};
use crate::ring;
use crate::{DebugStore, DsError, Platform, Qualifier, MSR_IA32_DS_AREA};

pub type Pid = u32;

/// Called when a trace buffer crosses its interrupt threshold
pub type OverflowCallback = Box<dyn FnMut() + Send>;

/// Per-thread Debug Store state kept alongside a task
#[derive(Default)]
pub(crate) struct ThreadDsState {
    pub ds_ctx: Option<Arc<DsContext>>,
    /// Saved debug-control register image, loaded on context switch
    pub debugctlmsr: u64,
    /// The DS area register needs switching with this task
    pub ds_area_msr: bool,
    /// The debug-control register needs switching with this task
    pub debugctl_msr: bool,
}

/// A schedulable task as seen by the Debug Store
pub struct Task {
    pid: Pid,
    thread: Mutex<ThreadDsState>,
}

impl Task {
    pub fn new(pid: Pid) -> Arc<Self> {
        Arc::new(Self {
            pid,
            thread: Mutex::new(ThreadDsState::default()),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn lock_thread(&self) -> MutexGuard<'_, ThreadDsState> {
        self.thread.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The task's DS context, if one is installed
    pub fn context(&self) -> Option<Arc<DsContext>> {
        self.lock_thread().ds_ctx.clone()
    }

    pub fn debugctlmsr(&self) -> u64 {
        self.lock_thread().debugctlmsr
    }

    pub fn has_ds_area(&self) -> bool {
        self.lock_thread().ds_area_msr
    }

    pub fn has_debugctl(&self) -> bool {
        self.lock_thread().debugctl_msr
    }
}

/// What a tracer is attached to
#[derive(Clone)]
pub enum Target {
    Task(Arc<Task>),
    /// The CPU executing the request
    CurrentCpu,
}

impl Target {
    pub fn is_per_thread(&self) -> bool {
        matches!(self, Target::Task(_))
    }
}

#[derive(Debug)]
pub(crate) enum Owner {
    Task { pid: Pid, task: Weak<Task> },
    Cpu(usize),
}

/// The single live tracer of one sub-buffer
pub(crate) struct Master {
    pub id: u64,
    pub buffer: Window,
    /// Flags of the tracer while collection is resumed, zero while suspended
    pub flags: u32,
    pub overflow: Option<OverflowCallback>,
}

pub(crate) struct ContextInner {
    pub ds: DsArea,
    pub bts_master: Option<Master>,
    pub pebs_master: Option<Master>,
    count: usize,
}

impl ContextInner {
    pub fn master(&self, qual: Qualifier) -> Option<&Master> {
        match qual {
            Qualifier::Bts => self.bts_master.as_ref(),
            Qualifier::Pebs => self.pebs_master.as_ref(),
        }
    }

    pub fn master_slot(&mut self, qual: Qualifier) -> &mut Option<Master> {
        match qual {
            Qualifier::Bts => &mut self.bts_master,
            Qualifier::Pebs => &mut self.pebs_master,
        }
    }

    /// Appends raw records to the `qual` buffer of the current master.
    ///
    /// Returns the number of bytes written, zero if there is no master.
    pub fn write(&mut self, qual: Qualifier, rec_size: usize, record: &[u8]) -> usize {
        let ContextInner {
            ds,
            bts_master,
            pebs_master,
            ..
        } = self;
        let master = match qual {
            Qualifier::Bts => bts_master.as_mut(),
            Qualifier::Pebs => pebs_master.as_mut(),
        };
        let Some(Master {
            buffer, overflow, ..
        }) = master
        else {
            return 0;
        };

        ring::write_records(ds, buffer, qual, rec_size, record, &mut || {
            if let Some(callback) = overflow.as_mut() {
                callback();
            }
        })
    }
}

/// The Debug Store context of one task or one CPU.
///
/// Owns the hardware-visible descriptor and the buffers of the BTS and
/// PEBS masters. Reference-counted by the tracers using it.
pub struct DsContext {
    owner: Owner,
    address: u64,
    inner: Mutex<ContextInner>,
}

impl DsContext {
    fn new(owner: Owner, ds: DsArea) -> Self {
        Self {
            owner,
            address: ds.address(),
            inner: Mutex::new(ContextInner {
                ds,
                bts_master: None,
                pebs_master: None,
                count: 0,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ContextInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Address of the descriptor, as loaded into the DS area register
    pub fn ds_address(&self) -> u64 {
        self.address
    }

    /// Number of tracers holding this context
    pub fn use_count(&self) -> usize {
        self.lock().count
    }

    pub fn pid(&self) -> Option<Pid> {
        match self.owner {
            Owner::Task { pid, .. } => Some(pid),
            Owner::Cpu(_) => None,
        }
    }

    pub fn cpu(&self) -> Option<usize> {
        match self.owner {
            Owner::Task { .. } => None,
            Owner::Cpu(cpu) => Some(cpu),
        }
    }

    pub(crate) fn task(&self) -> Option<Arc<Task>> {
        match &self.owner {
            Owner::Task { task, .. } => task.upgrade(),
            Owner::Cpu(_) => None,
        }
    }

    pub fn is_per_thread(&self) -> bool {
        matches!(self.owner, Owner::Task { .. })
    }

    pub fn has_master(&self, qual: Qualifier) -> bool {
        self.lock().master(qual).is_some()
    }
}

impl<P: Platform> DebugStore<P> {
    /// True if the context belongs to a CPU or to the running task, i.e. its
    /// registers are live on the executing CPU.
    pub(crate) fn is_live(&self, context: &DsContext) -> bool {
        match context.owner {
            Owner::Cpu(cpu) => self.platform.current_cpu() == cpu,
            Owner::Task { pid, .. } => self.platform.current_pid() == Some(pid),
        }
    }

    /// Fails for a CPU context bound to a CPU other than the executing one.
    ///
    /// Its registers can only be programmed from the CPU it belongs to.
    pub(crate) fn check_cpu(&self, context: &DsContext) -> Result<(), DsError> {
        match context.owner {
            Owner::Cpu(cpu) if self.platform.current_cpu() != cpu => {
                Err(DsError::PermissionDenied("context belongs to another cpu"))
            }
            _ => Ok(()),
        }
    }

    /// Returns the context of `target`, creating it on first use.
    pub fn get_context(&self, target: &Target) -> Result<Arc<DsContext>, DsError> {
        // Chances are small that a context already exists.
        let ds = DsArea::new(self.config.sizeof_ptr_field)?;

        let mut registry = self.lock_registry();

        let context = match target {
            Target::Task(task) => {
                let mut thread = task.lock_thread();
                match thread.ds_ctx.clone() {
                    Some(context) => context,
                    None => {
                        let context = Arc::new(DsContext::new(
                            Owner::Task {
                                pid: task.pid(),
                                task: Arc::downgrade(task),
                            },
                            ds,
                        ));
                        thread.ds_ctx = Some(context.clone());
                        thread.ds_area_msr = true;
                        if self.platform.current_pid() == Some(task.pid()) {
                            self.platform.write_msr(MSR_IA32_DS_AREA, context.ds_address());
                        }
                        debug!("New context for task {}", task.pid());
                        context
                    }
                }
            }
            Target::CurrentCpu => {
                let cpu = self.platform.current_cpu();
                let slot = registry
                    .cpu_contexts
                    .get_mut(cpu)
                    .ok_or(DsError::InvalidArgument("cpu index out of range"))?;
                match slot.clone() {
                    Some(context) => context,
                    None => {
                        let context = Arc::new(DsContext::new(Owner::Cpu(cpu), ds));
                        *slot = Some(context.clone());
                        self.platform.write_msr(MSR_IA32_DS_AREA, context.ds_address());
                        debug!("New context for cpu {}", cpu);
                        context
                    }
                }
            }
        };

        context.lock().count += 1;
        Ok(context)
    }

    /// Drops one reference to `context`, tearing it down with the last one.
    ///
    /// Tearing down another task's context waits for that task to be
    /// switched out, so the DS area register no longer refers to it.
    pub fn put_context(&self, context: Arc<DsContext>) {
        let mut registry = self.lock_registry();

        {
            let mut inner = context.lock();
            if inner.count == 0 {
                warn!("Context {:#x} released too often", context.ds_address());
                return;
            }
            inner.count -= 1;
            if inner.count > 0 {
                return;
            }
        }

        let wait_for = match &context.owner {
            Owner::Task { pid, task } => {
                let task = task.upgrade();
                if let Some(task) = &task {
                    let mut thread = task.lock_thread();
                    if thread
                        .ds_ctx
                        .as_ref()
                        .is_some_and(|installed| Arc::ptr_eq(installed, &context))
                    {
                        thread.ds_ctx = None;
                    }
                    thread.ds_area_msr = false;
                }
                if self.platform.current_pid() == Some(*pid) {
                    self.platform.write_msr(MSR_IA32_DS_AREA, 0);
                    None
                } else {
                    task
                }
            }
            Owner::Cpu(cpu) => {
                if let Some(slot) = registry.cpu_contexts.get_mut(*cpu) {
                    *slot = None;
                }
                if self.platform.current_cpu() == *cpu {
                    self.platform.write_msr(MSR_IA32_DS_AREA, 0);
                } else {
                    warn!(
                        "Context of cpu {} freed from cpu {}, its DS area register is stale",
                        cpu,
                        self.platform.current_cpu()
                    );
                }
                None
            }
        };
        drop(registry);

        if let Some(task) = wait_for {
            self.platform.wait_task_context_switch(&task);
        }

        debug!("Freed context {:#x}", context.ds_address());
    }
}
