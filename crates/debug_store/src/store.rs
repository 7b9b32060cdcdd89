use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::area::Window;
use crate::context::DsContext;
use crate::{BtsFormat, DsConfiguration, DsError, Platform, DS_ALIGNMENT};

/// First linear address handed out to trace buffers.
const LINEAR_BASE: u64 = 0x0010_0000;

/// Trace buffers are mapped below this address so that 4-byte fields can hold them.
const LINEAR_LIMIT: u64 = 0xffff_0000;

const LINEAR_GRANULE: u64 = 0x1000;

pub(crate) struct Registry {
    pub cpu_contexts: Vec<Option<Arc<DsContext>>>,
    /// Outstanding tracers: positive counts per-thread, negative per-cpu
    tracers: i64,
    next_linear: u64,
}

/// Owner of all Debug Store state of one system.
///
/// Holds the configuration, the per-CPU context slots and the tracer
/// allocation counter behind one lock. Task contexts live in their
/// [`crate::Task`] but are only installed or removed under that lock.
pub struct DebugStore<P: Platform> {
    pub(crate) config: DsConfiguration,
    pub(crate) format: BtsFormat,
    pub(crate) platform: Arc<P>,
    registry: Mutex<Registry>,
    next_tracer_id: AtomicU64,
}

impl<P: Platform> DebugStore<P> {
    pub fn new(config: DsConfiguration, nr_cpus: usize, platform: Arc<P>) -> Result<Self, DsError> {
        if config.sizeof_ptr_field != 4 && config.sizeof_ptr_field != 8 {
            return Err(DsError::InvalidArgument("pointer field width must be 4 or 8"));
        }
        if nr_cpus == 0 {
            return Err(DsError::InvalidArgument("no cpus"));
        }

        Ok(Self {
            format: BtsFormat::new(&config),
            config,
            platform,
            registry: Mutex::new(Registry {
                cpu_contexts: vec![None; nr_cpus],
                tracers: 0,
                next_linear: LINEAR_BASE,
            }),
            next_tracer_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &DsConfiguration {
        &self.config
    }

    pub fn format(&self) -> &BtsFormat {
        &self.format
    }

    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    pub(crate) fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_tracer_id(&self) -> u64 {
        self.next_tracer_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The context bound to `cpu`, if any
    pub fn cpu_context(&self, cpu: usize) -> Option<Arc<DsContext>> {
        self.lock_registry().cpu_contexts.get(cpu).cloned().flatten()
    }

    /// Reserves a tracer of one allocation type.
    ///
    /// Per-thread and per-cpu tracers exclude each other system-wide.
    pub fn acquire_allocation_slot(&self, per_thread: bool) -> Result<(), DsError> {
        let mut registry = self.lock_registry();

        if per_thread {
            if registry.tracers < 0 {
                return Err(DsError::PermissionDenied("per-cpu tracers are in use"));
            }
            registry.tracers += 1;
        } else {
            if registry.tracers > 0 {
                return Err(DsError::PermissionDenied("per-thread tracers are in use"));
            }
            registry.tracers -= 1;
        }

        Ok(())
    }

    pub fn release_allocation_slot(&self, per_thread: bool) {
        let mut registry = self.lock_registry();
        if per_thread {
            registry.tracers -= 1;
        } else {
            registry.tracers += 1;
        }
    }

    /// Outstanding tracers: positive counts per-thread, negative per-cpu
    pub fn allocation_count(&self) -> i64 {
        self.lock_registry().tracers
    }

    /// Maps `data` at a fresh linear address.
    ///
    /// The address keeps the buffer's offset from [`DS_ALIGNMENT`] so that
    /// alignment adjustments see the real placement.
    pub(crate) fn map_buffer(&self, data: Vec<u8>) -> Window {
        let mut registry = self.lock_registry();

        let misalignment = data.as_ptr() as u64 % DS_ALIGNMENT as u64;
        let span = (data.len() as u64 + misalignment).next_multiple_of(LINEAR_GRANULE);
        if registry.next_linear + span > LINEAR_LIMIT {
            registry.next_linear = LINEAR_BASE;
        }

        let base = registry.next_linear + misalignment;
        registry.next_linear += span;
        Window::new(base, data)
    }
}
