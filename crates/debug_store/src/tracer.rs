use std::fmt;
use std::sync::Arc;

use log::{debug, warn};

use crate::area::{DsField, Window};
use crate::context::{DsContext, Master, OverflowCallback, Target};
use crate::{
    BtsFormat, BtsRecord, DebugStore, DsError, DsFeature, Platform, Qualifier, DS_ALIGNMENT,
    MSR_IA32_DEBUGCTLMSR,
};

/// Collect kernel-mode branches
pub const BTS_KERNEL: u32 = 1 << 1;
/// Collect user-mode branches
pub const BTS_USER: u32 = 1 << 2;
/// Record task arrival and departure in the branch trace
pub const BTS_TIMESTAMPS: u32 = 1 << 5;

/// Geometry of a trace buffer and its current write position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DsTrace {
    /// Number of records the buffer holds
    pub n: usize,
    /// Size of one record
    pub size: usize,
    pub begin: u64,
    /// Next record to be written
    pub top: u64,
    pub end: u64,
    /// Interrupt threshold
    pub ith: u64,
    pub flags: u32,
}

impl DsTrace {
    /// Lays out `size` bytes at `base` as whole, aligned records.
    ///
    /// `ith` is the distance of the interrupt threshold from the end of the
    /// buffer in bytes. Without one, the threshold lies past the end.
    pub(crate) fn new(base: u64, size: usize, rec_size: usize, ith: Option<usize>, flags: u32) -> Self {
        let begin = base.next_multiple_of(DS_ALIGNMENT as u64);
        let size = size.saturating_sub((begin - base) as usize);

        let n = size / rec_size;
        let end = begin + (n * rec_size) as u64;
        let ith = match ith {
            Some(bytes) => end.saturating_sub(bytes as u64).max(begin),
            None => end + rec_size as u64,
        };

        Self {
            n,
            size: rec_size,
            begin,
            top: begin,
            end,
            ith,
            flags,
        }
    }
}

/// A PEBS trace with its counter reload value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PebsTrace {
    pub ds: DsTrace,
    pub reset_value: u64,
}

/// A refused release, handing the tracer back to the caller
pub struct ReleaseError<T> {
    pub tracer: T,
    pub error: DsError,
}

impl<T> fmt::Debug for ReleaseError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for ReleaseError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot release tracer: {}", self.error)
    }
}

impl<T> std::error::Error for ReleaseError<T> {}

/// Handle of a branch trace store tracer
#[must_use = "tracers keep their context busy until released"]
pub struct BtsTracer {
    id: u64,
    context: Arc<DsContext>,
    base: u64,
    size: usize,
    trace: DsTrace,
    format: BtsFormat,
}

impl BtsTracer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn context(&self) -> &Arc<DsContext> {
        &self.context
    }

    /// Linear address the buffer is mapped at, before alignment
    pub fn buffer_base(&self) -> u64 {
        self.base
    }

    /// Size of the buffer handed in at request time
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// The trace as of the last read or reset
    pub fn trace(&self) -> &DsTrace {
        &self.trace
    }

    /// Flags currently collecting, zero while suspended
    pub fn active_flags(&self) -> u32 {
        self.context
            .lock()
            .master(Qualifier::Bts)
            .filter(|master| master.id == self.id)
            .map_or(0, |master| master.flags)
    }

    /// Decodes every record slot of the buffer, in buffer order.
    pub fn records(&self) -> Result<Vec<BtsRecord>, DsError> {
        let inner = self.context.lock();
        let master = inner
            .master(Qualifier::Bts)
            .filter(|master| master.id == self.id)
            .ok_or(DsError::PermissionDenied("tracer is not the bts master"))?;

        let data = master
            .buffer
            .slice(self.trace.begin, (self.trace.end - self.trace.begin) as usize)
            .ok_or(DsError::InvalidArgument("trace outside of its buffer"))?;

        data.chunks_exact(self.format.record_size())
            .map(|raw| self.format.decode(raw))
            .collect()
    }
}

/// Handle of a precise event-based sampling tracer
#[must_use = "tracers keep their context busy until released"]
pub struct PebsTracer {
    id: u64,
    context: Arc<DsContext>,
    base: u64,
    size: usize,
    trace: PebsTrace,
}

impl PebsTracer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn context(&self) -> &Arc<DsContext> {
        &self.context
    }

    pub fn buffer_base(&self) -> u64 {
        self.base
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }

    pub fn trace(&self) -> &PebsTrace {
        &self.trace
    }

    /// Copies the record region of the buffer.
    pub fn raw_records(&self) -> Result<Vec<u8>, DsError> {
        let inner = self.context.lock();
        let master = inner
            .master(Qualifier::Pebs)
            .filter(|master| master.id == self.id)
            .ok_or(DsError::PermissionDenied("tracer is not the pebs master"))?;

        let ds = &self.trace.ds;
        master
            .buffer
            .slice(ds.begin, (ds.end - ds.begin) as usize)
            .map(<[u8]>::to_vec)
            .ok_or(DsError::InvalidArgument("trace outside of its buffer"))
    }
}

impl<P: Platform> DebugStore<P> {
    /// Validates a request and binds the buffer to the target's context.
    fn ds_request(
        &self,
        qual: Qualifier,
        target: &Target,
        buffer: Vec<u8>,
        threshold: Option<usize>,
        flags: u32,
    ) -> Result<(Arc<DsContext>, DsTrace, Window), DsError> {
        let rec_size = self.config.record_size(qual);
        if rec_size == 0 {
            return Err(DsError::Unsupported(qual.name()));
        }

        if buffer.is_empty() {
            return Err(DsError::InvalidArgument("no buffer"));
        }

        // Leave room for the alignment adjustment below.
        let size = buffer.len();
        if size < DS_ALIGNMENT + rec_size {
            return Err(DsError::InvalidArgument("buffer too small"));
        }

        let ith = match threshold {
            Some(records) => Some(
                records
                    .checked_mul(rec_size)
                    .filter(|&bytes| bytes < size)
                    .ok_or(DsError::InvalidArgument("threshold outside of the buffer"))?,
            ),
            None => None,
        };

        let window = self.map_buffer(buffer);
        let trace = DsTrace::new(window.base(), window.len(), rec_size, ith, flags);

        // A threshold at the start of the buffer can never be crossed.
        if ith.is_some() && trace.ith <= trace.begin {
            return Err(DsError::InvalidArgument("threshold leaves no room in the buffer"));
        }

        let context = self.get_context(target)?;
        Ok((context, trace, window))
    }

    /// Installs a new master for `qual` on the target's context.
    fn request_tracer(
        &self,
        qual: Qualifier,
        target: &Target,
        buffer: Vec<u8>,
        threshold: Option<usize>,
        flags: u32,
    ) -> Result<(u64, Arc<DsContext>, DsTrace, (u64, usize)), DsError> {
        let per_thread = target.is_per_thread();
        self.acquire_allocation_slot(per_thread)?;

        let (context, trace, window) =
            match self.ds_request(qual, target, buffer, threshold, flags) {
                Ok(request) => request,
                Err(err) => {
                    self.release_allocation_slot(per_thread);
                    return Err(err);
                }
            };

        let id = self.next_tracer_id();
        let mapping = (window.base(), window.len());

        let installed = {
            let _registry = self.lock_registry();
            let mut inner = context.lock();
            let slot = inner.master_slot(qual);
            if slot.is_some() {
                false
            } else {
                *slot = Some(Master {
                    id,
                    buffer: window,
                    flags: 0,
                    overflow: None,
                });
                inner.ds.write_config(qual, &trace);
                true
            }
        };

        if !installed {
            self.put_context(context);
            self.release_allocation_slot(per_thread);
            return Err(DsError::PermissionDenied("context already has a tracer"));
        }

        // The descriptor must be complete before collection is enabled.
        self.platform.serialize();

        debug!(
            "New {} tracer {}: {} records of {} bytes at {:#x}",
            qual.name(),
            id,
            trace.n,
            trace.size,
            trace.begin
        );

        Ok((id, context, trace, mapping))
    }

    /// Removes the `qual` master of `context` and drops the reference to it.
    fn release_tracer(&self, qual: Qualifier, id: u64, context: Arc<DsContext>) {
        let master = {
            let _registry = self.lock_registry();
            let mut inner = context.lock();
            let slot = inner.master_slot(qual);
            if slot.as_ref().is_some_and(|master| master.id == id) {
                let master = slot.take();
                inner.ds.clear(qual);
                master
            } else {
                warn!(
                    "Released {} tracer {} is not the master of its context",
                    qual.name(),
                    id
                );
                None
            }
        };

        // The task may still be writing into the buffer until it is switched out.
        if let Some(task) = context.task() {
            if !self.is_live(&context) {
                self.platform.wait_task_context_switch(&task);
            }
        }
        drop(master);

        let per_thread = context.is_per_thread();
        self.put_context(context);
        self.release_allocation_slot(per_thread);

        debug!("Released {} tracer {}", qual.name(), id);
    }

    fn set_master_flags(&self, qual: Qualifier, id: u64, context: &DsContext, flags: u32) {
        let mut inner = context.lock();
        if let Some(master) = inner.master_slot(qual).as_mut().filter(|master| master.id == id) {
            master.flags = flags;
        }
    }

    /// Requests a BTS tracer on `target`.
    ///
    /// `threshold` is the number of records before the end of the buffer at
    /// which an overflow is signalled; `None` disables it. Overflow callbacks
    /// are not supported.
    pub fn request_bts_tracer(
        &self,
        target: &Target,
        buffer: Vec<u8>,
        overflow: Option<OverflowCallback>,
        threshold: Option<usize>,
        flags: u32,
    ) -> Result<BtsTracer, DsError> {
        if overflow.is_some() {
            return Err(DsError::Unsupported("overflow callbacks"));
        }

        let (id, context, trace, (base, size)) =
            self.request_tracer(Qualifier::Bts, target, buffer, threshold, flags)?;
        let tracer = BtsTracer {
            id,
            context,
            base,
            size,
            trace,
            format: self.format,
        };
        self.enable_bts(&tracer);

        Ok(tracer)
    }

    pub fn request_pebs_tracer(
        &self,
        target: &Target,
        buffer: Vec<u8>,
        overflow: Option<OverflowCallback>,
        threshold: Option<usize>,
        flags: u32,
    ) -> Result<PebsTracer, DsError> {
        if overflow.is_some() {
            return Err(DsError::Unsupported("overflow callbacks"));
        }

        let (id, context, trace, (base, size)) =
            self.request_tracer(Qualifier::Pebs, target, buffer, threshold, flags)?;
        let tracer = PebsTracer {
            id,
            context,
            base,
            size,
            trace: PebsTrace {
                ds: trace,
                reset_value: 0,
            },
        };
        Ok(tracer)
    }

    /// Stops collection and frees the tracer and its buffer.
    ///
    /// Blocks until a traced task other than the current one has been
    /// switched out. A CPU tracer can only be released on its own CPU;
    /// elsewhere the tracer is handed back in the error.
    pub fn release_bts_tracer(&self, tracer: BtsTracer) -> Result<(), ReleaseError<BtsTracer>> {
        if let Err(error) = self.check_cpu(&tracer.context) {
            return Err(ReleaseError { tracer, error });
        }

        self.disable_bts(&tracer);
        self.release_tracer(Qualifier::Bts, tracer.id, tracer.context);
        Ok(())
    }

    pub fn release_pebs_tracer(&self, tracer: PebsTracer) -> Result<(), ReleaseError<PebsTracer>> {
        if let Err(error) = self.check_cpu(&tracer.context) {
            return Err(ReleaseError { tracer, error });
        }

        self.release_tracer(Qualifier::Pebs, tracer.id, tracer.context);
        Ok(())
    }

    fn disable_bts(&self, tracer: &BtsTracer) {
        self.set_master_flags(Qualifier::Bts, tracer.id, &tracer.context, 0);

        let control = self.config.bts_control();
        if self.is_live(&tracer.context) {
            let debugctl = self.platform.read_msr(MSR_IA32_DEBUGCTLMSR);
            self.platform
                .write_msr(MSR_IA32_DEBUGCTLMSR, debugctl & !control);
        }

        if let Some(task) = tracer.context.task() {
            let mut thread = task.lock_thread();
            thread.debugctlmsr &= !control;
            if thread.debugctlmsr == 0 {
                thread.debugctl_msr = false;
            }
        }
    }

    fn enable_bts(&self, tracer: &BtsTracer) {
        let flags = tracer.trace.flags;
        self.set_master_flags(Qualifier::Bts, tracer.id, &tracer.context, flags);

        let mut control = self.config.ctl(DsFeature::Bts);
        if flags & BTS_KERNEL == 0 {
            control |= self.config.ctl(DsFeature::BtsOffKernel);
        }
        if flags & BTS_USER == 0 {
            control |= self.config.ctl(DsFeature::BtsOffUser);
        }

        if let Some(task) = tracer.context.task() {
            let mut thread = task.lock_thread();
            thread.debugctlmsr |= control;
            thread.debugctl_msr = true;
        }

        if self.is_live(&tracer.context) {
            let debugctl = self.platform.read_msr(MSR_IA32_DEBUGCTLMSR);
            self.platform.write_msr(MSR_IA32_DEBUGCTLMSR, debugctl | control);
        }
    }

    /// Stops branch collection. CPU tracers must be suspended on their own CPU.
    pub fn suspend_bts_tracer(&self, tracer: &BtsTracer) -> Result<(), DsError> {
        self.check_cpu(&tracer.context)?;
        self.disable_bts(tracer);
        Ok(())
    }

    pub fn resume_bts_tracer(&self, tracer: &BtsTracer) -> Result<(), DsError> {
        self.check_cpu(&tracer.context)?;
        self.enable_bts(tracer);
        Ok(())
    }

    pub fn suspend_pebs_tracer(&self, tracer: &PebsTracer) -> Result<(), DsError> {
        self.check_cpu(&tracer.context)
    }

    pub fn resume_pebs_tracer(&self, tracer: &PebsTracer) -> Result<(), DsError> {
        self.check_cpu(&tracer.context)
    }

    /// Refreshes the tracer's trace from the live descriptor.
    pub fn read_bts_trace<'a>(&self, tracer: &'a mut BtsTracer) -> &'a DsTrace {
        tracer
            .context
            .lock()
            .ds
            .read_config(Qualifier::Bts, &mut tracer.trace);
        &tracer.trace
    }

    pub fn read_pebs_trace<'a>(&self, tracer: &'a mut PebsTracer) -> &'a PebsTrace {
        {
            let inner = tracer.context.lock();
            inner.ds.read_config(Qualifier::Pebs, &mut tracer.trace.ds);
            tracer.trace.reset_value = inner.ds.pebs_reset();
        }
        &tracer.trace
    }

    /// Moves the write position back to the start of the buffer.
    pub fn reset_bts_tracer(&self, tracer: &mut BtsTracer) {
        tracer.trace.top = tracer.trace.begin;
        tracer
            .context
            .lock()
            .ds
            .set(Qualifier::Bts, DsField::Index, tracer.trace.top);
    }

    pub fn reset_pebs_tracer(&self, tracer: &mut PebsTracer) {
        tracer.trace.ds.top = tracer.trace.ds.begin;
        tracer
            .context
            .lock()
            .ds
            .set(Qualifier::Pebs, DsField::Index, tracer.trace.ds.top);
    }

    /// Sets the value the PEBS counter is reloaded with after an overflow.
    pub fn set_pebs_reset_value(&self, tracer: &PebsTracer, value: u64) {
        tracer.context.lock().ds.set_pebs_reset(value);
    }

    /// Appends one record to the tracer's buffer.
    ///
    /// Returns the number of bytes written, which is short if the buffer is full.
    pub fn write_bts_record(&self, tracer: &BtsTracer, record: &BtsRecord) -> Result<usize, DsError> {
        let raw = self.format.encode(record)?;

        let mut inner = tracer.context.lock();
        if !inner
            .master(Qualifier::Bts)
            .is_some_and(|master| master.id == tracer.id)
        {
            return Err(DsError::PermissionDenied("tracer is not the bts master"));
        }
        Ok(inner.write(Qualifier::Bts, self.format.record_size(), raw.as_bytes()))
    }

    /// Appends raw PEBS records to the tracer's buffer.
    pub fn write_pebs_records(&self, tracer: &PebsTracer, raw: &[u8]) -> Result<usize, DsError> {
        let mut inner = tracer.context.lock();
        if !inner
            .master(Qualifier::Pebs)
            .is_some_and(|master| master.id == tracer.id)
        {
            return Err(DsError::PermissionDenied("tracer is not the pebs master"));
        }
        Ok(inner.write(Qualifier::Pebs, self.config.record_size(Qualifier::Pebs), raw))
    }
}
