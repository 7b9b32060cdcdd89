use crate::{DsError, DsTrace, Qualifier, MAX_SIZEOF_DS};

/// Width of one PEBS counter reset value.
const PEBS_RESET_FIELD_SIZE: usize = 8;

/// Pointer fields of one sub-buffer in the DS area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DsField {
    BufferBase = 0,
    Index,
    AbsoluteMaximum,
    InterruptThreshold,
}

/// Reads a little-endian field of `width` bytes.
pub(crate) fn read_field(bytes: &[u8], width: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw[..width].copy_from_slice(&bytes[..width]);
    u64::from_le_bytes(raw)
}

/// Writes the low `width` bytes of `value` in little-endian order.
pub(crate) fn write_field(bytes: &mut [u8], width: usize, value: u64) {
    bytes[..width].copy_from_slice(&value.to_le_bytes()[..width]);
}

/// The hardware-visible Debug Store descriptor.
///
/// Holds BTS fields, then PEBS fields, each as four pointer-sized slots,
/// followed by the PEBS counter reset value.
pub(crate) struct DsArea {
    bytes: Vec<u8>,
    sizeof_ptr_field: usize,
}

impl DsArea {
    pub fn new(sizeof_ptr_field: usize) -> Result<Self, DsError> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(MAX_SIZEOF_DS)
            .map_err(|_| DsError::OutOfMemory)?;
        bytes.resize(MAX_SIZEOF_DS, 0);

        Ok(Self {
            bytes,
            sizeof_ptr_field,
        })
    }

    /// Address loaded into the DS area register
    pub fn address(&self) -> u64 {
        self.bytes.as_ptr() as u64
    }

    fn offset(&self, qual: Qualifier, field: DsField) -> usize {
        self.sizeof_ptr_field * (field as usize + 4 * qual as usize)
    }

    pub fn get(&self, qual: Qualifier, field: DsField) -> u64 {
        let offset = self.offset(qual, field);
        read_field(&self.bytes[offset..], self.sizeof_ptr_field)
    }

    pub fn set(&mut self, qual: Qualifier, field: DsField, value: u64) {
        let offset = self.offset(qual, field);
        write_field(&mut self.bytes[offset..], self.sizeof_ptr_field, value);
    }

    pub fn pebs_reset(&self) -> u64 {
        read_field(&self.bytes[self.sizeof_ptr_field * 8..], PEBS_RESET_FIELD_SIZE)
    }

    pub fn set_pebs_reset(&mut self, value: u64) {
        let offset = self.sizeof_ptr_field * 8;
        write_field(&mut self.bytes[offset..], PEBS_RESET_FIELD_SIZE, value);
    }

    pub fn write_config(&mut self, qual: Qualifier, trace: &DsTrace) {
        self.set(qual, DsField::BufferBase, trace.begin);
        self.set(qual, DsField::Index, trace.top);
        self.set(qual, DsField::AbsoluteMaximum, trace.end);
        self.set(qual, DsField::InterruptThreshold, trace.ith);
    }

    pub fn read_config(&self, qual: Qualifier, trace: &mut DsTrace) {
        trace.begin = self.get(qual, DsField::BufferBase);
        trace.top = self.get(qual, DsField::Index);
        trace.end = self.get(qual, DsField::AbsoluteMaximum);
        trace.ith = self.get(qual, DsField::InterruptThreshold);
    }

    pub fn clear(&mut self, qual: Qualifier) {
        self.write_config(qual, &DsTrace::default());
    }
}

/// A tracer buffer mapped at a linear address the DS area can refer to
pub(crate) struct Window {
    base: u64,
    data: Vec<u8>,
}

impl Window {
    pub fn new(base: u64, data: Vec<u8>) -> Self {
        Self { base, data }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    fn range(&self, addr: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start..end)
    }

    pub fn slice(&self, addr: u64, len: usize) -> Option<&[u8]> {
        let range = self.range(addr, len)?;
        Some(&self.data[range])
    }

    pub fn slice_mut(&mut self, addr: u64, len: usize) -> Option<&mut [u8]> {
        let range = self.range(addr, len)?;
        Some(&mut self.data[range])
    }
}
