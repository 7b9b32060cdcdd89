use crate::area::{read_field, write_field};
use crate::{DsConfiguration, DsError, Qualifier};

/// Largest raw BTS record: three 8-byte fields.
pub const MAX_BTS_SIZEOF: usize = 3 * 8;

const BTS_QUAL_BIT_SIZE: u32 = 4;
const BTS_QUAL_MASK: u64 = (1 << BTS_QUAL_BIT_SIZE) - 1;

const BTS_INVALID: u64 = 0;
const BTS_BRANCH: u64 = 1;
const BTS_TASK_ARRIVES: u64 = 2;
const BTS_TASK_DEPARTS: u64 = 3;

// Field positions in a raw record. Event records reuse them as
// qualifier, clock and pid.
const BTS_FROM: usize = 0;
const BTS_TO: usize = 1;
const BTS_FLAGS: usize = 2;

/// An architecture-independent BTS record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtsRecord {
    /// An empty slot
    Invalid,
    /// A taken branch
    Branch { from: u64, to: u64 },
    /// The traced task was scheduled in
    TaskArrives { clock: u64, pid: u64 },
    /// The traced task was scheduled out
    TaskDeparts { clock: u64, pid: u64 },
    /// An escape-coded record with a qualifier this crate does not know
    Event { qualifier: u64, clock: u64, pid: u64 },
}

impl BtsRecord {
    pub fn qualifier(&self) -> u64 {
        match self {
            BtsRecord::Invalid => BTS_INVALID,
            BtsRecord::Branch { .. } => BTS_BRANCH,
            BtsRecord::TaskArrives { .. } => BTS_TASK_ARRIVES,
            BtsRecord::TaskDeparts { .. } => BTS_TASK_DEPARTS,
            BtsRecord::Event { qualifier, .. } => *qualifier,
        }
    }
}

/// A raw BTS record as laid out in the trace buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBtsRecord {
    bytes: [u8; MAX_BTS_SIZEOF],
    len: usize,
}

impl RawBtsRecord {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// Translates between raw BTS records and [`BtsRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtsFormat {
    sizeof_ptr_field: usize,
    sizeof_rec: usize,
}

impl BtsFormat {
    pub fn new(config: &DsConfiguration) -> Self {
        Self {
            sizeof_ptr_field: config.sizeof_ptr_field,
            sizeof_rec: config.record_size(Qualifier::Bts),
        }
    }

    pub fn record_size(&self) -> usize {
        self.sizeof_rec
    }

    fn field_mask(&self) -> u64 {
        if self.sizeof_ptr_field >= 8 {
            u64::MAX
        } else {
            (1u64 << (8 * self.sizeof_ptr_field)) - 1
        }
    }

    /// Top bits of the `from` field that mark an event record
    fn escape(&self) -> u64 {
        self.field_mask() & !BTS_QUAL_MASK
    }

    fn get(&self, raw: &[u8], field: usize) -> u64 {
        read_field(&raw[self.sizeof_ptr_field * field..], self.sizeof_ptr_field)
    }

    fn set(&self, raw: &mut [u8], field: usize, value: u64) {
        write_field(&mut raw[self.sizeof_ptr_field * field..], self.sizeof_ptr_field, value);
    }

    /// Decodes the record at the start of `raw`.
    pub fn decode(&self, raw: &[u8]) -> Result<BtsRecord, DsError> {
        if self.sizeof_rec == 0 {
            return Err(DsError::Unsupported("bts"));
        }
        if raw.len() < self.sizeof_rec || self.sizeof_rec < 3 * self.sizeof_ptr_field {
            return Err(DsError::InvalidArgument("raw bts record too short"));
        }

        let from = self.get(raw, BTS_FROM);
        if from & !BTS_QUAL_MASK == self.escape() {
            let clock = self.get(raw, BTS_TO);
            let pid = self.get(raw, BTS_FLAGS);
            return Ok(match from & BTS_QUAL_MASK {
                BTS_TASK_ARRIVES => BtsRecord::TaskArrives { clock, pid },
                BTS_TASK_DEPARTS => BtsRecord::TaskDeparts { clock, pid },
                qualifier => BtsRecord::Event {
                    qualifier,
                    clock,
                    pid,
                },
            });
        }

        let to = self.get(raw, BTS_TO);
        if from == 0 && to == 0 {
            return Ok(BtsRecord::Invalid);
        }
        Ok(BtsRecord::Branch { from, to })
    }

    /// Encodes `record` into its raw layout.
    ///
    /// Values wider than a field are truncated to the field width. A branch
    /// whose source would read back as an escape code is rejected.
    pub fn encode(&self, record: &BtsRecord) -> Result<RawBtsRecord, DsError> {
        if self.sizeof_rec == 0 {
            return Err(DsError::Unsupported("bts"));
        }
        if self.sizeof_rec > MAX_BTS_SIZEOF {
            return Err(DsError::Overflow {
                size: self.sizeof_rec,
                max: MAX_BTS_SIZEOF,
            });
        }

        let mut raw = RawBtsRecord {
            bytes: [0; MAX_BTS_SIZEOF],
            len: self.sizeof_rec,
        };

        match *record {
            BtsRecord::Invalid => {}
            BtsRecord::Branch { from, to } => {
                if from & self.field_mask() & !BTS_QUAL_MASK == self.escape() {
                    return Err(DsError::FormatError(BTS_BRANCH));
                }
                self.set(&mut raw.bytes, BTS_FROM, from);
                self.set(&mut raw.bytes, BTS_TO, to);
                self.set(&mut raw.bytes, BTS_FLAGS, 0);
            }
            BtsRecord::TaskArrives { clock, pid } | BtsRecord::TaskDeparts { clock, pid } => {
                self.set(&mut raw.bytes, BTS_FROM, self.escape() | record.qualifier());
                self.set(&mut raw.bytes, BTS_TO, clock);
                self.set(&mut raw.bytes, BTS_FLAGS, pid);
            }
            BtsRecord::Event { qualifier, .. } => return Err(DsError::FormatError(qualifier)),
        }

        Ok(raw)
    }
}
