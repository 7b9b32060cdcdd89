use log::warn;

use crate::area::{DsArea, DsField, Window};
use crate::Qualifier;

fn round_up(size: usize, rec_size: usize) -> usize {
    if rec_size == 0 {
        return size;
    }
    size.div_ceil(rec_size) * rec_size
}

/// Appends `record` to the `qual` ring buffer described by `ds`.
///
/// Writes up to the interrupt threshold; once the index is at or past the
/// threshold, fills the rest of the buffer up to the absolute maximum. A
/// trailing partial record is zero-padded. When the index reaches the
/// absolute maximum it wraps to the buffer base and the call returns.
///
/// `overflow` runs once each time the index crosses the interrupt threshold.
///
/// Returns the number of payload bytes written. A short count means the
/// buffer is full or has just wrapped.
pub(crate) fn write_records(
    ds: &mut DsArea,
    window: &mut Window,
    qual: Qualifier,
    rec_size: usize,
    mut record: &[u8],
    overflow: &mut dyn FnMut(),
) -> usize {
    let mut bytes_written = 0;

    while !record.is_empty() {
        let base = ds.get(qual, DsField::BufferBase);
        let index = ds.get(qual, DsField::Index);
        let end = ds.get(qual, DsField::AbsoluteMaximum);
        let int_th = ds.get(qual, DsField::InterruptThreshold);

        let mut write_end = end.min(int_th);
        if write_end <= index {
            write_end = end;
        }
        if write_end <= index {
            break;
        }

        let write_size = record.len().min((write_end - index) as usize);
        let adj_write_size = round_up(write_size, rec_size).min((end - index) as usize);

        let Some(dst) = window.slice_mut(index, adj_write_size) else {
            warn!(
                "Index {:#x} of the {} buffer is outside of the mapping at {:#x}",
                index,
                qual.name(),
                window.base()
            );
            break;
        };
        dst[..write_size].copy_from_slice(&record[..write_size]);
        dst[write_size..].fill(0);

        record = &record[write_size..];
        bytes_written += write_size;

        let next = index + adj_write_size as u64;
        let crossed = index < int_th && int_th <= next;
        let wrapped = next >= end;
        ds.set(qual, DsField::Index, if wrapped { base } else { next });

        if crossed {
            overflow();
        }
        if wrapped {
            break;
        }
    }

    bytes_written
}
