//! # debug_store
//!
//! Management of the x86 Debug Store (DS): the memory-resident descriptor
//! through which a CPU appends Branch Trace Store (BTS) and Precise
//! Event-Based Sampling (PEBS) records to ring buffers.
//!
//! The crate hands out BTS and PEBS tracers bound either to a task or to the
//! current CPU, keeps one reference-counted DS context per task and per CPU,
//! writes software records into the same ring buffers the hardware uses, and
//! translates raw BTS records to and from [`BtsRecord`].
//!
//! Register access and scheduling are supplied by the embedder through the
//! [`Msr`] and [`Scheduler`] traits. [`sim::SimPlatform`] implements both in
//! memory.
//!

mod area;
mod bts;
mod config;
mod context;
mod platform;
mod ring;
pub mod sim;
mod store;
mod switch;
mod tracer;

pub use bts::*;
pub use config::*;
pub use context::{DsContext, OverflowCallback, Pid, Target, Task};
pub use platform::*;
pub use store::*;
pub use tracer::*;

use thiserror::Error;

/// Errors returned by Debug Store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DsError {
    #[error("not supported: {0}")]
    Unsupported(&'static str),

    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("out of memory")]
    OutOfMemory,

    #[error("record size {size} exceeds the maximum of {max} bytes")]
    Overflow { size: usize, max: usize },

    #[error("cannot encode record with qualifier {0}")]
    FormatError(u64),
}
