//! A data-parallel job scheduler for workloads that split into many small, equally
//! sized slices.
//!
//! A `Job` describes a function applied to every slice of one or more input and
//! output buffers, plus a few uniform (read-only, shared) buffers. Jobs are
//! submitted through a `JobPort`:
//!
//! - `ThreadPoolPort` spreads the slices of a job over the workers of a `ThreadPool`.
//! - `SerialPort` runs them one after the other in the submitting thread.
//!
//! Design notes:
//! - No implicit global thread pool.
//! - Slices are distributed up-front and round-robin, there is no work stealing.
//! - Workers that have nothing to do sleep instead of spinning.
//! - Ordering between jobs is expressed with chains and sync points, both of which
//!   are executed by the workers so that submitting never blocks.

mod core;
mod context;
mod descriptor;
mod error;
mod port;

pub use crate::core::job::{Job, Slice};
pub use crate::core::thread_pool::{ThreadPool, ThreadPoolBuilder};
pub use crate::core::shutdown::ShutdownHandle;
pub use crate::core::WorkerHook;
pub use crate::core::sync;
pub use context::SliceContext;
pub use descriptor::{
    BufferDesc, InputDesc, JobFunction, OutputDesc, SlicedBuffer, UniformBuffer, UniformDesc,
};
pub use error::JobError;
pub use port::{job_port, DefaultJobPort, JobPort, SerialPort, ThreadPoolPort};

pub use crossbeam_utils::CachePadded;

/// Number of worker threads of a pool unless configured otherwise.
pub const NUM_WORKER_THREADS: u32 = 8;

/// Default size in bytes of the scratch buffer owned by each worker.
pub const MAX_SCRATCH_SIZE: usize = 64 * 1024;

/// Maximum number of buffers in each of the uniform, input and output sets of a job.
pub const MAX_SLICE_BUFFERS: usize = 8;
