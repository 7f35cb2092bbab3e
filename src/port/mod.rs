//! Job ports
//!
//! A job port is the entry point through which jobs are submitted and waited on.
//! Each port remembers the last job pushed into it, which is what `push_sync`,
//! `wait_done` and `check_done` refer to.
//!
//! Two backends implement the `JobPort` trait:
//!
//! - `ThreadPoolPort` hands slices to the workers of a `ThreadPool` and returns
//!   immediately.
//! - `SerialPort` executes every slice in the submitting thread before returning.
//!
//! `DefaultJobPort` is the backend selected at compile time (the `serial` feature
//! selects the serial one).

mod serial;
mod pooled;

pub use serial::SerialPort;
pub use pooled::ThreadPoolPort;

use crate::core::job::Job;
use crate::core::thread_pool::ThreadPool;
use crate::error::JobError;

pub trait JobPort {
    /// Submit all slices of a job.
    fn push_job(&mut self, job: &Job);

    /// Submit jobs that must run one after the other.
    ///
    /// No slice of a job starts before all slices of the previous one have completed.
    /// Panics if `jobs` is empty.
    fn push_job_chain(&mut self, jobs: &[&Job]);

    /// Make the data written before this call visible to jobs pushed after it.
    fn push_flush(&mut self);

    /// Jobs pushed after this call don't start before the last pushed job completes.
    ///
    /// Doesn't block the calling thread.
    fn push_sync(&mut self);

    /// Block until the last pushed job completed.
    ///
    /// Returns the first failure observed while executing that job.
    fn wait_done(&self) -> Result<(), JobError>;

    /// Whether the last pushed job completed.
    fn check_done(&self) -> bool;

    fn name(&self) -> &str;

    fn is_busy(&self) -> bool {
        !self.check_done()
    }
}

#[cfg(not(feature = "serial"))]
pub type DefaultJobPort = ThreadPoolPort;

#[cfg(feature = "serial")]
pub type DefaultJobPort = SerialPort;

/// Create a job port of the compile-time selected backend.
#[cfg(not(feature = "serial"))]
pub fn job_port(pool: &ThreadPool, name: &str) -> DefaultJobPort {
    ThreadPoolPort::new(pool, name)
}

/// Create a job port of the compile-time selected backend.
#[cfg(feature = "serial")]
pub fn job_port(pool: &ThreadPool, name: &str) -> DefaultJobPort {
    SerialPort::with_max_scratch_size(name, pool.max_scratch_size())
}

#[cfg(test)]
use crate::{BufferDesc, JobFunction, SlicedBuffer, UniformBuffer, UniformDesc};

/// output[i] = input[i] * scale
#[cfg(test)]
fn scale_job(input: &[f32], output: &mut [f32], scale: &f32, items_per_slice: usize) -> Job {
    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new().with_buffer(UniformBuffer::from_value(scale)),
            BufferDesc::new().with_buffer(SlicedBuffer::input(input, items_per_slice)),
            BufferDesc::new().with_buffer(SlicedBuffer::output(output, items_per_slice)),
            JobFunction::new(|mut ctx| {
                let scale = *ctx.uniform_value::<f32>(0);
                let src = ctx.input::<f32>(0);
                let dst = ctx.output::<f32>(0);
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = *s * scale;
                }
            }),
        );
    }

    job
}

/// output[i] = input[i] + offset, sleeping a bit on the first slice to make ordering
/// problems more likely to show up.
#[cfg(test)]
fn offset_job(input: &[f32], output: &mut [f32], offset: &f32, items_per_slice: usize) -> Job {
    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new().with_buffer(UniformBuffer::from_value(offset)),
            BufferDesc::new().with_buffer(SlicedBuffer::input(input, items_per_slice)),
            BufferDesc::new().with_buffer(SlicedBuffer::output(output, items_per_slice)),
            JobFunction::new(|mut ctx| {
                if ctx.slice_index == 0 {
                    std::thread::sleep(std::time::Duration::from_micros(200));
                }
                let offset = *ctx.uniform_value::<f32>(0);
                let src = ctx.input::<f32>(0);
                let dst = ctx.output::<f32>(0);
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = *s + offset;
                }
            }),
        );
    }

    job
}

#[test]
fn test_serial_parallel_equivalence() {
    let pool = ThreadPool::builder().with_worker_threads(5).build();

    let a: Vec<u32> = (0..4099).map(|i| i * 7 + 3).collect();
    let b: Vec<u8> = (0..4099).map(|i| (i % 251) as u8).collect();
    let table: Vec<u32> = (0..16).map(|i| i * i).collect();

    let run = |port: &mut dyn JobPort| -> (Vec<u32>, Vec<u16>) {
        let mut sums = vec![0u32; 4099];
        let mut tags = vec![0u16; 4099];
        let mut job = Job::new();
        unsafe {
            job.setup(
                UniformDesc::new().with_buffer(UniformBuffer::from_slice(&table)),
                BufferDesc::new()
                    .with_buffer(SlicedBuffer::input(&a, 13))
                    .with_buffer(SlicedBuffer::input(&b, 13)),
                BufferDesc::new()
                    .with_buffer(SlicedBuffer::output(&mut sums, 13))
                    .with_buffer(SlicedBuffer::output(&mut tags, 13)),
                JobFunction::new(|mut ctx| {
                    let table = ctx.uniform::<u32>(0);
                    let a = ctx.input::<u32>(0);
                    let b = ctx.input::<u8>(1);
                    let slice = ctx.slice_index;

                    let sums = ctx.output::<u32>(0);
                    for (i, sum) in sums.iter_mut().enumerate() {
                        *sum = a[i].wrapping_mul(table[b[i] as usize % 16]) ^ slice;
                    }

                    let tags = ctx.output::<u16>(1);
                    for (i, tag) in tags.iter_mut().enumerate() {
                        *tag = b[i] as u16 + slice as u16;
                    }
                }),
            );
        }

        port.push_job(&job);
        port.wait_done().unwrap();
        job.discard();

        (sums, tags)
    };

    let serial = run(&mut SerialPort::new("serial"));
    let parallel = run(&mut ThreadPoolPort::new(&pool, "parallel"));

    assert_eq!(serial, parallel);

    pool.shut_down().wait();
}

#[test]
fn test_default_port() {
    let pool = ThreadPool::builder().with_worker_threads(2).build();
    let mut port = job_port(&pool, "default");

    let input: Vec<f32> = (0..64).map(|i| i as f32).collect();
    let mut output = vec![0f32; 64];
    let scale = -1.0f32;
    let mut job = scale_job(&input, &mut output, &scale, 5);

    port.push_job(&job);
    port.wait_done().unwrap();
    job.discard();

    for (i, val) in output.iter().enumerate() {
        assert_eq!(*val, -(i as f32));
    }

    pool.shut_down().wait();
}
