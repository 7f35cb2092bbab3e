use super::JobPort;
use crate::core::job::{Job, JobState};
use crate::core::sync::Arc;
use crate::error::JobError;
use crate::MAX_SCRATCH_SIZE;

/// A job port executing everything immediately on the calling thread.
///
/// Ordering comes for free, so flushes and syncs are no-ops and a pushed job is
/// always done by the time `push_job` returns.
pub struct SerialPort {
    name: String,
    scratch: Vec<u8>,
    last_pushed_job: Option<Arc<JobState>>,
}

impl SerialPort {
    pub fn new(name: &str) -> Self {
        SerialPort::with_max_scratch_size(name, MAX_SCRATCH_SIZE)
    }

    pub fn with_max_scratch_size(name: &str, max_scratch_size: usize) -> Self {
        SerialPort {
            name: name.to_string(),
            scratch: vec![0; max_scratch_size],
            last_pushed_job: None,
        }
    }
}

impl JobPort for SerialPort {
    fn push_job(&mut self, job: &Job) {
        profiling::scope!("serial push_job");

        let job = job.state();
        assert!(
            job.scratch_size() == 0 || job.scratch_size() < self.scratch.len(),
            "Job needs {} bytes of scratch memory, port {:?} has {}",
            job.scratch_size(), self.name, self.scratch.len(),
        );

        job.notify_start();

        for slice in job.slices() {
            job.execute_slice(slice.index(), Some(&mut self.scratch[..]));
        }

        job.notify_slices_complete(job.num_slices());

        self.last_pushed_job = Some(Arc::clone(job));
    }

    fn push_job_chain(&mut self, jobs: &[&Job]) {
        assert!(!jobs.is_empty(), "Empty job chain pushed to port {:?}", self.name);

        for job in jobs {
            self.push_job(job);
        }
    }

    fn push_flush(&mut self) {}

    fn push_sync(&mut self) {}

    fn wait_done(&self) -> Result<(), JobError> {
        match &self.last_pushed_job {
            Some(job) => job.error().map_or(Ok(()), Err),
            None => Ok(()),
        }
    }

    fn check_done(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
use crate::{BufferDesc, JobFunction, SlicedBuffer, UniformDesc};
#[cfg(test)]
use super::scale_job;

#[test]
fn test_serial_push_job() {
    let input: Vec<f32> = (0..100).map(|i| i as f32).collect();
    let mut output = vec![0f32; 100];
    let scale = 3.0f32;

    let mut port = SerialPort::new("serial");
    assert!(port.check_done());
    assert_eq!(port.wait_done(), Ok(()));

    let mut job = scale_job(&input, &mut output, &scale, 8);
    assert_eq!(job.num_slices(), 13);

    port.push_job(&job);
    // Already done, flush and sync are no-ops.
    assert!(port.check_done());
    assert!(!port.is_busy());
    port.push_flush();
    port.push_sync();
    assert_eq!(port.wait_done(), Ok(()));
    job.discard();

    for (i, val) in output.iter().enumerate() {
        assert_eq!(*val, i as f32 * 3.0);
    }
}

#[test]
fn test_serial_last_slice_size() {
    let input = vec![1u32; 100];
    let mut output = vec![0u32; 100];
    let sizes = Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorder = sizes.clone();

    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(SlicedBuffer::input(&input, 8)),
            BufferDesc::new().with_buffer(SlicedBuffer::output(&mut output, 8)),
            JobFunction::new(move |ctx| {
                recorder.lock().unwrap().push((ctx.slice_index, ctx.inputs[0].len(), ctx.outputs[0].len()));
            }),
        );
    }

    let mut port = SerialPort::new("serial");
    port.push_job(&job);
    job.discard();

    let sizes = sizes.lock().unwrap();
    assert_eq!(sizes.len(), 13);
    for (slice, input_len, output_len) in sizes.iter() {
        let expected = if *slice == 12 { 16 } else { 32 };
        assert_eq!(*input_len, expected);
        assert_eq!(*output_len, expected);
    }
}

#[test]
#[should_panic]
fn test_serial_empty_chain() {
    let mut port = SerialPort::new("empty");
    port.push_job_chain(&[]);
}
