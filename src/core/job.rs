use std::panic::{self, AssertUnwindSafe};

use super::latch::Latch;
use super::sync::{Arc, Mutex};
use crate::context::SliceContext;
use crate::descriptor::{BufferDesc, JobFunction, UniformDesc};
use crate::error::JobError;
use crate::MAX_SLICE_BUFFERS;

/// One unit of a job's work.
///
/// A slice covers the same index range in each of the job's input and output
/// buffers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Slice {
    index: u32,
}

impl Slice {
    pub fn index(&self) -> u32 { self.index }
}

/// The part of a job shared with the threads executing it.
pub(crate) struct JobState {
    uniform: UniformDesc,
    input: BufferDesc,
    output: BufferDesc,
    function: JobFunction,
    slices: Box<[Slice]>,
    // The completion counter and event.
    completion: Arc<Latch>,
    // First failure observed during the current submission.
    error: Mutex<Option<JobError>>,
}

impl JobState {
    fn new(uniform: UniformDesc, input: BufferDesc, output: BufferDesc, function: JobFunction) -> Self {
        uniform.validate();
        input.validate("input");
        output.validate("output");

        let num_input_slices = input.num_slices();
        let num_output_slices = output.num_slices();
        assert_eq!(
            num_input_slices, num_output_slices,
            "Input and output buffers have different slice counts",
        );
        assert!(num_input_slices <= Latch::MAX_COUNT as usize, "Too many slices");

        let slices = (0..num_input_slices as u32)
            .map(|index| Slice { index })
            .collect();

        JobState {
            uniform,
            input,
            output,
            function,
            slices,
            completion: Arc::new(Latch::new()),
            error: Mutex::new(None),
        }
    }

    #[inline]
    pub fn num_slices(&self) -> u32 { self.slices.len() as u32 }

    #[inline]
    pub fn slices(&self) -> &[Slice] { &self.slices }

    #[inline]
    pub fn scratch_size(&self) -> usize { self.uniform.scratch_size }

    #[inline]
    pub fn completion(&self) -> &Arc<Latch> { &self.completion }

    pub fn is_done(&self) -> bool {
        self.completion.is_signaled()
    }

    pub fn wait(&self) {
        self.completion.wait();
    }

    pub fn error(&self) -> Option<JobError> {
        self.error.lock().unwrap().clone()
    }

    /// Must be called once per submission before any slice executes.
    pub fn notify_start(&self) {
        let num_slices = self.num_slices();
        assert!(
            self.completion.count() == 0,
            "Job submitted again before its previous submission completed",
        );

        *self.error.lock().unwrap() = None;
        self.completion.reset(num_slices);

        if num_slices == 0 {
            // Nothing will ever count the latch down.
            self.run_completion_callback();
        }
    }

    /// Called after executing `n` slices of this job.
    pub fn notify_slices_complete(&self, n: u32) {
        if n == 0 {
            return;
        }

        if self.completion.count_down(n) {
            self.run_completion_callback();
            self.completion.signal();
        }
    }

    // Runs on whichever thread retires the last slice, so a panic must not escape
    // into the worker loop.
    fn run_completion_callback(&self) {
        let callback = match &self.function.on_complete {
            Some(callback) => callback,
            None => return,
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback())) {
            let error = JobError::from_callback_panic(&*payload);
            log::error!("Job completion callback failed: {}", error);
            self.record_error(error);
        }
    }

    fn record_error(&self, error: JobError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Run the work function for one slice.
    ///
    /// A panic in the work function is recorded as the job's error instead of
    /// unwinding into the caller.
    pub fn execute_slice(&self, slice_index: u32, scratch: Option<&mut [u8]>) {
        debug_assert!(slice_index < self.num_slices());

        let mut uniforms: [&[u8]; MAX_SLICE_BUFFERS] = Default::default();
        let mut inputs: [&[u8]; MAX_SLICE_BUFFERS] = Default::default();
        let mut outputs: [&mut [u8]; MAX_SLICE_BUFFERS] = Default::default();

        let num_uniforms = self.uniform.buffers.len();
        let num_inputs = self.input.buffers.len();
        let num_outputs = self.output.buffers.len();

        unsafe {
            for (dst, buffer) in uniforms.iter_mut().zip(&self.uniform.buffers) {
                *dst = buffer.as_slice();
            }
            for (dst, buffer) in inputs.iter_mut().zip(&self.input.buffers) {
                *dst = buffer.slice(slice_index);
            }
            for (dst, buffer) in outputs.iter_mut().zip(&self.output.buffers) {
                *dst = buffer.slice_mut(slice_index);
            }
        }

        let scratch = if self.uniform.scratch_size > 0 {
            scratch.map(|mem| &mut mem[..self.uniform.scratch_size])
        } else {
            None
        };

        let ctx = SliceContext {
            slice_index,
            uniforms: &uniforms[..num_uniforms],
            inputs: &inputs[..num_inputs],
            outputs: &mut outputs[..num_outputs],
            scratch,
        };

        let work = &self.function.work;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| work(ctx))) {
            let error = JobError::from_panic(slice_index, &*payload);
            log::error!("Job function failed: {}", error);
            self.record_error(error);
        }
    }
}

/// A reusable unit of data-parallel work.
///
/// A job is set up with its descriptors once and can then be submitted to job ports
/// any number of times, as long as a submission completes before the next one starts.
pub struct Job {
    state: Option<Arc<JobState>>,
}

impl Job {
    pub fn new() -> Self {
        Job { state: None }
    }

    /// Validate the descriptors and build the slices of the job.
    ///
    /// Panics if the job is already set up, if there are no input or output buffers,
    /// if the input and output slice counts differ or if the job requests too much
    /// scratch memory.
    pub fn setup(&mut self, uniform: UniformDesc, input: BufferDesc, output: BufferDesc, function: JobFunction) {
        assert!(self.state.is_none(), "Job is already set up");

        let state = JobState::new(uniform, input, output, function);
        log::trace!("Job setup with {} slices", state.num_slices());

        self.state = Some(Arc::new(state));
    }

    /// Release the job's slices. Waits for an in-flight submission to finish first.
    pub fn discard(&mut self) {
        let state = self.state.take().expect("Discarding a job that isn't set up");
        state.wait();
    }

    pub fn is_valid(&self) -> bool {
        self.state.is_some()
    }

    pub fn num_slices(&self) -> u32 {
        self.state().num_slices()
    }

    pub fn slices(&self) -> &[Slice] {
        self.state().slices()
    }

    /// Whether the last submission of this job completed.
    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// The first failure of the last submission, if any.
    pub fn error(&self) -> Option<JobError> {
        self.state().error()
    }

    pub(crate) fn state(&self) -> &Arc<JobState> {
        self.state.as_ref().expect("Job isn't set up")
    }
}

impl Default for Job {
    fn default() -> Self {
        Job::new()
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        // The buffers the job points to may be released right after the job.
        if let Some(state) = &self.state {
            state.wait();
        }
    }
}

#[cfg(test)]
fn test_job(num_items: usize, items_per_slice: usize) -> (Job, Vec<u32>, Vec<u32>) {
    let input: Vec<u32> = (0..num_items as u32).collect();
    let mut output = vec![0u32; num_items];

    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::input(&input, items_per_slice)),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::output(&mut output, items_per_slice)),
            JobFunction::new(|mut ctx| {
                let src = ctx.input::<u32>(0);
                let dst = ctx.output::<u32>(0);
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = *s + 1;
                }
            }),
        );
    }

    (job, input, output)
}

#[test]
fn test_setup_builds_slices() {
    let (job, _input, _output) = test_job(100, 8);

    assert!(job.is_valid());
    assert_eq!(job.num_slices(), 13);
    for (i, slice) in job.slices().iter().enumerate() {
        assert_eq!(slice.index(), i as u32);
    }

    // A job that was never submitted is done.
    assert!(job.is_done());
}

#[test]
fn test_discard_and_setup_again() {
    let (mut job, _input, _output) = test_job(10, 4);
    job.discard();
    assert!(!job.is_valid());

    let input = vec![0u8; 64];
    let mut output = vec![0u8; 32];
    unsafe {
        job.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::input(&input, 8)),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::output(&mut output, 4)),
            JobFunction::new(|_| {}),
        );
    }
    assert_eq!(job.num_slices(), 8);
}

#[test]
#[should_panic]
fn test_setup_twice() {
    let (mut job, input, mut output) = test_job(10, 4);
    unsafe {
        job.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::input(&input, 4)),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::output(&mut output, 4)),
            JobFunction::new(|_| {}),
        );
    }
}

#[test]
#[should_panic]
fn test_discard_invalid() {
    let mut job = Job::new();
    job.discard();
}

#[test]
#[should_panic]
fn test_setup_without_input() {
    let mut output = vec![0u8; 16];
    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new(),
            BufferDesc::new(),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::output(&mut output, 4)),
            JobFunction::new(|_| {}),
        );
    }
}

#[test]
#[should_panic]
fn test_setup_without_output() {
    let input = vec![0u8; 16];
    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::input(&input, 4)),
            BufferDesc::new(),
            JobFunction::new(|_| {}),
        );
    }
}

#[test]
#[should_panic]
fn test_setup_slice_count_mismatch() {
    let input = vec![0u8; 16];
    let mut output = vec![0u8; 16];
    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::input(&input, 4)),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::output(&mut output, 8)),
            JobFunction::new(|_| {}),
        );
    }
}

#[test]
#[should_panic]
fn test_setup_scratch_too_large() {
    let input = vec![0u8; 16];
    let mut output = vec![0u8; 16];
    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new().with_scratch(crate::MAX_SCRATCH_SIZE + 1),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::input(&input, 4)),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::output(&mut output, 4)),
            JobFunction::new(|_| {}),
        );
    }
}

#[test]
fn test_completion_counter() {
    let (job, _input, _output) = test_job(100, 8);
    let state = job.state();

    state.notify_start();
    assert_eq!(state.completion().count(), 13);
    assert!(!job.is_done());

    state.notify_slices_complete(5);
    assert_eq!(state.completion().count(), 8);
    assert!(!job.is_done());

    state.notify_slices_complete(8);
    assert_eq!(state.completion().count(), 0);
    assert!(job.is_done());

    // The counter only goes back up with the next submission.
    state.notify_start();
    assert_eq!(state.completion().count(), 13);
    state.notify_slices_complete(13);
    assert!(job.is_done());
}

#[test]
#[should_panic]
fn test_notify_start_while_running() {
    let (job, _input, _output) = test_job(100, 8);
    let state = job.state().clone();
    // Don't wait on the job when unwinding.
    std::mem::forget(job);

    state.notify_start();
    state.notify_start();
}

#[test]
#[should_panic]
fn test_too_many_slices_completed() {
    let (job, _input, _output) = test_job(16, 8);
    let state = job.state().clone();
    std::mem::forget(job);

    state.notify_start();
    state.notify_slices_complete(3);
}

#[test]
fn test_execute_slice_clamps_last_slice() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    let input: Vec<f32> = (0..100).map(|i| i as f32).collect();
    let mut output = vec![0f32; 100];
    let last_len = StdArc::new(AtomicUsize::new(0));
    let recorded = last_len.clone();

    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::input(&input, 8)),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::output(&mut output, 8)),
            JobFunction::new(move |mut ctx| {
                let src = ctx.input::<f32>(0);
                if ctx.slice_index == 12 {
                    recorded.store(src.len(), Ordering::SeqCst);
                }
                let dst = ctx.output::<f32>(0);
                assert_eq!(src.len(), dst.len());
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = *s * 2.0;
                }
            }),
        );
    }

    let state = job.state();
    state.notify_start();
    for slice in 0..state.num_slices() {
        state.execute_slice(slice, None);
    }
    state.notify_slices_complete(state.num_slices());

    assert_eq!(last_len.load(Ordering::SeqCst), 4);
    job.discard();

    for (i, val) in output.iter().enumerate() {
        assert_eq!(*val, i as f32 * 2.0);
    }
}

#[test]
fn test_execute_slice_records_panic() {
    let input = vec![0u8; 64];
    let mut output = vec![0u8; 64];

    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::input(&input, 8)),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::output(&mut output, 8)),
            JobFunction::new(|ctx| {
                if ctx.slice_index >= 3 {
                    panic!("bad slice {}", ctx.slice_index);
                }
            }),
        );
    }

    let state = job.state();
    state.notify_start();
    for slice in 0..state.num_slices() {
        state.execute_slice(slice, None);
    }
    state.notify_slices_complete(state.num_slices());

    assert!(job.is_done());
    assert_eq!(
        job.error(),
        Some(JobError::SlicePanicked { slice: 3, message: "bad slice 3".to_string() }),
    );

    // A new submission starts with a clean slate.
    state.notify_start();
    assert_eq!(job.error(), None);
    state.notify_slices_complete(state.num_slices());
}

#[test]
fn test_callback_panic_still_signals() {
    let input = vec![0u8; 32];
    let mut output = vec![0u8; 32];

    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::input(&input, 8)),
            BufferDesc::new().with_buffer(crate::SlicedBuffer::output(&mut output, 8)),
            JobFunction::new(|_| {}).with_completion_callback(|| panic!("callback failed")),
        );
    }

    let state = job.state();
    state.notify_start();
    state.notify_slices_complete(state.num_slices());

    assert!(job.is_done());
    assert_eq!(
        job.error(),
        Some(JobError::CallbackPanicked { message: "callback failed".to_string() }),
    );

    job.discard();
}
