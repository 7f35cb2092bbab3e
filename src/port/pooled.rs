use super::JobPort;
use crate::core::job::{Job, JobState};
use crate::core::sync::Arc;
use crate::core::thread_pool::ThreadPool;
use crate::error::JobError;

/// A job port distributing slices over the workers of a thread pool.
///
/// Pushing work only enqueues commands, the only blocking operation is `wait_done`.
pub struct ThreadPoolPort {
    name: String,
    pool: ThreadPool,
    last_pushed_job: Option<Arc<JobState>>,
}

impl ThreadPoolPort {
    pub fn new(pool: &ThreadPool, name: &str) -> Self {
        ThreadPoolPort {
            name: name.to_string(),
            pool: pool.clone(),
            last_pushed_job: None,
        }
    }

    pub fn thread_pool(&self) -> &ThreadPool {
        &self.pool
    }
}

impl JobPort for ThreadPoolPort {
    fn push_job(&mut self, job: &Job) {
        let job = job.state();

        self.pool.check_job(job);
        self.pool.submit(job, None);

        self.last_pushed_job = Some(Arc::clone(job));
    }

    fn push_job_chain(&mut self, jobs: &[&Job]) {
        profiling::scope!("push_job_chain");
        assert!(!jobs.is_empty(), "Empty job chain pushed to port {:?}", self.name);

        log::trace!("Port {:?}: pushing a chain of {} jobs", self.name, jobs.len());

        for job in jobs {
            self.pool.check_job(job.state());
        }

        // All jobs of the chain start on the same worker so that the data produced by
        // the first slice of a job is likely to still be in cache for the next one.
        let thread_index = self.pool.next_thread_index();

        let mut previous: Option<&Arc<JobState>> = None;
        for job in jobs {
            let job = job.state();

            if let Some(previous) = previous {
                self.pool.push_sync(previous.completion());
            }

            self.pool.submit(job, Some(thread_index));

            previous = Some(job);
        }

        self.last_pushed_job = previous.cloned();
    }

    fn push_flush(&mut self) {
        // Workers read uniform buffers in place, there is nothing to flush.
    }

    fn push_sync(&mut self) {
        if let Some(job) = &self.last_pushed_job {
            log::trace!("Port {:?}: sync", self.name);
            self.pool.push_sync(job.completion());
        }
    }

    fn wait_done(&self) -> Result<(), JobError> {
        let job = self.last_pushed_job.as_ref().unwrap_or_else(|| {
            panic!("Waiting on port {:?} which never received a job", self.name)
        });

        job.wait();

        job.error().map_or(Ok(()), Err)
    }

    fn check_done(&self) -> bool {
        match &self.last_pushed_job {
            Some(job) => job.is_done(),
            None => true,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
#[cfg(test)]
use crate::{BufferDesc, JobFunction, SlicedBuffer, UniformDesc};
#[cfg(test)]
use super::{offset_job, scale_job, SerialPort};

#[test]
fn test_pool_push_job() {
    let pool = ThreadPool::builder().with_worker_threads(8).build();
    let mut port = ThreadPoolPort::new(&pool, "pool");
    assert_eq!(port.name(), "pool");

    let input: Vec<f32> = (0..10_000).map(|i| i as f32).collect();
    let mut output = vec![0f32; 10_000];
    let scale = 0.5f32;
    let mut job = scale_job(&input, &mut output, &scale, 64);

    for _ in 0..50 {
        port.push_job(&job);
        assert_eq!(port.wait_done(), Ok(()));
        assert!(port.check_done());
        assert!(job.is_done());
    }

    job.discard();

    for (i, val) in output.iter().enumerate() {
        assert_eq!(*val, i as f32 * 0.5);
    }

    pool.shut_down().wait();
}

#[test]
fn test_job_chain() {
    let pool = ThreadPool::builder().with_worker_threads(8).build();
    let mut port = ThreadPoolPort::new(&pool, "chain");

    let n = 2000;
    let input: Vec<f32> = (0..n).map(|i| i as f32).collect();
    let mut stage1 = vec![0f32; n];
    let mut stage2 = vec![0f32; n];
    let mut stage3 = vec![0f32; n];

    let offset1 = 1.0f32;
    let scale2 = 2.0f32;
    let offset3 = 5.0f32;

    // Each job reads the output of the previous one. Slices don't line up between
    // jobs so that a job depends on slices executed by other workers.
    let mut j0 = offset_job(&input, &mut stage1, &offset1, 16);
    let mut j1 = scale_job(&stage1, &mut stage2, &scale2, 50);
    let mut j2 = offset_job(&stage2, &mut stage3, &offset3, 7);

    for _ in 0..30 {
        port.push_job_chain(&[&j0, &j1, &j2]);
        assert_eq!(port.wait_done(), Ok(()));

        // Waiting on the port waits for the last job of the chain, the previous ones
        // are done by then.
        assert!(j0.is_done());
        assert!(j1.is_done());
        assert!(j2.is_done());
    }

    j0.discard();
    j1.discard();
    j2.discard();

    for (i, val) in stage3.iter().enumerate() {
        assert_eq!(*val, (i as f32 + 1.0) * 2.0 + 5.0);
    }

    pool.shut_down().wait();
}

#[test]
fn test_job_chain_keeps_start_index() {
    let pool = ThreadPool::builder().with_worker_threads(4).build();
    let mut port = ThreadPoolPort::new(&pool, "chain");

    let first_slice_workers = Arc::new(std::sync::Mutex::new(Vec::new()));

    let input = vec![0u8; 3];
    let mut outputs = vec![vec![0u8; 3]; 3];
    let mut jobs: Vec<Job> = Vec::new();
    for output in &mut outputs {
        let recorder = first_slice_workers.clone();
        let mut job = Job::new();
        unsafe {
            job.setup(
                UniformDesc::new(),
                BufferDesc::new().with_buffer(SlicedBuffer::input(&input, 1)),
                BufferDesc::new().with_buffer(SlicedBuffer::output(output, 1)),
                JobFunction::new(move |ctx| {
                    if ctx.slice_index == 0 {
                        let name = std::thread::current().name().unwrap().to_string();
                        recorder.lock().unwrap().push(name);
                    }
                }),
            );
        }
        jobs.push(job);
    }

    // Move the cursor so that the chain doesn't trivially start at worker 0.
    port.push_job(&jobs[0]);
    port.wait_done().unwrap();
    assert_eq!(pool.next_thread_index(), 3);
    first_slice_workers.lock().unwrap().clear();

    let chain: Vec<&Job> = jobs.iter().collect();
    port.push_job_chain(&chain);
    port.wait_done().unwrap();

    let workers = first_slice_workers.lock().unwrap();
    assert_eq!(workers.len(), 3);
    for name in workers.iter() {
        assert_eq!(name, "JobWorker#3");
    }
    drop(workers);

    for job in &mut jobs {
        job.discard();
    }

    pool.shut_down().wait();
}

#[test]
fn test_push_sync() {
    let pool = ThreadPool::builder().with_worker_threads(6).build();
    let mut port = ThreadPoolPort::new(&pool, "sync");

    let n = 3000;
    let input: Vec<f32> = (0..n).map(|i| i as f32).collect();
    let mut stage1 = vec![0f32; n];
    let mut stage2 = vec![0f32; n];
    let offset = 10.0f32;
    let scale = 4.0f32;

    let mut producer = offset_job(&input, &mut stage1, &offset, 32);
    let mut consumer = scale_job(&stage1, &mut stage2, &scale, 45);

    for _ in 0..30 {
        port.push_job(&producer);
        port.push_sync();
        port.push_job(&consumer);

        // The calling thread wasn't blocked by the barrier.
        assert_eq!(port.wait_done(), Ok(()));
        assert!(producer.is_done());
    }

    producer.discard();
    consumer.discard();

    for (i, val) in stage2.iter().enumerate() {
        assert_eq!(*val, (i as f32 + 10.0) * 4.0);
    }

    pool.shut_down().wait();
}

#[test]
fn test_check_done_without_job() {
    let pool = ThreadPool::builder().with_worker_threads(1).build();
    let mut port = ThreadPoolPort::new(&pool, "empty");

    assert!(port.check_done());
    assert!(!port.is_busy());
    // Nothing to synchronize with.
    port.push_sync();
    port.push_flush();

    pool.shut_down().wait();
}

#[test]
#[should_panic]
fn test_wait_without_job() {
    let pool = ThreadPool::builder().with_worker_threads(1).build();
    let port = ThreadPoolPort::new(&pool, "empty");
    let _ = port.wait_done();
}

#[test]
#[should_panic]
fn test_empty_chain() {
    let pool = ThreadPool::builder().with_worker_threads(1).build();
    let mut port = ThreadPoolPort::new(&pool, "empty");
    port.push_job_chain(&[]);
}

#[test]
fn test_slice_panic_is_reported() {
    let pool = ThreadPool::builder().with_worker_threads(4).build();
    let mut port = ThreadPoolPort::new(&pool, "panic");

    let executed = Arc::new(AtomicU32::new(0));
    let counter = executed.clone();

    let input = vec![0u8; 40];
    let mut output = vec![0u8; 40];
    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(SlicedBuffer::input(&input, 4)),
            BufferDesc::new().with_buffer(SlicedBuffer::output(&mut output, 4)),
            JobFunction::new(move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                if ctx.slice_index == 5 {
                    panic!("slice five");
                }
            }),
        );
    }

    port.push_job(&job);
    let result = port.wait_done();
    assert_eq!(
        result,
        Err(JobError::SlicePanicked { slice: 5, message: "slice five".to_string() }),
    );
    // The other slices still ran and the job completed.
    assert_eq!(executed.load(Ordering::SeqCst), 10);
    assert!(job.is_done());
    assert_eq!(job.error(), result.err());

    // Serial ports report failures the same way.
    let mut serial = SerialPort::new("panic");
    serial.push_job(&job);
    assert!(serial.wait_done().is_err());

    job.discard();
    pool.shut_down().wait();
}

#[test]
fn test_completion_callback() {
    let pool = ThreadPool::builder().with_worker_threads(8).build();
    let mut port = ThreadPoolPort::new(&pool, "callback");

    let completed = Arc::new(AtomicU32::new(0));
    let callback_counter = completed.clone();

    let input = vec![0u16; 1000];
    let mut output = vec![0u16; 1000];
    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(SlicedBuffer::input(&input, 10)),
            BufferDesc::new().with_buffer(SlicedBuffer::output(&mut output, 10)),
            JobFunction::new(|_| {}).with_completion_callback(move || {
                callback_counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    for i in 0..20 {
        port.push_job(&job);
        port.wait_done().unwrap();
        // The callback runs before waiters are released.
        assert_eq!(completed.load(Ordering::SeqCst), i + 1);
    }

    job.discard();
    pool.shut_down().wait();
}

#[test]
fn test_callback_panic_is_reported() {
    // A single worker, so the second job can only run if the worker survived.
    let pool = ThreadPool::builder().with_worker_threads(1).build();
    let mut port = ThreadPoolPort::new(&pool, "callback");

    let input = vec![0u8; 16];
    let mut output = vec![0u8; 16];
    let mut failing = Job::new();
    unsafe {
        failing.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(SlicedBuffer::input(&input, 4)),
            BufferDesc::new().with_buffer(SlicedBuffer::output(&mut output, 4)),
            JobFunction::new(|_| {}).with_completion_callback(|| panic!("callback failed")),
        );
    }

    port.push_job(&failing);
    assert_eq!(
        port.wait_done(),
        Err(JobError::CallbackPanicked { message: "callback failed".to_string() }),
    );
    assert!(failing.is_done());

    let values: Vec<f32> = (0..32).map(|i| i as f32).collect();
    let mut doubled = vec![0f32; 32];
    let two = 2.0f32;
    let mut job = scale_job(&values, &mut doubled, &two, 4);

    let mut other_port = ThreadPoolPort::new(&pool, "after callback");
    other_port.push_job(&job);
    assert_eq!(other_port.wait_done(), Ok(()));

    // The failure is reported again on the next submission.
    port.push_job(&failing);
    assert!(port.wait_done().is_err());

    job.discard();
    failing.discard();

    for (i, val) in doubled.iter().enumerate() {
        assert_eq!(*val, i as f32 * 2.0);
    }

    // Shutting down only completes if the worker is still alive.
    pool.shut_down().wait();
}

#[test]
fn test_zero_slices() {
    let pool = ThreadPool::builder().with_worker_threads(2).build();
    let mut port = ThreadPoolPort::new(&pool, "zero");

    let completed = Arc::new(AtomicU32::new(0));
    let callback_counter = completed.clone();

    let input: Vec<u32> = Vec::new();
    let mut output: Vec<u32> = Vec::new();
    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(SlicedBuffer::input(&input, 4)),
            BufferDesc::new().with_buffer(SlicedBuffer::output(&mut output, 4)),
            JobFunction::new(|_| panic!("no slice to run")).with_completion_callback(move || {
                callback_counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }
    assert_eq!(job.num_slices(), 0);

    port.push_job(&job);
    assert!(port.check_done());
    assert_eq!(port.wait_done(), Ok(()));
    assert_eq!(pool.next_thread_index(), 0);

    let mut serial = SerialPort::new("zero");
    serial.push_job(&job);
    assert_eq!(serial.wait_done(), Ok(()));

    assert_eq!(completed.load(Ordering::SeqCst), 2);

    job.discard();
    pool.shut_down().wait();
}

#[test]
fn test_scratch_memory() {
    let pool = ThreadPool::builder()
        .with_worker_threads(3)
        .with_max_scratch_size(1024)
        .build();
    assert_eq!(pool.max_scratch_size(), 1024);

    let input = vec![0u32; 300];
    let mut output = vec![0u32; 300];
    let with_scratch = Arc::new(AtomicUsize::new(0));
    let without_scratch = Arc::new(AtomicUsize::new(0));

    let mut scratch_job = Job::new();
    let counter = with_scratch.clone();
    unsafe {
        scratch_job.setup(
            UniformDesc::new().with_scratch(128),
            BufferDesc::new().with_buffer(SlicedBuffer::input(&input, 10)),
            BufferDesc::new().with_buffer(SlicedBuffer::output(&mut output, 10)),
            JobFunction::new(move |mut ctx| {
                let slice = ctx.slice_index;
                let scratch = ctx.scratch().unwrap();
                assert_eq!(scratch.len(), 128);

                // The scratch memory is private to the worker for the duration of
                // the slice.
                for byte in scratch.iter_mut() {
                    *byte = slice as u8;
                }
                let scratch: &[u8] = ctx.scratch.as_deref().unwrap();
                let intact = scratch.iter().all(|byte| *byte == slice as u8);
                for val in ctx.output::<u32>(0) {
                    *val = intact as u32;
                }

                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    let mut plain_job = Job::new();
    let counter = without_scratch.clone();
    unsafe {
        plain_job.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(SlicedBuffer::input(&input, 10)),
            BufferDesc::new().with_buffer(SlicedBuffer::output(&mut output, 10)),
            JobFunction::new(move |ctx| {
                assert!(ctx.scratch.is_none());
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    let mut port = ThreadPoolPort::new(&pool, "scratch");
    port.push_job(&scratch_job);
    assert_eq!(port.wait_done(), Ok(()));
    port.push_job(&plain_job);
    assert_eq!(port.wait_done(), Ok(()));

    let mut serial = SerialPort::with_max_scratch_size("scratch", 1024);
    serial.push_job(&scratch_job);
    assert_eq!(serial.wait_done(), Ok(()));

    assert_eq!(with_scratch.load(Ordering::SeqCst), 60);
    assert_eq!(without_scratch.load(Ordering::SeqCst), 30);

    scratch_job.discard();
    plain_job.discard();

    assert!(output.iter().all(|val| *val == 1));

    pool.shut_down().wait();
}

#[test]
#[should_panic]
fn test_scratch_larger_than_workers() {
    let pool = ThreadPool::builder()
        .with_worker_threads(1)
        .with_max_scratch_size(64)
        .build();

    let input = vec![0u8; 8];
    let mut output = vec![0u8; 8];
    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new().with_scratch(64),
            BufferDesc::new().with_buffer(SlicedBuffer::input(&input, 1)),
            BufferDesc::new().with_buffer(SlicedBuffer::output(&mut output, 1)),
            JobFunction::new(|_| {}),
        );
    }

    let mut port = ThreadPoolPort::new(&pool, "scratch");
    port.push_job(&job);
}

#[test]
fn test_independent_ports() {
    let pool = ThreadPool::builder().with_worker_threads(4).build();
    let mut port_a = ThreadPoolPort::new(&pool, "a");
    let mut port_b = ThreadPoolPort::new(&pool, "b");

    let input_a: Vec<f32> = (0..500).map(|i| i as f32).collect();
    let input_b: Vec<f32> = (0..700).map(|i| -(i as f32)).collect();
    let mut output_a = vec![0f32; 500];
    let mut output_b = vec![0f32; 700];
    let two = 2.0f32;
    let three = 3.0f32;

    let mut job_a = scale_job(&input_a, &mut output_a, &two, 9);
    let mut job_b = scale_job(&input_b, &mut output_b, &three, 11);

    port_a.push_job(&job_a);
    port_b.push_job(&job_b);

    port_b.wait_done().unwrap();
    port_a.wait_done().unwrap();

    job_a.discard();
    job_b.discard();

    for (i, val) in output_a.iter().enumerate() {
        assert_eq!(*val, i as f32 * 2.0);
    }
    for (i, val) in output_b.iter().enumerate() {
        assert_eq!(*val, -(i as f32) * 3.0);
    }

    pool.shut_down().wait();
}

#[test]
fn test_drop_waits_for_job() {
    let pool = ThreadPool::builder().with_worker_threads(4).build();
    let mut port = ThreadPoolPort::new(&pool, "drop");

    let input: Vec<f32> = (0..4000).map(|i| i as f32).collect();
    let mut output = vec![0f32; 4000];
    let offset = 1.0f32;

    {
        let job = offset_job(&input, &mut output, &offset, 10);
        port.push_job(&job);
        // Dropping the job blocks until its slices are done.
    }

    assert!(port.check_done());
    for (i, val) in output.iter().enumerate() {
        assert_eq!(*val, i as f32 + 1.0);
    }

    pool.shut_down().wait();
}
