use super::{Shared, WorkerHook};
use super::command::WorkerCommand;
use super::job::JobState;
use super::latch::Latch;
use super::sync::Arc;
use super::shutdown::{Shutdown, ShutdownHandle};
use crate::{MAX_SCRATCH_SIZE, NUM_WORKER_THREADS};

/// A reference to a fixed-size pool of job worker threads.
///
/// Each worker has its own command queue. Jobs are split into slices up-front and
/// the slices are spread over all workers, there is no work stealing.
#[derive(Clone)]
pub struct ThreadPool {
    pub(crate) shared: Arc<Shared>,
}

impl ThreadPool {
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder {
            num_threads: NUM_WORKER_THREADS,
            max_scratch_size: MAX_SCRATCH_SIZE,
            start_handler: None,
            exit_handler: None,
            name_handler: Box::new(|idx| format!("JobWorker#{}", idx)),
            stack_size: None,
        }
    }

    /// Ask the workers to stop once their queues are drained.
    pub fn shut_down(&self) -> ShutdownHandle {
        Shutdown::request(Arc::clone(&self.shared))
    }

    pub fn num_worker_threads(&self) -> u32 { self.shared.num_workers }

    /// Size of the scratch buffer of each worker.
    pub fn max_scratch_size(&self) -> usize { self.shared.max_scratch_size }

    /// The worker that will receive the first slice of the next job.
    pub fn next_thread_index(&self) -> u32 {
        *self.shared.next_worker_index.lock().unwrap()
    }

    /// Start a submission of `job` and spread its slices over all workers.
    ///
    /// Slice `k` is sent to worker `(start + k) % N`, where `start` is `start_index` if
    /// provided and the round-robin cursor otherwise. The cursor then moves past the
    /// workers that received slices.
    ///
    /// The cursor lock doubles as the submission lock: shutting down takes it too, so
    /// the slices of an accepted job are always queued before any worker can see the
    /// shutdown request.
    pub(crate) fn submit(&self, job: &Arc<JobState>, start_index: Option<u32>) {
        profiling::scope!("submit");

        let num_workers = self.shared.num_workers;
        let mut cursor = self.shared.next_worker_index.lock().unwrap();

        if self.shared.shutdown.is_requested() {
            // Release the lock before panicking so that it doesn't get poisoned.
            drop(cursor);
            panic!("Pushing work to a thread pool that is shutting down");
        }

        if job.num_slices() == 0 {
            // Nothing to queue. The completion callback runs right away and must not
            // run under the lock.
            drop(cursor);
            job.notify_start();
            return;
        }

        if let Some(start) = start_index {
            *cursor = start % num_workers;
        }

        job.notify_start();

        let mut used = 0;
        for (i, count) in slice_shares(job.num_slices(), num_workers).enumerate() {
            let worker = (*cursor as usize + i) % num_workers as usize;
            self.shared.queues[worker].enqueue(WorkerCommand::Run {
                job: Arc::clone(job),
                first_slice: i as u32,
                count,
                stride: num_workers,
            });
            used += 1;
        }

        *cursor = (*cursor + used) % num_workers;
    }

    /// Make every worker wait for the current epoch of `event` to be over before
    /// processing anything queued after this call.
    pub(crate) fn push_sync(&self, event: &Arc<Latch>) {
        profiling::scope!("push_sync");

        let epoch = event.epoch();
        for queue in &self.shared.queues {
            queue.enqueue(WorkerCommand::Sync { event: Arc::clone(event), epoch });
        }
    }

    /// Panics if the workers of this pool can't execute the job.
    ///
    /// Runs before the submission lock is taken, so that misuse can't poison it.
    pub(crate) fn check_job(&self, job: &JobState) {
        assert!(job.is_done(), "Job submitted again before its previous submission completed");
        assert!(
            job.scratch_size() == 0 || job.scratch_size() < self.shared.max_scratch_size,
            "Job needs {} bytes of scratch memory, workers have {}",
            job.scratch_size(), self.shared.max_scratch_size,
        );
    }
}

/// Number of slices each worker position receives, for the positions that receive
/// any.
///
/// Every position gets `num_slices / num_workers` slices and the first
/// `num_slices % num_workers` positions get one more.
pub(crate) fn slice_shares(num_slices: u32, num_workers: u32) -> impl Iterator<Item = u32> {
    let base = num_slices / num_workers;
    let remainder = num_slices % num_workers;

    (0..num_workers)
        .map(move |i| if i < remainder { base + 1 } else { base })
        .take_while(|count| *count > 0)
}

pub struct ThreadPoolBuilder {
    pub(crate) num_threads: u32,
    pub(crate) max_scratch_size: usize,
    pub(crate) start_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) exit_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) name_handler: Box<dyn Fn(u32) -> String>,
    pub(crate) stack_size: Option<usize>,
}

impl ThreadPoolBuilder {
    pub fn with_start_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.start_handler = Some(Box::new(handler));
        self
    }

    pub fn with_exit_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.exit_handler = Some(Box::new(handler));
        self
    }

    pub fn with_thread_names<F>(mut self, handler: F) -> Self
    where F: Fn(u32) -> String + 'static
    {
        self.name_handler = Box::new(handler);
        self
    }

    pub fn with_worker_threads(mut self, num_threads: u32) -> Self {
        self.num_threads = num_threads.max(1);
        self
    }

    /// Size of the scratch buffer allocated by each worker. Jobs must request strictly
    /// less than this.
    pub fn with_max_scratch_size(mut self, size: usize) -> Self {
        self.max_scratch_size = size;
        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn build(self) -> ThreadPool {
        crate::core::init(self)
    }
}

#[test]
fn test_slice_shares() {
    let shares: Vec<u32> = slice_shares(10, 8).collect();
    assert_eq!(shares, vec![2, 2, 1, 1, 1, 1, 1, 1]);

    let shares: Vec<u32> = slice_shares(3, 8).collect();
    assert_eq!(shares, vec![1, 1, 1]);

    let shares: Vec<u32> = slice_shares(16, 8).collect();
    assert_eq!(shares, vec![2; 8]);

    assert_eq!(slice_shares(0, 8).count(), 0);
}

#[test]
fn test_slice_shares_fairness() {
    for num_workers in 1..12 {
        for num_slices in 0..200 {
            let shares: Vec<u32> = slice_shares(num_slices, num_workers).collect();
            let floor = num_slices / num_workers;
            let ceil = (num_slices + num_workers - 1) / num_workers;

            assert_eq!(shares.iter().sum::<u32>(), num_slices);
            assert!(shares.len() <= num_workers as usize);
            for share in &shares {
                assert!(*share >= floor && *share <= ceil);
            }
            if floor > 0 {
                assert_eq!(shares.len(), num_workers as usize);
            }
        }
    }
}

#[test]
fn test_round_robin_cursor() {
    use crate::{Job, JobFunction, JobPort, ThreadPoolPort, UniformDesc, BufferDesc, SlicedBuffer};

    let pool = ThreadPool::builder().with_worker_threads(8).build();
    let mut port = ThreadPoolPort::new(&pool, "cursor");

    let input = vec![0u8; 3];
    let mut output = vec![0u8; 3];
    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(SlicedBuffer::input(&input, 1)),
            BufferDesc::new().with_buffer(SlicedBuffer::output(&mut output, 1)),
            JobFunction::new(|_| {}),
        );
    }

    assert_eq!(pool.next_thread_index(), 0);

    port.push_job(&job);
    port.wait_done().unwrap();
    assert_eq!(pool.next_thread_index(), 3);

    port.push_job(&job);
    port.wait_done().unwrap();
    assert_eq!(pool.next_thread_index(), 6);

    // Wraps around.
    port.push_job(&job);
    port.wait_done().unwrap();
    assert_eq!(pool.next_thread_index(), 1);

    job.discard();
    pool.shut_down().wait();
}

#[test]
fn test_slice_placement() {
    use std::sync::Mutex as StdMutex;
    use std::sync::Arc as StdArc;
    use crate::{Job, JobFunction, JobPort, ThreadPoolPort, UniformDesc, BufferDesc, SlicedBuffer};

    let num_workers = 4;
    let pool = ThreadPool::builder()
        .with_worker_threads(num_workers)
        .with_thread_names(|idx| format!("placement#{}", idx))
        .build();
    let mut port = ThreadPoolPort::new(&pool, "placement");

    let input = vec![0u8; 10];
    let mut output = vec![0u8; 10];
    let placements = StdArc::new(StdMutex::new(Vec::new()));
    let recorder = placements.clone();

    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(SlicedBuffer::input(&input, 1)),
            BufferDesc::new().with_buffer(SlicedBuffer::output(&mut output, 1)),
            JobFunction::new(move |ctx| {
                let name = std::thread::current().name().unwrap().to_string();
                let worker: u32 = name.trim_start_matches("placement#").parse().unwrap();
                recorder.lock().unwrap().push((ctx.slice_index, worker));
            }),
        );
    }

    // Move the cursor away from zero first.
    let small_input = vec![0u8; 1];
    let mut small_output = vec![0u8; 1];
    let mut small_job = Job::new();
    unsafe {
        small_job.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(SlicedBuffer::input(&small_input, 1)),
            BufferDesc::new().with_buffer(SlicedBuffer::output(&mut small_output, 1)),
            JobFunction::new(|_| {}),
        );
    }
    port.push_job(&small_job);
    port.wait_done().unwrap();
    let start = pool.next_thread_index();
    assert_eq!(start, 1);

    port.push_job(&job);
    port.wait_done().unwrap();

    let placements = placements.lock().unwrap();
    assert_eq!(placements.len(), 10);
    for (slice, worker) in placements.iter() {
        assert_eq!(*worker, (start + *slice) % num_workers);
    }

    drop(placements);
    job.discard();
    small_job.discard();
    pool.shut_down().wait();
}
