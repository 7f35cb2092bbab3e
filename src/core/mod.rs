pub mod job;
pub mod latch;
pub mod command;
pub mod thread_pool;
pub mod shutdown;
/// basic std::sync types reexported here so that we can hook loom into them for
/// testing.
pub mod sync;

use crossbeam_utils::{CachePadded, sync::Parker};

use sync::{Arc, Mutex, thread};
use command::{CommandQueue, WorkerCommand};
use thread_pool::{ThreadPool, ThreadPoolBuilder};
use shutdown::Shutdown;

/// Data accessible by the thread pool handles and all workers.
pub(crate) struct Shared {
    /// Number of dedicated worker threads.
    pub num_workers: u32,
    /// Size of each worker's scratch buffer.
    pub max_scratch_size: usize,
    /// One command queue per worker.
    pub queues: Vec<CachePadded<CommandQueue>>,
    /// The worker that receives the first slice of the next job, unless the
    /// submission overrides it. Also serializes submissions against shutdown.
    pub next_worker_index: Mutex<u32>,
    /// state and logic to handle shutting down.
    pub shutdown: Shutdown,
    // A few hooks to register work
    handlers: ThreadPoolHooks,
}

pub(crate) fn init(params: ThreadPoolBuilder) -> ThreadPool {
    let num_threads = params.num_threads as usize;

    log::info!(
        "Starting {} job workers with {} bytes of scratch memory each",
        num_threads, params.max_scratch_size,
    );

    let mut queues = Vec::with_capacity(num_threads);
    let mut parkers = Vec::with_capacity(num_threads);
    for _ in 0..num_threads {
        let parker = Parker::new();
        queues.push(CachePadded::new(CommandQueue::new(parker.unparker().clone())));
        parkers.push(parker);
    }

    let shared = Arc::new(Shared {
        num_workers: num_threads as u32,
        max_scratch_size: params.max_scratch_size,
        queues,
        next_worker_index: Mutex::new(0),
        shutdown: Shutdown::new(num_threads as u32),
        handlers: ThreadPoolHooks {
            start: params.start_handler,
            exit: params.exit_handler,
        },
    });

    for (i, parker) in parkers.into_iter().enumerate() {
        let mut worker = Worker {
            index: i as u32,
            parker,
            shared: shared.clone(),
        };

        let mut builder = thread::Builder::new()
            .name((params.name_handler)(i as u32));

        if let Some(stack_size) = params.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let _ = builder.spawn(move || {
            profiling::register_thread!("JobWorker");

            worker.run();

        }).expect("Failed to spawn a job worker thread");
    }

    ThreadPool { shared }
}

struct Worker {
    index: u32,
    parker: Parker,
    shared: Arc<Shared>,
}

impl Worker {
    fn run(&mut self) {
        let shared = Arc::clone(&self.shared);
        let queue = &shared.queues[self.index as usize];

        if let Some(handler) = &shared.handlers.start {
            handler.run(self.index);
        }

        log::debug!("Job worker {} started", self.index);

        // Only ever touched by this thread.
        let mut scratch = vec![0u8; shared.max_scratch_size];
        let mut batch = Vec::with_capacity(64);

        loop {
            // Take everything that is queued at this point, commands pushed while
            // we process the batch wait for the next iteration.
            queue.dequeue_all(&mut batch);

            for command in batch.drain(..) {
                match command {
                    WorkerCommand::Run { job, first_slice, count, stride } => {
                        profiling::scope!("run slices");

                        let mut scratch = if job.scratch_size() > 0 {
                            Some(&mut scratch[..])
                        } else {
                            None
                        };

                        let mut slice = first_slice;
                        for _ in 0..count {
                            job.execute_slice(slice, scratch.as_deref_mut());
                            slice += stride;
                        }

                        job.notify_slices_complete(count);
                    }
                    WorkerCommand::Sync { event, epoch } => {
                        profiling::scope!("sync");
                        event.wait_epoch(epoch);
                    }
                }
            }

            // Read the flag before checking the queue. Submissions accepted before the
            // request are queued by the time the flag is visible.
            let shutting_down = shared.shutdown.is_requested();

            if !queue.is_empty() {
                continue;
            }

            if shutting_down {
                break;
            }

            self.parker.park();
        }

        // Shutdown phase.

        drop(scratch);

        log::debug!("Job worker {} exiting", self.index);

        if let Some(handler) = &shared.handlers.exit {
            handler.run(self.index);
        }

        shared.shutdown.worker_exited();
    }
}

pub(crate) struct ThreadPoolHooks {
    start: Option<Box<dyn WorkerHook>>,
    exit: Option<Box<dyn WorkerHook>>,
}

pub trait WorkerHook: Send + Sync {
    fn run(&self, worker_id: u32);
}

impl<F> WorkerHook for F where F: Fn(u32) + Send + Sync + 'static {
    fn run(&self, worker_id: u32) { self(worker_id) }
}
