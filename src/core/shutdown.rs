//! Stopping the workers of a pool.
//!
//! A shutdown request never discards work. The request flag is raised while holding
//! the submission lock, so a concurrent submission is either fully queued before the
//! flag becomes visible or rejected. Workers only look at the flag once their queue
//! is empty, which means every accepted slice still runs before its worker exits.
//!
//! The shutdown handle waits until the last worker reports that it exited.

use crate::sync::{Ordering, AtomicBool, Mutex, Condvar, Arc};

use crate::core::Shared;

pub(crate) struct Shutdown {
    requested: AtomicBool,
    // Workers that haven't exited yet.
    running_workers: Mutex<u32>,
    all_exited: Condvar,
}

impl Shutdown {
    pub fn new(num_workers: u32) -> Self {
        Shutdown {
            requested: AtomicBool::new(false),
            running_workers: Mutex::new(num_workers),
            all_exited: Condvar::new(),
        }
    }

    pub fn request(shared: Arc<Shared>) -> ShutdownHandle {
        {
            let _submissions = shared.next_worker_index.lock().unwrap();
            if shared.shutdown.requested.swap(true, Ordering::SeqCst) {
                log::debug!("Job workers are already shutting down");
            } else {
                log::debug!("Shutting down {} job workers", shared.num_workers);
            }
        }

        // Sleeping workers have to notice the request.
        for queue in &shared.queues {
            queue.wake();
        }

        ShutdownHandle { shared }
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn worker_exited(&self) {
        let mut running = self.running_workers.lock().unwrap();
        *running -= 1;
        if *running == 0 {
            self.all_exited.notify_all();
        }
    }

    fn wait_all_exited(&self) {
        let mut running = self.running_workers.lock().unwrap();
        while *running > 0 {
            running = self.all_exited.wait(running).unwrap();
        }
    }
}

/// Returned by `ThreadPool::shut_down`.
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    /// Block until every worker drained its queue and exited.
    pub fn wait(self) {
        self.shared.shutdown.wait_all_exited();
        log::debug!("All job workers have shut down");
    }
}

#[cfg(test)]
fn counting_job(input: &[u8], output: &mut [u8], counter: std::sync::Arc<std::sync::atomic::AtomicU32>) -> crate::Job {
    use crate::{Job, JobFunction, UniformDesc, BufferDesc, SlicedBuffer};

    let mut job = Job::new();
    unsafe {
        job.setup(
            UniformDesc::new(),
            BufferDesc::new().with_buffer(SlicedBuffer::input(input, 1)),
            BufferDesc::new().with_buffer(SlicedBuffer::output(output, 1)),
            JobFunction::new(move |_| {
                std::thread::sleep(std::time::Duration::from_micros(50));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    job
}

#[test]
fn test_hooks_run_once_per_worker() {
    use std::sync::Mutex as StdMutex;
    use std::sync::Arc as StdArc;
    use crate::ThreadPool;

    for num_workers in [1, 3, 8, 13] {
        let started = StdArc::new(StdMutex::new(Vec::new()));
        let exited = StdArc::new(StdMutex::new(Vec::new()));
        let start_log = started.clone();
        let exit_log = exited.clone();

        let pool = ThreadPool::builder()
            .with_worker_threads(num_workers)
            .with_start_handler(move |id| start_log.lock().unwrap().push(id))
            .with_exit_handler(move |id| exit_log.lock().unwrap().push(id))
            .build();

        pool.shut_down().wait();

        let expected: Vec<u32> = (0..num_workers).collect();
        for record in [&started, &exited] {
            let mut ids = record.lock().unwrap().clone();
            ids.sort_unstable();
            assert_eq!(ids, expected);
        }
    }
}

#[test]
fn test_shutdown_drains_queues() {
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc as StdArc;
    use crate::{JobPort, ThreadPool, ThreadPoolPort};

    let pool = ThreadPool::builder().with_worker_threads(4).build();
    let mut port = ThreadPoolPort::new(&pool, "drain");

    let executed = StdArc::new(AtomicU32::new(0));
    let input = vec![0u8; 64];
    let mut output = vec![0u8; 64];
    let mut job = counting_job(&input, &mut output, executed.clone());

    port.push_job(&job);
    // Requesting twice is harmless.
    let _ = pool.shut_down();
    pool.shut_down().wait();

    assert_eq!(executed.load(Ordering::SeqCst), 64);
    assert!(port.check_done());
    job.discard();
}

#[test]
#[should_panic]
fn test_push_after_shutdown() {
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc as StdArc;
    use crate::{JobPort, ThreadPool, ThreadPoolPort};

    let pool = ThreadPool::builder().with_worker_threads(2).build();
    let mut port = ThreadPoolPort::new(&pool, "late");
    pool.shut_down().wait();

    let input = vec![0u8; 8];
    let mut output = vec![0u8; 8];
    let job = counting_job(&input, &mut output, StdArc::new(AtomicU32::new(0)));

    // Rejected without starting the job, so dropping it while unwinding doesn't block.
    port.push_job(&job);
}

#[test]
fn test_push_racing_shutdown() {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc as StdArc;
    use crate::{JobPort, ThreadPool, ThreadPoolPort};

    for _ in 0..200 {
        let pool = ThreadPool::builder().with_worker_threads(2).build();
        let mut port = ThreadPoolPort::new(&pool, "race");

        let executed = StdArc::new(AtomicU32::new(0));
        let input = vec![0u8; 16];
        let mut output = vec![0u8; 16];
        let job = counting_job(&input, &mut output, executed.clone());

        let submitter = std::thread::spawn(move || {
            let accepted = panic::catch_unwind(AssertUnwindSafe(|| port.push_job(&job))).is_ok();
            if accepted {
                // An accepted job must run to completion even though the pool is
                // shutting down concurrently.
                port.wait_done().unwrap();
            }
            (accepted, job)
        });

        pool.shut_down().wait();

        let (accepted, mut job) = submitter.join().unwrap();
        let expected = if accepted { 16 } else { 0 };
        assert_eq!(executed.load(Ordering::SeqCst), expected);
        assert!(job.is_done());
        job.discard();
    }
}
