use crossbeam_deque::{Injector, Steal};
use crossbeam_utils::sync::Unparker;

use super::job::JobState;
use super::latch::Latch;
use super::sync::Arc;

/// Instructions sent to a worker thread.
pub(crate) enum WorkerCommand {
    /// Execute `count` slices of `job`, starting at `first_slice` and moving forward
    /// by `stride` slices each time.
    Run {
        job: Arc<JobState>,
        first_slice: u32,
        count: u32,
        stride: u32,
    },
    /// Block until the given epoch of the latch is over before processing further
    /// commands.
    Sync {
        event: Arc<Latch>,
        epoch: u32,
    },
}

impl std::fmt::Debug for WorkerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            WorkerCommand::Run { first_slice, count, stride, .. } => f
                .debug_struct("Run")
                .field("first_slice", first_slice)
                .field("count", count)
                .field("stride", stride)
                .finish(),
            WorkerCommand::Sync { epoch, .. } => f
                .debug_struct("Sync")
                .field("epoch", epoch)
                .finish(),
        }
    }
}

/// The FIFO queue of a worker.
///
/// Any thread can push commands, only the owning worker pops them.
pub(crate) struct CommandQueue {
    commands: Injector<WorkerCommand>,
    unparker: Unparker,
}

impl CommandQueue {
    pub fn new(unparker: Unparker) -> Self {
        CommandQueue {
            commands: Injector::new(),
            unparker,
        }
    }

    /// Push a command and wake the worker up if it is sleeping.
    pub fn enqueue(&self, command: WorkerCommand) {
        self.commands.push(command);
        self.unparker.unpark();
    }

    /// Move all currently queued commands into `batch`, in queue order.
    pub fn dequeue_all(&self, batch: &mut Vec<WorkerCommand>) {
        loop {
            match self.commands.steal() {
                Steal::Success(command) => batch.push(command),
                Steal::Empty => return,
                Steal::Retry => {}
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn wake(&self) {
        self.unparker.unpark();
    }
}

#[test]
fn test_dequeue_all_keeps_order() {
    use crossbeam_utils::sync::Parker;

    let parker = Parker::new();
    let queue = CommandQueue::new(parker.unparker().clone());
    let events: Vec<Arc<Latch>> = (0..5).map(|_| Arc::new(Latch::new())).collect();

    for event in &events {
        queue.enqueue(WorkerCommand::Sync { event: event.clone(), epoch: 0 });
    }

    // The pending wake up token is consumed without blocking.
    parker.park();

    let mut batch = Vec::new();
    queue.dequeue_all(&mut batch);
    assert!(queue.is_empty());
    assert_eq!(batch.len(), 5);

    for (cmd, expected) in batch.iter().zip(&events) {
        match cmd {
            WorkerCommand::Sync { event, .. } => assert!(Arc::ptr_eq(event, expected)),
            WorkerCommand::Run { .. } => panic!("unexpected {:?}", cmd),
        }
    }

    batch.clear();
    queue.dequeue_all(&mut batch);
    assert!(batch.is_empty());
}
