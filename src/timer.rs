//! Shared deadline timer
//!
//! One background thread owns a min-heap of deadlines and runs the callback of
//! each deadline that is still pending when it comes due. Scheduling only sends
//! over a channel, so any number of threads can schedule and cancel without
//! locking. The worker never touches the work a deadline guards: a fired
//! deadline only runs its callback.
//!
//! The worker is a plain detached thread, so it never holds the process open.

use once_cell::sync::Lazy;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::EmitError;

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const FIRED: u8 = 2;

static GLOBAL: Lazy<Option<Arc<DeadlineTimer>>> = Lazy::new(|| match DeadlineTimer::start("poe-timer") {
    Ok(timer) => Some(Arc::new(timer)),
    Err(e) => {
        log::error!("Failed to start PoE deadline timer, timeouts will not be observed: {}", e);
        None
    }
});

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to one scheduled deadline
#[derive(Debug, Clone)]
pub struct Deadline {
    state: Arc<AtomicU8>,
}

impl Deadline {
    /// Cancel the deadline. Returns false if it already fired.
    pub fn cancel(&self) -> bool {
        match self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(state) => state == CANCELLED,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }
}

struct Entry {
    at: Instant,
    seq: u64,
    state: Arc<AtomicU8>,
    callback: Callback,
}

// Reversed so BinaryHeap pops the earliest deadline first
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

/// Single-worker timer facility
pub struct DeadlineTimer {
    tx: Sender<Entry>,
    seq: AtomicU64,
    queued: Arc<AtomicUsize>,
}

impl DeadlineTimer {
    /// Start a timer with its own worker thread
    pub fn start(name: &str) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let worker_queued = Arc::clone(&queued);

        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(rx, worker_queued))?;

        log::debug!("Started deadline timer worker '{}'", name);
        Ok(Self {
            tx,
            seq: AtomicU64::new(0),
            queued,
        })
    }

    /// The process-wide timer, started on first use
    pub fn global() -> Option<Arc<DeadlineTimer>> {
        (*GLOBAL).clone()
    }

    /// Run `callback` on the worker after `after`, unless cancelled first
    pub fn schedule<F>(&self, after: Duration, callback: F) -> Result<Deadline, EmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(PENDING));
        let entry = Entry {
            at: Instant::now() + after,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            state: Arc::clone(&state),
            callback: Box::new(callback),
        };

        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(entry).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(EmitError::Unexpected("deadline timer worker has stopped".to_string()));
        }

        Ok(Deadline { state })
    }

    /// Deadlines scheduled but not yet reached (cancelled ones included)
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

fn run(rx: Receiver<Entry>, queued: Arc<AtomicUsize>) {
    let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
    let mut closed = false;

    loop {
        let now = Instant::now();
        while heap.peek().is_some_and(|entry| entry.at <= now) {
            if let Some(entry) = heap.pop() {
                queued.fetch_sub(1, Ordering::SeqCst);
                fire(entry);
            }
        }

        let wait = heap.peek().map(|entry| entry.at.saturating_duration_since(Instant::now()));

        if closed {
            match wait {
                Some(wait) => thread::sleep(wait),
                None => return,
            }
            continue;
        }

        let received = match wait {
            Some(wait) => rx.recv_timeout(wait),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(entry) => heap.push(entry),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => closed = true,
        }
    }
}

fn fire(entry: Entry) {
    if entry
        .state
        .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    if panic::catch_unwind(AssertUnwindSafe(entry.callback)).is_err() {
        log::error!("Deadline callback panicked");
    }
}
