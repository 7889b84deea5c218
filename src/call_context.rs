//! Per-call deadline and cancellation management.
//!
//! Every proxied call gets a [`CallContext`] with its own cancellation token
//! (a child of the connection's token) and a background lifecycle task that
//! owns the deadline. The data path pushes the deadline forward with
//! [`CallContext::extend`]; when the deadline passes without an extension the
//! lifecycle task cancels the call on its own.
//!
//! ```text
//!   extend(d) ──► [bounded queue] ──┐
//!   release() / parent cancel ──────┼──► lifecycle task ──► cancelled = true
//!   deadline timer ─────────────────┘                  └──► abort attached stream
//! ```

use log::{debug, trace};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::AbortHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};

/// Pending extensions beyond this are dropped; the queued ones still apply.
pub const EXTENSION_QUEUE_CAPACITY: usize = 5;

/// Idle time the lifecycle task gives the data path after a deadline-driven
/// cancellation before it tears the stream down.
pub const CANCEL_GRACE: Duration = Duration::from_millis(10);

/// Hands out call contexts and their process-wide indices.
#[derive(Debug, Default)]
pub struct CallContextManager {
    counter: AtomicU64,
}

impl CallContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context whose cancellation is derived from `parent` and whose
    /// deadline starts at `now + timeout`. Must be called inside a tokio runtime.
    pub fn create(&self, parent: &CancellationToken, timeout: Duration) -> CallContext {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let (extend_tx, extend_rx) = mpsc::channel(EXTENSION_QUEUE_CAPACITY);
        let now = Instant::now();

        let shared = Arc::new(Shared {
            index,
            token: parent.child_token(),
            started: now,
            cancelled: AtomicBool::new(false),
            deadline: Mutex::new(now + timeout),
            stream: Mutex::new(StreamSlot::default()),
            extend_tx,
        });

        tokio::spawn(run_lifecycle(shared.clone(), extend_rx));
        trace!("[call {}] context created, timeout {:?}", index, timeout);

        CallContext { shared }
    }

    /// Number of contexts created so far.
    pub fn created(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

/// Handle on one call's deadline and cancellation state. Cloning is cheap and
/// every clone observes the same call.
#[derive(Debug, Clone)]
pub struct CallContext {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    index: u64,
    token: CancellationToken,
    started: Instant,
    // Written only by the lifecycle task.
    cancelled: AtomicBool,
    deadline: Mutex<Instant>,
    stream: Mutex<StreamSlot>,
    extend_tx: mpsc::Sender<Duration>,
}

#[derive(Debug, Default)]
struct StreamSlot {
    handle: Option<AbortHandle>,
    closed: bool,
}

impl CallContext {
    pub fn index(&self) -> u64 {
        self.shared.index
    }

    /// Time since the call started.
    pub fn elapsed(&self) -> Duration {
        self.shared.started.elapsed()
    }

    /// Current effective deadline.
    pub fn deadline(&self) -> Instant {
        *lock(&self.shared.deadline)
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Asks the lifecycle task to move the deadline to `now + duration`.
    /// Never blocks; a full queue drops this request.
    pub fn extend(&self, duration: Duration) {
        match self.shared.extend_tx.try_send(duration) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                trace!("[call {}] extension queue full, dropping extension", self.shared.index);
            }
            Err(TrySendError::Closed(_)) => {
                trace!("[call {}] extension after lifecycle exit ignored", self.shared.index);
            }
        }
    }

    /// Ends the call normally.
    pub fn release(&self) {
        self.shared.token.cancel();
    }

    /// Guard that releases the call when dropped, whatever the exit path.
    pub fn release_guard(&self) -> DropGuard {
        self.shared.token.clone().drop_guard()
    }

    /// Token that fires on deadline, parent cancellation or release.
    pub fn token(&self) -> &CancellationToken {
        &self.shared.token
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.shared.token.cancelled()
    }

    /// Gives the context the task that drains the upstream stream. The
    /// lifecycle task aborts it when the call ends; if that already happened
    /// the task is aborted right away. Only the first assignment is kept.
    pub fn attach_stream(&self, handle: AbortHandle) {
        let mut slot = lock(&self.shared.stream);
        if slot.closed {
            drop(slot);
            handle.abort();
            return;
        }
        if slot.handle.is_some() {
            debug!("[call {}] stream already attached", self.shared.index);
            return;
        }
        slot.handle = Some(handle);
    }
}

async fn run_lifecycle(shared: Arc<Shared>, mut extend_rx: mpsc::Receiver<Duration>) {
    loop {
        let deadline = *lock(&shared.deadline);

        tokio::select! {
            biased;

            _ = shared.token.cancelled() => break,

            Some(extension) = extend_rx.recv() => {
                let requested = Instant::now() + extension;
                let mut deadline = lock(&shared.deadline);
                if requested > *deadline {
                    *deadline = requested;
                }
            }

            _ = time::sleep_until(deadline) => {
                debug!("[call {}] deadline reached after {:?}, cancelling", shared.index, shared.started.elapsed());
                shared.cancelled.store(true, Ordering::Release);
                shared.token.cancel();
                time::sleep(CANCEL_GRACE).await;
            }
        }
    }

    shared.cancelled.store(true, Ordering::Release);
    extend_rx.close();

    let handle = {
        let mut slot = lock(&shared.stream);
        slot.closed = true;
        slot.handle.take()
    };
    if let Some(handle) = handle {
        handle.abort();
    }
    trace!("[call {}] lifecycle finished", shared.index);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
