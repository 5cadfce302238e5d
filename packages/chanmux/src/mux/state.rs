// state shared between a mux and all of its inputs.
//
// hot counters live in atomics so that producers can write and the consumer can read without
// taking the lock in the common case. every multi-step transition (parking or unparking a reader,
// tallying a closed input, recording an error, firing the completion signal) happens while
// holding the state lock. the lock is never held while waking a reader.

use super::{
    future::WaitToRead,
    options::MuxOptions,
};
use crate::{
    error::{
        SourceError,
        WaitError,
        CancelledError,
        ConcurrentWaitError,
        CompletionError,
        MuxDroppedError,
    },
    waiter::{Waiter, Claim},
};
use std::sync::{
    Arc,
    Mutex,
    MutexGuard,
    atomic::{
        Ordering::SeqCst,
        AtomicBool,
        AtomicIsize,
        AtomicUsize,
    },
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;


pub(crate) type WaitResult = Result<bool, WaitError>;

// value of the completion signal. none until fired.
pub(crate) type CompletionState = Option<Result<(), SourceError>>;

// parked reader to resolve once the state lock is released.
pub(crate) type Wake = Option<(Claim<WaitResult>, WaitResult)>;

pub struct Shared {
    // items enqueued across all inputs minus items dequeued. may be transiently negative, because
    // a consumer may dequeue an item before its producer has counted it.
    pub(super) readable_items: AtomicIsize,
    // number of inputs which are write-complete and drained. never exceeds total_channels.
    pub(super) closed_channels: AtomicUsize,
    pub(super) total_channels: usize,
    // mirrors whether lockable.exception is some, for lock-free checks.
    pub(super) has_exception: AtomicBool,
    // set after a waiter is installed, and cleared when one is taken. lets writers skip the lock.
    reader_waiting: AtomicBool,
    waiter_singleton: Arc<Waiter<WaitResult>>,
    pub(super) options: MuxOptions,
    lockable: Mutex<Lockable>,
}

pub(crate) struct Lockable {
    // parked reader
    waiting: Option<Claim<WaitResult>>,
    // first unsuppressed error, with the index of the input that reported it
    exception: Option<(usize, SourceError)>,
    completion: watch::Sender<CompletionState>,
}

impl Shared {
    pub(crate) fn new(total_channels: usize, options: MuxOptions) -> Arc<Self> {
        let (completion, _) = watch::channel(None);
        let wake_asynchronously = options.run_continuations_asynchronously;
        Arc::new(Shared {
            readable_items: AtomicIsize::new(0),
            closed_channels: AtomicUsize::new(0),
            total_channels,
            has_exception: AtomicBool::new(false),
            reader_waiting: AtomicBool::new(false),
            waiter_singleton: Waiter::pooled(wake_asynchronously),
            options,
            lockable: Mutex::new(Lockable {
                waiting: None,
                exception: None,
                completion,
            }),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Lockable> {
        self.lockable.lock().unwrap()
    }

    pub(crate) fn exception(&self) -> Option<SourceError> {
        if !self.has_exception.load(SeqCst) {
            return None;
        }
        self.lock().exception.as_ref().map(|(_, e)| e.clone())
    }

    pub(crate) fn all_closed(&self) -> bool {
        self.closed_channels.load(SeqCst) >= self.total_channels
    }

    // count a newly enqueued item, and unpark the reader if one is parked.
    pub(crate) fn item_added(&self) {
        self.readable_items.fetch_add(1, SeqCst);
        if self.reader_waiting.load(SeqCst) {
            let waiter = {
                let mut lock = self.lock();
                self.take_waiter(&mut lock)
            };
            if let Some(waiter) = waiter {
                trace!("unparking reader for newly readable item");
                waiter.complete(Ok(true));
            }
        }
    }

    pub(crate) fn items_removed(&self, n: usize) {
        self.readable_items.fetch_sub(n as isize, SeqCst);
    }

    fn take_waiter(&self, lock: &mut Lockable) -> Option<Claim<WaitResult>> {
        let waiter = lock.waiting.take();
        self.reader_waiting.store(false, SeqCst);
        waiter
    }

    // remove the given waiter from the slot if it is still parked there.
    fn take_waiter_if(&self, lock: &mut Lockable, waiter: &Claim<WaitResult>) -> bool {
        if lock.waiting.as_ref().is_some_and(|parked| parked.same(waiter)) {
            self.take_waiter(lock);
            true
        } else {
            false
        }
    }

    // record an error reported by the input at the given index. the first error wins.
    pub(crate) fn record_exception(&self, lock: &mut Lockable, index: usize, error: SourceError) {
        if lock.exception.is_none() {
            debug!(%error, "mux input failed");
            lock.exception = Some((index, error));
            self.has_exception.store(true, SeqCst);
        } else {
            debug!(%error, "mux input failed after another input already failed");
        }
    }

    // count an input as closed. the caller guarantees each input is tallied at most once per
    // registration.
    pub(crate) fn tally_closed(&self, _lock: &mut Lockable) {
        let closed = self.closed_channels.fetch_add(1, SeqCst) + 1;
        debug_assert!(closed <= self.total_channels, "closed tally overflow (internal bug)");
        trace!(closed, total = self.total_channels, "mux input closed");
    }

    // fire the completion signal if the mux is finished and it has not fired yet, and take the
    // parked reader, if any, to be resolved once the lock is released.
    pub(crate) fn try_finish(&self, lock: &mut Lockable) -> Wake {
        let result = match &lock.exception {
            Some((_, error)) => Err(error.clone()),
            None if self.all_closed() => Ok(()),
            None => return None,
        };
        let fired = lock.completion.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(result.clone());
                true
            } else {
                false
            }
        });
        if fired {
            debug!(success = result.is_ok(), "mux completed");
        }
        let waiter = self.take_waiter(lock)?;
        Some((waiter, result.map(|()| false).map_err(WaitError::from)))
    }

    // undo the state an input contributed, so that a fresh input can take its place. re-arms
    // the completion signal if it already fired, and fires it again immediately if the remaining
    // state still warrants it.
    pub(crate) fn reset_input(&self, lock: &mut Lockable, index: usize, was_closed: bool) -> Wake {
        if was_closed {
            self.closed_channels.fetch_sub(1, SeqCst);
        }
        if lock.exception.as_ref().is_some_and(|&(i, _)| i == index) {
            lock.exception = None;
            self.has_exception.store(false, SeqCst);
        }
        if lock.completion.borrow().is_some() {
            // receivers of the fired signal keep observing its final value
            lock.completion = watch::channel(None).0;
            debug!("mux completion re-armed");
        }
        self.try_finish(lock)
    }

    pub(crate) fn completion(&self) -> Completion {
        Completion(self.lock().completion.subscribe())
    }

    pub(crate) fn wait_to_read(
        self: &Arc<Self>,
        cancel: Option<&CancellationToken>,
    ) -> WaitToRead {
        // fast path
        if cancel.is_some_and(|token| token.is_cancelled()) {
            return WaitToRead::ready(Err(CancelledError.into()));
        }
        if let Some(error) = self.exception() {
            return WaitToRead::ready(Err(error.into()));
        }
        if self.readable_items.load(SeqCst) > 0 {
            return WaitToRead::ready(Ok(true));
        }

        // slow path
        let (waiter, displaced) = {
            let mut lock = self.lock();
            if self.readable_items.load(SeqCst) > 0 {
                return WaitToRead::ready(Ok(true));
            }
            if let Some((_, error)) = &lock.exception {
                return WaitToRead::ready(Err(error.clone().into()));
            }
            if self.all_closed() {
                return WaitToRead::ready(Ok(false));
            }

            let waiter = cancel
                .is_none()
                .then(|| self.waiter_singleton.try_claim())
                .flatten()
                .unwrap_or_else(|| Waiter::armed(self.options.run_continuations_asynchronously));
            let displaced = lock.waiting.replace(waiter.clone());
            self.reader_waiting.store(true, SeqCst);
            (waiter, displaced)
        };
        if let Some(displaced) = displaced {
            warn!("wait_to_read called on mux while a previous wait was still outstanding");
            displaced.complete(Err(ConcurrentWaitError.into()));
        }

        // an item may have been counted before its producer could see the parked reader
        if self.readable_items.load(SeqCst) > 0 {
            let reclaimed = self.take_waiter_if(&mut self.lock(), &waiter);
            if reclaimed {
                waiter.release();
                return WaitToRead::ready(Ok(true));
            }
        }

        trace!(pooled = waiter.is_pooled(), "parking mux reader");
        WaitToRead::parked(Arc::clone(self), waiter, cancel)
    }

    // resolve a parked wait because its cancellation token fired. data that is already available
    // takes precedence over cancellation.
    pub(crate) fn cancel_wait(&self, waiter: &Claim<WaitResult>) {
        let result = {
            let mut lock = self.lock();
            self.take_waiter_if(&mut lock, waiter);
            if self.readable_items.load(SeqCst) > 0 {
                Ok(true)
            } else {
                Err(CancelledError.into())
            }
        };
        if waiter.complete(result) {
            trace!("mux wait cancelled");
        }
    }

    // unpark and release the waiter of a wait which was dropped before resolving.
    pub(crate) fn abandon_wait(&self, waiter: &Claim<WaitResult>) {
        self.take_waiter_if(&mut self.lock(), waiter);
        waiter.release();
    }
}

// resolve a parked reader taken while holding the state lock.
pub(crate) fn wake(wake: Wake) {
    if let Some((waiter, result)) = wake {
        waiter.complete(result);
    }
}

/// Handle to a mux's completion signal
///
/// The signal fires once every input is closed, or once an input reports an error that is not
/// suppressed, whichever happens first. Replacing an input re-arms the mux's signal, in which
/// case handles obtained earlier keep observing the value it fired with.
#[derive(Clone)]
pub struct Completion(watch::Receiver<CompletionState>);

impl Completion {
    /// Whether the signal has fired
    pub fn is_completed(&self) -> bool {
        self.0.borrow().is_some()
    }

    /// The value the signal fired with, if it has fired
    pub fn result(&self) -> Option<Result<(), SourceError>> {
        self.0.borrow().clone()
    }

    /// Wait for the signal to fire
    ///
    /// Errors with `MuxDropped` if the mux is dropped before the signal fires.
    pub async fn wait(mut self) -> Result<(), CompletionError> {
        let state = self.0
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CompletionError::from(MuxDroppedError))?;
        match &*state {
            Some(Ok(())) => Ok(()),
            Some(Err(error)) => Err(error.clone().into()),
            None => unreachable!("completion wait resolved before firing"),
        }
    }

    /// Block the current thread until the signal fires
    ///
    /// Errors with `MuxDropped` if the mux is dropped before the signal fires.
    pub fn block(self) -> Result<(), CompletionError> {
        crate::polling::block_on(self.wait())
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("Completion").field(&*self.0.borrow()).finish()
    }
}
