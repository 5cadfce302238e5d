// per-type mux input.
//
// an input is split in two. the `Input` half is registered with the upstream source as a sink and
// is driven from the producer's thread. the `Slot` half is owned by the mux and is driven from
// the consumer's thread. they share an spsc queue, with the producer end behind the `Input` and
// the consumer end inside the `Slot`.
//
// an input moves through `open -> write-complete -> closed`. it becomes write-complete when its
// producer completes it, and closed once it is write-complete and drained, at which point it is
// tallied into the mux's closed count exactly once.

use super::state::{self, Shared};
use crate::{
    error::{ChannelError, SourceError, NotClosedError},
    source::{Writable, Sink, Source, Registration, TypeTag},
    spsc::{self, Producer, Consumer, Iter},
};
use std::{
    iter,
    sync::{
        Arc,
        Mutex,
        TryLockError,
        atomic::{
            Ordering::SeqCst,
            AtomicBool,
        },
    },
};


pub struct Input<T> {
    shared: Arc<Shared>,
    index: usize,
    type_tag: TypeTag,
    producer: Mutex<Producer<T>>,
    // set by the first completion, or by detaching. later completions are ignored.
    complete_claimed: AtomicBool,
    // write-complete. only set while holding the state lock.
    is_complete: AtomicBool,
    // tallied into the mux's closed count. only accessed while holding the state lock.
    is_closed: AtomicBool,
}

impl<T> Input<T> {
    // tally this input into the closed count unless it already is.
    fn tally_closed(&self, lock: &mut state::Lockable) -> bool {
        if self.is_closed.swap(true, SeqCst) {
            return false;
        }
        self.shared.tally_closed(lock);
        true
    }

    // make every later write and completion a no-op, without tallying anything. returns once no
    // write is in flight.
    fn detach(&self) {
        self.complete_claimed.store(true, SeqCst);
        {
            let _lock = self.shared.lock();
            self.is_complete.store(true, SeqCst);
        }
        drop(self.producer.lock().unwrap());
    }
}

impl<T: 'static> Writable<T> for Input<T> {
    fn try_write(&self, item: T) -> bool {
        if self.shared.has_exception.load(SeqCst) {
            return false;
        }
        let mut producer = match self.producer.try_lock() {
            Ok(producer) => producer,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) if self.is_complete.load(SeqCst) => return false,
            Err(TryLockError::WouldBlock) => panic!(
                "concurrent writes to mux input for {}, which only supports a single producer",
                self.type_tag,
            ),
        };
        if self.is_complete.load(SeqCst) {
            return false;
        }
        producer.push(item);
        // counted before unlocking, so that detaching waits for the count too
        self.shared.item_added();
        true
    }

    fn try_complete(&self, error: Option<ChannelError>) -> bool {
        if self.complete_claimed.swap(true, SeqCst) {
            return false;
        }
        let error = self.shared.options.filter(self.type_tag, error)
            .map(|cause| SourceError::new(self.type_tag, cause));
        let wake = {
            let mut lock = self.shared.lock();
            if let Some(error) = error {
                self.shared.record_exception(&mut lock, self.index, error);
            }
            self.is_complete.store(true, SeqCst);
            self.shared.try_finish(&mut lock)
        };
        state::wake(wake);

        // the consumer tallies instead if it drains the last item after this check
        if self.producer.lock().unwrap().is_empty() {
            let wake = {
                let mut lock = self.shared.lock();
                if self.tally_closed(&mut lock) {
                    self.shared.try_finish(&mut lock)
                } else {
                    None
                }
            };
            state::wake(wake);
        }
        true
    }
}

pub struct Slot<T> {
    input: Arc<Input<T>>,
    consumer: Consumer<T>,
    registration: Option<Registration>,
}

impl<T> Slot<T> {
    pub(crate) fn try_read(&mut self) -> Option<T> {
        let item = self.consumer.pop()?;
        let shared = &self.input.shared;
        shared.items_removed(1);
        if self.input.is_complete.load(SeqCst) && self.consumer.is_empty() {
            let wake = {
                let mut lock = shared.lock();
                if self.consumer.is_empty() && self.input.tally_closed(&mut lock) {
                    shared.try_finish(&mut lock)
                } else {
                    None
                }
            };
            state::wake(wake);
        }
        Some(item)
    }

    pub(crate) fn dispose(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.deregister();
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.input.is_complete.load(SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.input.is_closed.load(SeqCst)
    }

    pub(crate) fn len(&self) -> usize {
        self.consumer.len()
    }

    pub(crate) fn iter(&self) -> Iter<'_, T> {
        self.consumer.iter()
    }
}

impl<T: Send + 'static> Slot<T> {
    // construct a fresh input for the given index and register it with the source.
    pub(crate) fn register<S>(shared: &Arc<Shared>, index: usize, source: &S) -> Self
    where
        S: Source<T> + ?Sized,
    {
        let (producer, consumer) = spsc::queue();
        let input = Arc::new(Input {
            shared: Arc::clone(shared),
            index,
            type_tag: TypeTag::of::<T>(),
            producer: Mutex::new(producer),
            complete_claimed: AtomicBool::new(false),
            is_complete: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
        });
        let registration = source.register_sink(Arc::clone(&input) as Arc<dyn Sink<T>>);
        trace!(index, type_tag = %input.type_tag, "mux input registered");
        Slot { input, consumer, registration: Some(registration) }
    }

    // swap in a fresh input registered with a new source, returning the old input's leftovers.
    pub(crate) fn replace<S>(&mut self, source: &S, force: bool) -> Result<Vec<T>, NotClosedError>
    where
        S: Source<T> + ?Sized,
    {
        if !force && !self.input.is_complete.load(SeqCst) {
            return Err(NotClosedError);
        }
        let old = Arc::clone(&self.input);
        let shared = Arc::clone(&old.shared);

        old.detach();
        if let Some(registration) = self.registration.take() {
            registration.deregister();
        }
        let remaining = iter::from_fn(|| self.consumer.pop()).collect::<Vec<T>>();
        shared.items_removed(remaining.len());

        let wake = {
            let mut lock = shared.lock();
            let was_closed = old.is_closed.load(SeqCst);
            shared.reset_input(&mut lock, old.index, was_closed)
        };
        state::wake(wake);

        *self = Slot::register(&shared, old.index, source);
        debug!(
            index = old.index,
            type_tag = %old.type_tag,
            remaining = remaining.len(),
            force,
            "mux input replaced",
        );
        Ok(remaining)
    }
}
