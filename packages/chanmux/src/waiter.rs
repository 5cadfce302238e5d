// reusable single-observer completion cell that parks a reader until the mux is readable.
//
// a waiter moves through `Idle -> Armed -> Resolved -> Idle`. an operation claims an idle waiter
// (arming it), someone resolves it at most once, and the operation observes the result exactly
// once, which returns a pooled waiter to idle for the next operation to claim. a non-pooled
// waiter is armed from birth and simply dropped once observed.
//
// every claim gets a new epoch, and resolving or releasing through a stale claim does nothing.
// this keeps a resolver that took a waiter out of the mux just before its operation was withdrawn
// from resolving whatever operation claimed the waiter next.

use std::{
    mem,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};
use tokio::runtime::Handle;


pub(crate) struct Waiter<T> {
    inner: Mutex<Inner<T>>,
    pooled: bool,
    wake_asynchronously: bool,
}

struct Inner<T> {
    epoch: u64,
    state: State<T>,
}

enum State<T> {
    // not owned by any operation.
    Idle,
    // owned by an operation that has not resolved yet. holds the waker of the last poll, if any.
    Armed(Option<Waker>),
    // resolved, result not yet observed.
    Resolved(T),
}

// one operation's ownership of a waiter.
pub(crate) struct Claim<T> {
    waiter: Arc<Waiter<T>>,
    epoch: u64,
}

impl<T> Waiter<T> {
    // construct an idle waiter for repeated reuse.
    pub(crate) fn pooled(wake_asynchronously: bool) -> Arc<Self> {
        Arc::new(Waiter {
            inner: Mutex::new(Inner { epoch: 0, state: State::Idle }),
            pooled: true,
            wake_asynchronously,
        })
    }

    // construct an already armed waiter for a single operation.
    pub(crate) fn armed(wake_asynchronously: bool) -> Claim<T> {
        let waiter = Arc::new(Waiter {
            inner: Mutex::new(Inner { epoch: 0, state: State::Armed(None) }),
            pooled: false,
            wake_asynchronously,
        });
        Claim { waiter, epoch: 0 }
    }

    // try to take ownership of an idle waiter. fails if another operation owns it.
    pub(crate) fn try_claim(self: &Arc<Self>) -> Option<Claim<T>> {
        let mut lock = self.inner.lock().unwrap();
        if !matches!(&lock.state, State::Idle) {
            return None;
        }
        lock.epoch += 1;
        lock.state = State::Armed(None);
        Some(Claim { waiter: Arc::clone(self), epoch: lock.epoch })
    }

    fn wake(&self, waker: Waker) {
        if self.wake_asynchronously {
            if let Ok(handle) = Handle::try_current() {
                handle.spawn(async move { waker.wake() });
                return;
            }
        }
        waker.wake();
    }
}

impl<T> Claim<T> {
    // resolve the claimed waiter, waking its operation. returns false and does nothing if the
    // claim is stale or the waiter is not armed, so only the first resolution takes effect.
    pub(crate) fn complete(&self, result: T) -> bool {
        let waker = {
            let mut lock = self.waiter.inner.lock().unwrap();
            if lock.epoch != self.epoch {
                return false;
            }
            let State::Armed(waker) = &mut lock.state else { return false };
            let waker = waker.take();
            lock.state = State::Resolved(result);
            waker
        };
        if let Some(waker) = waker {
            self.waiter.wake(waker);
        }
        true
    }

    // observe the result if resolved, otherwise register the context's waker.
    //
    // panics if idle. an owning operation stops polling once it has observed the result.
    pub(crate) fn poll_result(&self, cx: &mut Context) -> Poll<T> {
        let mut lock = self.waiter.inner.lock().unwrap();
        debug_assert_eq!(lock.epoch, self.epoch, "polled stale waiter claim (internal bug)");
        match &mut lock.state {
            State::Armed(waker) => {
                if !waker.as_ref().is_some_and(|waker| waker.will_wake(cx.waker())) {
                    *waker = Some(cx.waker().clone());
                }
                Poll::Pending
            }
            State::Resolved(_) => match mem::replace(&mut lock.state, State::Idle) {
                State::Resolved(result) => Poll::Ready(result),
                _ => unreachable!(),
            },
            State::Idle => panic!("polled idle waiter (internal bug)"),
        }
    }

    // return an abandoned waiter to idle, dropping any unobserved result and stored waker.
    pub(crate) fn release(&self) {
        let mut lock = self.waiter.inner.lock().unwrap();
        if lock.epoch == self.epoch {
            lock.state = State::Idle;
        }
    }

    // whether both claims are the same ownership of the same waiter.
    pub(crate) fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.waiter, &other.waiter) && self.epoch == other.epoch
    }

    pub(crate) fn is_pooled(&self) -> bool {
        self.waiter.pooled
    }
}

impl<T> Clone for Claim<T> {
    fn clone(&self) -> Self {
        Claim { waiter: Arc::clone(&self.waiter), epoch: self.epoch }
    }
}
