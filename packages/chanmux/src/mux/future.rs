use super::state::{Shared, WaitResult};
use crate::{
    error::{TryWaitError, WouldBlockError},
    polling::{Timeout, poll},
    waiter::Claim,
};
use std::{
    future::Future,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};


/// Future for waiting until a mux has an item to read
///
/// Resolves to `Ok(true)` once an item is readable, to `Ok(false)` once every input is closed
/// and drained, or to an error. Dropping it before it resolves withdraws the wait.
pub struct WaitToRead(Inner);

enum Inner {
    // resolved on construction
    Ready(WaitResult),
    // reader parked on the mux
    Parked {
        shared: Arc<Shared>,
        waiter: Claim<WaitResult>,
        cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    },
    // result already taken
    Terminated,
}

impl WaitToRead {
    pub(crate) fn ready(result: WaitResult) -> Self {
        WaitToRead(Inner::Ready(result))
    }

    pub(crate) fn parked(
        shared: Arc<Shared>,
        waiter: Claim<WaitResult>,
        cancel: Option<&CancellationToken>,
    ) -> Self {
        WaitToRead(Inner::Parked {
            shared,
            waiter,
            cancelled: cancel.map(|token| Box::pin(token.clone().cancelled_owned())),
        })
    }

    /// Block until this future resolves
    ///
    /// Calling this method counts as polling this future, and when this method returns, that
    /// counts as this future resolving. This method will panic if this future has already
    /// resolved.
    pub fn block(&mut self) -> WaitResult {
        assert!(!self.is_terminated(), "WaitToRead.block called after terminated");
        poll(self, Timeout::Never).expect("poll timed out with Timeout::Never")
    }

    /// Try to resolve this future immediately without blocking
    ///
    /// Calling this method counts as polling this future, and if this method returns anything
    /// other than [`WouldBlockError`], that counts as this future resolving. This method will
    /// panic if this future has already resolved.
    pub fn try_now(&mut self) -> Result<bool, TryWaitError> {
        assert!(!self.is_terminated(), "WaitToRead.try_now called after terminated");
        map_try_wait_result(poll(self, Timeout::NonBlocking))
    }

    /// Block until this future resolves or a timeout elapses
    ///
    /// Calling this method counts as polling this future, and if this method returns anything
    /// other than [`WouldBlockError`], that counts as this future resolving. This method will
    /// panic if this future has already resolved.
    pub fn block_timeout(&mut self, timeout: Duration) -> Result<bool, TryWaitError> {
        assert!(!self.is_terminated(), "WaitToRead.block_timeout called after terminated");
        self.block_deadline(Instant::now() + timeout)
    }

    /// Block until this future resolves or the deadline is reached
    ///
    /// Calling this method counts as polling this future, and if this method returns anything
    /// other than [`WouldBlockError`], that counts as this future resolving. This method will
    /// panic if this future has already resolved.
    pub fn block_deadline(&mut self, deadline: Instant) -> Result<bool, TryWaitError> {
        assert!(!self.is_terminated(), "WaitToRead.block_deadline called after terminated");
        map_try_wait_result(poll(self, Timeout::At(deadline)))
    }

    /// Whether this future has already resolved
    pub fn is_terminated(&self) -> bool {
        matches!(&self.0, Inner::Terminated)
    }
}

fn map_try_wait_result(result: Option<WaitResult>) -> Result<bool, TryWaitError> {
    match result {
        Some(result) => result.map_err(TryWaitError::from),
        None => Err(WouldBlockError.into()),
    }
}

impl Future for WaitToRead {
    type Output = WaitResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<WaitResult> {
        let this = self.get_mut();
        let parked_result = match &mut this.0 {
            // for implementation of FusedFuture
            Inner::Terminated => return Poll::Pending,
            Inner::Ready(_) => None,
            Inner::Parked { shared, waiter, cancelled } => {
                if let Poll::Ready(result) = waiter.poll_result(cx) {
                    Some(result)
                } else {
                    let Some(cancelled) = cancelled else { return Poll::Pending };
                    if cancelled.as_mut().poll(cx).is_pending() {
                        return Poll::Pending;
                    }
                    // resolves the waiter unless something else already has
                    shared.cancel_wait(waiter);
                    match waiter.poll_result(cx) {
                        Poll::Ready(result) => Some(result),
                        Poll::Pending => unreachable!("cancelled wait did not resolve"),
                    }
                }
            }
        };
        match (mem::replace(&mut this.0, Inner::Terminated), parked_result) {
            (_, Some(result)) => Poll::Ready(result),
            (Inner::Ready(result), None) => Poll::Ready(result),
            (_, None) => unreachable!(),
        }
    }
}

#[cfg(feature = "futures")]
impl futures::future::FusedFuture for WaitToRead {
    fn is_terminated(&self) -> bool {
        Self::is_terminated(self)
    }
}

impl Drop for WaitToRead {
    fn drop(&mut self) {
        if let Inner::Parked { shared, waiter, .. } = &self.0 {
            shared.abandon_wait(waiter);
        }
    }
}

impl std::fmt::Debug for WaitToRead {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let state = match &self.0 {
            Inner::Ready(_) => "Ready",
            Inner::Parked { .. } => "Parked",
            Inner::Terminated => "Terminated",
        };
        f.debug_tuple("WaitToRead").field(&state).finish()
    }
}
