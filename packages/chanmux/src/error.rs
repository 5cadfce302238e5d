//! Error types

use crate::source::TypeTag;
use std::{
    error::Error as StdError,
    fmt::{self, Formatter, Debug, Display},
    sync::Arc,
};
use thiserror::Error;


// ==== producer-reported errors ====


/// Error with which a producer completes its channel
///
/// Cheaply clonable, so that one failure can be fanned out to every reader of a broadcast channel
/// and re-surfaced from every wait on a mux.
#[derive(Clone)]
pub struct ChannelError(Arc<anyhow::Error>);

impl ChannelError {
    /// Wrap any error
    pub fn new<E: Into<anyhow::Error>>(error: E) -> Self {
        ChannelError(Arc::new(error.into()))
    }

    /// Construct from a printable message
    pub fn msg<M>(msg: M) -> Self
    where
        M: Display + Debug + Send + Sync + 'static,
    {
        ChannelError(Arc::new(anyhow::Error::msg(msg)))
    }

    /// Borrow the wrapped error
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Downcast the wrapped error by reference
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Whether both handles refer to the same reported error
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<anyhow::Error> for ChannelError {
    fn from(error: anyhow::Error) -> Self {
        ChannelError(Arc::new(error))
    }
}

impl Debug for ChannelError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

impl Display for ChannelError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&*self.0, f)
    }
}

impl StdError for ChannelError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

/// Error a mux recorded because one of its inputs was completed with an error
///
/// Tagged with the item type of the input that reported it.
#[derive(Debug, Clone, Error)]
#[error("{type_tag} channel completed with error: {cause}")]
pub struct SourceError {
    type_tag: TypeTag,
    #[source]
    cause: ChannelError,
}

impl SourceError {
    pub(crate) fn new(type_tag: TypeTag, cause: ChannelError) -> Self {
        SourceError { type_tag, cause }
    }

    /// Item type of the input that reported the error
    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    /// Whether the error was reported by an input of item type `T`
    pub fn is_from<T: 'static>(&self) -> bool {
        self.type_tag == TypeTag::of::<T>()
    }

    /// The error the producer completed its channel with
    pub fn cause(&self) -> &ChannelError {
        &self.cause
    }
}


// ==== base error types ====


/// Error for a wait whose cancellation token fired before it resolved
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
#[error("wait was cancelled")]
pub struct CancelledError;

/// Error for a wait that was displaced by another wait started on the same mux before it resolved
///
/// A mux supports a single outstanding wait. Seeing this error indicates a bug in the consumer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
#[error("another wait was started on the mux before this one resolved")]
pub struct ConcurrentWaitError;

/// Error for trying to replace a mux input which is not yet complete, without forcing it
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
#[error("channel is not complete and replacement was not forced")]
pub struct NotClosedError;

/// Error for awaiting completion of a mux that was dropped before completing
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
#[error("mux was dropped before completing")]
pub struct MuxDroppedError;

/// Error for attempting to wait with no or limited blocking, and the wait not resolving
/// immediately or by the specified deadline
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
#[error("operation would block")]
pub struct WouldBlockError;


// ==== compound error types ====


macro_rules! compound_from {
    ($compound:ident {$(
        $variant:ident($inner:ty),
    )*})=>{$(
        impl From<$inner> for $compound {
            fn from(inner: $inner) -> Self {
                Self::$variant(inner)
            }
        }
    )*};
}

/// Error for waiting on a mux to become readable
#[derive(Debug, Clone, Error)]
pub enum WaitError {
    /// An input was completed with an error which was not suppressed
    #[error(transparent)]
    Source(SourceError),
    /// The wait's cancellation token fired
    #[error(transparent)]
    Cancelled(CancelledError),
    /// Another wait was started before this one resolved
    #[error(transparent)]
    ConcurrentWait(ConcurrentWaitError),
}

compound_from!(WaitError {
    Source(SourceError),
    Cancelled(CancelledError),
    ConcurrentWait(ConcurrentWaitError),
});

/// Error for waiting on a mux with no or limited blocking
#[derive(Debug, Clone, Error)]
pub enum TryWaitError {
    /// The wait resolved to an error
    #[error(transparent)]
    Wait(WaitError),
    /// The wait could not be resolved immediately or by the specified deadline
    #[error(transparent)]
    WouldBlock(WouldBlockError),
}

compound_from!(TryWaitError {
    Wait(WaitError),
    WouldBlock(WouldBlockError),
});

/// Error state of a mux's completion
#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    /// The mux completed because an input reported an error
    #[error(transparent)]
    Source(SourceError),
    /// The mux was dropped without completing
    #[error(transparent)]
    MuxDropped(MuxDroppedError),
}

compound_from!(CompletionError {
    Source(SourceError),
    MuxDropped(MuxDroppedError),
});


#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Error)]
    #[error("disk full")]
    struct DiskFull;

    #[test]
    fn channel_error_wraps_and_shares() {
        let error = ChannelError::new(DiskFull);
        assert_eq!(error.downcast_ref::<DiskFull>(), Some(&DiskFull));
        assert!(error.downcast_ref::<std::io::Error>().is_none());
        assert_eq!(error.inner().to_string(), "disk full");

        let clone = error.clone();
        assert!(error.ptr_eq(&clone));
        assert!(!error.ptr_eq(&ChannelError::new(DiskFull)));

        let from_anyhow = ChannelError::from(anyhow::anyhow!("disk full"));
        assert_eq!(from_anyhow.to_string(), error.to_string());
        assert!(from_anyhow.downcast_ref::<DiskFull>().is_none());
    }

    #[test]
    fn source_error_chain() {
        let cause = ChannelError::msg("boom");
        let error = SourceError::new(TypeTag::of::<u32>(), cause.clone());
        assert_eq!(error.to_string(), "u32 channel completed with error: boom");
        assert!(error.is_from::<u32>());
        assert!(!error.is_from::<i32>());
        assert!(error.cause().ptr_eq(&cause));
        assert_eq!(StdError::source(&error).unwrap().to_string(), "boom");

        let wait = WaitError::from(error);
        assert_eq!(wait.to_string(), "u32 channel completed with error: boom");
        assert!(matches!(TryWaitError::from(wait), TryWaitError::Wait(WaitError::Source(_))));
        assert_eq!(TryWaitError::from(WouldBlockError).to_string(), "operation would block");
    }
}
