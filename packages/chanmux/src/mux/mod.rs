//! Typed channel multiplexers.
//!
//! A mux merges between two and eight sources of differently typed items into one consumer
//! endpoint. Each source feeds its own per-type input. The consumer waits on the mux as a whole
//! with [`wait_to_read`](Mux2::wait_to_read), and then reads from whichever input it likes with
//! [`try_read`](Mux2::try_read).
//!
//! Items of one type come out in the order their producer wrote them. There is no ordering
//! between items of different types.

pub(crate) mod state;
pub(crate) mod future;
pub(crate) mod input;
pub(crate) mod options;

#[cfg(test)]
mod tests;

use self::{
    state::{Shared, Completion},
    future::WaitToRead,
    input::Slot,
    options::MuxOptions,
};
use crate::{
    error::{NotClosedError, SourceError},
    source::Source,
    spsc::Iter,
};
use std::sync::{Arc, atomic::Ordering::SeqCst};
use tokio_util::sync::CancellationToken;


/// Index markers that select a mux input by position
///
/// Usually inferred. Only needed when a mux has multiple inputs of the same item type, in which
/// case the marker picks which of them to address, for example `mux.try_read::<u32, I1>()`.
pub mod index {
    macro_rules! index_markers {
        ($($idx:ident $n:literal,)*)=>{$(
            #[doc = concat!("Marker for the input at position ", stringify!($n))]
            #[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
            pub struct $idx;
        )*};
    }

    index_markers!(
        I0 0,
        I1 1,
        I2 2,
        I3 3,
        I4 4,
        I5 5,
        I6 6,
        I7 7,
    );
}

use self::index::*;

/// Mux which has an input of item type `T` at the position selected by `Idx`
///
/// Implemented by every mux for each of its inputs. This is what lets per-input methods such as
/// `try_read` pick an input by its item type.
pub trait HasInput<T, Idx> {
    #[doc(hidden)]
    fn input(&self) -> &Slot<T>;

    #[doc(hidden)]
    fn input_mut(&mut self) -> &mut Slot<T>;
}

macro_rules! impl_has_input {
    ($mux:ident [$($all:ident),*] $t:ident $idx:ident $n:tt)=>{
        impl<$($all),*> HasInput<$t, $idx> for $mux<$($all),*> {
            fn input(&self) -> &Slot<$t> {
                &self.slots.$n
            }

            fn input_mut(&mut self) -> &mut Slot<$t> {
                &mut self.slots.$n
            }
        }
    };
}

macro_rules! define_mux {
    (
        $(#[$attr:meta])*
        $mux:ident $all:tt $total:literal {$(
            $t:ident $idx:ident $n:tt $source:ident,
        )*}
    )=>{
        $(#[$attr])*
        pub struct $mux<$($t),*> {
            shared: Arc<Shared>,
            slots: ($(Slot<$t>,)*),
            disposed: bool,
        }

        impl<$($t: Send + 'static),*> $mux<$($t),*> {
            /// Construct with default options, registering an input with each source
            pub fn new($($source: &(impl Source<$t> + ?Sized)),*) -> Self {
                Self::with_options($($source,)* MuxOptions::default())
            }

            /// Construct with the given options, registering an input with each source
            pub fn with_options(
                $($source: &(impl Source<$t> + ?Sized),)*
                options: MuxOptions,
            ) -> Self {
                let shared = Shared::new($total, options);
                let slots = ($(Slot::register(&shared, $n, $source),)*);
                debug!(total_channels = $total, "mux constructed");
                $mux { shared, slots, disposed: false }
            }

            fn assert_not_disposed(&self) {
                assert!(!self.disposed, "{} used after dispose", stringify!($mux));
            }

            /// Wait until an item is readable, every input is closed, or an input fails
            ///
            /// Resolves to `Ok(true)` if an item is readable, or to `Ok(false)` if every input is
            /// closed and drained. Resolves to an error if an input failed, if `cancel` fires
            /// while no item is readable, or if another wait is started on this mux before this
            /// one resolves.
            ///
            /// Supports one outstanding wait at a time.
            pub fn wait_to_read(&mut self, cancel: Option<&CancellationToken>) -> WaitToRead {
                self.assert_not_disposed();
                self.shared.wait_to_read(cancel)
            }

            /// Take the next item of type `T`, if one is available
            ///
            /// Panics if the mux has been disposed.
            pub fn try_read<T, Idx>(&mut self) -> Option<T>
            where
                Self: HasInput<T, Idx>,
                T: Send + 'static,
            {
                self.assert_not_disposed();
                <Self as HasInput<T, Idx>>::input_mut(self).try_read()
            }

            /// Replace the input of type `T` with a fresh one registered with a new source
            ///
            /// Unless `force` is set, errors if the existing input is not yet complete. The old
            /// input is deregistered from its source, and any items left in it are returned.
            /// Whatever mux state the old input contributed is undone: it no longer counts as
            /// closed, the error it reported (if it was the one recorded) is cleared, and a
            /// completion signal that already fired is re-armed.
            pub fn replace_channel<T, Idx>(
                &mut self,
                source: &(impl Source<T> + ?Sized),
                force: bool,
            ) -> Result<Vec<T>, NotClosedError>
            where
                Self: HasInput<T, Idx>,
                T: Send + 'static,
            {
                self.assert_not_disposed();
                <Self as HasInput<T, Idx>>::input_mut(self).replace(source, force)
            }

            /// Handle to the completion signal
            pub fn completion(&self) -> Completion {
                self.shared.completion()
            }

            /// Number of items written but not yet read, across all inputs
            ///
            /// May be transiently off by the writes and reads in flight.
            pub fn readable_items(&self) -> isize {
                self.shared.readable_items.load(SeqCst)
            }

            /// Number of inputs which are complete and drained
            pub fn closed_channels(&self) -> usize {
                self.shared.closed_channels.load(SeqCst)
            }

            /// Number of inputs
            pub fn total_channels(&self) -> usize {
                self.shared.total_channels
            }

            /// Whether an input failure is recorded
            pub fn has_exception(&self) -> bool {
                self.shared.has_exception.load(SeqCst)
            }

            /// The recorded input failure, if any
            pub fn exception(&self) -> Option<SourceError> {
                self.shared.exception()
            }

            /// Whether the input of type `T` has been completed by its producer
            pub fn is_complete<T, Idx>(&self) -> bool
            where
                Self: HasInput<T, Idx>,
                T: Send + 'static,
            {
                <Self as HasInput<T, Idx>>::input(self).is_complete()
            }

            /// Whether the input of type `T` has been completed by its producer and drained
            pub fn is_closed<T, Idx>(&self) -> bool
            where
                Self: HasInput<T, Idx>,
                T: Send + 'static,
            {
                <Self as HasInput<T, Idx>>::input(self).is_closed()
            }

            /// Number of items buffered in the input of type `T`
            pub fn len<T, Idx>(&self) -> usize
            where
                Self: HasInput<T, Idx>,
                T: Send + 'static,
            {
                <Self as HasInput<T, Idx>>::input(self).len()
            }

            /// Iterate over the items buffered in the input of type `T`, without removing them
            pub fn iter<T, Idx>(&self) -> Iter<'_, T>
            where
                Self: HasInput<T, Idx>,
                T: Send + 'static,
            {
                <Self as HasInput<T, Idx>>::input(self).iter()
            }
        }

        impl<$($t),*> $mux<$($t),*> {
            /// Deregister every input from its source
            ///
            /// Idempotent, and done automatically on drop. Reading after disposal panics.
            pub fn dispose(&mut self) {
                if self.disposed {
                    return;
                }
                self.disposed = true;
                $( self.slots.$n.dispose(); )*
                debug!("{} disposed", stringify!($mux));
            }
        }

        impl<$($t),*> Drop for $mux<$($t),*> {
            fn drop(&mut self) {
                self.dispose();
            }
        }

        impl<$($t),*> std::fmt::Debug for $mux<$($t),*> {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.debug_struct(stringify!($mux))
                    .field("readable_items", &self.shared.readable_items.load(SeqCst))
                    .field("closed_channels", &self.shared.closed_channels.load(SeqCst))
                    .field("total_channels", &self.shared.total_channels)
                    .field("has_exception", &self.shared.has_exception.load(SeqCst))
                    .field("disposed", &self.disposed)
                    .finish()
            }
        }

        $( impl_has_input!($mux $all $t $idx $n); )*
    };
}

define_mux!(
    /// Mux over two sources
    Mux2 [T0, T1] 2 {
        T0 I0 0 source0,
        T1 I1 1 source1,
    }
);

define_mux!(
    /// Mux over three sources
    Mux3 [T0, T1, T2] 3 {
        T0 I0 0 source0,
        T1 I1 1 source1,
        T2 I2 2 source2,
    }
);

define_mux!(
    /// Mux over four sources
    Mux4 [T0, T1, T2, T3] 4 {
        T0 I0 0 source0,
        T1 I1 1 source1,
        T2 I2 2 source2,
        T3 I3 3 source3,
    }
);

define_mux!(
    /// Mux over five sources
    Mux5 [T0, T1, T2, T3, T4] 5 {
        T0 I0 0 source0,
        T1 I1 1 source1,
        T2 I2 2 source2,
        T3 I3 3 source3,
        T4 I4 4 source4,
    }
);

define_mux!(
    /// Mux over six sources
    Mux6 [T0, T1, T2, T3, T4, T5] 6 {
        T0 I0 0 source0,
        T1 I1 1 source1,
        T2 I2 2 source2,
        T3 I3 3 source3,
        T4 I4 4 source4,
        T5 I5 5 source5,
    }
);

define_mux!(
    /// Mux over seven sources
    Mux7 [T0, T1, T2, T3, T4, T5, T6] 7 {
        T0 I0 0 source0,
        T1 I1 1 source1,
        T2 I2 2 source2,
        T3 I3 3 source3,
        T4 I4 4 source4,
        T5 I5 5 source5,
        T6 I6 6 source6,
    }
);

define_mux!(
    /// Mux over eight sources
    Mux8 [T0, T1, T2, T3, T4, T5, T6, T7] 8 {
        T0 I0 0 source0,
        T1 I1 1 source1,
        T2 I2 2 source2,
        T3 I3 3 source3,
        T4 I4 4 source4,
        T5 I5 5 source5,
        T6 I6 6 source6,
        T7 I7 7 source7,
    }
);
