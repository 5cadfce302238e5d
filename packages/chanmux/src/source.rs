// registration contract between data sources and the sinks that consume them, and the capability
// traits the channel types are built from.

use crate::error::ChannelError;
use std::{
    any::{TypeId, type_name},
    fmt::{self, Formatter, Debug, Display},
    sync::Arc,
};


/// Capability of accepting items without blocking
///
/// Writes never apply backpressure: they either succeed immediately or report that the receiving
/// side is no longer accepting items.
pub trait Writable<T> {
    /// Try to write an item, returning whether it was accepted
    fn try_write(&self, item: T) -> bool;

    /// Mark the receiving side as complete, optionally with an error
    ///
    /// Only the first call has an effect. Returns whether this call was that first call.
    fn try_complete(&self, error: Option<ChannelError>) -> bool;
}

/// Capability of reading items without blocking
pub trait Readable<T> {
    /// Take the next available item, if any
    fn try_read(&mut self) -> Option<T>;
}

/// Capability of sending responses back up to the writer of a channel
pub trait RespondsWith<R> {
    /// Send a response, returning whether the writer side can still receive it
    fn respond(&self, response: R) -> bool;
}

/// Write sink which a [`Source`] drives
///
/// Implemented for anything shareable across threads that is [`Writable`].
pub trait Sink<T>: Writable<T> + Send + Sync {}

impl<T, S: Writable<T> + Send + Sync + ?Sized> Sink<T> for S {}

/// Data source that sinks can be attached to
pub trait Source<T> {
    /// Attach a sink, returning the handle that detaches it again
    fn register_sink(&self, sink: Arc<dyn Sink<T>>) -> Registration;
}

/// Handle to a sink's registration with a [`Source`]
///
/// Deregisters the sink exactly once, either explicitly or when dropped.
#[must_use = "dropping a Registration immediately deregisters the sink"]
pub struct Registration(Option<Box<dyn FnOnce() + Send>>);

impl Registration {
    /// Construct from the function that removes the sink from its source
    pub fn new<F: FnOnce() + Send + 'static>(deregister: F) -> Self {
        Registration(Some(Box::new(deregister)))
    }

    /// Registration which has nothing to undo
    pub fn none() -> Self {
        Registration(None)
    }

    /// Remove the sink from its source
    pub fn deregister(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(deregister) = self.0.take() {
            deregister();
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.run();
    }
}

impl Debug for Registration {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Registration")
            .field("registered", &self.0.is_some())
            .finish()
    }
}

/// Identity of an item type, used to tag which mux input something came from
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    /// Tag for type `T`
    pub fn of<T: ?Sized + 'static>() -> Self {
        TypeTag { id: TypeId::of::<T>(), name: type_name::<T>() }
    }

    /// The tagged type's `TypeId`
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// The tagged type's name, as given by [`std::any::type_name`]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Debug for TypeTag {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "TypeTag({})", self.name)
    }
}

impl Display for TypeTag {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.name)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

    #[test]
    fn registration_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_2 = Arc::clone(&count);
        let registration = Registration::new(move || { count_2.fetch_add(1, Relaxed); });
        registration.deregister();
        assert_eq!(count.load(Relaxed), 1);

        let count_3 = Arc::clone(&count);
        drop(Registration::new(move || { count_3.fetch_add(1, Relaxed); }));
        assert_eq!(count.load(Relaxed), 2);
    }

    #[test]
    fn type_tags_distinguish_types() {
        assert_eq!(TypeTag::of::<u32>(), TypeTag::of::<u32>());
        assert_ne!(TypeTag::of::<u32>(), TypeTag::of::<i32>());
        assert_eq!(TypeTag::of::<u32>().to_string(), "u32");
        assert_eq!(TypeTag::of::<u32>().id(), std::any::TypeId::of::<u32>());
        assert_eq!(TypeTag::of::<Vec<u8>>().name(), std::any::type_name::<Vec<u8>>());
        assert_eq!(format!("{:?}", TypeTag::of::<str>()), "TypeTag(str)");
    }
}
