use crate::{
    error::ChannelError,
    source::TypeTag,
};
use std::{
    fmt::{self, Formatter, Debug},
    sync::Arc,
};


pub(crate) type CompletionFilter =
    dyn Fn(TypeTag, Option<ChannelError>) -> Option<ChannelError> + Send + Sync;

/// Options for constructing a mux
#[derive(Clone, Default)]
pub struct MuxOptions {
    pub(crate) run_continuations_asynchronously: bool,
    pub(crate) on_channel_complete: Option<Arc<CompletionFilter>>,
}

impl MuxOptions {
    /// Construct with default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether a reader parked in `wait_to_read` should be resumed from a freshly spawned
    /// tokio task rather than from the thread of the producer that unparked it
    ///
    /// Has no effect when the unparking thread is not within a tokio runtime. Defaults to false.
    pub fn set_run_continuations_asynchronously(&mut self, enabled: bool) -> &mut Self {
        self.run_continuations_asynchronously = enabled;
        self
    }

    /// Chaining version of `set_run_continuations_asynchronously`
    pub fn with_run_continuations_asynchronously(mut self, enabled: bool) -> Self {
        self.set_run_continuations_asynchronously(enabled);
        self
    }

    /// Set a filter through which every input's completion is routed
    ///
    /// The filter is called once per input completion, with the type of the input and the error
    /// it completed with, if any. The error it returns is what the mux records. Returning `None`
    /// suppresses an error, in which case the input simply closes. The filter is called
    /// synchronously from the completing producer and must not block.
    pub fn set_on_channel_complete<F>(&mut self, filter: F) -> &mut Self
    where
        F: Fn(TypeTag, Option<ChannelError>) -> Option<ChannelError> + Send + Sync + 'static,
    {
        self.on_channel_complete = Some(Arc::new(filter));
        self
    }

    /// Chaining version of `set_on_channel_complete`
    pub fn with_on_channel_complete<F>(mut self, filter: F) -> Self
    where
        F: Fn(TypeTag, Option<ChannelError>) -> Option<ChannelError> + Send + Sync + 'static,
    {
        self.set_on_channel_complete(filter);
        self
    }

    pub(crate) fn filter(&self, type_tag: TypeTag, error: Option<ChannelError>) -> Option<ChannelError> {
        match &self.on_channel_complete {
            Some(filter) => filter(type_tag, error),
            None => error,
        }
    }
}

impl Debug for MuxOptions {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("MuxOptions")
            .field("run_continuations_asynchronously", &self.run_continuations_asynchronously)
            .field("on_channel_complete", &self.on_channel_complete.as_ref().map(|_| ".."))
            .finish()
    }
}
