//! Broadcast channel with a response path.
//!
//! A [`BroadcastChannel`] has one writer side and any number of sinks. Every item written is
//! cloned out to every sink registered at the time. Sinks are either [`BroadcastReader`]s handed
//! out by the channel, or anything else registered through the channel's [`Source`] impl, such as
//! a mux input. Readers can send responses of type `R` back up to the writer side.

use crate::{
    error::ChannelError,
    source::{Writable, Readable, RespondsWith, Sink, Source, Registration},
};
use std::{
    fmt::{self, Formatter, Debug},
    sync::{Arc, Mutex, Weak},
};
use tokio::sync::{mpsc, Mutex as AsyncMutex};


/// Default response type, optionally carrying an error
#[derive(Debug, Clone, Default)]
pub struct Response {
    error: Option<ChannelError>,
}

impl Response {
    /// Response reporting success
    pub fn ok() -> Self {
        Response { error: None }
    }

    /// Response reporting an error
    pub fn error(error: ChannelError) -> Self {
        Response { error: Some(error) }
    }

    /// The reported error, if any
    pub fn err(&self) -> Option<&ChannelError> {
        self.error.as_ref()
    }

    /// Whether this response reports success
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Broadcast channel over items of type `T`, with responses of type `R`
pub struct BroadcastChannel<T, R = Response> {
    writer: BroadcastWriter<T, R>,
}

impl<T: Clone + Send + 'static, R: Send + 'static> BroadcastChannel<T, R> {
    /// Construct a channel with no sinks
    pub fn new() -> Self {
        let (responses_send, responses_recv) = mpsc::unbounded_channel();
        BroadcastChannel {
            writer: BroadcastWriter(Arc::new(WriterShared {
                registry: Mutex::new(Registry {
                    next_id: 0,
                    sinks: Arc::from(Vec::new()),
                    completed: None,
                    disposed: false,
                }),
                responses_send: Mutex::new(Some(responses_send)),
                responses_recv: AsyncMutex::new(responses_recv),
            })),
        }
    }

    /// The writer side
    pub fn writer(&self) -> &BroadcastWriter<T, R> {
        &self.writer
    }

    /// Register a new reader, which receives every item written from now on
    pub fn reader(&self) -> BroadcastReader<T, R> {
        self.writer.reader()
    }
}

impl<T: Clone + Send + 'static, R: Send + 'static> Default for BroadcastChannel<T, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static, R: Send + 'static> Source<T> for BroadcastChannel<T, R> {
    fn register_sink(&self, sink: Arc<dyn Sink<T>>) -> Registration {
        self.writer.register_sink(sink)
    }
}

impl<T, R> Debug for BroadcastChannel<T, R> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("BroadcastChannel")
            .field("writer", &self.writer)
            .finish()
    }
}

/// Writer side of a [`BroadcastChannel`]
///
/// Cheaply clonable. Once every clone is dropped, the writer is disposed.
pub struct BroadcastWriter<T, R = Response>(Arc<WriterShared<T, R>>);

struct WriterShared<T, R> {
    registry: Mutex<Registry<T>>,
    responses_send: Mutex<Option<mpsc::UnboundedSender<R>>>,
    responses_recv: AsyncMutex<mpsc::UnboundedReceiver<R>>,
}

struct Registry<T> {
    next_id: u64,
    // replaced rather than mutated, so a fan-out iterates a stable snapshot
    sinks: Arc<[(u64, Arc<dyn Sink<T>>)]>,
    // how the writer side was completed, if it was. sinks registered later are completed at once.
    completed: Option<Option<ChannelError>>,
    disposed: bool,
}

impl<T, R> Clone for BroadcastWriter<T, R> {
    fn clone(&self) -> Self {
        BroadcastWriter(Arc::clone(&self.0))
    }
}

impl<T, R> WriterShared<T, R> {
    fn remove(&self, id: u64) {
        let removed = {
            let mut registry = self.registry.lock().unwrap();
            let Some(pos) = registry.sinks.iter().position(|&(i, _)| i == id) else { return };
            let removed = Arc::clone(&registry.sinks[pos].1);
            registry.sinks = registry.sinks.iter()
                .filter(|&&(i, _)| i != id)
                .cloned()
                .collect();
            removed
        };
        trace!(id, "broadcast sink removed");
        removed.try_complete(None);
    }

    fn dispose(&self) {
        let sinks = {
            let mut registry = self.registry.lock().unwrap();
            if registry.disposed {
                return;
            }
            registry.disposed = true;
            std::mem::replace(&mut registry.sinks, Arc::from(Vec::new()))
        };
        for (_, sink) in sinks.iter() {
            sink.try_complete(None);
        }
        self.responses_send.lock().unwrap().take();
        debug!(sinks = sinks.len(), "broadcast writer disposed");
    }
}

impl<T, R> Drop for WriterShared<T, R> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T: Clone + Send + 'static, R: Send + 'static> BroadcastWriter<T, R> {
    /// Write an item to every registered sink
    ///
    /// Returns true if every sink accepted it, including when there are no sinks at all.
    /// Writes are serialized, so each sink sees a single producer.
    pub fn try_write(&self, item: T) -> bool {
        let registry = self.0.registry.lock().unwrap();
        match registry.sinks.split_last() {
            None => true,
            Some(((_, last), rest)) => {
                let mut written = true;
                for (_, sink) in rest {
                    written &= sink.try_write(item.clone());
                }
                written &= last.try_write(item);
                written
            }
        }
    }

    /// Write several items to every registered sink, in order
    ///
    /// Returns true if every sink accepted every item.
    pub fn try_write_all<I: IntoIterator<Item = T>>(&self, items: I) -> bool {
        let registry = self.0.registry.lock().unwrap();
        let mut written = true;
        for item in items {
            for (_, sink) in registry.sinks.iter() {
                written &= sink.try_write(item.clone());
            }
        }
        written
    }

    /// Complete every registered sink, optionally with an error
    ///
    /// Sinks registered afterwards are completed the same way as soon as they register. Only the
    /// first call has an effect. Returns false if the writer side was already completed, or if
    /// any sink was already complete.
    pub fn try_complete(&self, error: Option<ChannelError>) -> bool {
        let mut registry = self.0.registry.lock().unwrap();
        if registry.completed.is_some() || registry.disposed {
            return false;
        }
        registry.completed = Some(error.clone());
        debug!(error = ?error, sinks = registry.sinks.len(), "broadcast writer completed");
        let mut completed = true;
        for (_, sink) in registry.sinks.iter() {
            completed &= sink.try_complete(error.clone());
        }
        completed
    }

    /// Number of registered sinks
    pub fn reader_count(&self) -> usize {
        self.0.registry.lock().unwrap().sinks.len()
    }

    /// Register a new reader, which receives every item written from now on
    pub fn reader(&self) -> BroadcastReader<T, R> {
        let (send, recv) = mpsc::unbounded_channel();
        let sink = Arc::new(ReaderSink(Mutex::new(Some(send))));
        let registration = self.register_sink(sink);
        BroadcastReader {
            recv,
            writer: Arc::downgrade(&self.0),
            failed: None,
            _registration: registration,
        }
    }

    /// Take a response sent by a reader, if one is available
    pub fn try_read_response(&self) -> Option<R> {
        self.0.responses_recv.try_lock().ok()?.try_recv().ok()
    }

    /// Wait for a response sent by a reader
    ///
    /// Resolves to `None` once the writer is disposed and every reader is dropped.
    pub async fn read_response(&self) -> Option<R> {
        self.0.responses_recv.lock().await.recv().await
    }

    /// Complete every registered sink and stop accepting responses
    ///
    /// Idempotent. Sinks registered afterwards are completed immediately.
    pub fn dispose(&self) {
        self.0.dispose();
    }
}

impl<T: Clone + Send + 'static, R: Send + 'static> Source<T> for BroadcastWriter<T, R> {
    fn register_sink(&self, sink: Arc<dyn Sink<T>>) -> Registration {
        let (id, completion) = {
            let mut registry = self.0.registry.lock().unwrap();
            if registry.disposed {
                (None, Some(None))
            } else if let Some(error) = &registry.completed {
                (None, Some(error.clone()))
            } else {
                let id = registry.next_id;
                registry.next_id += 1;
                registry.sinks = registry.sinks.iter()
                    .cloned()
                    .chain([(id, Arc::clone(&sink))])
                    .collect();
                (Some(id), None)
            }
        };
        if let Some(error) = completion {
            trace!("sink registered with already completed broadcast writer");
            sink.try_complete(error);
        }
        let Some(id) = id else { return Registration::none() };
        trace!(id, "broadcast sink registered");
        let shared = Arc::downgrade(&self.0);
        Registration::new(move || {
            if let Some(shared) = Weak::upgrade(&shared) {
                shared.remove(id);
            }
        })
    }
}

impl<T: Clone + Send + 'static, R: Send + 'static> Writable<T> for BroadcastWriter<T, R> {
    fn try_write(&self, item: T) -> bool {
        BroadcastWriter::try_write(self, item)
    }

    fn try_complete(&self, error: Option<ChannelError>) -> bool {
        BroadcastWriter::try_complete(self, error)
    }
}

impl<T, R> Debug for BroadcastWriter<T, R> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let registry = self.0.registry.lock().unwrap();
        f.debug_struct("BroadcastWriter")
            .field("sinks", &registry.sinks.len())
            .field("completed", &registry.completed.is_some())
            .field("disposed", &registry.disposed)
            .finish()
    }
}

enum Message<T> {
    Item(T),
    Failed(ChannelError),
}

// sink end of a reader's data channel. the sender is dropped on completion.
struct ReaderSink<T>(Mutex<Option<mpsc::UnboundedSender<Message<T>>>>);

impl<T: Send> Writable<T> for ReaderSink<T> {
    fn try_write(&self, item: T) -> bool {
        match &*self.0.lock().unwrap() {
            Some(send) => send.send(Message::Item(item)).is_ok(),
            None => false,
        }
    }

    fn try_complete(&self, error: Option<ChannelError>) -> bool {
        let Some(send) = self.0.lock().unwrap().take() else { return false };
        if let Some(error) = error {
            let _ = send.send(Message::Failed(error));
        }
        true
    }
}

/// Reader of a [`BroadcastChannel`]
///
/// Deregisters from the channel when dropped.
pub struct BroadcastReader<T, R = Response> {
    recv: mpsc::UnboundedReceiver<Message<T>>,
    writer: Weak<WriterShared<T, R>>,
    // error the writer side completed with, once observed
    failed: Option<ChannelError>,
    _registration: Registration,
}

impl<T, R> BroadcastReader<T, R> {
    /// Take the next item, if one is available
    ///
    /// Returns `None` both when no item is available yet and when the channel is complete.
    pub fn try_read(&mut self) -> Option<T> {
        if self.failed.is_some() {
            return None;
        }
        match self.recv.try_recv() {
            Ok(Message::Item(item)) => Some(item),
            Ok(Message::Failed(error)) => {
                self.failed = Some(error);
                None
            }
            Err(_) => None,
        }
    }

    /// Wait for the next item
    ///
    /// Resolves to `None` once the channel is complete and drained, or to the error the writer
    /// side completed with.
    pub async fn read(&mut self) -> Result<Option<T>, ChannelError> {
        if let Some(error) = &self.failed {
            return Err(error.clone());
        }
        match self.recv.recv().await {
            Some(Message::Item(item)) => Ok(Some(item)),
            Some(Message::Failed(error)) => {
                self.failed = Some(error.clone());
                Err(error)
            }
            None => Ok(None),
        }
    }

    /// Send a response back up to the writer side
    ///
    /// Returns false if the writer side has been disposed.
    pub fn respond(&self, response: R) -> bool {
        let Some(writer) = self.writer.upgrade() else { return false };
        let responses_send = writer.responses_send.lock().unwrap();
        responses_send.as_ref().is_some_and(|send| send.send(response).is_ok())
    }
}

impl<T, R> Readable<T> for BroadcastReader<T, R> {
    fn try_read(&mut self) -> Option<T> {
        BroadcastReader::try_read(self)
    }
}

impl<T, R> RespondsWith<R> for BroadcastReader<T, R> {
    fn respond(&self, response: R) -> bool {
        BroadcastReader::respond(self, response)
    }
}

impl<T, R> Debug for BroadcastReader<T, R> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("BroadcastReader")
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}
