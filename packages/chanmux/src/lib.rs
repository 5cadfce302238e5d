//! Typed channel multiplexing.
//!
//! This crate merges several independent sources of differently typed items into a single
//! consumer endpoint. A mux ([`Mux2`] through [`Mux8`]) registers one input with each source.
//! Producers write into their inputs without blocking, and the consumer awaits readiness of the
//! mux as a whole before reading whichever inputs have items:
//!
//! ```
//! use chanmux::{BroadcastChannel, Mux2};
//!
//! let numbers = BroadcastChannel::<u32>::new();
//! let words = BroadcastChannel::<String>::new();
//! let mut mux = Mux2::new(&numbers, &words);
//!
//! numbers.writer().try_write(7);
//! words.writer().try_write("seven".to_owned());
//! numbers.writer().try_complete(None);
//! words.writer().try_complete(None);
//!
//! while mux.wait_to_read(None).block().unwrap() {
//!     while let Some(n) = mux.try_read::<u32, _>() {
//!         println!("number {}", n);
//!     }
//!     while let Some(s) = mux.try_read::<String, _>() {
//!         println!("word {}", s);
//!     }
//! }
//! assert!(mux.completion().is_completed());
//! ```
//!
//! Any type implementing [`Source`] can feed a mux. The crate provides [`BroadcastChannel`],
//! which fans every item out to all of its readers and sinks.

#[macro_use]
extern crate tracing;

mod polling;
mod waiter;
mod mux;
mod source;

pub mod error;
pub mod spsc;
pub mod broadcast;

pub use crate::{
    broadcast::{BroadcastChannel, BroadcastWriter, BroadcastReader, Response},
    mux::{
        Mux2, Mux3, Mux4, Mux5, Mux6, Mux7, Mux8,
        HasInput,
        index,
        options::MuxOptions,
    },
    source::{Writable, Readable, RespondsWith, Sink, Source, Registration, TypeTag},
};

/// Future types
pub mod future {
    pub use crate::mux::{
        future::WaitToRead,
        state::Completion,
    };
}
