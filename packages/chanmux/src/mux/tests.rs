use super::{*, index::*};
use crate::{
    broadcast::BroadcastChannel,
    error::*,
    source::{Sink, Registration, TypeTag},
};
use std::{
    sync::Mutex,
    thread,
    time::Duration,
};


// source which hands its sink to the test, to be driven directly
struct ManualSource<T>(Mutex<Option<Arc<dyn Sink<T>>>>);

impl<T> ManualSource<T> {
    fn new() -> Self {
        ManualSource(Mutex::new(None))
    }

    fn sink(&self) -> Arc<dyn Sink<T>> {
        Arc::clone(self.0.lock().unwrap().as_ref().unwrap())
    }
}

impl<T> Source<T> for ManualSource<T> {
    fn register_sink(&self, sink: Arc<dyn Sink<T>>) -> Registration {
        *self.0.lock().unwrap() = Some(sink);
        Registration::none()
    }
}

// source which drops its sink right away
struct Detached;

impl<T> Source<T> for Detached {
    fn register_sink(&self, _sink: Arc<dyn Sink<T>>) -> Registration {
        Registration::none()
    }
}

fn channels() -> (BroadcastChannel<u32>, BroadcastChannel<String>) {
    (BroadcastChannel::new(), BroadcastChannel::new())
}

#[test]
fn read_per_type_in_order() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    for i in 0..5 {
        assert!(a.writer().try_write(i));
    }
    assert!(b.writer().try_write("x".to_owned()));
    assert!(b.writer().try_write("y".to_owned()));
    assert_eq!(mux.readable_items(), 7);

    assert!(mux.wait_to_read(None).block().unwrap());
    assert_eq!(mux.try_read::<String, _>().as_deref(), Some("x"));
    for i in 0..5 {
        assert_eq!(mux.try_read::<u32, _>(), Some(i));
    }
    assert_eq!(mux.try_read::<u32, _>(), None);
    assert_eq!(mux.try_read::<String, _>().as_deref(), Some("y"));
    assert_eq!(mux.readable_items(), 0);
    assert!(matches!(mux.wait_to_read(None).try_now(), Err(TryWaitError::WouldBlock(_))));
}

#[test]
fn duplicate_types_by_index() {
    let x = BroadcastChannel::<u32>::new();
    let y = BroadcastChannel::<u32>::new();
    let s = BroadcastChannel::<String>::new();
    let mut mux = Mux3::new(&x, &y, &s);
    x.writer().try_write(1);
    y.writer().try_write(2);
    assert_eq!(mux.try_read::<u32, I1>(), Some(2));
    assert_eq!(mux.try_read::<u32, I0>(), Some(1));
    assert_eq!(mux.try_read::<u32, I0>(), None);
    assert_eq!(mux.try_read::<String, _>(), None);
}

#[test]
fn all_closed_completes() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    a.writer().try_write(1);
    a.writer().try_complete(None);
    b.writer().try_complete(None);

    // a is complete but still has an item buffered
    assert!(mux.is_complete::<u32, _>());
    assert!(!mux.is_closed::<u32, _>());
    assert!(mux.is_closed::<String, _>());
    assert_eq!(mux.closed_channels(), 1);
    assert!(!mux.completion().is_completed());

    assert!(mux.wait_to_read(None).block().unwrap());
    assert_eq!(mux.try_read::<u32, _>(), Some(1));
    assert!(mux.is_closed::<u32, _>());
    assert_eq!(mux.closed_channels(), mux.total_channels());
    assert!(!mux.wait_to_read(None).block().unwrap());
    assert!(matches!(mux.completion().result(), Some(Ok(()))));
    assert!(mux.completion().block().is_ok());
}

#[test]
fn completion_is_first_wins() {
    let source = ManualSource::<u32>::new();
    let other = ManualSource::<String>::new();
    let mut mux = Mux2::new(&source, &other);
    let sink = source.sink();

    assert!(sink.try_write(1));
    assert!(sink.try_complete(None));
    assert!(!sink.try_complete(Some(ChannelError::msg("too late"))));
    assert!(!sink.try_write(2));
    assert!(!mux.has_exception());
    assert_eq!(mux.closed_channels(), 0);
    assert_eq!(mux.try_read::<u32, _>(), Some(1));
    assert_eq!(mux.closed_channels(), 1);
    assert_eq!(mux.try_read::<u32, _>(), None);
    assert_eq!(mux.closed_channels(), 1);
}

#[test]
fn error_ends_completion() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    assert!(a.writer().try_complete(Some(ChannelError::msg("a failed"))));

    match mux.wait_to_read(None).block() {
        Err(WaitError::Source(e)) => {
            assert!(e.is_from::<u32>());
            assert_eq!(e.type_tag(), TypeTag::of::<u32>());
            assert_eq!(e.cause().to_string(), "a failed");
        }
        other => panic!("unexpected wait result: {:?}", other),
    }
    assert!(mux.has_exception());
    assert!(matches!(mux.completion().block(), Err(CompletionError::Source(_))));
    // the other input no longer accepts writes
    assert!(!b.writer().try_write("b".to_owned()));
    // and the error keeps surfacing
    assert!(matches!(mux.wait_to_read(None).block(), Err(WaitError::Source(_))));
}

#[test]
fn buffered_items_survive_error() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    assert!(b.writer().try_write("b1".to_owned()));
    assert!(b.writer().try_write("b2".to_owned()));
    assert!(a.writer().try_complete(Some(ChannelError::msg("a failed"))));

    assert_eq!(mux.try_read::<String, _>().as_deref(), Some("b1"));
    assert!(matches!(mux.wait_to_read(None).block(), Err(WaitError::Source(e)) if e.is_from::<u32>()));
    assert!(matches!(mux.completion().result(), Some(Err(_))));
    assert_eq!(mux.try_read::<String, _>().as_deref(), Some("b2"));
    assert_eq!(mux.try_read::<String, _>(), None);
    // other inputs stop accepting writes once an error is recorded
    assert!(!b.writer().try_write("b3".to_owned()));
}

#[test]
fn suppressed_error_still_closes() {
    let (a, b) = channels();
    let options = MuxOptions::new().with_on_channel_complete(|_, _| None);
    let mut mux = Mux2::with_options(&a, &b, options);
    a.writer().try_complete(Some(ChannelError::msg("ignored")));
    assert!(!mux.has_exception());
    assert!(mux.is_closed::<u32, _>());
    assert!(!mux.completion().is_completed());

    b.writer().try_write("b".to_owned());
    b.writer().try_complete(None);
    assert!(mux.wait_to_read(None).block().unwrap());
    assert_eq!(mux.try_read::<String, _>().as_deref(), Some("b"));
    assert!(!mux.wait_to_read(None).block().unwrap());
    assert!(matches!(mux.completion().result(), Some(Ok(()))));
}

#[test]
fn filter_sees_every_completion() {
    let (a, b) = channels();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_2 = Arc::clone(&seen);
    let options = MuxOptions::new().with_on_channel_complete(move |type_tag, error| {
        seen_2.lock().unwrap().push(type_tag);
        error.map(|e| ChannelError::msg(format!("wrapped: {}", e)))
    });
    let mut mux = Mux2::with_options(&a, &b, options);
    b.writer().try_complete(None);
    a.writer().try_complete(Some(ChannelError::msg("inner")));

    assert_eq!(*seen.lock().unwrap(), [TypeTag::of::<String>(), TypeTag::of::<u32>()]);
    match mux.wait_to_read(None).block() {
        Err(WaitError::Source(e)) => assert_eq!(e.cause().to_string(), "wrapped: inner"),
        other => panic!("unexpected wait result: {:?}", other),
    }
}

#[test]
fn replace_after_completed() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    a.writer().try_complete(None);
    b.writer().try_complete(None);
    assert!(!mux.wait_to_read(None).block().unwrap());
    let completion = mux.completion();
    assert!(completion.is_completed());

    let a2 = BroadcastChannel::<u32>::new();
    assert_eq!(mux.replace_channel::<u32, _>(&a2, false).unwrap(), Vec::<u32>::new());
    assert_eq!(mux.closed_channels(), 1);
    assert!(!mux.completion().is_completed());
    assert!(completion.is_completed(), "earlier handles keep their fired value");

    a2.writer().try_write(5);
    assert!(mux.wait_to_read(None).block().unwrap());
    assert_eq!(mux.try_read::<u32, _>(), Some(5));
    a2.writer().try_complete(None);
    assert!(!mux.wait_to_read(None).block().unwrap());
    assert!(mux.completion().is_completed());
}

#[test]
fn replace_open_channel_requires_force() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    a.writer().try_write(1);
    a.writer().try_write(2);

    let a2 = BroadcastChannel::<u32>::new();
    assert_eq!(mux.replace_channel::<u32, _>(&a2, false), Err(NotClosedError));
    assert_eq!(a.writer().reader_count(), 1);
    assert_eq!(mux.replace_channel::<u32, _>(&a2, true).unwrap(), vec![1, 2]);
    assert_eq!(mux.readable_items(), 0);
    assert_eq!(a.writer().reader_count(), 0);
    assert_eq!(a2.writer().reader_count(), 1);

    // the old source no longer reaches the mux
    assert!(a.writer().try_write(3));
    assert_eq!(mux.try_read::<u32, _>(), None);
    a2.writer().try_write(4);
    assert_eq!(mux.try_read::<u32, _>(), Some(4));
}

#[test]
fn replace_keeps_foreign_exception() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    a.writer().try_complete(Some(ChannelError::msg("a failed")));
    b.writer().try_complete(None);
    assert!(matches!(mux.wait_to_read(None).block(), Err(WaitError::Source(_))));

    let b2 = BroadcastChannel::<String>::new();
    mux.replace_channel::<String, _>(&b2, false).unwrap();
    assert!(mux.has_exception());
    assert!(matches!(mux.wait_to_read(None).block(), Err(WaitError::Source(e)) if e.is_from::<u32>()));
    assert!(matches!(mux.completion().result(), Some(Err(_))));
}

#[test]
fn replace_clears_own_exception() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    a.writer().try_complete(Some(ChannelError::msg("a failed")));
    b.writer().try_complete(None);
    assert!(mux.completion().is_completed());

    let a2 = BroadcastChannel::<u32>::new();
    mux.replace_channel::<u32, _>(&a2, false).unwrap();
    assert!(!mux.has_exception());
    assert!(mux.exception().is_none());
    assert_eq!(mux.closed_channels(), 1);
    assert!(!mux.completion().is_completed());
    assert!(matches!(mux.wait_to_read(None).try_now(), Err(TryWaitError::WouldBlock(_))));

    a2.writer().try_write(9);
    assert!(mux.wait_to_read(None).block().unwrap());
    assert_eq!(mux.try_read::<u32, _>(), Some(9));
}

#[test]
fn cancelled_token_fails_fast() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    let token = CancellationToken::new();
    token.cancel();
    a.writer().try_write(1);
    assert!(matches!(mux.wait_to_read(Some(&token)).block(), Err(WaitError::Cancelled(_))));
    assert!(mux.wait_to_read(None).block().unwrap());
}

#[tokio::test]
async fn cancel_mid_flight() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    let token = CancellationToken::new();
    let wait = mux.wait_to_read(Some(&token));
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });
    assert!(matches!(wait.await, Err(WaitError::Cancelled(_))));
    assert!(!mux.completion().is_completed());
    assert!(!mux.has_exception());

    // cancellation does not poison the mux
    a.writer().try_write(1);
    assert!(mux.wait_to_read(None).await.unwrap());
    assert_eq!(mux.try_read::<u32, _>(), Some(1));
}

#[tokio::test]
async fn cancel_racing_data_prefers_data() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    let token = CancellationToken::new();
    let mut wait = mux.wait_to_read(Some(&token));
    assert!(matches!(wait.try_now(), Err(TryWaitError::WouldBlock(_))));

    token.cancel();
    assert!(a.writer().try_write(1));
    assert!(wait.await.unwrap());
    assert_eq!(mux.try_read::<u32, _>(), Some(1));
    assert!(!mux.completion().is_completed());
}

#[test]
fn cancel_with_data_buffered_resolves_ready() {
    let mut mux = Mux2::<u32, String>::new(&Detached, &Detached);
    let token = CancellationToken::new();
    let mut wait = mux.wait_to_read(Some(&token));
    assert!(matches!(wait.try_now(), Err(TryWaitError::WouldBlock(_))));

    // an item counted while the wait is parked but before its producer unparks it
    mux.shared.readable_items.fetch_add(1, SeqCst);
    token.cancel();
    assert!(wait.try_now().unwrap());
    mux.shared.readable_items.fetch_sub(1, SeqCst);
}

#[test]
fn displaced_wait_fails() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    let mut first = mux.wait_to_read(None);
    assert!(matches!(first.try_now(), Err(TryWaitError::WouldBlock(_))));
    let mut second = mux.wait_to_read(None);
    assert!(matches!(
        first.try_now(),
        Err(TryWaitError::Wait(WaitError::ConcurrentWait(_))),
    ));
    assert!(first.is_terminated());
    a.writer().try_write(1);
    assert!(second.try_now().unwrap());
}

#[test]
fn dropped_wait_is_withdrawn() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    for i in 0..3 {
        let mut wait = mux.wait_to_read(None);
        assert!(matches!(wait.block_timeout(Duration::from_millis(5)), Err(TryWaitError::WouldBlock(_))));
        drop(wait);
        a.writer().try_write(i);
        assert!(mux.wait_to_read(None).try_now().unwrap());
        assert_eq!(mux.try_read::<u32, _>(), Some(i));
    }
}

#[test]
fn wake_from_other_thread() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    let writer = b.writer().clone();
    let producer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        assert!(writer.try_write("late".to_owned()));
    });
    assert!(mux.wait_to_read(None).block().unwrap());
    assert_eq!(mux.try_read::<String, _>().as_deref(), Some("late"));
    producer.join().unwrap();
}

#[test]
fn concurrent_producers() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    let writer_a = a.writer().clone();
    let writer_b = b.writer().clone();
    let producer_a = thread::spawn(move || {
        for i in 0..100 {
            assert!(writer_a.try_write(i));
        }
        writer_a.try_complete(None);
    });
    let producer_b = thread::spawn(move || {
        for i in 0..50 {
            assert!(writer_b.try_write(i.to_string()));
        }
        writer_b.try_complete(None);
    });

    let mut numbers = Vec::new();
    let mut strings = Vec::new();
    while mux.wait_to_read(None).block().unwrap() {
        while let Some(n) = mux.try_read::<u32, _>() {
            numbers.push(n);
        }
        while let Some(s) = mux.try_read::<String, _>() {
            strings.push(s);
        }
    }
    producer_a.join().unwrap();
    producer_b.join().unwrap();

    assert_eq!(numbers, (0..100).collect::<Vec<u32>>());
    assert_eq!(strings, (0..50).map(|i| i.to_string()).collect::<Vec<String>>());
    assert!(matches!(mux.completion().result(), Some(Ok(()))));
    assert_eq!(mux.readable_items(), 0);
    assert_eq!(mux.closed_channels(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn asynchronous_continuations() {
    let (a, b) = channels();
    let options = MuxOptions::new().with_run_continuations_asynchronously(true);
    let mut mux = Mux2::with_options(&a, &b, options);
    let writer = a.writer().clone();
    let producer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        writer.try_write(1)
    });
    assert!(mux.wait_to_read(None).await.unwrap());
    assert_eq!(mux.try_read::<u32, _>(), Some(1));
    assert!(producer.await.unwrap());
}

#[test]
fn diagnostics() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    for i in 0..3 {
        a.writer().try_write(i);
    }
    assert_eq!(mux.len::<u32, _>(), 3);
    assert_eq!(mux.len::<String, _>(), 0);
    assert_eq!(mux.iter::<u32, _>().copied().collect::<Vec<_>>(), [0, 1, 2]);
    assert_eq!(mux.try_read::<u32, _>(), Some(0));
    assert_eq!(mux.iter::<u32, _>().copied().collect::<Vec<_>>(), [1, 2]);
    assert_eq!(mux.total_channels(), 2);
}

#[test]
fn dispose_deregisters() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    assert_eq!(a.writer().reader_count(), 1);
    assert_eq!(b.writer().reader_count(), 1);
    mux.dispose();
    mux.dispose();
    assert_eq!(a.writer().reader_count(), 0);
    assert_eq!(b.writer().reader_count(), 0);

    let mux = Mux2::new(&a, &b);
    assert_eq!(a.writer().reader_count(), 1);
    drop(mux);
    assert_eq!(a.writer().reader_count(), 0);
}

#[test]
#[should_panic(expected = "used after dispose")]
fn read_after_dispose_panics() {
    let (a, b) = channels();
    let mut mux = Mux2::new(&a, &b);
    mux.dispose();
    mux.try_read::<u32, _>();
}

#[test]
fn dropped_mux_fails_completion() {
    let mux = Mux2::<u32, String>::new(&Detached, &Detached);
    let completion = mux.completion();
    drop(mux);
    assert!(matches!(completion.block(), Err(CompletionError::MuxDropped(_))));
}

#[test]
fn widest_mux() {
    let c0 = BroadcastChannel::<u8>::new();
    let c1 = BroadcastChannel::<u16>::new();
    let c2 = BroadcastChannel::<u32>::new();
    let c3 = BroadcastChannel::<u64>::new();
    let c4 = BroadcastChannel::<i8>::new();
    let c5 = BroadcastChannel::<i16>::new();
    let c6 = BroadcastChannel::<i32>::new();
    let c7 = BroadcastChannel::<i64>::new();
    let mut mux = Mux8::new(&c0, &c1, &c2, &c3, &c4, &c5, &c6, &c7);
    c3.writer().try_write(3);
    c7.writer().try_write(-7);
    assert!(mux.wait_to_read(None).block().unwrap());
    assert_eq!(mux.try_read::<u64, _>(), Some(3));
    assert_eq!(mux.try_read::<i64, _>(), Some(-7));
    assert_eq!(mux.try_read::<u8, _>(), None);
    assert_eq!(mux.total_channels(), 8);
}
