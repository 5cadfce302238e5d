//! Unbounded single-producer single-consumer queue.
//!
//! The queue is split into a [`Producer`] and a [`Consumer`] half, which may live on different
//! threads. Pushing never blocks and never fails. Popping never blocks and returns `None` when
//! the queue is empty.

// the queue is a singly linked list of fixed-capacity segments. the producer owns a pointer to
// the back segment and fills its slots front to back, publishing each slot by bumping the
// segment's `tail` with release ordering. once the back segment is full, the producer allocates
// a new one, writes the elem into it, and links it in as the old segment's `next`. from then on
// the producer never touches the old segment again.
//
// the consumer owns a pointer to the front segment and reads slots up to the `tail` it observes
// with acquire ordering. once it has read every slot of a segment and that segment has a `next`,
// it frees the segment and moves on.
//
// a sequentially consistent length counter, bumped after a slot is published and dropped after
// a slot is read, answers `len` and `is_empty` from either side. the consumer may read a slot
// before the producer has counted it, so the counter can dip to -1 and reads clamp it at 0.

use std::{
    cell::UnsafeCell,
    mem::size_of,
    ptr::{NonNull, drop_in_place},
    marker::PhantomData,
    alloc::{Layout, alloc, dealloc, handle_alloc_error},
    sync::{
        Arc,
        atomic::{
            Ordering::{Acquire, Release, Relaxed, SeqCst},
            AtomicPtr,
            AtomicUsize,
            AtomicIsize,
        },
    },
    fmt::{self, Formatter, Debug},
};


// compute segment capacity in elems.
const fn cap<T>() -> usize {
    elem_size_to_cap(size_of::<T>())
}

// compute segment capacity in elems, given the byte size of an elem.
const fn elem_size_to_cap(elem_size: usize) -> usize {
    // "target" byte capacity of a segment
    const IDEAL_CAP_BYTES: usize = 1024;

    if elem_size == 0 {
        // edge case: ZST
        //
        // slots take no memory, so the capacity only bounds how often segments are relinked.
        IDEAL_CAP_BYTES
    } else {
        let n = IDEAL_CAP_BYTES / elem_size;
        if n < 1 {
            // edge case: elem larger than ideal segment capacity
            1
        } else {
            n
        }
    }
}

// compute segment layout and offset of elem array within segment.
fn seg_layout<T>() -> (Layout, usize) {
    let layout_meta = Layout::new::<SegMeta>();
    let layout_elems = Layout::array::<T>(cap::<T>()).unwrap();
    layout_meta.extend(layout_elems).unwrap()
}

// non-null pointer to a heap allocated segment
//
// the layout of the heap allocation is basically that of a struct containing:
//
// - `SegMeta`
// - `MaybeUninit<[T; cap::<T>()]>`
struct SegPtr<T>(NonNull<u8>, PhantomData<T>);

// content of a segment other than the elements
struct SegMeta {
    // next segment towards back, or null. written at most once, by the producer.
    next: AtomicPtr<u8>,
    // number of slots the producer has initialized. only increases.
    tail: AtomicUsize,
    // number of slots the consumer has moved out. only accessed by the consumer, or on drop.
    head: UnsafeCell<usize>,
}

impl<T> SegPtr<T> {
    // allocate on the heap and initialize as empty
    unsafe fn alloc() -> Self {
        let (layout, _) = seg_layout::<T>();
        let Some(ptr) = NonNull::new(alloc(layout)) else { handle_alloc_error(layout) };
        (ptr.as_ptr() as *mut SegMeta).write(SegMeta {
            next: AtomicPtr::new(std::ptr::null_mut()),
            tail: AtomicUsize::new(0),
            head: UnsafeCell::new(0),
        });
        SegPtr(ptr, PhantomData)
    }

    unsafe fn meta<'a>(self) -> &'a SegMeta {
        &*(self.0.as_ptr() as *const SegMeta)
    }

    unsafe fn slot(self, idx: usize) -> *mut T {
        debug_assert!(idx < cap::<T>());
        let (_, offset) = seg_layout::<T>();
        (self.0.as_ptr().add(offset) as *mut T).add(idx)
    }

    unsafe fn next(self) -> Option<Self> {
        NonNull::new(self.meta().next.load(Acquire)).map(|ptr| SegPtr(ptr, PhantomData))
    }

    // drop the elems which were published but never read, then free the allocation
    unsafe fn drop_and_dealloc(self) {
        let meta = self.meta();
        let head = *meta.head.get();
        let tail = meta.tail.load(Acquire);
        for idx in head..tail {
            drop_in_place(self.slot(idx));
        }
        let (layout, _) = seg_layout::<T>();
        dealloc(self.0.as_ptr(), layout);
    }
}

impl<T> Copy for SegPtr<T> {}

impl<T> Clone for SegPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

// state owned jointly by both halves
struct Shared<T> {
    len: AtomicIsize,
    // current front segment. only accessed by the consumer, or on drop.
    front: UnsafeCell<SegPtr<T>>,
}

impl<T> Shared<T> {
    fn len(&self) -> usize {
        self.len.load(SeqCst).max(0) as usize
    }
}

unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        unsafe {
            let mut next = Some(*self.front.get_mut());
            while let Some(seg) = next {
                next = seg.next();
                seg.drop_and_dealloc();
            }
        }
    }
}

/// Construct a new empty queue
pub fn queue<T>() -> (Producer<T>, Consumer<T>) {
    unsafe {
        let seg = SegPtr::alloc();
        let shared = Arc::new(Shared {
            len: AtomicIsize::new(0),
            front: UnsafeCell::new(seg),
        });
        (
            Producer { shared: Arc::clone(&shared), back: seg },
            Consumer { shared },
        )
    }
}

/// Pushing half of a [`queue`]
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
    back: SegPtr<T>,
}

unsafe impl<T: Send> Send for Producer<T> {}
unsafe impl<T: Send> Sync for Producer<T> {}

impl<T> Producer<T> {
    /// Push an elem to the back
    pub fn push(&mut self, elem: T) {
        unsafe {
            let meta = self.back.meta();
            let tail = meta.tail.load(Relaxed);
            if tail < cap::<T>() {
                self.back.slot(tail).write(elem);
                meta.tail.store(tail + 1, Release);
            } else {
                let new_back = SegPtr::<T>::alloc();
                new_back.slot(0).write(elem);
                new_back.meta().tail.store(1, Relaxed);
                meta.next.store(new_back.0.as_ptr(), Release);
                self.back = new_back;
            }
        }
        self.shared.len.fetch_add(1, SeqCst);
    }

    /// Number of elems pushed but not yet popped
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    /// Whether every pushed elem has been popped
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Popping half of a [`queue`]
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

unsafe impl<T: Send> Send for Consumer<T> {}
unsafe impl<T: Send> Sync for Consumer<T> {}

impl<T> Consumer<T> {
    /// Pop an elem from the front, if there is one
    pub fn pop(&mut self) -> Option<T> {
        unsafe {
            loop {
                let front = *self.shared.front.get();
                let meta = front.meta();
                let head = *meta.head.get();
                if head < meta.tail.load(Acquire) {
                    let elem = front.slot(head).read();
                    *meta.head.get() = head + 1;
                    self.shared.len.fetch_sub(1, SeqCst);
                    return Some(elem);
                }
                if head < cap::<T>() {
                    return None;
                }
                // front segment exhausted
                let next = front.next()?;
                *self.shared.front.get() = next;
                front.drop_and_dealloc();
            }
        }
    }

    /// Number of elems pushed but not yet popped
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    /// Whether every pushed elem has been popped
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over elems from front to back, by reference
    ///
    /// Yields at most the elems present when the iterator was created.
    pub fn iter(&self) -> Iter<'_, T> {
        unsafe {
            let seg = *self.shared.front.get();
            Iter {
                seg,
                idx: *seg.meta().head.get(),
                remaining: self.len(),
                _p: PhantomData,
            }
        }
    }
}

impl<T: Debug> Debug for Consumer<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Iterator over the elems of a [`Consumer`] by reference
pub struct Iter<'a, T> {
    seg: SegPtr<T>,
    idx: usize,
    remaining: usize,
    _p: PhantomData<&'a T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.remaining == 0 {
            return None;
        }
        unsafe {
            loop {
                if self.idx < self.seg.meta().tail.load(Acquire) {
                    let elem = &*self.seg.slot(self.idx);
                    self.idx += 1;
                    self.remaining -= 1;
                    return Some(elem);
                }
                if self.idx < cap::<T>() {
                    return None;
                }
                self.seg = self.seg.next()?;
                self.idx = 0;
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}
