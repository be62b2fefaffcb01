//! A lock-free single-producer/single-consumer byte ring for no-alloc systems.
//!
//! The ring is split into a [`Producer`] (typically owned by the USB interrupt handler) and a
//! [`Consumer`] (typically owned by the task draining the data). `head` is only ever stored
//! through the producer and `tail` only through the consumer; each side merely loads the
//! other's index. With Acquire/Release ordering on those two indices the ring is sound both
//! on a single core with interrupt preemption and between real threads.
//!
//! One slot of the backing array is always left unused so that `head == tail` unambiguously
//! means "empty": a `RingBuffer<N>` holds at most `N - 1` bytes.
//!
//! Example usage:
//!
//! ```rust
//! # use bulkflow::make_ring;
//! let (mut producer, mut consumer) = make_ring!(16);
//!
//! producer.write(b"hello");
//! assert!(consumer.has_data(5));
//!
//! let mut buf = [0; 5];
//! consumer.read(&mut buf);
//! assert_eq!(&buf, b"hello");
//! ```

use core::{future::poll_fn, task::Poll};

#[cfg(not(loom))]
use portable_atomic::{AtomicUsize, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicUsize, Ordering};

use crate::unsafecell::UnsafeCell;
use crate::waker::WakerSlot;

#[cfg(feature = "defmt-03")]
use crate::defmt;

#[doc(hidden)]
pub use critical_section;

/// A fixed-capacity byte ring. `N` is the size of the backing array, the usable capacity is
/// `N - 1` bytes.
pub struct RingBuffer<const N: usize> {
    // Bytes in `[tail, head)` belong to the consumer, everything else to the producer.
    storage: [UnsafeCell<u8>; N],
    // Next write position, only stored through the `Producer`.
    head: AtomicUsize,
    // Next read position, only stored through the `Consumer`.
    tail: AtomicUsize,
    // A consumer waiting for data.
    data_waker: WakerSlot,
    // A producer waiting for space.
    space_waker: WakerSlot,
}

unsafe impl<const N: usize> Send for RingBuffer<N> {}

unsafe impl<const N: usize> Sync for RingBuffer<N> {}

/// Number of bytes from `from` up to (excluding) `to`, walking forward around a ring of `n`.
#[inline(always)]
const fn distance(from: usize, to: usize, n: usize) -> usize {
    if to >= from {
        to - from
    } else {
        to + n - from
    }
}

/// `pos + by` wrapped to `[0, n)`. Both inputs are below `n`, so one subtraction suffices.
#[inline(always)]
const fn advance(pos: usize, by: usize, n: usize) -> usize {
    let next = pos + by;
    if next >= n {
        next - n
    } else {
        next
    }
}

impl<const N: usize> RingBuffer<N> {
    const _CHECK: () = assert!(N >= 2, "a ring needs at least two bytes of backing storage");

    /// Create a new, empty ring.
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::_CHECK;

        Self {
            storage: [const { UnsafeCell::new(0) }; N],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            data_waker: WakerSlot::new(),
            space_waker: WakerSlot::new(),
        }
    }

    /// Create a new, empty ring.
    #[cfg(loom)]
    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::_CHECK;

        Self {
            storage: core::array::from_fn(|_| UnsafeCell::new(0)),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            data_waker: WakerSlot::new(),
            space_waker: WakerSlot::new(),
        }
    }

    /// Split the ring into its `Producer`/`Consumer` pair. The ring starts out empty.
    pub fn split(&mut self) -> (Producer<'_, N>, Consumer<'_, N>) {
        self.reset();

        let ring: &Self = self;
        (Producer { ring }, Consumer { ring })
    }

    /// Discard all buffered data.
    ///
    /// Taking `&mut self` guarantees neither a producer nor a consumer is active. Use
    /// [`reset`] to do the same through a split pair.
    pub fn reset(&mut self) {
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);

        trace!("ring reset, capacity {=usize}", N - 1);
    }

    /// The maximum number of bytes the ring can hold, `N - 1`.
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    /// Number of bytes currently buffered.
    pub fn occupied(&self) -> usize {
        // Each index is loaded exactly once; the other side may move it at any time.
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);

        distance(tail, head, N)
    }

    /// Number of bytes that can be written without overwriting unread data.
    pub fn available(&self) -> usize {
        N - 1 - self.occupied()
    }

    /// Returns true if at least `n` bytes can be read.
    pub fn has_data(&self, n: usize) -> bool {
        self.occupied() >= n
    }

    /// Returns true if at least `n` bytes can be written.
    pub fn has_avail(&self, n: usize) -> bool {
        self.available() >= n
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    /// Wait until at least `n` bytes are buffered.
    ///
    /// Only one task may wait for data at a time; a second waiter evicts the first, which is
    /// then woken to re-register.
    pub async fn wait_for_data(&self, n: usize) {
        assert!(
            n < N,
            "waiting for {} bytes in a ring of capacity {} would never complete",
            n,
            N - 1
        );

        poll_fn(|cx| {
            if self.has_data(n) {
                return Poll::Ready(());
            }

            self.data_waker.register(cx.waker());

            // The producer may have written between the check and the registration.
            if self.has_data(n) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }

    /// Wait until at least `n` bytes of space are free.
    pub async fn wait_for_space(&self, n: usize) {
        assert!(
            n < N,
            "waiting for {} free bytes in a ring of capacity {} would never complete",
            n,
            N - 1
        );

        poll_fn(|cx| {
            if self.has_avail(n) {
                return Poll::Ready(());
            }

            self.space_waker.register(cx.waker());

            if self.has_avail(n) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }

    /// Copy `src` into storage starting at `at`, splitting the copy at the end of the array.
    fn copy_in(&self, at: usize, src: &[u8]) {
        let first = src.len().min(N - at);
        let (front, wrapped) = src.split_at(first);

        self.store_bytes(at, front);
        self.store_bytes(0, wrapped);
    }

    /// Copy from storage starting at `at` into `dst`, splitting the copy at the end of the array.
    fn copy_out(&self, at: usize, dst: &mut [u8]) {
        let first = dst.len().min(N - at);
        let (front, wrapped) = dst.split_at_mut(first);

        self.load_bytes(at, front);
        self.load_bytes(0, wrapped);
    }

    #[cfg(not(loom))]
    fn store_bytes(&self, at: usize, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        assert!(at + src.len() <= N);

        // SAFETY: `UnsafeCell<u8>` is `repr(transparent)`, so the cells are one contiguous byte
        // array that may be mutated through `&self`. The range lies outside `[tail, head)`, so
        // the consumer does not touch it until `head` is published.
        unsafe {
            let dst = self.storage.as_ptr().cast::<u8>().cast_mut().add(at);
            core::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        }
    }

    #[cfg(not(loom))]
    fn load_bytes(&self, at: usize, dst: &mut [u8]) {
        if dst.is_empty() {
            return;
        }
        assert!(at + dst.len() <= N);

        // SAFETY: as in `store_bytes`; the range lies inside `[tail, head)`, which the producer
        // does not touch until `tail` is published.
        unsafe {
            let src = self.storage.as_ptr().cast::<u8>().add(at);
            core::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len());
        }
    }

    #[cfg(loom)]
    fn store_bytes(&self, at: usize, src: &[u8]) {
        for (cell, byte) in self.storage[at..at + src.len()].iter().zip(src) {
            cell.with_mut(|p| unsafe { *p = *byte });
        }
    }

    #[cfg(loom)]
    fn load_bytes(&self, at: usize, dst: &mut [u8]) {
        for (cell, byte) in self.storage[at..at + dst.len()].iter().zip(dst.iter_mut()) {
            *byte = cell.with(|p| unsafe { *p });
        }
    }
}

#[cfg(not(loom))]
impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> core::fmt::Debug for RingBuffer<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("occupied", &self.occupied())
            .field("capacity", &(N - 1))
            .finish()
    }
}

#[cfg(feature = "defmt-03")]
impl<const N: usize> defmt::Format for RingBuffer<N> {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(
            f,
            "RingBuffer {{ occupied: {=usize}, capacity: {=usize} }}",
            self.occupied(),
            N - 1
        )
    }
}

/// Discard all buffered data of the ring `producer` and `consumer` belong to.
///
/// Holding both handles mutably proves that neither side is in the middle of a transfer,
/// which is what makes the reset race free. Intended to run when the USB host
/// (re-)configures the device, before the endpoint is armed again.
///
/// # Panics
///
/// If `producer` and `consumer` were split from different rings.
pub fn reset<const N: usize>(producer: &mut Producer<'_, N>, consumer: &mut Consumer<'_, N>) {
    assert!(
        core::ptr::eq(producer.ring, consumer.ring),
        "producer and consumer belong to different rings"
    );

    let ring = producer.ring;
    ring.head.store(0, Ordering::Release);
    ring.tail.store(0, Ordering::Release);

    trace!("ring reset, capacity {=usize}", N - 1);

    // All space was just reclaimed.
    ring.space_waker.wake();
}

/// Creates a split ring with `'static` lifetime.
#[cfg(not(loom))]
#[macro_export]
macro_rules! make_ring {
    ($size:expr) => {{
        static mut RING: $crate::ring::RingBuffer<$size> = $crate::ring::RingBuffer::new();

        static TAKEN: $crate::portable_atomic::AtomicBool =
            $crate::portable_atomic::AtomicBool::new(false);

        $crate::ring::critical_section::with(|_| {
            if TAKEN.load(::core::sync::atomic::Ordering::Relaxed) {
                panic!("call to the same `make_ring` instance twice");
            }

            TAKEN.store(true, ::core::sync::atomic::Ordering::Relaxed);
        });

        // SAFETY: `RING` is hidden inside this block and the check above makes sure the
        // mutable borrow happens at most once.
        #[allow(static_mut_refs)]
        unsafe {
            RING.split()
        }
    }};
}

// -------- Errors

/// Error returned by [`Producer::try_write`].
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// The ring does not have enough free space for the whole write.
    Insufficient {
        /// Bytes the caller tried to write.
        requested: usize,
        /// Bytes that were free at the time of the call.
        available: usize,
    },
}

impl core::fmt::Display for WriteError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WriteError::Insufficient {
                requested,
                available,
            } => write!(
                f,
                "cannot write {requested} bytes, only {available} bytes free"
            ),
        }
    }
}

impl core::error::Error for WriteError {}

/// Error returned by [`Consumer::try_read`].
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// Fewer bytes are buffered than requested; partial reads are not supported.
    Insufficient {
        /// Bytes the caller tried to read.
        requested: usize,
        /// Bytes that were buffered at the time of the call.
        occupied: usize,
    },
}

impl core::fmt::Display for ReadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ReadError::Insufficient {
                requested,
                occupied,
            } => write!(
                f,
                "cannot read {requested} bytes, only {occupied} bytes buffered"
            ),
        }
    }
}

impl core::error::Error for ReadError {}

// -------- Producer

/// The writing half of a [`RingBuffer`]. There is exactly one per ring.
pub struct Producer<'a, const N: usize> {
    ring: &'a RingBuffer<N>,
}

impl<const N: usize> core::fmt::Debug for Producer<'_, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Producer")
    }
}

#[cfg(feature = "defmt-03")]
impl<const N: usize> defmt::Format for Producer<'_, N> {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Producer",)
    }
}

impl<'a, const N: usize> Producer<'a, N> {
    /// The ring this producer writes into.
    pub fn ring(&self) -> &'a RingBuffer<N> {
        self.ring
    }

    /// Number of bytes that can be written without overwriting unread data.
    pub fn available(&self) -> usize {
        // `head` is ours, only `tail` can move under us.
        let head = self.ring.head.load(Ordering::Relaxed);
        let tail = self.ring.tail.load(Ordering::Acquire);

        N - 1 - distance(tail, head, N)
    }

    /// Number of bytes currently buffered.
    pub fn occupied(&self) -> usize {
        N - 1 - self.available()
    }

    /// Returns true if at least `n` bytes can be written.
    pub fn has_avail(&self, n: usize) -> bool {
        self.available() >= n
    }

    /// Append `data` to the ring.
    ///
    /// The caller must have made sure that `data.len() <= self.available()`; writing more
    /// overwrites unread data. This is checked in debug builds.
    ///
    /// # Panics
    ///
    /// If `data` is longer than the capacity of the ring, or (debug builds only) longer than
    /// the currently free space.
    pub fn write(&mut self, data: &[u8]) {
        let len = data.len();
        assert!(
            len < N,
            "write of {} bytes can never fit a ring of capacity {}",
            len,
            N - 1
        );

        let head = self.ring.head.load(Ordering::Relaxed);
        let tail = self.ring.tail.load(Ordering::Acquire);
        debug_assert!(
            len <= N - 1 - distance(tail, head, N),
            "ring overflow: writing {} bytes with {} bytes free",
            len,
            N - 1 - distance(tail, head, N)
        );

        if len == 0 {
            return;
        }

        self.ring.copy_in(head, data);
        self.ring.head.store(advance(head, len, N), Ordering::Release);

        self.ring.data_waker.wake();
    }

    /// Append `data` to the ring if there is room for all of it.
    pub fn try_write(&mut self, data: &[u8]) -> Result<(), WriteError> {
        let available = self.available();
        if data.len() > available {
            return Err(WriteError::Insufficient {
                requested: data.len(),
                available,
            });
        }

        self.write(data);
        Ok(())
    }

    /// Append `data` to the ring, waiting until there is room for all of it.
    ///
    /// Meant for producers running as a task or thread; an interrupt handler cannot wait.
    pub async fn write_all(&mut self, data: &[u8]) {
        self.ring.wait_for_space(data.len()).await;
        self.write(data);
    }
}

// -------- Consumer

/// The reading half of a [`RingBuffer`]. There is exactly one per ring.
pub struct Consumer<'a, const N: usize> {
    ring: &'a RingBuffer<N>,
}

impl<const N: usize> core::fmt::Debug for Consumer<'_, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Consumer")
    }
}

#[cfg(feature = "defmt-03")]
impl<const N: usize> defmt::Format for Consumer<'_, N> {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Consumer",)
    }
}

impl<'a, const N: usize> Consumer<'a, N> {
    /// The ring this consumer reads from.
    pub fn ring(&self) -> &'a RingBuffer<N> {
        self.ring
    }

    /// Number of bytes currently buffered.
    pub fn occupied(&self) -> usize {
        // `tail` is ours, only `head` can move under us.
        let head = self.ring.head.load(Ordering::Acquire);
        let tail = self.ring.tail.load(Ordering::Relaxed);

        distance(tail, head, N)
    }

    /// Number of bytes that can be written without overwriting unread data.
    pub fn available(&self) -> usize {
        N - 1 - self.occupied()
    }

    /// Returns true if at least `n` bytes can be read.
    pub fn has_data(&self, n: usize) -> bool {
        self.occupied() >= n
    }

    /// Fill `dst` with the oldest buffered bytes.
    ///
    /// The caller must have made sure that `dst.len() <= self.occupied()` (e.g. with
    /// [`Consumer::has_data`]); short reads are not supported. This is checked in debug builds.
    ///
    /// # Panics
    ///
    /// If `dst` is longer than the capacity of the ring, or (debug builds only) longer than
    /// the number of buffered bytes.
    pub fn read(&mut self, dst: &mut [u8]) {
        let len = dst.len();
        assert!(
            len < N,
            "read of {} bytes can never be satisfied by a ring of capacity {}",
            len,
            N - 1
        );

        let tail = self.ring.tail.load(Ordering::Relaxed);
        let head = self.ring.head.load(Ordering::Acquire);
        debug_assert!(
            len <= distance(tail, head, N),
            "ring underflow: reading {} bytes with {} bytes buffered",
            len,
            distance(tail, head, N)
        );

        if len == 0 {
            return;
        }

        self.ring.copy_out(tail, dst);
        self.ring.tail.store(advance(tail, len, N), Ordering::Release);

        self.ring.space_waker.wake();
    }

    /// Fill `dst` with the oldest buffered bytes if enough of them are buffered.
    pub fn try_read(&mut self, dst: &mut [u8]) -> Result<(), ReadError> {
        let occupied = self.occupied();
        if dst.len() > occupied {
            return Err(ReadError::Insufficient {
                requested: dst.len(),
                occupied,
            });
        }

        self.read(dst);
        Ok(())
    }

    /// Fill `dst`, waiting until enough bytes have been buffered.
    pub async fn read_exact(&mut self, dst: &mut [u8]) {
        self.ring.wait_for_data(dst.len()).await;
        self.read(dst);
    }
}
