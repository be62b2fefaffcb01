//! Compat layer for [`core::cell::UnsafeCell`] and `loom::cell::UnsafeCell`.

#[cfg(loom)]
pub use loom::cell::UnsafeCell;

#[cfg(not(loom))]
pub use self::cell::UnsafeCell;

#[cfg(not(loom))]
mod cell {
    /// A [`core::cell::UnsafeCell`] wrapper with the same layout as `T`.
    ///
    /// `[UnsafeCell<u8>; N]` is therefore a plain byte array that may be written through a
    /// shared reference.
    #[derive(Debug)]
    #[repr(transparent)]
    pub struct UnsafeCell<T>(core::cell::UnsafeCell<T>);

    impl<T> UnsafeCell<T> {
        /// Create a new `UnsafeCell`.
        pub const fn new(data: T) -> UnsafeCell<T> {
            UnsafeCell(core::cell::UnsafeCell::new(data))
        }
    }
}
