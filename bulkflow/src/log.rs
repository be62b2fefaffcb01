//! Logging shims that forward to `defmt` when the `defmt-03` feature is enabled.

macro_rules! debug {
    ($($arg:tt)+) => {
        #[cfg(feature = "defmt-03")]
        $crate::defmt::debug!($($arg)+);
    };
}

macro_rules! trace {
    ($($arg:tt)+) => {
        #[cfg(feature = "defmt-03")]
        $crate::defmt::trace!($($arg)+);
    };
}
