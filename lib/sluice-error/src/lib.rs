//! Error primitives shared across the sluice workspace.
//!
//! Components define their own typed errors with `snafu` where callers need to match on them. Everywhere else, and at
//! the application boundary, errors are carried as a [`GenericError`] and printed with `{:#}` to show the whole chain.

use std::{convert::Infallible, fmt::Display};

/// A type-erased error with an attached chain of context.
pub type GenericError = anyhow::Error;

/// Constructs a [`GenericError`].
///
/// Takes a string literal, a format string with its arguments, or a single error value, which becomes the source of
/// the new error.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

mod sealed {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}

    impl<T> Sealed for Option<T> {}
}

/// Context for fallible results and missing values.
///
/// Named apart from `anyhow::Context` so it can be imported next to `snafu::ResultExt`.
pub trait ErrorContext<T, E>: sealed::Sealed {
    /// Turns the error, or the missing value, into a [`GenericError`] described by `context`.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Like [`error_context`](ErrorContext::error_context), building the context only on failure.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, f)
    }
}

impl<T> ErrorContext<T, Infallible> for Option<T> {
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, Infallible>>::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, Infallible>>::with_context(self, f)
    }
}
