//! Thin wrapper around [`anyhow`] that adds chain-aware downcasting.
//!
//! The workspace aliases the `anyhow` dependency name to this crate, so every normal
//! `anyhow` item (`Result`, `Context`, `anyhow!`, `bail!`, ...) is re-exported here
//! unchanged; [`ErrorExt`] is the only addition.

use std::error::Error as StdError;
use std::fmt;

pub use anyhow::{Context, Error, Ok, Result, anyhow, bail, ensure};

/// Extends [`anyhow::Error`] with chain-aware downcasting.
///
/// `anyhow::Error::is` and `downcast_ref` only match the error's root cause. These helpers
/// instead walk the whole `source()` chain, which matters once an error has been wrapped a
/// few times via `.context(..)`.
pub trait ErrorExt {
    /// Returns `true` if any error in the chain is of type `E`.
    fn any_is<E>(&self) -> bool
    where
        E: StdError + fmt::Debug + fmt::Display + 'static;

    /// Returns a reference to the first error in the chain of type `E`, if any.
    fn any_downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + fmt::Debug + fmt::Display + 'static;
}

impl ErrorExt for anyhow::Error {
    fn any_is<E>(&self) -> bool
    where
        E: StdError + fmt::Debug + fmt::Display + 'static,
    {
        self.any_downcast_ref::<E>().is_some()
    }

    fn any_downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + fmt::Debug + fmt::Display + 'static,
    {
        self.chain().find_map(|cause| cause.downcast_ref::<E>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("inner failure")]
    struct InnerError;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct OuterError;

    #[test]
    fn finds_error_wrapped_in_context() {
        let err = anyhow::Error::new(InnerError).context("while doing something");

        assert!(err.any_is::<InnerError>());
        assert!(!err.any_is::<OuterError>());
    }

    #[test]
    fn does_not_find_unrelated_error() {
        let err = anyhow::Error::new(OuterError).context("while doing something else");

        assert!(!err.any_is::<InnerError>());
    }
}
