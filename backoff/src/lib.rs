//! Retry helpers shared by the hubstream crates.
//!
//! A [`retry::Retry`] future re-runs an [`Operation`] while its [`Condition`] allows it, sleeping
//! between attempts for the durations yielded by a [`strategy`] iterator. When the iterator is
//! exhausted the last error is returned to the caller.

use std::future::Future;

pub mod retry;
pub mod strategy;

/// Something that can be (re)started and yields a future per attempt.
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    fn run(&mut self) -> Self::Future;
}

impl<I, E, T, F> Operation for F
where
    T: Future<Output = Result<I, E>>,
    F: FnMut() -> T,
{
    type Item = I;
    type Error = E;
    type Future = T;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

/// Decides whether an error is worth another attempt.
pub trait Condition<E> {
    fn can_retry(&mut self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: FnMut(&E) -> bool,
{
    fn can_retry(&mut self, error: &E) -> bool {
        self(error)
    }
}
