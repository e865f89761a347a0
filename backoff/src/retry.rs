use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

use crate::{Condition, Operation};

/// The retry future alternates between running the operation and sleeping off a backoff delay.
///
/// ```no_rust
///   Attempt --Ok--> done
///      |
///     Err --not retryable--> done(Err)
///      |
///   next delay --None--> done(Err)
///      |
///    Backoff --elapsed--> Attempt
/// ```
#[pin_project(project = PhaseProj)]
enum Phase<O>
where
    O: Operation,
{
    Attempt(#[pin] O::Future),
    Backoff(#[pin] Sleep),
}

/// Runs an [`Operation`] until it succeeds, the [`Condition`] rejects the error, or the delay
/// iterator runs dry. The first run is not a retry, so `take(n)` allows `n + 1` runs in total.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    phase: Phase<O>,
    delays: I,
    operation: O,
    condition: C,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<II>(delays: II, mut operation: O, condition: C) -> Self
    where
        II: IntoIterator<IntoIter = I, Item = Duration>,
    {
        Self {
            phase: Phase::Attempt(operation.run()),
            delays: delays.into_iter(),
            operation,
            condition,
        }
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, O::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            let this = self.as_mut().project();
            match this.phase.project() {
                PhaseProj::Attempt(fut) => match fut.poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(item)) => return Poll::Ready(Ok(item)),
                    Poll::Ready(Err(e)) => {
                        let this = self.as_mut().project();
                        if !this.condition.can_retry(&e) {
                            return Poll::Ready(Err(e));
                        }
                        let Some(delay) = this.delays.next() else {
                            return Poll::Ready(Err(e));
                        };
                        self.as_mut()
                            .project()
                            .phase
                            .set(Phase::Backoff(sleep_until(Instant::now() + delay)));
                    }
                },
                PhaseProj::Backoff(sleep) => match sleep.poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => {
                        let next = self.as_mut().project().operation.run();
                        self.as_mut().project().phase.set(Phase::Attempt(next));
                    }
                },
            }
        }
    }
}
