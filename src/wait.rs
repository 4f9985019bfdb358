// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The portable wait future and platform backend selection.

use crate::clock::Timestamp;
use crate::driver::PollImpl;
use crate::driver::Scheduler;
use crate::error::Cancelled;
use crate::error::Error;
use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

/// A backend that can arm a native one-shot timer for an absolute wall-clock
/// deadline.
pub(crate) trait ArmTimer: Send + Sync {
    /// Creates and programs the native timer, bridging its completion to
    /// `scheduler`.
    ///
    /// Every failure path must have released whatever native state was
    /// already allocated before returning.
    fn arm(&self, scheduler: &dyn Scheduler, deadline: Timestamp) -> Result<PendingWait, Error>;
}

/// An armed native timer, exclusive owner of its native resources.
pub(crate) type PendingWait = PollImpl<dyn PollSleep>;

/// The polled side of an armed native timer.
pub(crate) trait PollSleep: Unpin + Send + Sync {
    /// Polls for the deadline having elapsed.
    fn poll_sleep(&mut self, cx: &mut Context<'_>) -> Poll<()>;

    /// Releases the native timer immediately.
    ///
    /// The caller guarantees [`poll_sleep`](Self::poll_sleep) is never
    /// called again afterwards.
    fn cancel(&mut self);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum WaitState {
    Armed,
    Cancelled,
    Done(Result<(), Cancelled>),
}

/// A future that resolves when an absolute wall-clock deadline is reached,
/// returned by [`wait_until`].
///
/// Resolves to `Ok(())` when the deadline elapses, or to
/// `Err(`[`Cancelled`]`)` after [`cancel`](Self::cancel). Dropping the
/// future before it resolves also releases the native timer; cancellation
/// and deadline arrival race benignly, with whichever transition happens
/// first deciding the outcome. The future is fused: polling it again after
/// it has resolved keeps returning the same outcome.
#[must_use = "futures do nothing unless polled"]
pub struct WaitUntil {
    wait: PendingWait,
    state: WaitState,
}

impl WaitUntil {
    pub(crate) fn arm(
        backend: &dyn ArmTimer,
        scheduler: &dyn Scheduler,
        deadline: Timestamp,
    ) -> Result<Self, Error> {
        let wait = backend.arm(scheduler, deadline)?;
        tracing::trace!(?deadline, "armed wall-clock wait");
        Ok(Self {
            wait,
            state: WaitState::Armed,
        })
    }

    /// Cancels the wait, releasing the native timer immediately.
    ///
    /// The next poll resolves to `Err(`[`Cancelled`]`)`. Has no effect once
    /// the future has resolved; calling it again is a no-op.
    pub fn cancel(&mut self) {
        if self.state == WaitState::Armed {
            self.wait.cancel();
            self.state = WaitState::Cancelled;
            tracing::trace!("cancelled wall-clock wait");
        }
    }
}

impl Future for WaitUntil {
    type Output = Result<(), Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = match this.state {
            WaitState::Armed => {
                std::task::ready!(this.wait.poll_sleep(cx));
                Ok(())
            }
            WaitState::Cancelled => Err(Cancelled),
            WaitState::Done(outcome) => outcome,
        };
        this.state = WaitState::Done(outcome);
        Poll::Ready(outcome)
    }
}

/// Returns the native timer backend for the running platform, resolved once
/// for the life of the process.
#[allow(unreachable_code)]
pub(crate) fn platform() -> Result<&'static dyn ArmTimer, Error> {
    #[cfg(any(unix, windows))]
    {
        use once_cell::sync::OnceCell;

        static BACKEND: OnceCell<crate::sys::PlatformTimer> = OnceCell::new();
        return Ok(BACKEND.get_or_init(crate::sys::PlatformTimer::new));
    }
    Err(Error::UnsupportedPlatform)
}

/// Suspends the caller until the absolute wall-clock instant `target`.
///
/// `target` is anything convertible to a [`Timestamp`]: a `Timestamp`
/// itself, a [`std::time::SystemTime`], or a [`time::OffsetDateTime`]. A
/// [`time::PrimitiveDateTime`] is rejected with [`Error::NaiveTimestamp`]
/// since it does not name an unambiguous instant. Past instants resolve
/// promptly.
///
/// All setup failures surface here; the returned future's only non-success
/// outcome is [`Cancelled`].
pub fn wait_until<T>(scheduler: &impl Scheduler, target: T) -> Result<WaitUntil, Error>
where
    T: TryInto<Timestamp>,
    T::Error: Into<Error>,
{
    let deadline = target.try_into().map_err(Into::into)?;
    let backend = platform()?;
    WaitUntil::arm(backend, scheduler, deadline)
}
