// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! macOS dispatch source backend.
//!
//! A one-shot walltime timer source on the global concurrent queue. The
//! event handler runs on a worker thread: it records the expiration, wakes
//! the waiter, and requests cancellation of the source. Releasing the
//! context is two-phase: the `Arc` reference donated to the source at arm
//! time is reclaimed only in the cancellation handler, which the kernel
//! runs strictly after the last possible event callback, so the context and
//! the source stay alive for as long as a callback could still touch them.

use super::deadline_timespec;
use crate::clock::Timestamp;
use crate::driver::Scheduler;
use crate::error::Error;
use crate::wait::ArmTimer;
use crate::wait::PendingWait;
use crate::wait::PollSleep;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::io;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;

const DISPATCH_TIME_FOREVER: u64 = !0;
/// 1 ms of allowed coalescing, comfortably inside the precision target.
const TIMER_LEEWAY_NS: u64 = 1_000_000;

#[allow(non_upper_case_globals)]
extern "C" {
    static _dispatch_source_type_timer: c_void;

    fn dispatch_get_global_queue(identifier: libc::c_long, flags: libc::c_ulong) -> *mut c_void;
    fn dispatch_source_create(
        r#type: *const c_void,
        handle: libc::uintptr_t,
        mask: libc::c_ulong,
        queue: *mut c_void,
    ) -> *mut c_void;
    fn dispatch_set_context(object: *mut c_void, context: *mut c_void);
    fn dispatch_source_set_event_handler_f(
        source: *mut c_void,
        handler: unsafe extern "C" fn(*mut c_void),
    );
    fn dispatch_source_set_cancel_handler_f(
        source: *mut c_void,
        handler: unsafe extern "C" fn(*mut c_void),
    );
    fn dispatch_walltime(when: *const libc::timespec, delta: i64) -> u64;
    fn dispatch_source_set_timer(source: *mut c_void, start: u64, interval: u64, leeway: u64);
    fn dispatch_resume(object: *mut c_void);
    fn dispatch_source_cancel(source: *mut c_void);
    fn dispatch_release(object: *mut c_void);
}

/// The kernel-queue timer backend.
#[derive(Debug)]
pub struct DispatchTimer;

impl DispatchTimer {
    pub(crate) fn new() -> Self {
        Self
    }
}

#[derive(Debug)]
enum FireState {
    Armed(Option<Waker>),
    Signaled,
    Cancelled,
}

/// A retained dispatch source handle.
#[derive(Debug)]
struct SourceRef(*mut c_void);

// SAFETY: dispatch objects are reference-counted kernel-queue handles with
// no thread affinity.
unsafe impl Send for SourceRef {}
// SAFETY: see above.
unsafe impl Sync for SourceRef {}

#[derive(Debug)]
struct DispatchInner {
    state: Mutex<FireState>,
    source: SourceRef,
}

impl DispatchInner {
    /// Records the expiration and wakes the waiter. No-op if cancellation
    /// won the race.
    fn fire(&self) {
        let waker = {
            let mut state = self.state.lock();
            match &mut *state {
                FireState::Armed(waker) => {
                    let waker = waker.take();
                    *state = FireState::Signaled;
                    waker
                }
                FireState::Signaled | FireState::Cancelled => return,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl Drop for DispatchInner {
    fn drop(&mut self) {
        // The last reference is gone: the source was cancelled and its
        // cancellation handler has reclaimed the donated reference, so no
        // callback can run against it again.
        //
        // SAFETY: releasing the single retain taken at creation.
        unsafe {
            dispatch_release(self.source.0);
        }
    }
}

/// Event handler, called on a dispatch worker thread at expiration.
unsafe extern "C" fn timer_event(context: *mut c_void) {
    // SAFETY: the context is the DispatchInner donated at arm time, kept
    // alive at least until the cancellation handler runs, which is ordered
    // after this call. Borrowed, never consumed, here.
    let inner = unsafe { &*context.cast::<DispatchInner>() };
    inner.fire();
    // One-shot: stop the source now that it has fired.
    //
    // SAFETY: the source handle stays valid for the same reason.
    unsafe {
        dispatch_source_cancel(inner.source.0);
    }
}

/// Cancellation handler, called once after the kernel guarantees no further
/// event callback can run.
unsafe extern "C" fn timer_cancelled(context: *mut c_void) {
    // SAFETY: reclaims the reference donated with Arc::into_raw at arm
    // time. This is the only place it is reclaimed.
    let inner = unsafe { Arc::from_raw(context.cast::<DispatchInner>()) };
    drop(inner);
}

impl ArmTimer for DispatchTimer {
    fn arm(&self, _scheduler: &dyn Scheduler, deadline: Timestamp) -> Result<PendingWait, Error> {
        // SAFETY: the global queue is a permanent object; no release is
        // needed or allowed.
        let queue = unsafe { dispatch_get_global_queue(0, 0) };
        // SAFETY: creating a timer source with no handle or mask, retained
        // once for us.
        let source =
            unsafe { dispatch_source_create(&_dispatch_source_type_timer, 0, 0, queue) };
        if source.is_null() {
            return Err(Error::ResourceCreation(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "dispatch_source_create failed",
            )));
        }

        let inner = Arc::new(DispatchInner {
            state: Mutex::new(FireState::Armed(None)),
            source: SourceRef(source),
        });
        // Donate a reference to the source; timer_cancelled reclaims it.
        let context = Arc::into_raw(inner.clone());

        let spec = deadline_timespec(deadline);
        // SAFETY: configuring a source not yet resumed, so none of the
        // handlers can run concurrently with this.
        unsafe {
            dispatch_set_context(source, context.cast_mut().cast());
            dispatch_source_set_event_handler_f(source, timer_event);
            dispatch_source_set_cancel_handler_f(source, timer_cancelled);
            let start = dispatch_walltime(&spec, 0);
            dispatch_source_set_timer(source, start, DISPATCH_TIME_FOREVER, TIMER_LEEWAY_NS);
            dispatch_resume(source);
        }

        tracing::trace!("armed dispatch timer");
        Ok(smallbox::smallbox!(DispatchWait { inner }))
    }
}

struct DispatchWait {
    inner: Arc<DispatchInner>,
}

impl PollSleep for DispatchWait {
    fn poll_sleep(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.inner.state.lock();
        match &mut *state {
            FireState::Armed(waker) => {
                if !waker
                    .as_ref()
                    .is_some_and(|waker| waker.will_wake(cx.waker()))
                {
                    *waker = Some(cx.waker().clone());
                }
                Poll::Pending
            }
            FireState::Signaled => Poll::Ready(()),
            FireState::Cancelled => unreachable!("polled after cancellation"),
        }
    }

    fn cancel(&mut self) {
        {
            let mut state = self.inner.state.lock();
            if let FireState::Armed(_) = &*state {
                *state = FireState::Cancelled;
            }
        }
        // Idempotent, and a benign no-op if the event handler already
        // requested it.
        //
        // SAFETY: the source handle is valid while `inner` is alive.
        unsafe {
            dispatch_source_cancel(self.inner.source.0);
        }
    }
}

impl Drop for DispatchWait {
    fn drop(&mut self) {
        // Make sure the cancellation handler eventually runs to reclaim the
        // donated reference, whether or not the timer fired.
        //
        // SAFETY: the source handle is valid while `inner` is alive.
        unsafe {
            dispatch_source_cancel(self.inner.source.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DispatchTimer;
    use crate::testing;

    #[test]
    fn fires_at_target() {
        testing::fires_at_target(&DispatchTimer::new());
    }

    #[test]
    fn cancel_before_fire() {
        testing::cancel_before_fire(&DispatchTimer::new());
    }

    #[test]
    fn past_deadline_fires_promptly() {
        testing::past_deadline_fires_promptly(&DispatchTimer::new());
    }

    #[test]
    fn concurrent_waits_are_independent() {
        testing::concurrent_waits_are_independent(&DispatchTimer::new());
    }
}
