// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! POSIX interval timer backend.
//!
//! `timer_create` with `SIGEV_THREAD` delivers expirations by calling a
//! function on a library-managed notification thread. The callback receives
//! only a pointer-sized `sigev_value`; an opaque registry token is passed
//! through it rather than a pointer, so a late or duplicate delivery can at
//! worst miss a lookup. Teardown gates on the closed transition under the
//! context mutex, then removes the registry entry, then deletes the native
//! timer, exactly once.

use super::deadline_timespec;
use super::SyscallResult;
use crate::clock::Timestamp;
use crate::driver::Scheduler;
use crate::error::Error;
use crate::registry::WaitRegistry;
use crate::registry::WaitToken;
use crate::wait::ArmTimer;
use crate::wait::PendingWait;
use crate::wait::PollSleep;
use parking_lot::Mutex;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;

/// Live wait contexts, keyed by the token carried through `sigev_value`.
static REGISTRY: WaitRegistry<PosixInner> = WaitRegistry::new();

/// The notification-thread timer backend.
#[derive(Debug)]
pub struct PosixTimer;

impl PosixTimer {
    pub(crate) fn new() -> Self {
        Self
    }
}

/// `struct sigevent` with the `SIGEV_THREAD` union arm broken out, since
/// the `libc` crate does not expose `sigev_notify_function`.
///
/// glibc and musl put `sigev_value` first; this is their layout, 64 bytes.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[repr(C)]
struct SigeventThread {
    sigev_value: libc::sigval,
    sigev_signo: libc::c_int,
    sigev_notify: libc::c_int,
    sigev_notify_function: Option<unsafe extern "C" fn(libc::sigval)>,
    sigev_notify_attributes: *mut libc::c_void,
    _pad: [u8; SIGEVENT_PAD],
}

/// The BSDs and illumos put `sigev_notify` first, with the notify function
/// and attributes as the leading union arms after `sigev_value`.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
#[repr(C)]
struct SigeventThread {
    sigev_notify: libc::c_int,
    sigev_signo: libc::c_int,
    sigev_value: libc::sigval,
    sigev_notify_function: Option<unsafe extern "C" fn(libc::sigval)>,
    sigev_notify_attributes: *mut libc::c_void,
    _pad: [u8; SIGEVENT_PAD],
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SIGEVENT_SIZE: usize = 64;
// Larger than any of the native definitions (FreeBSD's, the largest, is
// 80); the callee reads only its own sizeof, so oversizing is harmless and
// undersizing would let it read past the end.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SIGEVENT_SIZE: usize = 96;

const SIGEVENT_PAD: usize = SIGEVENT_SIZE
    - (size_of::<libc::sigval>()
        + 2 * size_of::<libc::c_int>()
        + 2 * size_of::<*mut libc::c_void>());

#[derive(Debug)]
enum FireState {
    Armed(Option<Waker>),
    Signaled,
    Closed,
}

#[derive(Debug)]
struct PosixInner {
    state: Mutex<FireState>,
}

impl PosixInner {
    /// Records an expiration and wakes the waiter. Duplicate deliveries and
    /// deliveries racing teardown are no-ops.
    fn fire(&self) {
        let waker = {
            let mut state = self.state.lock();
            match &mut *state {
                FireState::Armed(waker) => {
                    let waker = waker.take();
                    *state = FireState::Signaled;
                    waker
                }
                FireState::Signaled | FireState::Closed => return,
            }
        };
        // Wake outside the lock.
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Expiration entry point, called on the notification thread.
unsafe extern "C" fn timer_notify(value: libc::sigval) {
    let token = WaitToken::from_raw(value.sival_ptr as usize);
    let Some(inner) = REGISTRY.get(token) else {
        // Delivery for a wait that has since been torn down.
        tracing::debug!(?token, "dropped stale timer notification");
        return;
    };
    inner.fire();
}

/// A kernel timer id. Just a handle, so it can move between threads.
#[derive(Debug)]
struct TimerId(libc::timer_t);

// SAFETY: the id is an opaque kernel handle with no thread affinity.
unsafe impl Send for TimerId {}
// SAFETY: see above.
unsafe impl Sync for TimerId {}

struct PosixWait {
    inner: Arc<PosixInner>,
    token: WaitToken,
    timer: Option<TimerId>,
}

impl ArmTimer for PosixTimer {
    fn arm(&self, _scheduler: &dyn Scheduler, deadline: Timestamp) -> Result<PendingWait, Error> {
        let inner = Arc::new(PosixInner {
            state: Mutex::new(FireState::Armed(None)),
        });
        let token = REGISTRY.insert(inner.clone());

        // SAFETY: a zeroed sigevent is a valid starting point; the fields
        // left zero select no signal and no thread attributes.
        let mut sev: SigeventThread = unsafe { std::mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_THREAD;
        sev.sigev_notify_function = Some(timer_notify);
        sev.sigev_value.sival_ptr = token.to_raw() as *mut libc::c_void;

        // SAFETY: timer_t is an integer on some targets and a pointer on
        // others; all-zero is a valid placeholder for both, and timer_create
        // overwrites it before it is used.
        let mut timer_id: libc::timer_t = unsafe { std::mem::zeroed() };
        // SAFETY: SigeventThread matches the sigevent layout, and the
        // callback dereferences nothing but the token in sigev_value.
        let r = unsafe {
            libc::timer_create(
                libc::CLOCK_REALTIME,
                std::ptr::from_mut(&mut sev).cast(),
                &mut timer_id,
            )
        }
        .syscall_result();
        if let Err(err) = r {
            REGISTRY.remove(token);
            return Err(Error::ResourceCreation(err));
        }

        let mut wait = PosixWait {
            inner,
            token,
            timer: Some(TimerId(timer_id)),
        };

        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: deadline_timespec(deadline),
        };
        // SAFETY: timer_id was just created and spec outlives the call.
        let r = unsafe {
            libc::timer_settime(timer_id, libc::TIMER_ABSTIME, &spec, std::ptr::null_mut())
        }
        .syscall_result();
        if let Err(err) = r {
            wait.close();
            return Err(Error::ResourceArm(err));
        }

        tracing::trace!(token = ?token, "armed posix timer");
        Ok(smallbox::smallbox!(wait))
    }
}

impl PosixWait {
    /// Tears down the native timer. Idempotent; gated by the closed
    /// transition.
    fn close(&mut self) {
        {
            let mut state = self.inner.state.lock();
            if matches!(*state, FireState::Closed) {
                return;
            }
            *state = FireState::Closed;
        }
        // In-flight notifications now either miss the registry or observe
        // the closed state, so the native timer can go.
        REGISTRY.remove(self.token);
        if let Some(timer) = self.timer.take() {
            // SAFETY: deleting a timer id created in arm and not yet
            // deleted.
            unsafe {
                libc::timer_delete(timer.0);
            }
        }
    }
}

impl PollSleep for PosixWait {
    fn poll_sleep(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let signaled = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                FireState::Armed(waker) => {
                    if !waker
                        .as_ref()
                        .is_some_and(|waker| waker.will_wake(cx.waker()))
                    {
                        *waker = Some(cx.waker().clone());
                    }
                    false
                }
                FireState::Signaled => true,
                FireState::Closed => unreachable!("polled after cancellation"),
            }
        };
        if !signaled {
            return Poll::Pending;
        }
        self.close();
        Poll::Ready(())
    }

    fn cancel(&mut self) {
        self.close();
    }
}

impl Drop for PosixWait {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::timer_notify;
    use super::FireState;
    use super::PosixInner;
    use super::PosixTimer;
    use super::REGISTRY;
    use crate::testing;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn fires_at_target() {
        testing::fires_at_target(&PosixTimer::new());
    }

    #[test]
    fn cancel_before_fire() {
        testing::cancel_before_fire(&PosixTimer::new());
    }

    #[test]
    fn past_deadline_fires_promptly() {
        testing::past_deadline_fires_promptly(&PosixTimer::new());
    }

    #[test]
    fn concurrent_waits_are_independent() {
        testing::concurrent_waits_are_independent(&PosixTimer::new());
    }

    fn notify(raw: usize) {
        let value = libc::sigval {
            sival_ptr: raw as *mut libc::c_void,
        };
        // SAFETY: the notification entry point only interprets the value as
        // a registry token.
        unsafe { timer_notify(value) }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn sigevent_mirror_matches_native_size() {
        assert_eq!(size_of::<super::SigeventThread>(), super::SIGEVENT_SIZE);
        assert_eq!(size_of::<super::SigeventThread>(), size_of::<libc::sigevent>());
    }

    #[test]
    fn duplicate_notification_is_noop() {
        let inner = Arc::new(PosixInner {
            state: Mutex::new(FireState::Armed(None)),
        });
        let token = REGISTRY.insert(inner.clone());

        notify(token.to_raw());
        assert!(matches!(*inner.state.lock(), FireState::Signaled));

        // Second delivery for the same expiration changes nothing.
        notify(token.to_raw());
        assert!(matches!(*inner.state.lock(), FireState::Signaled));

        REGISTRY.remove(token);
    }

    #[test]
    fn notification_after_teardown_is_swallowed() {
        let inner = Arc::new(PosixInner {
            state: Mutex::new(FireState::Armed(None)),
        });
        let token = REGISTRY.insert(inner.clone());
        REGISTRY.remove(token);

        notify(token.to_raw());
        assert!(matches!(*inner.state.lock(), FireState::Armed(None)));
    }
}
