// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Windows waitable timer backend.
//!
//! A manual-reset waitable timer is armed with an absolute FILETIME due
//! time and its handle is registered with the scheduler's handle-wait
//! driver. The handle stays signaled once due, so a wait registered at any
//! point observes the expiration.

// UNSAFETY: Calls to Win32 timer functions and handling their return
// values.
#![allow(unsafe_code)]

use crate::clock::Timestamp;
use crate::driver::PollHandleWait;
use crate::driver::PollImpl;
use crate::driver::Scheduler;
use crate::error::Error;
use crate::wait::ArmTimer;
use crate::wait::PendingWait;
use crate::wait::PollSleep;
use std::io;
use std::os::windows::prelude::*;
use std::ptr::null;
use std::task::Context;
use std::task::Poll;
use windows_sys::Win32::System::Threading::CreateWaitableTimerW;
use windows_sys::Win32::System::Threading::SetWaitableTimer;

pub(crate) use self::WaitableTimer as PlatformTimer;

/// The waitable timer backend.
#[derive(Debug)]
pub struct WaitableTimer;

impl WaitableTimer {
    pub(crate) fn new() -> Self {
        Self
    }
}

impl ArmTimer for WaitableTimer {
    fn arm(&self, scheduler: &dyn Scheduler, deadline: Timestamp) -> Result<PendingWait, Error> {
        // SAFETY: creating a new, unnamed, uniquely owned timer object.
        let handle = unsafe { CreateWaitableTimerW(null(), 1, null()) };
        if handle.is_null() {
            return Err(Error::ResourceCreation(io::Error::last_os_error()));
        }
        // SAFETY: transferring ownership of the new handle.
        let handle = unsafe { OwnedHandle::from_raw_handle(handle) };

        let due_time = deadline.to_filetime_ticks();
        // SAFETY: calling with an owned handle; the due time outlives the
        // call. No completion routine, so no callback contract to uphold.
        let r = unsafe {
            SetWaitableTimer(handle.as_raw_handle(), &due_time, 0, None, null(), 0)
        };
        if r == 0 {
            return Err(Error::ResourceArm(io::Error::last_os_error()));
        }

        let wait = scheduler
            .new_dyn_handle_wait(handle.as_raw_handle())
            .map_err(Error::ResourceArm)?;

        tracing::trace!(due_time, "armed waitable timer");
        Ok(smallbox::smallbox!(WaitableWait {
            wait: Some(wait),
            handle: Some(handle),
        }))
    }
}

/// An armed waitable timer.
///
/// The wait registration is released before the handle is closed, in
/// `close` and in the derived drop order.
struct WaitableWait {
    wait: Option<PollImpl<dyn PollHandleWait>>,
    handle: Option<OwnedHandle>,
}

impl WaitableWait {
    fn close(&mut self) {
        self.wait = None;
        self.handle = None;
    }
}

impl PollSleep for WaitableWait {
    fn poll_sleep(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some(wait) = &mut self.wait else {
            unreachable!("polled after cancellation")
        };
        match std::task::ready!(wait.poll_handle_wait(cx)) {
            Ok(()) => {}
            Err(err) => {
                // NT waits on a valid timer handle do not fail once
                // registration has succeeded.
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "waitable timer wait failed"
                );
            }
        }
        tracing::trace!("waitable timer fired");
        self.close();
        Poll::Ready(())
    }

    fn cancel(&mut self) {
        self.close();
    }
}
