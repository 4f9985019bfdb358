// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Linux timerfd backend.
//!
//! The deadline is programmed as an absolute one-shot expiration on a
//! `CLOCK_REALTIME` timerfd, and the fd's read readiness is bridged through
//! the scheduler's fd driver. Every transition happens on the scheduler
//! thread, so no shared state or locking is needed.

use super::deadline_timespec;
use super::SyscallResult;
use crate::clock::Timestamp;
use crate::driver::PollFdReady;
use crate::driver::PollImpl;
use crate::driver::Scheduler;
use crate::error::Error;
use crate::wait::ArmTimer;
use crate::wait::PendingWait;
use crate::wait::PollSleep;
use std::fs::File;
use std::io;
use std::os::unix::prelude::*;
use std::task::Context;
use std::task::Poll;

/// The descriptor timer backend.
#[derive(Debug)]
pub struct TimerfdTimer;

impl TimerfdTimer {
    pub(crate) fn new() -> Self {
        Self
    }
}

impl ArmTimer for TimerfdTimer {
    fn arm(&self, scheduler: &dyn Scheduler, deadline: Timestamp) -> Result<PendingWait, Error> {
        let fd = create_timerfd().map_err(Error::ResourceCreation)?;
        program_timerfd(&fd, deadline).map_err(Error::ResourceArm)?;
        let fd_ready = scheduler
            .new_dyn_fd_ready(fd.as_raw_fd())
            .map_err(Error::ResourceArm)?;
        tracing::trace!(fd = fd.as_raw_fd(), "armed timerfd");
        Ok(smallbox::smallbox!(TimerfdWait {
            fd_ready: Some(fd_ready),
            fd: Some(fd),
        }))
    }
}

fn create_timerfd() -> io::Result<File> {
    // SAFETY: timerfd_create returns a new, uniquely owned fd.
    let fd = unsafe {
        libc::timerfd_create(libc::CLOCK_REALTIME, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
            .syscall_result()?
    };
    // SAFETY: transferring ownership of the new fd.
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn program_timerfd(fd: &File, deadline: Timestamp) -> io::Result<()> {
    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: deadline_timespec(deadline),
    };
    // SAFETY: calling with an owned fd and a valid itimerspec.
    unsafe {
        libc::timerfd_settime(fd.as_raw_fd(), libc::TFD_TIMER_ABSTIME, &spec, std::ptr::null_mut())
            .syscall_result()?;
    }
    Ok(())
}

/// An armed timerfd wait.
///
/// The registration is dropped before the fd is closed, in `close` and in
/// the derived drop order.
struct TimerfdWait {
    fd_ready: Option<PollImpl<dyn PollFdReady>>,
    fd: Option<File>,
}

impl TimerfdWait {
    fn close(&mut self) {
        self.fd_ready = None;
        self.fd = None;
    }
}

impl PollSleep for TimerfdWait {
    fn poll_sleep(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let (Some(fd_ready), Some(fd)) = (&mut self.fd_ready, &self.fd) else {
            unreachable!("polled after cancellation")
        };
        loop {
            std::task::ready!(fd_ready.poll_fd_ready(cx));
            fd_ready.clear_fd_ready();

            // Consume the expiration count to confirm the timer really
            // expired.
            //
            // SAFETY: calling with an owned fd and an appropriately sized
            // buffer.
            let mut buf = [0u64; 1];
            let r = unsafe {
                libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), 8).syscall_result()
            };
            match r {
                Ok(_) => break,
                Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => {
                    // The timer has not actually expired, presumably due to
                    // a race. Loop around again.
                }
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "timerfd read failed"
                    );
                    break;
                }
            }
        }
        tracing::trace!("timerfd fired");
        self.close();
        Poll::Ready(())
    }

    fn cancel(&mut self) {
        self.close();
    }
}
