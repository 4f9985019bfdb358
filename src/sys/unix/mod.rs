// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Unix timer backends.

// UNSAFETY: Calls to various libc functions to interact with os-level
// primitives and handling their return values.
#![allow(unsafe_code)]

use crate::clock::Timestamp;
#[cfg(not(target_os = "macos"))]
use std::io;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        // The POSIX timer backend is not selected on Linux, but it runs
        // there, so keep it compiled and covered by the test suite.
        pub mod posix;
        pub mod timerfd;
        pub(crate) use timerfd::TimerfdTimer as PlatformTimer;
    } else if #[cfg(target_os = "macos")] {
        pub mod dispatch;
        pub(crate) use dispatch::DispatchTimer as PlatformTimer;
    } else {
        pub mod posix;
        pub(crate) use posix::PosixTimer as PlatformTimer;
    }
}

/// Trait for mapping a raw syscall return value to an `io::Result`.
#[cfg(not(target_os = "macos"))]
pub(crate) trait SyscallResult: Sized {
    fn syscall_result(self) -> io::Result<Self>;
}

#[cfg(not(target_os = "macos"))]
impl SyscallResult for i32 {
    fn syscall_result(self) -> io::Result<Self> {
        if self == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(self)
        }
    }
}

#[cfg(not(target_os = "macos"))]
impl SyscallResult for isize {
    fn syscall_result(self) -> io::Result<Self> {
        if self == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(self)
        }
    }
}

/// Encodes `deadline` as an absolute `timespec`, clamped so that a past
/// deadline still arms (and promptly fires) the timer.
pub(crate) fn deadline_timespec(deadline: Timestamp) -> libc::timespec {
    let (tv_sec, tv_nsec) = deadline.to_timespec_parts();
    libc::timespec {
        tv_sec: tv_sec as libc::time_t,
        tv_nsec: tv_nsec as _,
    }
}
