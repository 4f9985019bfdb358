// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scheduler collaborator traits.
//!
//! The crate never runs its own event loop. The caller's single-threaded
//! cooperative scheduler is consumed through [`Scheduler`], an object-safe
//! trait blanket-implemented for anything carrying the per-capability traits
//! ([`FdReadyDriver`] on Unix, [`HandleWaitDriver`] on Windows). Foreign
//! threads reach the scheduler thread only through the [`std::task::Waker`]
//! stored at poll time.

use smallbox::space::S4;
use smallbox::SmallBox;
use std::io;
#[cfg(unix)]
use std::os::unix::prelude::*;
#[cfg(windows)]
use std::os::windows::prelude::*;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

/// A generic `Box`-like container of one of the polled types.
pub type PollImpl<T> = SmallBox<T, S4>;

/// A scheduler that supports the polled waits this crate needs.
pub trait Scheduler: 'static + Send + Sync {
    /// Returns a new object for polling read readiness of a file descriptor.
    #[cfg(unix)]
    fn new_dyn_fd_ready(&self, fd: RawFd) -> io::Result<PollImpl<dyn PollFdReady>>;

    /// Returns a new object for polling a kernel handle becoming signaled.
    #[cfg(windows)]
    fn new_dyn_handle_wait(&self, handle: RawHandle) -> io::Result<PollImpl<dyn PollHandleWait>>;
}

/// A scheduler capability for polling file descriptor read readiness.
#[cfg(unix)]
pub trait FdReadyDriver: Unpin {
    /// The fd readiness type.
    type FdReady: 'static + PollFdReady;

    /// Returns a new object for polling read readiness of `fd`.
    ///
    /// The fd must remain valid until the returned object is dropped;
    /// dropping it deregisters the fd.
    fn new_fd_ready(&self, fd: RawFd) -> io::Result<Self::FdReady>;
}

/// An object for polling file descriptor read readiness.
#[cfg(unix)]
pub trait PollFdReady: Unpin + Send + Sync {
    /// Polls the fd for read readiness.
    fn poll_fd_ready(&mut self, cx: &mut Context<'_>) -> Poll<()>;

    /// Clears cached readiness so that the next
    /// [`poll_fd_ready`](Self::poll_fd_ready) waits for a fresh signal.
    fn clear_fd_ready(&mut self);
}

/// A scheduler capability for waiting on kernel handles.
#[cfg(windows)]
pub trait HandleWaitDriver: Unpin {
    /// The handle wait type.
    type HandleWait: 'static + PollHandleWait;

    /// Returns a new object for waiting for `handle` to be signaled.
    ///
    /// The handle must remain valid until the returned object is dropped;
    /// dropping it cancels the wait.
    fn new_handle_wait(&self, handle: RawHandle) -> io::Result<Self::HandleWait>;
}

/// An object for polling a kernel handle becoming signaled.
#[cfg(windows)]
pub trait PollHandleWait: Unpin + Send + Sync {
    /// Polls for the handle to be signaled.
    fn poll_handle_wait(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

#[cfg(unix)]
impl<T> Scheduler for T
where
    T: 'static + Send + Sync + FdReadyDriver,
{
    fn new_dyn_fd_ready(&self, fd: RawFd) -> io::Result<PollImpl<dyn PollFdReady>> {
        Ok(smallbox::smallbox!(self.new_fd_ready(fd)?))
    }
}

#[cfg(windows)]
impl<T> Scheduler for T
where
    T: 'static + Send + Sync + HandleWaitDriver,
{
    fn new_dyn_handle_wait(&self, handle: RawHandle) -> io::Result<PollImpl<dyn PollHandleWait>> {
        Ok(smallbox::smallbox!(self.new_handle_wait(handle)?))
    }
}

#[cfg(unix)]
impl Scheduler for Box<dyn Scheduler> {
    fn new_dyn_fd_ready(&self, fd: RawFd) -> io::Result<PollImpl<dyn PollFdReady>> {
        self.as_ref().new_dyn_fd_ready(fd)
    }
}

#[cfg(windows)]
impl Scheduler for Box<dyn Scheduler> {
    fn new_dyn_handle_wait(&self, handle: RawHandle) -> io::Result<PollImpl<dyn PollHandleWait>> {
        self.as_ref().new_dyn_handle_wait(handle)
    }
}

#[cfg(unix)]
impl Scheduler for Arc<dyn Scheduler> {
    fn new_dyn_fd_ready(&self, fd: RawFd) -> io::Result<PollImpl<dyn PollFdReady>> {
        self.as_ref().new_dyn_fd_ready(fd)
    }
}

#[cfg(windows)]
impl Scheduler for Arc<dyn Scheduler> {
    fn new_dyn_handle_wait(&self, handle: RawHandle) -> io::Result<PollImpl<dyn PollHandleWait>> {
        self.as_ref().new_dyn_handle_wait(handle)
    }
}
