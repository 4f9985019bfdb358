// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared backend test scenarios, plus a minimal thread-backed scheduler
//! implementing the collaborator traits: a helper thread blocks on the
//! native object and posts back to the polling thread through the stored
//! waker.

// UNSAFETY: Blocking syscalls on the watched fd or handle from the helper
// thread.
#![allow(unsafe_code)]

use crate::clock::Timestamp;
use crate::error::Cancelled;
use crate::wait::ArmTimer;
use crate::wait::WaitUntil;
use futures::executor::block_on;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

/// A scheduler that services each registration with a dedicated watcher
/// thread.
pub(crate) struct ThreadScheduler;

struct WatchState {
    signaled: bool,
    stop: bool,
    waker: Option<Waker>,
}

impl WatchState {
    fn new() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            signaled: false,
            stop: false,
            waker: None,
        }))
    }

    fn signal(state: &Mutex<Self>) {
        let waker = {
            let mut state = state.lock();
            state.signaled = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

struct Watcher {
    state: Arc<Mutex<WatchState>>,
    thread: Option<JoinHandle<()>>,
}

impl Watcher {
    fn poll_signaled(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.state.lock();
        if state.signaled {
            Poll::Ready(())
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.state.lock().stop = true;
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

#[cfg(unix)]
mod sys {
    use super::ThreadScheduler;
    use super::WatchState;
    use super::Watcher;
    use crate::driver::FdReadyDriver;
    use crate::driver::PollFdReady;
    use std::io;
    use std::os::unix::prelude::*;
    use std::task::Context;
    use std::task::Poll;

    pub struct ThreadFdReady(Watcher);

    impl FdReadyDriver for ThreadScheduler {
        type FdReady = ThreadFdReady;

        fn new_fd_ready(&self, fd: RawFd) -> io::Result<Self::FdReady> {
            let state = WatchState::new();
            let thread = std::thread::spawn({
                let state = state.clone();
                move || loop {
                    if state.lock().stop {
                        break;
                    }
                    let mut pollfd = libc::pollfd {
                        fd,
                        events: libc::POLLIN,
                        revents: 0,
                    };
                    // SAFETY: polling a single valid pollfd; the fd outlives
                    // this thread by the registration drop contract.
                    let r = unsafe { libc::poll(&mut pollfd, 1, 20) };
                    if r > 0 && pollfd.revents & libc::POLLIN != 0 {
                        WatchState::signal(&state);
                        break;
                    }
                }
            });
            Ok(ThreadFdReady(Watcher {
                state,
                thread: Some(thread),
            }))
        }
    }

    impl PollFdReady for ThreadFdReady {
        fn poll_fd_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
            self.0.poll_signaled(cx)
        }

        fn clear_fd_ready(&mut self) {
            self.0.state.lock().signaled = false;
        }
    }
}

#[cfg(windows)]
mod sys {
    use super::ThreadScheduler;
    use super::WatchState;
    use super::Watcher;
    use crate::driver::HandleWaitDriver;
    use crate::driver::PollHandleWait;
    use std::io;
    use std::os::windows::prelude::*;
    use std::task::Context;
    use std::task::Poll;
    use windows_sys::Win32::Foundation::WAIT_OBJECT_0;
    use windows_sys::Win32::System::Threading::WaitForSingleObject;

    pub struct ThreadHandleWait(Watcher);

    impl HandleWaitDriver for ThreadScheduler {
        type HandleWait = ThreadHandleWait;

        fn new_handle_wait(&self, handle: RawHandle) -> io::Result<Self::HandleWait> {
            let state = WatchState::new();
            let handle = handle as usize;
            let thread = std::thread::spawn({
                let state = state.clone();
                move || loop {
                    if state.lock().stop {
                        break;
                    }
                    // SAFETY: waiting on a handle that outlives this thread
                    // by the registration drop contract.
                    let r = unsafe { WaitForSingleObject(handle as RawHandle, 20) };
                    if r == WAIT_OBJECT_0 {
                        WatchState::signal(&state);
                        break;
                    }
                }
            });
            Ok(ThreadHandleWait(Watcher {
                state,
                thread: Some(thread),
            }))
        }
    }

    impl PollHandleWait for ThreadHandleWait {
        fn poll_handle_wait(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.0.poll_signaled(cx).map(Ok)
        }
    }
}

fn arm(backend: &dyn ArmTimer, deadline: Timestamp) -> WaitUntil {
    WaitUntil::arm(backend, &ThreadScheduler, deadline).unwrap()
}

/// A wait on now + 100 ms completes inside the [100 ms, 350 ms) window.
pub(crate) fn fires_at_target(backend: &dyn ArmTimer) {
    let start = Instant::now();
    let wait = arm(backend, Timestamp::now() + Duration::from_millis(100));
    block_on(wait).unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(100), "woke early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(350), "woke late: {elapsed:?}");
}

/// Cancelling an armed wait yields `Cancelled` promptly, not success.
pub(crate) fn cancel_before_fire(backend: &dyn ArmTimer) {
    let mut wait = arm(backend, Timestamp::now() + Duration::from_secs(5));
    let start = Instant::now();
    wait.cancel();
    assert_eq!(block_on(wait), Err(Cancelled));
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_millis(50), "cancel stalled: {elapsed:?}");
}

/// A deadline already in the past completes promptly with success.
pub(crate) fn past_deadline_fires_promptly(backend: &dyn ArmTimer) {
    let start = Instant::now();
    let wait = arm(backend, Timestamp::now() - Duration::from_secs(1));
    block_on(wait).unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_millis(50), "past deadline stalled: {elapsed:?}");
}

/// Two waits with different deadlines resolve independently and in deadline
/// order.
pub(crate) fn concurrent_waits_are_independent(backend: &dyn ArmTimer) {
    let start = Instant::now();
    let now = Timestamp::now();
    let first = arm(backend, now + Duration::from_millis(100));
    let second = arm(backend, now + Duration::from_millis(220));

    let order = RefCell::new(Vec::new());
    block_on(async {
        futures::join!(
            async {
                second.await.unwrap();
                order.borrow_mut().push(2);
            },
            async {
                first.await.unwrap();
                order.borrow_mut().push(1);
            },
        );
    });
    assert_eq!(*order.borrow(), [1, 2]);

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(220), "woke early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "woke late: {elapsed:?}");
}
