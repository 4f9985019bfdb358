// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Asynchronous waits for an absolute wall-clock deadline, backed by native
//! one-shot OS timers: timerfd on Linux, dispatch timer sources on macOS,
//! POSIX interval timers on other Unixes, and waitable timers on Windows.
//!
//! The crate does not run an event loop of its own. The caller supplies a
//! single-threaded cooperative scheduler through the [`Scheduler`] trait,
//! and every native completion is bridged back onto it: native callback
//! threads only record the outcome and wake a [`std::task::Waker`], and the
//! outcome is observed exclusively by polling on the scheduler thread.
//!
//! ```no_run
//! # use std::time::{Duration, SystemTime};
//! # async fn example(scheduler: &impl wall_timer::Scheduler) {
//! let deadline = SystemTime::now() + Duration::from_secs(30);
//! wall_timer::wait_until(scheduler, deadline)
//!     .expect("timer setup failed")
//!     .await
//!     .expect("not cancelled");
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod driver;
mod error;
#[cfg(all(unix, not(target_os = "macos")))]
mod registry;
#[cfg(any(unix, windows))]
#[cfg_attr(unix, path = "sys/unix/mod.rs")]
#[cfg_attr(windows, path = "sys/windows/mod.rs")]
mod sys;
#[cfg(test)]
mod testing;
mod wait;

pub use clock::Timestamp;
#[cfg(unix)]
pub use driver::FdReadyDriver;
#[cfg(windows)]
pub use driver::HandleWaitDriver;
#[cfg(unix)]
pub use driver::PollFdReady;
#[cfg(windows)]
pub use driver::PollHandleWait;
pub use driver::PollImpl;
pub use driver::Scheduler;
pub use error::Cancelled;
pub use error::Error;
pub use wait::wait_until;
pub use wait::WaitUntil;
