// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types.

use std::convert::Infallible;
use std::io;
use thiserror::Error;

/// An error arming a wall-clock wait.
///
/// All variants are reported synchronously by
/// [`wait_until`](crate::wait_until), before a [`WaitUntil`](crate::WaitUntil)
/// future exists. Once a future has been returned, the only non-success
/// outcome is [`Cancelled`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The native timer object could not be allocated.
    #[error("failed to create native timer")]
    ResourceCreation(#[source] io::Error),
    /// The native timer object exists but the deadline could not be
    /// programmed or registered with the scheduler.
    #[error("failed to arm native timer")]
    ResourceArm(#[source] io::Error),
    /// No timer backend exists for the running OS.
    #[error("no wall-clock timer backend for this platform")]
    UnsupportedPlatform,
    /// The timestamp has no UTC offset and so does not name an unambiguous
    /// instant.
    #[error("timestamp has no UTC offset")]
    NaiveTimestamp,
}

impl From<Infallible> for Error {
    fn from(err: Infallible) -> Self {
        match err {}
    }
}

/// The outcome of a wait that was cancelled before its deadline elapsed.
///
/// This is an expected terminal outcome, not a failure, so it is kept
/// distinct from [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wait cancelled")]
pub struct Cancelled;
