//! Detect overlapping guarded calls in asynchronous test APIs.
//!
//! Test APIs that simulate stepped execution (advancing a frame, pumping a queue, draining
//! timers) are rarely safe to run concurrently. If a caller forgets to `.await` one of these
//! calls before starting another, the two interleave and silently corrupt test state. This
//! crate tracks every such "guarded" call as a scope and turns any overlap into an error that
//! names both call sites.
//!
//! # Terminology
//!
//! A [Tracker] owns a stack of open scopes. [Tracker::guard] opens a scope and returns a
//! [Guarded] future that runs the body inside a derived [context::Context]. Any guard-protocol
//! call made from outside the body of the innermost open scope is a _conflict_. A scope that is
//! still open when an enclosing scope closes (or when the test ends) has _leaked_.
//!
//! # Example
//!
//! ```rust
//! use commonware_guard::{Error, Label, Runner};
//!
//! Runner::default().start(|tracker| async move {
//!     let step = tracker
//!         .guard_as(Label::method("Tester", "step"), || async { Ok::<_, Error>(1) })
//!         .unwrap();
//!
//!     // Starting a second step before awaiting the first is a conflict.
//!     let err = tracker
//!         .guard_as(Label::method("Tester", "step"), || async { Ok::<_, Error>(2) })
//!         .err()
//!         .unwrap();
//!     assert!(matches!(err, Error::Conflict(_)));
//!
//!     assert_eq!(step.await.unwrap(), 1);
//! });
//! ```
//!
//! # Status
//!
//! `commonware-guard` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

use thiserror::Error;

pub mod analyzer;
pub use analyzer::{Caller, Label};
mod config;
pub use config::Config;
pub mod context;
pub mod diagnostic;
mod runner;
pub use runner::{reschedule, Runner};
pub mod stack;
mod tracker;
pub use tracker::{Guarded, Tracker};

/// Errors returned when guarded calls overlap.
///
/// Both variants carry the fully composed, multi-line diagnostic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Leak(String),
}

impl Error {
    /// Returns the composed diagnostic.
    pub fn message(&self) -> &str {
        match self {
            Self::Conflict(message) | Self::Leak(message) => message,
        }
    }
}
