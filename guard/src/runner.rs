use crate::{Config, Tracker};
use futures::executor::block_on;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tracing::{debug, error};

/// Runs a single test case against a fresh [Tracker].
///
/// The future returned by the provided closure is driven to completion on the current thread.
/// Once it completes, every scope must be closed: if any guarded call leaked, the runner panics
/// with the composed diagnostic (failing the test).
///
/// # Example
///
/// ```rust
/// use commonware_guard::{Config, Error, Label, Runner};
///
/// let cfg = Config {
///     log_level: None,
///     ..Config::default()
/// };
/// let frames = Runner::new(cfg).start(|tracker| async move {
///     let mut frames = 0;
///     for _ in 0..3 {
///         tracker
///             .guard_as(Label::function("pump"), || async { Ok::<_, Error>(()) })
///             .unwrap()
///             .await
///             .unwrap();
///         frames += 1;
///     }
///     frames
/// });
/// assert_eq!(frames, 3);
/// ```
pub struct Runner {
    cfg: Config,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Runner {
    /// Create a new runner with the given configuration.
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Run `f` to completion and verify that all scopes were closed.
    ///
    /// # Panics
    ///
    /// Panics if any guarded call started by `f` never completed.
    pub fn start<F, Fut>(self, f: F) -> Fut::Output
    where
        F: FnOnce(Tracker) -> Fut,
        Fut: Future,
    {
        // Install a subscriber (if one is not already installed)
        if let Some(level) = self.cfg.log_level {
            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_test_writer()
                .try_init();
        }

        // Run the test case
        let tracker = Tracker::new(self.cfg);
        let output = block_on(f(tracker.clone()));

        // Verify that nothing leaked
        if let Err(err) = tracker.verify_all_scopes_closed() {
            error!("test finished with open scopes");
            panic!("{err}");
        }
        debug!("test finished with all scopes closed");
        output
    }
}

/// Yield the current task back to the executor.
///
/// Useful for suspending a guarded body mid-flight (as a stepped test API would between frames).
/// Mirrors `commonware_runtime::reschedule`.
pub async fn reschedule() {
    struct Reschedule {
        yielded: bool,
    }

    impl Future for Reschedule {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    Reschedule { yielded: false }.await
}
