use crate::{
    analyzer::{Analyzer, Caller, Label},
    context::{Context, Marker},
    diagnostic,
    stack::Stack,
    Config, Error,
};
use futures::{future::CatchUnwind, FutureExt};
use std::{
    any::Any,
    fmt::{self, Display},
    future::Future,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe, Location},
    pin::Pin,
    sync::{Arc, Mutex},
    task::{self, ready, Poll},
};
use tokio::task::futures::TaskLocalFuture;
use tracing::{debug, warn};

/// One in-flight guarded call.
#[derive(Clone)]
struct Scope {
    context: Context,
    stack: Stack,
    label: Option<Label>,
    location: &'static Location<'static>,
}

impl Scope {
    /// Find the caller responsible for opening this scope.
    fn resolve(&self, analyzer: &Analyzer<'_>, notes: &mut Vec<String>) -> Option<Caller> {
        match self.label {
            Some(label) => Some(Caller::labeled(label, self.location)),
            None => analyzer.find(&self.stack, "guard", notes),
        }
    }
}

/// Tracks guarded calls and reports the ones that overlap.
///
/// Cloning is cheap and every clone shares the same stack of scopes. A test API typically holds
/// a clone and calls [Tracker::guard] from each asynchronous operation that must not overlap
/// with another, and [Tracker::guard_sync] from each synchronous operation that must not run
/// while one is pending.
///
/// # Call sites
///
/// Diagnostics name the code that _called the test API_, not the test API itself. Without a
/// [Label], the call site is recovered from a backtrace (which requires debug information).
/// With a label, the name comes from the label and the location from [Location::caller], so
/// test APIs using the `_as` variants should be marked `#[track_caller]`.
#[derive(Clone)]
pub struct Tracker {
    marker: Marker,
    cfg: Arc<Config>,
    scopes: Arc<Mutex<Vec<Scope>>>,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("marker", &self.marker)
            .field("depth", &self.depth())
            .finish()
    }
}

impl Tracker {
    /// Create a tracker with no open scopes.
    pub fn new(cfg: Config) -> Self {
        Self {
            marker: Marker::unique(),
            cfg: Arc::new(cfg),
            scopes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns the number of open scopes.
    pub fn depth(&self) -> usize {
        self.scopes.lock().unwrap().len()
    }

    /// Forget all open scopes.
    ///
    /// Intended for harnesses that reuse a tracker across independent test cases. Any
    /// [Guarded] call still pending from a previous case must not be polled afterwards.
    pub fn reset(&self) {
        let mut scopes = self.scopes.lock().unwrap();
        if !scopes.is_empty() {
            debug!(open = scopes.len(), "discarding open scopes");
        }
        scopes.clear();
    }

    /// Open a scope and return a future that runs the body built by `body` inside it.
    ///
    /// The scope is opened immediately (not when the returned future is first polled), so a
    /// second guarded call made before this one completes is detected even if neither has been
    /// polled yet. `body` is called once the scope is open, inside the scope's context, so a
    /// body built directly from another guarded call (`tracker.guard(|| api.pump())`) nests.
    ///
    /// # Errors
    ///
    /// Returns [Error::Conflict] (without calling `body`) if another guarded call is pending and
    /// this call is not nested inside it. Awaiting the returned future yields the body's result,
    /// or [Error::Leak] (converted into `E`) if a guarded call started inside the body had not
    /// completed when the body did.
    #[track_caller]
    pub fn guard<B, F, T, E>(&self, body: B) -> Result<Guarded<F>, Error>
    where
        B: FnOnce() -> F,
        F: Future<Output = Result<T, E>>,
        E: From<Error> + Display,
    {
        self.enter(None, Location::caller(), body)
    }

    /// Like [Tracker::guard], but describes the call with an explicit `label`.
    #[track_caller]
    pub fn guard_as<B, F, T, E>(&self, label: Label, body: B) -> Result<Guarded<F>, Error>
    where
        B: FnOnce() -> F,
        F: Future<Output = Result<T, E>>,
        E: From<Error> + Display,
    {
        self.enter(Some(label), Location::caller(), body)
    }

    /// Verify that no guarded call is pending, unless the caller is running inside the body of
    /// the innermost one.
    ///
    /// # Errors
    ///
    /// Returns [Error::Conflict] describing both the pending call and this one.
    #[track_caller]
    pub fn guard_sync(&self) -> Result<(), Error> {
        self.check("guard_sync", None, Location::caller())
    }

    /// Like [Tracker::guard_sync], but describes the call with an explicit `label`.
    #[track_caller]
    pub fn guard_sync_as(&self, label: Label) -> Result<(), Error> {
        self.check("guard_sync", Some(label), Location::caller())
    }

    /// Verify that every guarded call has completed.
    ///
    /// Call once at the end of each test case (see [crate::Runner]).
    ///
    /// # Errors
    ///
    /// Returns [Error::Leak] listing every open scope in the order it was opened.
    pub fn verify_all_scopes_closed(&self) -> Result<(), Error> {
        let scopes = self.scopes.lock().unwrap().clone();
        if scopes.is_empty() {
            return Ok(());
        }
        warn!(open = scopes.len(), "guarded calls never completed");
        Err(Error::Leak(self.leak_report(&scopes, None)))
    }

    fn enter<B, F, T, E>(
        &self,
        label: Option<Label>,
        location: &'static Location<'static>,
        body: B,
    ) -> Result<Guarded<F>, Error>
    where
        B: FnOnce() -> F,
        F: Future<Output = Result<T, E>>,
        E: From<Error> + Display,
    {
        self.check("guard", label, location)?;

        // Open the scope
        let context = Context::current().child(Some(self.marker));
        let scope = Scope {
            context: context.clone(),
            stack: Stack::capture(),
            label,
            location,
        };
        let depth = {
            let mut scopes = self.scopes.lock().unwrap();
            scopes.push(scope);
            scopes.len()
        };
        debug!(depth, ?label, "opened scope");

        // Build the body inside the scope's context (closing the scope if that panics)
        let body = match catch_unwind(AssertUnwindSafe(|| context.enter(body))) {
            Ok(body) => body,
            Err(panic) => {
                self.close(&context);
                resume_unwind(panic);
            }
        };

        // Run the body inside the scope's context
        let body = Box::pin(context.run(AssertUnwindSafe(body).catch_unwind()));
        Ok(Guarded {
            tracker: self.clone(),
            context,
            body,
            settled: false,
        })
    }

    fn check(
        &self,
        operation: &'static str,
        label: Option<Label>,
        location: &'static Location<'static>,
    ) -> Result<(), Error> {
        let (original, depth) = {
            let scopes = self.scopes.lock().unwrap();
            let Some(last) = scopes.last() else {
                return Ok(());
            };

            // Nested calls are always allowed
            let owner = Context::current().owner(self.marker);
            if owner.as_ref() == Some(&last.context) {
                return Ok(());
            }

            // The call overlaps the first scope opened after the one it is running in (or the
            // oldest scope if it is not running in any)
            let position = owner
                .and_then(|owner| scopes.iter().rposition(|scope| scope.context == owner))
                .map_or(0, |position| position + 1);
            (scopes[position].clone(), scopes.len())
        };
        warn!(depth, operation, "guarded call conflict");

        // Resolve both call sites
        let analyzer = Analyzer::new(&self.cfg.internal, &self.cfg.elided);
        let mut lines = vec![diagnostic::CONFLICT.to_string()];
        let first = original.resolve(&analyzer, &mut lines);
        let second = match label {
            Some(label) => Some(Caller::labeled(label, location)),
            None => analyzer.find(&Stack::capture(), operation, &mut lines),
        };
        if let (Some(first), Some(second)) = (first, second) {
            let stack = original.stack.filtered(&self.cfg.noise());
            lines.extend(diagnostic::conflict(
                &first,
                &second,
                &stack,
                &self.cfg.sync_checks,
            ));
        }
        Err(Error::Conflict(diagnostic::render(&lines)))
    }

    /// Close the scope running in `context`, returning any scopes (in the order they were
    /// opened) that were still open above it.
    fn close(&self, context: &Context) -> Vec<Scope> {
        let mut scopes = self.scopes.lock().unwrap();
        assert!(!scopes.is_empty(), "no scope is open");
        assert!(
            scopes.iter().any(|scope| &scope.context == context),
            "scope is not open"
        );
        let mut leaked = Vec::new();
        while let Some(scope) = scopes.pop() {
            if &scope.context == context {
                break;
            }
            leaked.push(scope);
        }
        leaked.reverse();
        debug!(depth = scopes.len(), leaked = leaked.len(), "closed scope");
        leaked
    }

    /// Handle the outcome of a guarded body.
    fn complete<T, E>(
        &self,
        context: &Context,
        outcome: Result<Result<T, E>, Box<dyn Any + Send>>,
    ) -> Result<T, E>
    where
        E: From<Error> + Display,
    {
        let leaked = self.close(context);
        if leaked.is_empty() {
            return match outcome {
                Ok(result) => result,
                Err(panic) => resume_unwind(panic),
            };
        }
        warn!(leaked = leaked.len(), "guarded calls leaked");

        // Report the leak (and whatever may have caused it)
        let cause = match &outcome {
            Ok(Ok(_)) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(panic) => Some(extract_panic_message(&**panic)),
        };
        Err(E::from(Error::Leak(
            self.leak_report(&leaked, cause.as_deref()),
        )))
    }

    fn leak_report(&self, scopes: &[Scope], cause: Option<&str>) -> String {
        let analyzer = Analyzer::new(&self.cfg.internal, &self.cfg.elided);
        let mut lines = vec![diagnostic::LEAK.to_string()];
        for scope in scopes {
            if let Some(caller) = scope.resolve(&analyzer, &mut lines) {
                lines.push(diagnostic::leaked(&caller));
            }
        }
        if let Some(cause) = cause {
            lines.extend(diagnostic::cause(cause));
        }
        diagnostic::render(&lines)
    }
}

/// Same extraction `commonware_runtime` applies to panicking tasks.
fn extract_panic_message(err: &(dyn Any + Send)) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        format!("{err:?}")
    }
}

/// A guarded call returned by [Tracker::guard].
///
/// The scope it belongs to is already open. It closes when the body settles (returns a value,
/// an error, or panics). Dropping a `Guarded` before it settles leaves its scope open, which is
/// then reported as a leak.
#[must_use = "guarded calls must be awaited"]
pub struct Guarded<F: Future> {
    tracker: Tracker,
    context: Context,
    body: Pin<Box<TaskLocalFuture<Context, CatchUnwind<AssertUnwindSafe<F>>>>>,
    settled: bool,
}

impl<F, T, E> Future for Guarded<F>
where
    F: Future<Output = Result<T, E>>,
    E: From<Error> + Display,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        assert!(!this.settled, "guarded call polled after completion");
        let outcome = ready!(this.body.as_mut().poll(cx));
        this.settled = true;
        Poll::Ready(this.tracker.complete(&this.context, outcome))
    }
}

impl<F: Future> Drop for Guarded<F> {
    fn drop(&mut self) {
        if !self.settled {
            debug!("guarded call dropped before completion");
        }
    }
}
