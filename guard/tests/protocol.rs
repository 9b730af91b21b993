//! Drive a mock stepped test API through the guard protocol.

use commonware_guard::{diagnostic, reschedule, Config, Error, Guarded, Label, Runner, Tracker};
use futures::{executor::block_on, future::join, poll};
use std::{
    future::Future,
    sync::{Arc, Mutex},
};

/// A test API that advances a simulated clock one frame at a time.
#[derive(Clone)]
struct Tester {
    tracker: Tracker,
    frames: Arc<Mutex<u64>>,
}

impl Tester {
    fn new(tracker: Tracker) -> Self {
        Self {
            tracker,
            frames: Arc::new(Mutex::new(0)),
        }
    }

    fn frames(&self) -> u64 {
        *self.frames.lock().unwrap()
    }

    /// Advance `n` frames.
    #[track_caller]
    fn pump(&self, n: u64) -> Result<Guarded<impl Future<Output = Result<u64, Error>>>, Error> {
        let frames = self.frames.clone();
        self.tracker
            .guard_as(Label::method("Tester", "pump"), move || async move {
                for _ in 0..n {
                    reschedule().await;
                    *frames.lock().unwrap() += 1;
                }
                Ok(*frames.lock().unwrap())
            })
    }

    /// Advance one frame at a time until `n` frames have elapsed.
    #[track_caller]
    fn settle(&self, n: u64) -> Result<Guarded<impl Future<Output = Result<u64, Error>>>, Error> {
        let this = self.clone();
        self.tracker
            .guard_as(Label::method("Tester", "settle"), move || async move {
                while this.frames() < n {
                    this.pump(1)?.await?;
                    expect(&this, this.frames())?;
                }
                Ok(this.frames())
            })
    }

    /// Start a pump without waiting for it (a broken test API).
    #[track_caller]
    fn tap(&self) -> Result<Guarded<impl Future<Output = Result<(), Error>>>, Error> {
        let this = self.clone();
        self.tracker
            .guard_as(Label::method("Tester", "tap"), move || async move {
                let _forgotten = this.pump(1)?;
                Ok(())
            })
    }

    /// Advance one frame (call site recovered from a backtrace).
    #[inline(never)]
    fn drag(&self) -> Result<Guarded<impl Future<Output = Result<(), Error>>>, Error> {
        let frames = self.frames.clone();
        self.tracker.guard(move || async move {
            reschedule().await;
            *frames.lock().unwrap() += 1;
            Ok(())
        })
    }
}

/// Check the number of elapsed frames.
#[track_caller]
fn expect(tester: &Tester, frames: u64) -> Result<(), Error> {
    tester.tracker.guard_sync_as(Label::function("expect"))?;
    assert_eq!(tester.frames(), frames);
    Ok(())
}

/// Check the number of elapsed frames (call site recovered from a backtrace).
#[inline(never)]
fn verify(tester: &Tester) -> Result<(), Error> {
    tester.tracker.guard_sync()
}

fn quiet() -> Config {
    Config {
        log_level: None,
        ..Config::default()
    }
}

#[test]
fn test_awaited_calls_pass() {
    let frames = Runner::default().start(|tracker| async move {
        let tester = Tester::new(tracker);
        tester.pump(3).unwrap().await.unwrap();
        expect(&tester, 3).unwrap();
        tester.settle(6).unwrap().await.unwrap();
        expect(&tester, 6).unwrap();
        tester.frames()
    });
    assert_eq!(frames, 6);
}

#[test]
fn test_guarded_call_used_as_body() {
    let frames = Runner::new(quiet()).start(|tracker| async move {
        let tester = Tester::new(tracker.clone());
        let wrapped = tracker
            .guard_as(Label::method("Tester", "settle"), || tester.pump(2).unwrap())
            .unwrap();
        assert_eq!(tracker.depth(), 2);
        wrapped.await.unwrap()
    });
    assert_eq!(frames, 2);
}

#[test]
fn test_conflicting_methods() {
    Runner::new(quiet()).start(|tracker| async move {
        let tester = Tester::new(tracker);
        let (first, first_line) = (tester.pump(2).unwrap(), line!());
        let (second, second_line) = (tester.settle(4), line!());
        let err = second.err().unwrap();
        let lines: Vec<&str> = err.message().lines().collect();
        assert_eq!(lines[0], diagnostic::CONFLICT);
        assert_eq!(
            lines[1],
            format!(
                "The guarded method \"pump\" from class Tester was called from {} on line {first_line}.",
                file!()
            )
        );
        assert_eq!(
            lines[2],
            format!(
                "Then, the \"settle\" method (also from class Tester) was called from {} on line {second_line}.",
                file!()
            )
        );
        assert!(lines[3].starts_with(
            "The first method (Tester.pump) had not yet finished executing at the time that the second method (Tester.settle) was called."
        ));
        assert_eq!(lines[4], "");
        assert_eq!(
            lines[5],
            "When the first pump method was called, this was the stack:"
        );
        first.await.unwrap();
    });
}

#[test]
fn test_sync_check_while_pending() {
    Runner::new(quiet()).start(|tracker| async move {
        let tester = Tester::new(tracker);
        let mut pending = Box::pin(tester.pump(1).unwrap());
        assert!(poll!(pending.as_mut()).is_pending());

        let (result, line) = (expect(&tester, 0), line!());
        let err = result.unwrap_err();
        let lines: Vec<&str> = err.message().lines().collect();
        assert_eq!(
            lines[2],
            format!(
                "Then, the \"expect\" function was called from {} on line {line}.",
                file!()
            )
        );
        assert!(lines[4].ends_with("then consider using expect_sync() instead."));

        // Once the pump completes, checks pass again
        assert_eq!(pending.await.unwrap(), 1);
        expect(&tester, 1).unwrap();
    });
}

#[test]
fn test_concurrent_chains_conflict() {
    Runner::new(quiet()).start(|tracker| async move {
        let tester = Tester::new(tracker);
        let observer = {
            let tester = tester.clone();
            async move {
                reschedule().await;
                expect(&tester, 1)
            }
        };
        let (pumped, observed) = join(tester.pump(2).unwrap(), observer).await;
        assert_eq!(pumped.unwrap(), 2);
        assert!(matches!(observed, Err(Error::Conflict(_))));
    });
}

#[test]
fn test_leak_reported_when_parent_completes() {
    Runner::new(quiet()).start(|tracker| async move {
        let tester = Tester::new(tracker.clone());
        let err = tester.tap().unwrap().await.unwrap_err();
        assert!(matches!(err, Error::Leak(_)));
        let lines: Vec<&str> = err.message().lines().collect();
        assert_eq!(lines[0], diagnostic::LEAK);
        assert!(lines[1].starts_with("The guarded method \"pump\" from class Tester was called from"));
        assert!(lines[1].ends_with("but never completed before its parent scope closed."));
        assert_eq!(tracker.depth(), 0);
    });
}

#[test]
#[should_panic(expected = "The guarded method \"pump\" from class Tester was called from")]
fn test_leak_reported_when_test_ends() {
    Runner::new(quiet()).start(|tracker| async move {
        let tester = Tester::new(tracker);
        let _forgotten = tester.pump(1).unwrap();
    });
}

#[test]
fn test_unlabelled_conflict_names_call_sites() {
    let tester = Tester::new(Tracker::new(quiet()));
    let first = tester.drag().unwrap();
    let err = tester.drag().err().unwrap();
    let message = err.message();
    assert!(
        message.contains("The guarded method \"drag\" from class Tester was called from"),
        "{message}"
    );
    assert!(message.contains("Then, it was called from"), "{message}");
    assert!(message.contains("protocol.rs on line"), "{message}");
    assert!(
        message.contains("When the first drag method was called, this was the stack:"),
        "{message}"
    );
    assert!(
        message.contains("test_unlabelled_conflict_names_call_sites"),
        "{message}"
    );
    block_on(first).unwrap();
}

#[test]
fn test_unlabelled_sync_check() {
    let tester = Tester::new(Tracker::new(quiet()));
    let first = tester.drag().unwrap();
    let err = verify(&tester).unwrap_err();
    let message = err.message();
    assert!(
        message.contains("Then, the \"verify\" function was called from"),
        "{message}"
    );
    assert!(!message.contains("verify_sync()"), "{message}");
    block_on(first).unwrap();
    verify(&tester).unwrap();
}

#[test]
fn test_unlabelled_leak() {
    let tracker = Tracker::new(quiet());
    let tester = Tester::new(tracker.clone());
    let pending = tester.drag().unwrap();
    let err = tracker.verify_all_scopes_closed().unwrap_err();
    let message = err.message();
    assert!(message.starts_with(diagnostic::LEAK), "{message}");
    assert!(
        message.contains("The guarded method \"drag\" from class Tester was called from"),
        "{message}"
    );
    block_on(pending).unwrap();
    tracker.verify_all_scopes_closed().unwrap();
}
