//! Compose the messages carried by [crate::Error].
//!
//! Messages are built as a list of lines. The analyzer appends its notes to the same list, so a
//! message that could not be fully resolved still reads top to bottom in the order the problems
//! were found. [render] joins the lines and trims trailing whitespace.

use crate::analyzer::Caller;

/// First line of every conflict message.
pub const CONFLICT: &str =
    "Guarded function conflict. You must use \"await\" with all Future-returning test APIs.";

/// First line of every leak message.
pub const LEAK: &str = "Asynchronous call to guarded function leaked. You must use \"await\" with all Future-returning test APIs.";

/// Describe a conflict between the `original` guarded call and the `colliding` call made
/// before it completed.
///
/// `stack` is the (already filtered) stack captured when `original` was entered. If the
/// colliding call is a free function listed in `sync_checks`, a hint pointing at its `_sync`
/// variant follows the explanation.
pub fn conflict<S: AsRef<str>>(
    original: &Caller,
    colliding: &Caller,
    stack: &str,
    sync_checks: &[S],
) -> Vec<String> {
    let mut lines = Vec::new();
    let original_kind = original.kind();
    let colliding_kind = colliding.kind();

    // Where the first call came from
    lines.push(match &original.class {
        Some(class) => format!(
            "The guarded method \"{}\" from class {class} was called from {} on line {}.",
            original.method, original.file, original.line
        ),
        None => format!(
            "The guarded \"{}\" function was called from {} on line {}.",
            original.method, original.file, original.line
        ),
    });

    // Where the second call came from
    let again = if original.same_site(colliding) {
        "again "
    } else {
        ""
    };
    lines.push(if original.same_operation(colliding) {
        format!(
            "Then, it was called {again}from {} on line {}.",
            colliding.file, colliding.line
        )
    } else {
        match &colliding.class {
            None => format!(
                "Then, the \"{}\" function was called {again}from {} on line {}.",
                colliding.method, colliding.file, colliding.line
            ),
            Some(class) => {
                let from = if original.class == colliding.class {
                    format!("(also from class {class})")
                } else {
                    format!("from class {class}")
                };
                format!(
                    "Then, the \"{}\" method {from} was called {again}from {} on line {}.",
                    colliding.method, colliding.file, colliding.line
                )
            }
        }
    });

    // How to fix it
    let (first, second) = if original.same_operation(colliding) {
        (String::new(), String::new())
    } else {
        (qualified(original), qualified(colliding))
    };
    lines.push(format!(
        "The first {original_kind}{first} had not yet finished executing at the time that the \
         second {colliding_kind}{second} was called. Since both are guarded, and the second was \
         not a nested call inside the first, the first must complete its execution before the \
         second can be called. Typically, this is achieved by putting an \"await\" statement in \
         front of the call to the first."
    ));
    let sync_check = colliding.class.is_none()
        && sync_checks.iter().any(|name| {
            let name: &str = name.as_ref();
            name == colliding.method
        });
    if sync_check {
        lines.push(format!(
            "If you are confident that all test APIs are being called using \"await\", and this \
             {name}() call is not being called at the top level but is itself being called from \
             some sort of callback registered before the {} {original_kind} was called, then \
             consider using {name}_sync() instead.",
            original.method,
            name = colliding.method,
        ));
    }

    // Where the first call was entered
    lines.push(String::new());
    lines.push(format!(
        "When the first {} {original_kind} was called, this was the stack:",
        original.method
    ));
    lines.push(stack.trim_end().to_string());
    lines
}

/// Name a caller as ` (Type.method)` (or ` (function)`).
fn qualified(caller: &Caller) -> String {
    match &caller.class {
        Some(class) => format!(" ({class}.{})", caller.method),
        None => format!(" ({})", caller.method),
    }
}

/// Describe a scope that was still open when it should have been closed.
pub fn leaked(caller: &Caller) -> String {
    let from = caller
        .class
        .as_ref()
        .map(|class| format!("from class {class} "))
        .unwrap_or_default();
    format!(
        "The guarded method \"{}\" {from}was called from {} on line {}, but never completed before its parent scope closed.",
        caller.method, caller.file, caller.line
    )
}

/// Describe the failure of the body whose completion uncovered a leak.
pub fn cause(error: &str) -> Vec<String> {
    vec![
        String::new(),
        "An uncaught error may have caused the guarded function leak. The error was:".into(),
        error.trim_end().to_string(),
    ]
}

/// Join `lines` into the final message.
pub fn render<S: AsRef<str>>(lines: &[S]) -> String {
    let lines: Vec<&str> = lines.iter().map(|line| line.as_ref()).collect();
    lines.join("\n").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller(class: Option<&str>, method: &str, line: u32) -> Caller {
        Caller {
            class: class.map(String::from),
            method: method.into(),
            file: "tests/protocol.rs".into(),
            line,
        }
    }

    const STACK: &str = "   3: protocol::test_pump\n             at tests/protocol.rs:10:5\n\n";

    #[test]
    fn test_conflict_same_class() {
        let lines = conflict(
            &caller(Some("X"), "A", 10),
            &caller(Some("X"), "B", 11),
            STACK,
            &["expect"],
        );
        assert_eq!(
            lines[0],
            "The guarded method \"A\" from class X was called from tests/protocol.rs on line 10."
        );
        assert_eq!(
            lines[1],
            "Then, the \"B\" method (also from class X) was called from tests/protocol.rs on line 11."
        );
        assert!(lines[2].starts_with(
            "The first method (X.A) had not yet finished executing at the time that the second method (X.B) was called."
        ));
        assert!(lines[2].ends_with(
            "Typically, this is achieved by putting an \"await\" statement in front of the call to the first."
        ));
        assert_eq!(lines[3], "");
        assert_eq!(lines[4], "When the first A method was called, this was the stack:");
        assert_eq!(
            lines[5],
            "   3: protocol::test_pump\n             at tests/protocol.rs:10:5"
        );
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn test_conflict_other_class() {
        let lines = conflict(
            &caller(Some("X"), "A", 10),
            &caller(Some("Y"), "B", 11),
            STACK,
            &["expect"],
        );
        assert_eq!(
            lines[1],
            "Then, the \"B\" method from class Y was called from tests/protocol.rs on line 11."
        );
    }

    #[test]
    fn test_conflict_same_operation() {
        let lines = conflict(
            &caller(Some("X"), "A", 10),
            &caller(Some("X"), "A", 12),
            STACK,
            &["expect"],
        );
        assert_eq!(
            lines[1],
            "Then, it was called from tests/protocol.rs on line 12."
        );
        assert!(lines[2].starts_with(
            "The first method had not yet finished executing at the time that the second method was called."
        ));
    }

    #[test]
    fn test_conflict_same_site() {
        let lines = conflict(
            &caller(Some("X"), "A", 10),
            &caller(Some("X"), "A", 10),
            STACK,
            &["expect"],
        );
        assert_eq!(
            lines[1],
            "Then, it was called again from tests/protocol.rs on line 10."
        );

        let lines = conflict(
            &caller(None, "pump", 10),
            &caller(None, "step", 10),
            STACK,
            &["expect"],
        );
        assert_eq!(
            lines[0],
            "The guarded \"pump\" function was called from tests/protocol.rs on line 10."
        );
        assert_eq!(
            lines[1],
            "Then, the \"step\" function was called again from tests/protocol.rs on line 10."
        );
        assert!(lines[2].starts_with(
            "The first function (pump) had not yet finished executing at the time that the second function (step) was called."
        ));
        assert_eq!(
            lines[4],
            "When the first pump function was called, this was the stack:"
        );
    }

    #[test]
    fn test_conflict_sync_check_hint() {
        let lines = conflict(
            &caller(Some("X"), "A", 10),
            &caller(None, "expect", 11),
            STACK,
            &["expect"],
        );
        assert_eq!(
            lines[1],
            "Then, the \"expect\" function was called from tests/protocol.rs on line 11."
        );
        assert!(lines[2].starts_with("The first method (X.A) had not yet finished"));
        assert!(lines[2].contains("the second function (expect) was called"));
        assert_eq!(
            lines[3],
            "If you are confident that all test APIs are being called using \"await\", and this \
             expect() call is not being called at the top level but is itself being called from \
             some sort of callback registered before the A method was called, then consider \
             using expect_sync() instead."
        );
        assert_eq!(lines[4], "");
        assert_eq!(lines.len(), 7);
    }

    #[test]
    fn test_conflict_sync_check_requires_free_function() {
        // A method that happens to be named like a sync check gets no hint
        let lines = conflict(
            &caller(Some("X"), "A", 10),
            &caller(Some("Y"), "expect", 11),
            STACK,
            &["expect"],
        );
        assert_eq!(lines.len(), 6);

        // Nor does an unlisted function
        let lines = conflict(
            &caller(Some("X"), "A", 10),
            &caller(None, "expect", 11),
            STACK,
            &["verify"],
        );
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn test_leaked() {
        assert_eq!(
            leaked(&caller(Some("X"), "A", 10)),
            "The guarded method \"A\" from class X was called from tests/protocol.rs on line 10, but never completed before its parent scope closed."
        );
        assert_eq!(
            leaked(&caller(None, "pump", 3)),
            "The guarded method \"pump\" was called from tests/protocol.rs on line 3, but never completed before its parent scope closed."
        );
    }

    #[test]
    fn test_render_trims_trailing_whitespace() {
        let mut lines = vec![LEAK.to_string()];
        lines.extend(cause("boom\n\n"));
        lines.push("   ".into());
        lines.push(String::new());
        assert_eq!(
            render(&lines),
            format!(
                "{LEAK}\n\nAn uncaught error may have caused the guarded function leak. The error was:\nboom"
            )
        );
        assert_eq!(render::<&str>(&[]), "");
    }
}
