//! Identify the call site responsible for a guarded call.
//!
//! A guarded call is usually issued by a test API (`Tester::pump`) on behalf of the test that
//! called it. The interesting location is therefore not where the guard was entered but where the
//! test API was invoked. Given a [Stack] captured inside the guard, the [Analyzer]:
//!
//! 1. Skips the tracker's own frames to find the call-site frame (the test API), extracting its
//!    type (if any) and function name from the demangled symbol.
//! 2. Skips every following frame that belongs to the same type or function (closures of an
//!    `async fn`, helper methods) or to runtime plumbing (`Future::poll` shims, task-local
//!    wrappers).
//! 3. Reads the file and line of the first frame that remains.
//!
//! Failures never panic: each step that cannot complete leaves a note describing what went
//! wrong in the caller's buffer and the analysis yields `None`.

use crate::stack::{Frame, Stack};
use regex::Regex;
use std::{panic::Location, sync::LazyLock};
use tracing::trace;

/// `file:line[:column]`
static LOCATION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?):(\d+)(?::\d+)?$").unwrap());

/// Legacy-mangling hash suffix (`::h0123456789abcdef`).
static HASH_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"::h[0-9a-f]{16}$").unwrap());

static IDENTIFIER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Explicit description of a guarded operation.
///
/// Supplying a label (see [crate::Tracker::guard_as]) removes the need to recover the
/// operation's name from symbols, which makes diagnostics independent of debug information and
/// inlining.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Label {
    owner: Option<&'static str>,
    name: &'static str,
}

impl Label {
    /// Label a method `name` of type `owner`.
    pub const fn method(owner: &'static str, name: &'static str) -> Self {
        Self {
            owner: Some(owner),
            name,
        }
    }

    /// Label a free function `name`.
    pub const fn function(name: &'static str) -> Self {
        Self { owner: None, name }
    }

    /// Returns the type the operation belongs to, if any.
    pub fn owner(&self) -> Option<&'static str> {
        self.owner
    }

    /// Returns the name of the operation.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// The call site responsible for a guarded call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    /// Type of the guarded operation (`None` for free functions).
    pub class: Option<String>,
    /// Name of the guarded operation.
    pub method: String,
    /// File the operation was called from.
    pub file: String,
    /// Line the operation was called from.
    pub line: u32,
}

impl Caller {
    /// Build a caller from an explicit label and the location it was invoked from.
    pub fn labeled(label: Label, location: &Location<'_>) -> Self {
        Self {
            class: label.owner.map(String::from),
            method: label.name.to_string(),
            file: location.file().to_string(),
            line: location.line(),
        }
    }

    /// Returns `"method"` or `"function"`.
    pub fn kind(&self) -> &'static str {
        if self.class.is_some() {
            "method"
        } else {
            "function"
        }
    }

    /// Returns true if both callers were invoked from the same file and line.
    pub fn same_site(&self, other: &Self) -> bool {
        self.file == other.file && self.line == other.line
    }

    /// Returns true if both callers refer to the same operation.
    pub fn same_operation(&self, other: &Self) -> bool {
        self.class == other.class && self.method == other.method
    }
}

/// Type and function a frame's symbol resolves to.
#[derive(Debug, PartialEq, Eq)]
struct Symbol {
    class: Option<String>,
    method: String,
}

impl Symbol {
    /// Parse a demangled symbol such as `my_crate::Tester::pump::{{closure}}` or
    /// `<my_crate::Tester as my_crate::Api>::pump`.
    fn parse(symbol: &str) -> Option<Self> {
        let symbol = HASH_PATTERN.replace(symbol.trim(), "");
        // Drop closures (`{{closure}}`, `{closure#0}`) and turbofish arguments (`::<T>`)
        let segments: Vec<_> = split(&symbol)
            .into_iter()
            .enumerate()
            .filter(|(i, segment)| {
                !segment.is_empty()
                    && !segment.starts_with('{')
                    && !(*i > 0 && segment.starts_with('<'))
            })
            .map(|(_, segment)| segment)
            .collect();
        let (method, rest) = segments.split_last()?;
        let method = strip_generics(method);
        if !IDENTIFIER_PATTERN.is_match(method) {
            return None;
        }
        let class = rest.last().and_then(|segment| type_name(segment));
        Some(Self {
            class: class.map(String::from),
            method: method.to_string(),
        })
    }

    /// Type name, or function name for free functions.
    fn owner(&self) -> &str {
        self.class.as_deref().unwrap_or(&self.method)
    }
}

/// Split a path on `::`, ignoring separators nested inside `<...>`.
fn split(path: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            b'>' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                segments.push(&path[start..i]);
                i += 2;
                start = i;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    segments.push(&path[start..]);
    segments
}

/// Remove generic arguments (`Tester<T>` becomes `Tester`).
fn strip_generics(segment: &str) -> &str {
    segment.split('<').next().unwrap_or(segment)
}

/// Extract a type name from a path segment, if the segment names a type.
///
/// Qualified segments (`<a::Tester as b::Api>`) resolve to their self type. Plain segments
/// name a type when they follow the `UpperCamelCase` convention, otherwise they are modules.
fn type_name(segment: &str) -> Option<&str> {
    let name = match segment.strip_prefix('<') {
        Some(qualified) => {
            let qualified = qualified.strip_suffix('>').unwrap_or(qualified);
            let self_type = qualified.split(" as ").next().unwrap_or(qualified);
            let self_type = self_type
                .trim_start_matches('&')
                .trim_start_matches("mut ")
                .trim_start_matches("dyn ");
            let last = split(self_type).into_iter().last().unwrap_or(self_type);
            strip_generics(last)
        }
        None => strip_generics(segment),
    };
    let uppercase = name.chars().next().is_some_and(char::is_uppercase);
    (uppercase && IDENTIFIER_PATTERN.is_match(name)).then_some(name)
}

/// Locate responsible callers in captured stacks.
pub struct Analyzer<'a> {
    internal: &'a [String],
    synthetic: &'a [String],
}

impl<'a> Analyzer<'a> {
    /// Create an analyzer that treats frames matching `internal` as the tracker's own and frames
    /// matching `synthetic` as runtime plumbing.
    pub fn new(internal: &'a [String], synthetic: &'a [String]) -> Self {
        Self {
            internal,
            synthetic,
        }
    }

    /// Find the caller responsible for invoking `operation` in `stack`.
    ///
    /// On failure, a note explaining which step could not complete is appended to `notes`.
    pub fn find(&self, stack: &Stack, operation: &str, notes: &mut Vec<String>) -> Option<Caller> {
        let frames = stack.frames();

        // Skip our own frames to find the call site
        let Some(index) = frames
            .iter()
            .position(|frame| !frame.matches(self.internal) && !frame.matches(self.synthetic))
        else {
            trace!(operation, frames = frames.len(), "no external frame");
            notes.push(format!(
                "(Unable to find the method that called Tracker::{operation}(). The stack may be incomplete or bogus.)"
            ));
            return None;
        };
        let site = &frames[index];
        let Some(symbol) = Symbol::parse(site.symbol()) else {
            trace!(operation, symbol = site.symbol(), "unparseable call site");
            notes.push(format!(
                "(Unable to parse the stack frame of the method that called Tracker::{operation}(). The stack may be incomplete or bogus.)"
            ));
            notes.push(site.to_string());
            return None;
        };

        // Skip the rest of the call site (closures, helpers, and runtime shims)
        let Some(caller) = frames[index..].iter().find(|frame| !self.within(frame, &symbol)) else {
            trace!(operation, owner = symbol.owner(), "no frame after call site");
            notes.push(format!(
                "(Unable to find the stack frame of the method that called the method that called Tracker::{operation}(). The stack may be incomplete or bogus.)"
            ));
            return None;
        };

        // Extract the location of the call
        let Some((file, line)) = caller.location().and_then(parse_location) else {
            trace!(operation, symbol = caller.symbol(), "unparseable caller location");
            notes.push(format!(
                "(Unable to parse the stack frame of the method that called the method that called Tracker::{operation}(). The stack may be incomplete or bogus.)"
            ));
            notes.push(caller.to_string());
            return None;
        };
        Some(Caller {
            class: symbol.class,
            method: symbol.method,
            file,
            line,
        })
    }

    /// Returns true if `frame` is part of the call site described by `site`.
    fn within(&self, frame: &Frame, site: &Symbol) -> bool {
        if frame.matches(self.synthetic) {
            return true;
        }
        Symbol::parse(frame.symbol()).is_some_and(|symbol| symbol.owner() == site.owner())
    }
}

/// Split `file:line[:column]` into its file and line.
fn parse_location(location: &str) -> Option<(String, u32)> {
    let captures = LOCATION_PATTERN.captures(location.trim())?;
    let line = captures[2].parse().ok()?;
    Some((captures[1].to_string(), line))
}
