//! Captured call stacks.
//!
//! A [Stack] is captured eagerly (a cheap walk of return addresses) but resolved lazily: symbols,
//! files and lines are only looked up the first time [Stack::frames] is called, which in practice
//! means only when a diagnostic is being composed.
//!
//! Frames are usually produced by parsing the text form of a [std::backtrace::Backtrace]:
//!
//! ```txt
//!    4: my_crate::Tester::pump
//!              at ./tests/protocol.rs:42:9
//! ```
//!
//! The single-line form `#4 my_crate::Tester::pump (./tests/protocol.rs:42:9)` is accepted as
//! well, and stacks may also be built directly from structured [Frame]s.

use regex::Regex;
use std::{
    backtrace::{Backtrace, BacktraceStatus},
    collections::BTreeSet,
    fmt,
    sync::{Arc, LazyLock, OnceLock},
};

/// `   4: symbol`
static HEADER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+):\s+(.*\S)\s*$").unwrap());

/// `             at file:line:column`
static LOCATION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*at\s+(.*\S)\s*$").unwrap());

/// `#4 symbol (file:line:column)`
static SINGLE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*#(\d+)\s+(.+?)\s+\((.+)\)\s*$").unwrap());

/// One frame of a call stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    index: usize,
    symbol: String,
    location: Option<String>,
}

impl Frame {
    /// Create a frame at `index` executing `symbol` with no known location.
    pub fn new(index: usize, symbol: impl Into<String>) -> Self {
        Self {
            index,
            symbol: symbol.into(),
            location: None,
        }
    }

    /// Attach a location (`file:line[:column]`) to the frame.
    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Position of the frame in the stack (inlined frames share the index of their caller).
    pub fn index(&self) -> usize {
        self.index
    }

    /// Demangled symbol of the function executing in this frame.
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Location within the function, if known.
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// Symbol path with any leading qualified-path bracket removed.
    ///
    /// `<my_crate::Guarded<F> as core::future::Future>::poll` becomes
    /// `my_crate::Guarded<F> as core::future::Future>::poll`, which lets callers match frames by
    /// crate or module prefix regardless of trait qualification.
    pub fn path(&self) -> &str {
        self.symbol.trim_start_matches('<')
    }

    /// Returns true if the frame's symbol path starts with any of `prefixes`.
    pub fn matches<S: AsRef<str>>(&self, prefixes: &[S]) -> bool {
        let path = self.path();
        prefixes.iter().any(|prefix| {
            let prefix: &str = prefix.as_ref();
            path.starts_with(prefix)
        })
    }

    /// Name of the crate the frame belongs to.
    fn krate(&self) -> &str {
        let path = self.path();
        path.split("::").next().unwrap_or(path)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>4}: {}", self.index, self.symbol)?;
        if let Some(location) = &self.location {
            write!(f, "\n             at {location}")?;
        }
        Ok(())
    }
}

enum Source {
    Captured(Backtrace),
    Text(String),
    Frames,
}

struct Inner {
    source: Source,
    frames: OnceLock<Vec<Frame>>,
}

/// A call stack captured at some point of execution.
///
/// Cloning is cheap and shares the (lazily resolved) frames.
#[derive(Clone)]
pub struct Stack {
    inner: Arc<Inner>,
}

impl Stack {
    /// Capture the current call stack, regardless of `RUST_BACKTRACE`.
    ///
    /// If the platform does not support backtraces the stack has no frames.
    #[inline(never)]
    pub fn capture() -> Self {
        Self::from_source(Source::Captured(Backtrace::force_capture()))
    }

    /// Create a stack from the text form of a backtrace.
    pub fn parse(text: impl Into<String>) -> Self {
        Self::from_source(Source::Text(text.into()))
    }

    fn from_source(source: Source) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                frames: OnceLock::new(),
            }),
        }
    }

    /// Returns the frames of the stack, innermost first.
    pub fn frames(&self) -> &[Frame] {
        self.inner.frames.get_or_init(|| match &self.inner.source {
            Source::Captured(backtrace) => match backtrace.status() {
                BacktraceStatus::Captured => parse(&backtrace.to_string()),
                _ => Vec::new(),
            },
            Source::Text(text) => parse(text),
            Source::Frames => Vec::new(),
        })
    }

    /// Render the stack, dropping frames whose symbol starts with any of `elided`.
    ///
    /// Dropped frames are summarized on a final line naming the crates they belonged to.
    pub fn filtered<S: AsRef<str>>(&self, elided: &[S]) -> String {
        let mut lines = Vec::new();
        let mut skipped = 0;
        let mut crates = BTreeSet::new();
        for frame in self.frames() {
            if frame.matches(elided) {
                skipped += 1;
                crates.insert(frame.krate());
                continue;
            }
            lines.push(frame.to_string());
        }
        if skipped > 0 {
            let plural = if skipped == 1 { "" } else { "s" };
            lines.push(format!(
                "(elided {skipped} frame{plural} from {})",
                enumerate(crates.into_iter())
            ));
        }
        lines.join("\n")
    }
}

impl From<Vec<Frame>> for Stack {
    fn from(frames: Vec<Frame>) -> Self {
        let stack = Self::from_source(Source::Frames);
        let _ = stack.inner.frames.set(frames);
        stack
    }
}

impl fmt::Display for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.frames().iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{frame}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("frames", &self.frames().len())
            .finish()
    }
}

/// Join names as `a`, `a and b`, or `a, b and c`.
fn enumerate<'a>(names: impl Iterator<Item = &'a str>) -> String {
    let names: Vec<_> = names.collect();
    match names.split_last() {
        None => String::new(),
        Some((last, [])) => (*last).to_string(),
        Some((last, rest)) => format!("{} and {last}", rest.join(", ")),
    }
}

/// Parse the text form of a backtrace into frames.
///
/// Lines that do not belong to a frame (headers, notes, blank lines) are ignored. A symbol line
/// without an index (as printed for inlined functions) becomes a frame sharing the index of the
/// frame before it.
fn parse(text: &str) -> Vec<Frame> {
    let mut frames: Vec<Frame> = Vec::new();
    for line in text.lines() {
        if let Some(captures) = SINGLE_PATTERN.captures(line) {
            let Ok(index) = captures[1].parse() else {
                continue;
            };
            frames.push(Frame::new(index, &captures[2]).at(&captures[3]));
            continue;
        }
        if let Some(captures) = HEADER_PATTERN.captures(line) {
            let Ok(index) = captures[1].parse() else {
                continue;
            };
            frames.push(Frame::new(index, &captures[2]));
            continue;
        }
        if let Some(captures) = LOCATION_PATTERN.captures(line) {
            if let Some(frame) = frames.last_mut() {
                if frame.location.is_none() {
                    frame.location = Some(captures[1].to_string());
                }
            }
            continue;
        }

        // Inlined symbol (no index of its own)
        let symbol = line.trim();
        if symbol.is_empty() || symbol.starts_with("note:") {
            continue;
        }
        if let Some(index) = frames.last().map(Frame::index) {
            frames.push(Frame::new(index, symbol));
        }
    }
    frames
}
