use tracing::Level;

/// Configuration for a [crate::Tracker] (and the [crate::Runner] that hosts it).
#[derive(Clone, Debug)]
pub struct Config {
    /// Symbol prefixes of frames that belong to the tracker itself.
    ///
    /// These frames are skipped when looking for the call site of a guarded call.
    pub internal: Vec<String>,

    /// Symbol prefixes of runtime plumbing (executors, `Future::poll` shims, task-local
    /// wrappers).
    ///
    /// These frames are treated as part of whichever call site surrounds them and are elided
    /// from stacks printed in diagnostics.
    pub elided: Vec<String>,

    /// Names of synchronous checks that have a `_sync` variant.
    ///
    /// When one of these (free) functions collides with a pending guarded call, the conflict
    /// message suggests calling `<name>_sync()` instead.
    pub sync_checks: Vec<String>,

    /// Maximum level of logs printed while a [crate::Runner] is executing.
    ///
    /// If `None`, no subscriber is installed.
    pub log_level: Option<Level>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            internal: vec![
                "std::backtrace".into(),
                format!("{}::", env!("CARGO_CRATE_NAME")),
            ],
            elided: [
                "alloc::",
                "core::",
                "std::",
                "futures_core::",
                "futures_executor::",
                "futures_task::",
                "futures_util::",
                "tokio::",
                "test::",
                "__rust",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            sync_checks: vec!["expect".into()],
            log_level: Some(Level::DEBUG),
        }
    }
}

impl Config {
    /// Elided prefixes followed by internal prefixes (frames never shown in diagnostics).
    pub(crate) fn noise(&self) -> Vec<String> {
        self.elided.iter().chain(&self.internal).cloned().collect()
    }
}
