//! Structured record of what a run changed.
//!
//! Passes do not keep their own counters. Instead every edit they make is
//! pushed into a shared [`EventLog`] as an [`Event`]: an instruction removed,
//! a string decrypted, a symbol renamed. After the run the log answers both
//! detailed queries ("which methods lost watermarks?") and aggregate ones
//! ([`DerivedStats`]).
//!
//! Recording is a statement, not an expression chain that must be consumed:
//!
//! ```rust
//! use cilstrip::{EventKind, EventLog, Token};
//!
//! let log = EventLog::new();
//! log.record(EventKind::StringDecrypted)
//!     .at(Token::new(0x06000001), 4)
//!     .message("decrypted: \"hello world\"");
//!
//! assert!(log.has(EventKind::StringDecrypted));
//! ```
//!
//! The builder returned by [`EventLog::record`] commits the event when it goes
//! out of scope, so call sites never hold on to it.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::Duration,
};

use crate::model::Token;

/// Categories of events that can be logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An instruction was removed.
    InstructionRemoved,
    /// Unreachable instructions were removed.
    DeadCodeRemoved,
    /// A branch was simplified or coalesced.
    BranchSimplified,
    /// A constant expression was folded.
    ConstantFolded,
    /// An encrypted string literal was decrypted and inlined.
    StringDecrypted,
    /// A proxy call was replaced by its constant or direct target.
    ProxyInlined,
    /// An indirect or stub call was restored to a direct call.
    CallRestored,
    /// A watermark literal was removed.
    WatermarkRemoved,
    /// An encrypted resource was decrypted in place.
    ResourceDecrypted,
    /// A resource name or payload was restored.
    ResourceRestored,
    /// A type, method, field or property was renamed.
    SymbolRenamed,
    /// A type was removed from the module.
    TypeRemoved,
    /// A method was removed from its type.
    MethodRemoved,
    /// A field was removed from its type.
    FieldRemoved,
    /// An exception handler was dropped during repair.
    HandlerDropped,
    /// Unused local slots were removed and operands remapped.
    LocalsCompacted,
    /// A virtualization stub was rewritten to direct code.
    StubRestored,
    /// A dangling branch or handler marker was retargeted.
    TargetRepaired,

    /// A pass started.
    PassStarted,
    /// A pass completed.
    PassCompleted,
    /// A pass failed and was isolated.
    PassFailed,

    /// Informational message.
    Info,
    /// Warning (something unexpected but recoverable).
    Warning,
    /// Error (something failed).
    Error,
    /// A notable success worth surfacing to the user.
    Success,
}

impl EventKind {
    /// Human-readable label, also the default message for events of this kind.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::InstructionRemoved => "instruction removed",
            Self::DeadCodeRemoved => "dead code removed",
            Self::BranchSimplified => "branch simplified",
            Self::ConstantFolded => "constant folded",
            Self::StringDecrypted => "string decrypted",
            Self::ProxyInlined => "proxy inlined",
            Self::CallRestored => "call restored",
            Self::WatermarkRemoved => "watermark removed",
            Self::ResourceDecrypted => "resource decrypted",
            Self::ResourceRestored => "resource restored",
            Self::SymbolRenamed => "symbol renamed",
            Self::TypeRemoved => "type removed",
            Self::MethodRemoved => "method removed",
            Self::FieldRemoved => "field removed",
            Self::HandlerDropped => "handler dropped",
            Self::LocalsCompacted => "locals compacted",
            Self::StubRestored => "stub restored",
            Self::TargetRepaired => "target repaired",
            Self::PassStarted => "pass started",
            Self::PassCompleted => "pass completed",
            Self::PassFailed => "pass failed",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Success => "success",
        }
    }

    /// Whether events of this kind describe an edit to the module.
    ///
    /// Engine lifecycle markers and diagnostics are not transformations.
    #[must_use]
    pub fn is_transformation(&self) -> bool {
        !matches!(
            self,
            Self::PassStarted
                | Self::PassCompleted
                | Self::PassFailed
                | Self::Info
                | Self::Warning
                | Self::Error
                | Self::Success
        )
    }

    /// Whether this kind carries a free-form diagnostic message.
    #[must_use]
    pub fn is_diagnostic(&self) -> bool {
        matches!(self, Self::Info | Self::Warning | Self::Error | Self::Success)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// One recorded change, diagnostic or lifecycle marker.
#[derive(Debug, Clone)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// The method the event belongs to, when there is one.
    pub method: Option<Token>,
    /// Program-order position inside that method's body.
    pub location: Option<usize>,
    /// Human-readable description.
    pub message: String,
    /// Name of the pass that recorded the event.
    pub pass: Option<String>,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// In-flight event returned by [`EventLog::record`].
///
/// The event lands in the log when the builder is dropped, so a bare
/// statement commits it:
///
/// ```rust,ignore
/// ctx.events
///     .record(EventKind::ProxyInlined)
///     .at(method, 7)
///     .message("call 0x06000042 -> ldc.i4 13");
/// ```
pub struct EventBuilder<'a> {
    log: &'a EventLog,
    event: Option<Event>,
}

impl<'a> EventBuilder<'a> {
    fn new(log: &'a EventLog, kind: EventKind) -> Self {
        EventBuilder {
            log,
            event: Some(Event {
                kind,
                method: None,
                location: None,
                message: String::new(),
                pass: None,
            }),
        }
    }

    fn edit(mut self, apply: impl FnOnce(&mut Event)) -> Self {
        if let Some(event) = self.event.as_mut() {
            apply(event);
        }
        self
    }

    /// Pins the event to a method and a position within its body.
    pub fn at(self, method: Token, location: usize) -> Self {
        self.edit(|event| {
            event.method = Some(method);
            event.location = Some(location);
        })
    }

    /// Pins the event to a method without a body position.
    pub fn method(self, method: Token) -> Self {
        self.edit(|event| event.method = Some(method))
    }

    /// Replaces the default kind-derived message.
    pub fn message(self, message: impl Into<String>) -> Self {
        let message = message.into();
        self.edit(|event| event.message = message)
    }

    /// Names the pass the event came from.
    pub fn pass(self, pass: impl Into<String>) -> Self {
        let pass = pass.into();
        self.edit(|event| event.pass = Some(pass))
    }
}

impl Drop for EventBuilder<'_> {
    fn drop(&mut self) {
        if let Some(mut event) = self.event.take() {
            if event.message.is_empty() {
                event.message = event.kind.description().to_string();
            }
            self.log.entries.push(event);
        }
    }
}

/// Append-only log of everything a run did.
///
/// Appending takes `&self`, so rayon method sweeps record through a shared
/// reference without locking.
#[derive(Debug)]
pub struct EventLog {
    entries: boxcar::Vec<Event>,
}

impl Default for EventLog {
    fn default() -> Self {
        EventLog {
            entries: boxcar::Vec::new(),
        }
    }
}

impl Clone for EventLog {
    fn clone(&self) -> Self {
        let log = EventLog::new();
        for event in self.iter() {
            log.entries.push(event.clone());
        }
        log
    }
}

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        EventLog::default()
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.count() == 0
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.count()
    }

    /// Starts an event of the given kind; it is committed on drop.
    pub fn record(&self, kind: EventKind) -> EventBuilder<'_> {
        EventBuilder::new(self, kind)
    }

    /// Records an informational message.
    pub fn info(&self, message: impl Into<String>) {
        self.record(EventKind::Info).message(message);
    }

    /// Records a warning.
    pub fn warn(&self, message: impl Into<String>) {
        self.record(EventKind::Warning).message(message);
    }

    /// Records an error.
    pub fn error(&self, message: impl Into<String>) {
        self.record(EventKind::Error).message(message);
    }

    /// Records a success message.
    pub fn success(&self, message: impl Into<String>) {
        self.record(EventKind::Success).message(message);
    }

    /// Returns true if at least one event of the given kind was recorded.
    #[must_use]
    pub fn has(&self, kind: EventKind) -> bool {
        self.iter().any(|event| event.kind == kind)
    }

    /// Number of events of the given kind.
    #[must_use]
    pub fn count_kind(&self, kind: EventKind) -> usize {
        self.iter().filter(|event| event.kind == kind).count()
    }

    /// Event counts grouped by kind.
    #[must_use]
    pub fn count_by_kind(&self) -> HashMap<EventKind, usize> {
        let mut counts = HashMap::new();
        for event in self.iter() {
            *counts.entry(event.kind).or_insert(0) += 1;
        }
        counts
    }

    /// Number of distinct methods that events point at.
    #[must_use]
    pub fn methods_affected(&self) -> usize {
        self.iter()
            .filter_map(|event| event.method)
            .collect::<HashSet<_>>()
            .len()
    }

    /// All events in recording order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.entries.iter().map(|(_, event)| event)
    }

    /// Only the events that describe module edits.
    pub fn transformations(&self) -> impl Iterator<Item = &Event> {
        self.iter().filter(|event| event.kind.is_transformation())
    }
}

/// Counters summarizing an [`EventLog`].
///
/// Every number is derived from the recorded events; no pass keeps its own
/// tallies.
#[derive(Debug, Clone, Default)]
pub struct DerivedStats {
    /// Number of methods that had any transformations.
    pub methods_transformed: usize,
    /// Number of instructions removed.
    pub instructions_removed: usize,
    /// Number of unreachable instructions removed.
    pub dead_code_removed: usize,
    /// Number of branches simplified or coalesced.
    pub branches_simplified: usize,
    /// Number of constants folded.
    pub constants_folded: usize,
    /// Number of strings decrypted.
    pub strings_decrypted: usize,
    /// Number of proxy calls inlined.
    pub proxies_inlined: usize,
    /// Number of calls restored to direct form.
    pub calls_restored: usize,
    /// Number of watermarks removed.
    pub watermarks_removed: usize,
    /// Number of resources decrypted.
    pub resources_decrypted: usize,
    /// Number of resources with names or payloads restored.
    pub resources_restored: usize,
    /// Number of symbols renamed.
    pub symbols_renamed: usize,
    /// Number of types removed.
    pub types_removed: usize,
    /// Number of methods removed.
    pub methods_removed: usize,
    /// Number of fields removed.
    pub fields_removed: usize,
    /// Number of exception handlers dropped.
    pub handlers_dropped: usize,
    /// Number of methods whose local slots were compacted.
    pub locals_compacted: usize,
    /// Number of virtualization stubs restored.
    pub stubs_restored: usize,
    /// Number of dangling references retargeted.
    pub targets_repaired: usize,
    /// Number of passes that failed and were isolated.
    pub passes_failed: usize,
    /// Number of warnings.
    pub warnings: usize,
    /// Number of errors.
    pub errors: usize,
    /// Processing time.
    pub total_time: Duration,
}

impl DerivedStats {
    /// Computes statistics from an event log.
    #[must_use]
    pub fn from_log(log: &EventLog) -> Self {
        let counts = log.count_by_kind();
        let get = |kind: EventKind| counts.get(&kind).copied().unwrap_or(0);

        DerivedStats {
            methods_transformed: log.methods_affected(),
            instructions_removed: get(EventKind::InstructionRemoved),
            dead_code_removed: get(EventKind::DeadCodeRemoved),
            branches_simplified: get(EventKind::BranchSimplified),
            constants_folded: get(EventKind::ConstantFolded),
            strings_decrypted: get(EventKind::StringDecrypted),
            proxies_inlined: get(EventKind::ProxyInlined),
            calls_restored: get(EventKind::CallRestored),
            watermarks_removed: get(EventKind::WatermarkRemoved),
            resources_decrypted: get(EventKind::ResourceDecrypted),
            resources_restored: get(EventKind::ResourceRestored),
            symbols_renamed: get(EventKind::SymbolRenamed),
            types_removed: get(EventKind::TypeRemoved),
            methods_removed: get(EventKind::MethodRemoved),
            fields_removed: get(EventKind::FieldRemoved),
            handlers_dropped: get(EventKind::HandlerDropped),
            locals_compacted: get(EventKind::LocalsCompacted),
            stubs_restored: get(EventKind::StubRestored),
            targets_repaired: get(EventKind::TargetRepaired),
            passes_failed: get(EventKind::PassFailed),
            warnings: get(EventKind::Warning),
            errors: get(EventKind::Error),
            total_time: Duration::ZERO,
        }
    }

    /// Sets the total processing time.
    #[must_use]
    pub fn with_time(mut self, time: Duration) -> Self {
        self.total_time = time;
        self
    }

    /// One-line summary listing only the nonzero counters.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        let mut add = |count: usize, label: &str| {
            if count > 0 {
                parts.push(format!("{count} {label}"));
            }
        };

        add(self.methods_transformed, "methods");
        add(self.strings_decrypted, "strings decrypted");
        add(self.resources_decrypted, "resources decrypted");
        add(self.resources_restored, "resources restored");
        add(self.constants_folded, "constants folded");
        add(self.instructions_removed, "instructions removed");
        add(self.dead_code_removed, "dead instructions");
        add(self.branches_simplified, "branches simplified");
        add(self.proxies_inlined, "proxies inlined");
        add(self.calls_restored, "calls restored");
        add(self.watermarks_removed, "watermarks removed");
        add(self.stubs_restored, "stubs restored");
        add(self.locals_compacted, "locals compacted");
        add(self.symbols_renamed, "symbols renamed");
        add(self.types_removed, "types removed");
        add(self.methods_removed, "methods removed");
        add(self.fields_removed, "fields removed");
        add(self.targets_repaired, "targets repaired");
        add(self.handlers_dropped, "handlers dropped");
        add(self.passes_failed, "passes failed");
        add(self.errors, "errors");
        add(self.warnings, "warnings");

        let stats = if parts.is_empty() {
            "no transformations".to_string()
        } else {
            parts.join(", ")
        };

        if self.total_time.as_millis() > 0 {
            format!("{} in {:?}", stats, self.total_time)
        } else {
            stats
        }
    }

}

impl fmt::Display for DerivedStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Shortens a string for event messages, appending `...` when it was cut.
///
/// The cut lands on a character boundary, so multi-byte literals are safe.
#[must_use]
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len.saturating_sub(3);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_log() {
        let log = EventLog::new();
        assert!(log.is_empty());
        assert_eq!(log.len(), 0);
        assert!(!log.has(EventKind::StringDecrypted));
    }

    #[test]
    fn test_record_commits_on_drop() {
        let log = EventLog::new();
        let method = Token::new(0x06000001);

        log.record(EventKind::StringDecrypted)
            .at(method, 4)
            .message("decrypted: \"hello\"");

        assert_eq!(log.len(), 1);
        let event = log.iter().next().unwrap();
        assert_eq!(event.kind, EventKind::StringDecrypted);
        assert_eq!(event.method, Some(method));
        assert_eq!(event.location, Some(4));
        assert_eq!(event.message, "decrypted: \"hello\"");
    }

    #[test]
    fn test_message_defaults_to_kind_description() {
        let log = EventLog::new();
        log.record(EventKind::WatermarkRemoved)
            .method(Token::new(0x06000001));

        let event = log.iter().next().unwrap();
        assert_eq!(event.message, "watermark removed");
        assert_eq!(format!("{event}"), "[watermark removed] watermark removed");
    }

    #[test]
    fn test_diagnostic_shorthands() {
        let log = EventLog::new();
        log.info("starting");
        log.warn("odd body");
        log.error("bad body");
        log.success("done");

        assert_eq!(log.len(), 4);
        for event in log.iter() {
            assert!(event.kind.is_diagnostic());
            assert!(!event.kind.is_transformation());
        }
        assert_eq!(log.count_kind(EventKind::Warning), 1);
    }

    #[test]
    fn test_count_by_kind() {
        let log = EventLog::new();
        let method = Token::new(0x06000001);

        log.record(EventKind::WatermarkRemoved).at(method, 1);
        log.record(EventKind::WatermarkRemoved).at(method, 2);
        log.record(EventKind::ConstantFolded).at(method, 3);

        let counts = log.count_by_kind();
        assert_eq!(counts.get(&EventKind::WatermarkRemoved), Some(&2));
        assert_eq!(counts.get(&EventKind::ConstantFolded), Some(&1));
        assert_eq!(counts.get(&EventKind::TypeRemoved), None);
    }

    #[test]
    fn test_transformations_excludes_lifecycle_and_diagnostics() {
        let log = EventLog::new();
        let method = Token::new(0x06000001);

        log.record(EventKind::PassStarted).pass("Watermarks");
        log.record(EventKind::StringDecrypted).at(method, 1);
        log.info("progress");
        log.record(EventKind::DeadCodeRemoved).at(method, 2);
        log.record(EventKind::PassCompleted).pass("Watermarks");

        assert_eq!(log.transformations().count(), 2);
        assert_eq!(log.len(), 5);
    }

    #[test]
    fn test_event_carries_pass_name() {
        let log = EventLog::new();
        log.record(EventKind::ConstantFolded)
            .at(Token::new(0x06000001), 1)
            .pass("Arithmetic")
            .message("3 + 4 -> 7");

        let event = log.iter().next().unwrap();
        assert_eq!(event.pass.as_deref(), Some("Arithmetic"));
    }

    #[test]
    fn test_clone_preserves_entries() {
        let log = EventLog::new();
        log.record(EventKind::TypeRemoved)
            .message("VMRuntime removed");
        let copy = log.clone();

        log.record(EventKind::MethodRemoved);
        assert_eq!(copy.len(), 1);
        assert!(copy.has(EventKind::TypeRemoved));
        assert!(!copy.has(EventKind::MethodRemoved));
    }

    #[test]
    fn test_derived_stats_counts_methods_and_kinds() {
        let log = EventLog::new();
        let method1 = Token::new(0x06000001);
        let method2 = Token::new(0x06000002);

        log.record(EventKind::StringDecrypted).at(method1, 1);
        log.record(EventKind::StringDecrypted).at(method2, 2);
        log.record(EventKind::ConstantFolded).at(method1, 3);
        log.warn("a warning");

        let stats = DerivedStats::from_log(&log);
        assert_eq!(stats.methods_transformed, 2);
        assert_eq!(stats.strings_decrypted, 2);
        assert_eq!(stats.constants_folded, 1);
        assert_eq!(stats.warnings, 1);

        let summary = stats.summary();
        assert!(summary.contains("2 methods"));
        assert!(summary.contains("2 strings decrypted"));
        assert!(summary.contains("1 warnings"));
    }

    #[test]
    fn test_stats_summary_empty_log() {
        let stats = DerivedStats::from_log(&EventLog::new());
        assert_eq!(stats.summary(), "no transformations");
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("short", 10), "short");
        assert_eq!(truncate_string("a longer string", 10), "a longe...");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let literal = "héllo wörld, héllo wörld";
        let cut = truncate_string(literal, 10);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= 10);
    }

    #[test]
    fn test_concurrent_recording() {
        use std::sync::Arc;
        use std::thread;

        let log = Arc::new(EventLog::new());
        let handles: Vec<_> = (0..4u32)
            .map(|worker| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for i in 0..100u32 {
                        log.record(EventKind::InstructionRemoved)
                            .at(Token::new(0x06000000 + worker * 100 + i), i as usize);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(log.len(), 400);
        assert_eq!(log.count_kind(EventKind::InstructionRemoved), 400);
    }
}
