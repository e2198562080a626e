use thiserror::Error;

macro_rules! malformed_body {
    // Single string version
    ($msg:expr) => {
        crate::Error::MalformedBody {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::MalformedBody {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// This enum covers the failure modes of the transformation engine: configuration
/// problems detected before a run starts, pass lookups by name, failures raised inside
/// an individual pass (which the orchestrator isolates rather than propagates), and
/// method-body consistency violations discovered while mutating instruction streams.
///
/// # Error Categories
///
/// ## Run Setup Errors
/// - [`Error::Config`] - Rejected engine configuration
/// - [`Error::UnknownPass`] - Pass name did not resolve to a built-in or registered pass
///
/// ## Transformation Errors
/// - [`Error::Pass`] - A pass reported a failure (caught at the pass boundary)
/// - [`Error::MalformedBody`] - A method body violated a structural expectation
///
/// # Examples
///
/// ```rust
/// use cilstrip::{Error, EngineConfig, NullLogger, ProtectionEngine};
///
/// let mut engine = ProtectionEngine::new(EngineConfig::default());
/// let mut module = cilstrip::Module::new("sample.exe");
///
/// match engine.apply_pass(&mut module, "No Such Pass", &NullLogger) {
///     Err(Error::UnknownPass(name)) => {
///         eprintln!("not a pass: {}", name);
///     }
///     other => {
///         other.expect("pass dispatch");
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The engine configuration was rejected during run initialization.
    ///
    /// Raised before any pass executes, typically for threshold values that
    /// make a heuristic meaningless (zero-width removal spans, percentage
    /// ratios above 1.0, inverted handler size bounds).
    #[error("Invalid configuration - {0}")]
    Config(String),

    /// A pass name did not resolve to any built-in or registered pass.
    ///
    /// Returned by single-pass invocation when the supplied name matches
    /// neither a catalog entry nor a registered extension pass.
    #[error("Unknown pass - '{0}'")]
    UnknownPass(String),

    /// A pass failed while running.
    ///
    /// Carries the pass's own description of what went wrong. The orchestrator
    /// catches this at the pass boundary, records the pass as not applied, and
    /// continues with the next pass; it never aborts a run.
    #[error("Pass failure - {0}")]
    Pass(String),

    /// A method body violated a structural expectation.
    ///
    /// This error indicates an instruction stream a transformation cannot
    /// reason about, such as an operand handle that never belonged to the body
    /// it is used with. The error includes the source location where the
    /// violation was detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of the violation
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed body - {file}:{line}: {message}")]
    MalformedBody {
        /// The message to be printed for the malformed body error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Generic error for miscellaneous failures.
    ///
    /// Used for errors that don't fit into other categories, including
    /// failures surfaced by registered extension passes.
    #[error("{0}")]
    Error(String),
}
