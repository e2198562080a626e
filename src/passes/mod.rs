//! Protection-removal passes and their shared infrastructure.
//!
//! Every transformation the engine can perform is a [`ProtectionPass`]. The
//! [`PassKind`] enum is the canonical catalog: one entry per pass, in the
//! order the engine executes them, each mapped to the [`ProtectionFlags`] bit
//! that enables it. Passes receive a [`PassContext`] carrying the run
//! configuration, the event log, the injected logger and the per-run caches.
//!
//! Passes are stateless and thread-safe; anything discovered during a run
//! that later passes want to reuse goes into [`RunCaches`].

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    config::{EngineConfig, ProtectionFlags},
    events::EventLog,
    logger::Logger,
    model::{Module, Token},
    Result,
};

pub mod anti;
pub mod arithmetic;
pub mod callis;
pub mod controlflow;
pub mod junk;
pub mod localfields;
pub mod metadata;
pub mod proxy;
pub mod rename;
pub mod resources;
pub mod stack;
pub mod strings;
pub mod watermark;

/// A single protection-removal transformation.
///
/// Passes must be thread-safe (`Send + Sync`); the engine may instantiate
/// them once and run them against many modules. A pass receives mutable
/// access to the module and shared access to the run context, and reports
/// whether it changed anything.
///
/// Passes record fine-grained [`EventLog`] entries for each transformation
/// and speak to the user through `ctx.logger`. They never terminate the run:
/// recoverable trouble is a logged warning, unrecoverable trouble is an `Err`
/// that the engine converts into a per-pass failure without aborting the
/// remaining passes.
pub trait ProtectionPass: Send + Sync {
    /// Unique display name, as listed in the catalog.
    fn name(&self) -> &'static str;

    /// Runs the pass over the whole module.
    ///
    /// Returns `true` if any changes were made, `false` otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the pass cannot complete; the module may have
    /// been partially modified at that point.
    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool>;

    /// One-line description of what this pass does.
    fn description(&self) -> &'static str {
        "No description available"
    }
}

/// Shared state handed to every pass invocation.
///
/// Borrowed for the duration of one `run` call. All fields are shared
/// references; passes communicate results through the module itself, the
/// event log and [`RunCaches`].
pub struct PassContext<'a> {
    /// Run configuration with all heuristic thresholds.
    pub config: &'a EngineConfig,
    /// Accumulating event log for this run.
    pub events: &'a EventLog,
    /// Injected logger for user-facing progress messages.
    pub logger: &'a dyn Logger,
    /// Per-run caches shared across passes.
    pub caches: &'a RunCaches,
}

/// Caches that outlive a single pass but not the run.
///
/// Thread-safe so parallel per-method work inside a pass can populate them.
#[derive(Debug, Default)]
pub struct RunCaches {
    /// Proxy-candidate scans memoized by name prefix, shared by the three
    /// proxy passes.
    pub proxies: DashMap<String, Arc<Vec<Token>>>,
    /// The string decryptor method, located at most once per run.
    /// A stored `None` records a completed search that found nothing.
    pub decryptor: OnceLock<Option<Token>>,
}

impl RunCaches {
    /// Creates empty caches for a new run.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// The canonical pass catalog, in execution order.
///
/// Display names are the stable identifiers used in reports, logs and on the
/// command line; parsing is case-insensitive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr,
)]
#[strum(ascii_case_insensitive)]
pub enum PassKind {
    /// Remove anti-tamper probe spans.
    #[strum(serialize = "Anti-Tamper")]
    AntiTamper,
    /// Remove anti-dump probe spans.
    #[strum(serialize = "Anti-Dump")]
    AntiDump,
    /// Remove anti-debug probe spans.
    #[strum(serialize = "Anti-Debug")]
    AntiDebug,
    /// Remove calls to planted anti-tooling junk methods.
    #[strum(serialize = "Anti-De4Dot")]
    AntiDe4Dot,
    /// Remove watermark string literals.
    #[strum(serialize = "Watermarks")]
    Watermarks,
    /// Remove redundant jumps and orphaned nops.
    #[strum(serialize = "Jump Control Flow")]
    JumpControlFlow,
    /// Unflatten switch dispatch and simplify branch chains.
    #[strum(serialize = "Control Flow")]
    ControlFlow,
    /// Inline constant-returning proxy methods.
    #[strum(serialize = "Proxy Constants")]
    ProxyConstants,
    /// Inline string-returning proxy methods.
    #[strum(serialize = "Proxy Strings")]
    ProxyStrings,
    /// Redirect forwarding proxy calls to their real targets.
    #[strum(serialize = "Proxy Methods")]
    ProxyMethods,
    /// Fold `ldc; ldc; xor` confusion triples.
    #[strum(serialize = "Integer Confusion")]
    IntegerConfusion,
    /// Fold constant arithmetic chains and duplicate calculations.
    #[strum(serialize = "Arithmetic")]
    Arithmetic,
    /// Decrypt statically-encrypted string literals.
    #[strum(serialize = "Encrypted Strings")]
    EncryptedStrings,
    /// Replace online-decryption literals with offline placeholders.
    #[strum(serialize = "Online String Decryption")]
    OnlineStrings,
    /// Decrypt XOR-encrypted resources.
    #[strum(serialize = "Resource Encryption")]
    ResourceEncryption,
    /// Strip protection markers from resource names and payloads.
    #[strum(serialize = "Resource Protections")]
    ResourceProtections,
    /// Remove stack-noise pairs and unused locals.
    #[strum(serialize = "Stack Confusion")]
    StackConfusion,
    /// Restore `ldftn`/`calli` pairs to direct calls.
    #[strum(serialize = "Callis")]
    Callis,
    /// Restore empty or digit-only metadata names.
    #[strum(serialize = "Invalid Metadata")]
    InvalidMetadata,
    /// Convert hoisted `local_*` static fields back to locals.
    #[strum(serialize = "Local2Field")]
    LocalToField,
    /// Rename obfuscated symbols to readable placeholders.
    #[strum(serialize = "Renamer")]
    Renamer,
    /// Token-qualified renaming of obfuscated data structures.
    #[strum(serialize = "Data Structure Recovery")]
    StructureRecovery,
    /// Remove junk methods and unused private fields.
    #[strum(serialize = "Junk Code Removal")]
    JunkCode,
    /// Detect and remove virtualization machinery.
    #[strum(serialize = "Virtual Machine Removal")]
    VirtualMachines,
    /// Run externally registered extension passes.
    #[strum(serialize = "Extensions")]
    Extensions,
}

impl PassKind {
    /// Returns the configuration bit that enables this pass.
    #[must_use]
    pub fn flag(self) -> ProtectionFlags {
        match self {
            PassKind::AntiTamper => ProtectionFlags::ANTI_TAMPER,
            PassKind::AntiDump => ProtectionFlags::ANTI_DUMP,
            PassKind::AntiDebug => ProtectionFlags::ANTI_DEBUG,
            PassKind::AntiDe4Dot => ProtectionFlags::ANTI_DE4DOT,
            PassKind::Watermarks => ProtectionFlags::WATERMARKS,
            PassKind::JumpControlFlow => ProtectionFlags::JUMP_CONTROL_FLOW,
            PassKind::ControlFlow => ProtectionFlags::CONTROL_FLOW,
            PassKind::ProxyConstants => ProtectionFlags::PROXY_CONSTANTS,
            PassKind::ProxyStrings => ProtectionFlags::PROXY_STRINGS,
            PassKind::ProxyMethods => ProtectionFlags::PROXY_METHODS,
            PassKind::IntegerConfusion => ProtectionFlags::INTEGER_CONFUSION,
            PassKind::Arithmetic => ProtectionFlags::ARITHMETIC,
            PassKind::EncryptedStrings => ProtectionFlags::ENCRYPTED_STRINGS,
            PassKind::OnlineStrings => ProtectionFlags::ONLINE_STRINGS,
            PassKind::ResourceEncryption => ProtectionFlags::RESOURCE_ENCRYPTION,
            PassKind::ResourceProtections => ProtectionFlags::RESOURCE_PROTECTIONS,
            PassKind::StackConfusion => ProtectionFlags::STACK_CONFUSION,
            PassKind::Callis => ProtectionFlags::CALLIS,
            PassKind::InvalidMetadata => ProtectionFlags::INVALID_METADATA,
            PassKind::LocalToField => ProtectionFlags::LOCAL_TO_FIELD,
            PassKind::Renamer => ProtectionFlags::RENAMER,
            PassKind::StructureRecovery => ProtectionFlags::STRUCTURE_RECOVERY,
            PassKind::JunkCode => ProtectionFlags::JUNK_CODE,
            PassKind::VirtualMachines => ProtectionFlags::VIRTUAL_MACHINES,
            PassKind::Extensions => ProtectionFlags::EXTENSIONS,
        }
    }
}

/// Creates the built-in pass for a catalog entry.
///
/// Returns `None` for [`PassKind::Extensions`]: extension passes are not
/// built in, they are registered on the engine by the caller.
#[must_use]
pub fn instantiate(kind: PassKind) -> Option<Box<dyn ProtectionPass>> {
    match kind {
        PassKind::AntiTamper => Some(Box::new(anti::AntiTamperPass)),
        PassKind::AntiDump => Some(Box::new(anti::AntiDumpPass)),
        PassKind::AntiDebug => Some(Box::new(anti::AntiDebugPass)),
        PassKind::AntiDe4Dot => Some(Box::new(anti::AntiDe4DotPass)),
        PassKind::Watermarks => Some(Box::new(watermark::WatermarkPass)),
        PassKind::JumpControlFlow => Some(Box::new(controlflow::JumpControlFlowPass)),
        PassKind::ControlFlow => Some(Box::new(controlflow::ControlFlowPass)),
        PassKind::ProxyConstants => Some(Box::new(proxy::ProxyConstantPass)),
        PassKind::ProxyStrings => Some(Box::new(proxy::ProxyStringPass)),
        PassKind::ProxyMethods => Some(Box::new(proxy::ProxyMethodPass)),
        PassKind::IntegerConfusion => Some(Box::new(arithmetic::IntegerConfusionPass)),
        PassKind::Arithmetic => Some(Box::new(arithmetic::ArithmeticPass)),
        PassKind::EncryptedStrings => Some(Box::new(strings::EncryptedStringPass)),
        PassKind::OnlineStrings => Some(Box::new(strings::OnlineStringPass)),
        PassKind::ResourceEncryption => Some(Box::new(resources::ResourceEncryptionPass)),
        PassKind::ResourceProtections => Some(Box::new(resources::ResourceProtectionPass)),
        PassKind::StackConfusion => Some(Box::new(stack::StackConfusionPass)),
        PassKind::Callis => Some(Box::new(callis::CallIndirectionPass)),
        PassKind::InvalidMetadata => Some(Box::new(metadata::InvalidMetadataPass)),
        PassKind::LocalToField => Some(Box::new(localfields::LocalToFieldPass)),
        PassKind::Renamer => Some(Box::new(rename::RenamerPass)),
        PassKind::StructureRecovery => Some(Box::new(rename::StructureRecoveryPass)),
        PassKind::JunkCode => Some(Box::new(junk::JunkCodePass)),
        PassKind::VirtualMachines => Some(Box::new(crate::vm::VirtualMachinePass)),
        PassKind::Extensions => None,
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_catalog_size() {
        assert_eq!(PassKind::iter().count(), 25);
    }

    #[test]
    fn test_display_names_round_trip() {
        for kind in PassKind::iter() {
            let name = kind.to_string();
            let parsed = PassKind::from_str(&name).ok();
            assert_eq!(parsed, Some(kind), "{name} did not round-trip");
        }
    }

    #[test]
    fn test_parsing_is_case_insensitive() {
        assert_eq!(
            PassKind::from_str("anti-tamper").ok(),
            Some(PassKind::AntiTamper)
        );
        assert_eq!(
            PassKind::from_str("VIRTUAL MACHINE REMOVAL").ok(),
            Some(PassKind::VirtualMachines)
        );
        assert!(PassKind::from_str("No Such Pass").is_err());
    }

    #[test]
    fn test_flags_cover_standard_set() {
        let mut union = ProtectionFlags::empty();
        for kind in PassKind::iter() {
            union |= kind.flag();
        }
        assert_eq!(union, ProtectionFlags::all());

        let standard: ProtectionFlags = PassKind::iter()
            .filter(|k| *k != PassKind::Extensions)
            .map(PassKind::flag)
            .collect();
        assert_eq!(standard, ProtectionFlags::STANDARD);
    }

    #[test]
    fn test_instantiate_names_match_catalog() {
        for kind in PassKind::iter() {
            match instantiate(kind) {
                Some(pass) => assert_eq!(pass.name(), kind.to_string()),
                None => assert_eq!(kind, PassKind::Extensions),
            }
        }
    }
}
