//! Configuration for the protection-removal engine.
//!
//! [`EngineConfig`] selects which passes run (via [`ProtectionFlags`]) and
//! carries every heuristic threshold the detectors consult. All numeric
//! defaults live in the [`defaults`] module as named constants so that tuning
//! is done in one place and no detector hides a magic number inline.

use bitflags::bitflags;

use crate::{Error, Result};

/// Named defaults for every tunable threshold.
pub mod defaults {
    /// Longest instruction span removed after an anti-tamper anchor.
    pub const ANTI_TAMPER_SPAN: usize = 10;
    /// Longest instruction span removed after an anti-dump anchor.
    pub const ANTI_DUMP_SPAN: usize = 8;
    /// Longest instruction span removed after an anti-debug anchor.
    pub const ANTI_DEBUG_SPAN: usize = 6;
    /// Name length beyond which an internal callee counts as a junk call.
    pub const JUNK_NAME_LEN: usize = 20;
    /// Internal call count above which the renamer leaves method names alone.
    pub const RENAMER_CALL_LIMIT: usize = 5;
    /// Method count above which the renamer leaves method names alone.
    pub const RENAMER_METHOD_LIMIT: usize = 10;
    /// XOR key applied to encrypted resources.
    pub const RESOURCE_XOR_KEY: u8 = 0x42;
    /// Minimum resource size considered for decryption.
    pub const MIN_ENCRYPTED_RESOURCE_LEN: usize = 100;
    /// Distinct byte values above which a resource counts as encrypted.
    pub const RESOURCE_ENTROPY_THRESHOLD: usize = 200;

    /// Fraction of 4-instruction windows that must match a dispatch shape.
    pub const VM_DISPATCH_WINDOW_RATIO: f64 = 0.30;
    /// Smallest method size that still counts as a handler.
    pub const VM_HANDLER_METHOD_MIN: usize = 5;
    /// Largest method size that still counts as a handler.
    pub const VM_HANDLER_METHOD_MAX: usize = 20;
    /// Call count below which a switch-bearing method counts as a handler.
    pub const VM_HANDLER_CALL_LIMIT: usize = 3;
    /// Conditional-branch fraction above which a method counts as a handler.
    pub const VM_HANDLER_BRANCH_RATIO: f64 = 0.50;
    /// Method count above which a type is examined for handler clustering.
    pub const VM_HANDLER_TYPE_METHOD_COUNT: usize = 50;
    /// Handler fraction above which a large type flags the module.
    pub const VM_HANDLER_TYPE_RATIO: f64 = 0.80;
    /// Complexity-score fraction above which a method counts as complex.
    pub const VM_COMPLEXITY_RATIO: f64 = 0.40;
    /// Complex-method fraction above which a type has advanced structure.
    pub const VM_COMPLEX_METHOD_RATIO: f64 = 0.60;
    /// Container-typed field fraction above which a type has advanced structure.
    pub const VM_CONTAINER_FIELD_RATIO: f64 = 0.40;
    /// Advanced-structure type fraction above which the module is flagged.
    pub const VM_TYPE_MODULE_RATIO: f64 = 0.10;
    /// Dispatch-instruction fraction above which the module is flagged.
    pub const VM_GLOBAL_DENSITY_RATIO: f64 = 0.15;
    /// Method count above which handler clustering marks a type for removal.
    pub const VM_REMOVAL_METHOD_COUNT: usize = 20;
    /// Handler fraction above which clustering marks a type for removal.
    pub const VM_REMOVAL_HANDLER_RATIO: f64 = 0.70;
    /// Methods smaller than this are skipped by the dispatch-window scan.
    pub const VM_MIN_METHOD_INSTRUCTIONS: usize = 10;
    /// Smallest body treated as a virtualization stub.
    pub const VM_STUB_MIN: usize = 3;
    /// Largest body treated as a virtualization stub.
    pub const VM_STUB_MAX: usize = 10;
}

bitflags! {
    /// Selects which protection-removal passes a run executes.
    ///
    /// One bit per pass, in catalog order. The composites group the families
    /// that are usually toggled together. Flags describe a single run and are
    /// never stored in the module being processed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProtectionFlags: u32 {
        /// Remove anti-tamper probe spans.
        const ANTI_TAMPER = 1 << 0;
        /// Remove anti-dump probe spans.
        const ANTI_DUMP = 1 << 1;
        /// Remove anti-debug probe spans.
        const ANTI_DEBUG = 1 << 2;
        /// Remove calls to planted anti-tooling junk methods.
        const ANTI_DE4DOT = 1 << 3;
        /// Remove watermark string literals.
        const WATERMARKS = 1 << 4;
        /// Remove redundant jumps and orphaned nops.
        const JUMP_CONTROL_FLOW = 1 << 5;
        /// Unflatten switch dispatch and simplify branches.
        const CONTROL_FLOW = 1 << 6;
        /// Inline constant-returning proxy methods.
        const PROXY_CONSTANTS = 1 << 7;
        /// Inline string-returning proxy methods.
        const PROXY_STRINGS = 1 << 8;
        /// Redirect forwarding proxy calls to their real targets.
        const PROXY_METHODS = 1 << 9;
        /// Fold `ldc; ldc; xor` confusion triples.
        const INTEGER_CONFUSION = 1 << 10;
        /// Fold constant arithmetic chains.
        const ARITHMETIC = 1 << 11;
        /// Decrypt statically-encrypted string literals.
        const ENCRYPTED_STRINGS = 1 << 12;
        /// Replace online-decryption literals with offline placeholders.
        const ONLINE_STRINGS = 1 << 13;
        /// Decrypt XOR-encrypted resources.
        const RESOURCE_ENCRYPTION = 1 << 14;
        /// Strip protection markers from resource names and payloads.
        const RESOURCE_PROTECTIONS = 1 << 15;
        /// Remove stack-noise pairs and unused locals.
        const STACK_CONFUSION = 1 << 16;
        /// Restore `ldftn`/`calli` pairs to direct calls.
        const CALLIS = 1 << 17;
        /// Restore empty or digit-only metadata names.
        const INVALID_METADATA = 1 << 18;
        /// Convert hoisted `local_*` static fields back to locals.
        const LOCAL_TO_FIELD = 1 << 19;
        /// Rename obfuscated symbols to readable placeholders.
        const RENAMER = 1 << 20;
        /// Token-qualified renaming of obfuscated data structures.
        const STRUCTURE_RECOVERY = 1 << 21;
        /// Remove junk methods, unused private fields and dead pairs.
        const JUNK_CODE = 1 << 22;
        /// Detect and remove virtualization machinery.
        const VIRTUAL_MACHINES = 1 << 23;
        /// Run registered extension passes.
        const EXTENSIONS = 1 << 24;

        /// The four anti-analysis probe families.
        const ANTI = Self::ANTI_TAMPER.bits()
            | Self::ANTI_DUMP.bits()
            | Self::ANTI_DEBUG.bits()
            | Self::ANTI_DE4DOT.bits();
        /// All proxy-resolution passes.
        const PROXIES = Self::PROXY_CONSTANTS.bits()
            | Self::PROXY_STRINGS.bits()
            | Self::PROXY_METHODS.bits();
        /// Every built-in pass; extension passes stay opt-in.
        const STANDARD = Self::ANTI.bits()
            | Self::WATERMARKS.bits()
            | Self::JUMP_CONTROL_FLOW.bits()
            | Self::CONTROL_FLOW.bits()
            | Self::PROXIES.bits()
            | Self::INTEGER_CONFUSION.bits()
            | Self::ARITHMETIC.bits()
            | Self::ENCRYPTED_STRINGS.bits()
            | Self::ONLINE_STRINGS.bits()
            | Self::RESOURCE_ENCRYPTION.bits()
            | Self::RESOURCE_PROTECTIONS.bits()
            | Self::STACK_CONFUSION.bits()
            | Self::CALLIS.bits()
            | Self::INVALID_METADATA.bits()
            | Self::LOCAL_TO_FIELD.bits()
            | Self::RENAMER.bits()
            | Self::STRUCTURE_RECOVERY.bits()
            | Self::JUNK_CODE.bits()
            | Self::VIRTUAL_MACHINES.bits();
    }
}

/// Thresholds for virtualization detection and removal.
///
/// The five detection signals and the removal heuristics are all ratio- or
/// count-based; this struct names every knob. Defaults come from
/// [`defaults`].
#[derive(Debug, Clone, PartialEq)]
pub struct VmThresholds {
    /// Fraction of 4-instruction windows that must match a dispatch shape
    /// for a method to count as a dispatch loop (default: 0.30).
    pub dispatch_window_ratio: f64,
    /// Inclusive lower bound on handler-shaped method size (default: 5).
    pub handler_method_min: usize,
    /// Inclusive upper bound on handler-shaped method size (default: 20).
    pub handler_method_max: usize,
    /// A switch-bearing method with fewer calls than this counts as a
    /// handler (default: 3).
    pub handler_call_limit: usize,
    /// Conditional-branch fraction above which a method counts as a handler
    /// (default: 0.50).
    pub handler_branch_ratio: f64,
    /// Types with more methods than this are examined for handler
    /// clustering (default: 50).
    pub handler_type_method_count: usize,
    /// Handler fraction above which a large type flags the module
    /// (default: 0.80).
    pub handler_type_ratio: f64,
    /// Complexity score fraction above which one method counts as complex
    /// (default: 0.40).
    pub complexity_ratio: f64,
    /// Complex-method fraction above which a type has advanced structure
    /// (default: 0.60).
    pub complex_method_ratio: f64,
    /// Container-typed field fraction above which a type has advanced
    /// structure (default: 0.40).
    pub container_field_ratio: f64,
    /// Advanced-structure type fraction above which the module is flagged
    /// (default: 0.10).
    pub vm_type_module_ratio: f64,
    /// Dispatch-instruction fraction above which the whole module is
    /// flagged (default: 0.15).
    pub global_density_ratio: f64,
    /// Method count above which handler clustering marks a type for
    /// removal (default: 20).
    pub removal_method_count: usize,
    /// Handler fraction above which clustering marks a type for removal
    /// (default: 0.70).
    pub removal_handler_ratio: f64,
    /// Methods smaller than this are skipped by the window scan
    /// (default: 10).
    pub min_method_instructions: usize,
    /// Inclusive lower bound on stub body size (default: 3).
    pub stub_min: usize,
    /// Inclusive upper bound on stub body size (default: 10).
    pub stub_max: usize,
}

impl Default for VmThresholds {
    fn default() -> Self {
        Self {
            dispatch_window_ratio: defaults::VM_DISPATCH_WINDOW_RATIO,
            handler_method_min: defaults::VM_HANDLER_METHOD_MIN,
            handler_method_max: defaults::VM_HANDLER_METHOD_MAX,
            handler_call_limit: defaults::VM_HANDLER_CALL_LIMIT,
            handler_branch_ratio: defaults::VM_HANDLER_BRANCH_RATIO,
            handler_type_method_count: defaults::VM_HANDLER_TYPE_METHOD_COUNT,
            handler_type_ratio: defaults::VM_HANDLER_TYPE_RATIO,
            complexity_ratio: defaults::VM_COMPLEXITY_RATIO,
            complex_method_ratio: defaults::VM_COMPLEX_METHOD_RATIO,
            container_field_ratio: defaults::VM_CONTAINER_FIELD_RATIO,
            vm_type_module_ratio: defaults::VM_TYPE_MODULE_RATIO,
            global_density_ratio: defaults::VM_GLOBAL_DENSITY_RATIO,
            removal_method_count: defaults::VM_REMOVAL_METHOD_COUNT,
            removal_handler_ratio: defaults::VM_REMOVAL_HANDLER_RATIO,
            min_method_instructions: defaults::VM_MIN_METHOD_INSTRUCTIONS,
            stub_min: defaults::VM_STUB_MIN,
            stub_max: defaults::VM_STUB_MAX,
        }
    }
}

/// Configuration for a protection-removal run.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// The passes this run executes.
    pub passes: ProtectionFlags,
    /// Virtualization detection and removal thresholds.
    pub vm: VmThresholds,
    /// Longest span removed after an anti-tamper anchor (default: 10).
    pub max_anti_tamper_span: usize,
    /// Longest span removed after an anti-dump anchor (default: 8).
    pub max_anti_dump_span: usize,
    /// Longest span removed after an anti-debug anchor (default: 6).
    pub max_anti_debug_span: usize,
    /// Name length beyond which an internal callee counts as a junk call
    /// (default: 20).
    pub junk_name_len: usize,
    /// Internal call count above which renaming leaves methods alone
    /// (default: 5).
    pub renamer_call_limit: usize,
    /// Method count above which renaming leaves methods alone (default: 10).
    pub renamer_method_limit: usize,
    /// XOR key applied when decrypting resources (default: 0x42).
    pub resource_xor_key: u8,
    /// Minimum resource size considered for decryption (default: 100).
    pub min_encrypted_resource_len: usize,
    /// Distinct byte values above which a resource counts as encrypted
    /// (default: 200).
    pub resource_entropy_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            passes: ProtectionFlags::STANDARD,
            vm: VmThresholds::default(),
            max_anti_tamper_span: defaults::ANTI_TAMPER_SPAN,
            max_anti_dump_span: defaults::ANTI_DUMP_SPAN,
            max_anti_debug_span: defaults::ANTI_DEBUG_SPAN,
            junk_name_len: defaults::JUNK_NAME_LEN,
            renamer_call_limit: defaults::RENAMER_CALL_LIMIT,
            renamer_method_limit: defaults::RENAMER_METHOD_LIMIT,
            resource_xor_key: defaults::RESOURCE_XOR_KEY,
            min_encrypted_resource_len: defaults::MIN_ENCRYPTED_RESOURCE_LEN,
            resource_entropy_threshold: defaults::RESOURCE_ENTROPY_THRESHOLD,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with default settings: every built-in pass,
    /// no extensions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a minimal configuration.
    ///
    /// Runs only the anti-analysis probe removal, watermark removal and
    /// jump cleanup; nothing that rewrites call graphs, names or resources.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            passes: ProtectionFlags::ANTI
                | ProtectionFlags::WATERMARKS
                | ProtectionFlags::JUMP_CONTROL_FLOW,
            ..Self::default()
        }
    }

    /// Creates an aggressive configuration.
    ///
    /// Runs every built-in pass plus any registered extension passes.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            passes: ProtectionFlags::all(),
            ..Self::default()
        }
    }

    /// Replaces the pass selection.
    #[must_use]
    pub fn with_passes(mut self, passes: ProtectionFlags) -> Self {
        self.passes = passes;
        self
    }

    /// Enables additional passes on top of the current selection.
    #[must_use]
    pub fn enable(mut self, passes: ProtectionFlags) -> Self {
        self.passes |= passes;
        self
    }

    /// Disables passes from the current selection.
    #[must_use]
    pub fn disable(mut self, passes: ProtectionFlags) -> Self {
        self.passes &= !passes;
        self
    }

    /// Replaces the virtualization thresholds.
    #[must_use]
    pub fn with_vm(mut self, vm: VmThresholds) -> Self {
        self.vm = vm;
        self
    }

    /// Sets the resource XOR key.
    #[must_use]
    pub fn with_resource_key(mut self, key: u8) -> Self {
        self.resource_xor_key = key;
        self
    }

    /// Checks the configuration for values that would make a heuristic
    /// meaningless.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_anti_tamper_span == 0 {
            return Err(Error::Config(
                "max_anti_tamper_span must be at least 1".to_string(),
            ));
        }
        if self.max_anti_dump_span == 0 {
            return Err(Error::Config(
                "max_anti_dump_span must be at least 1".to_string(),
            ));
        }
        if self.max_anti_debug_span == 0 {
            return Err(Error::Config(
                "max_anti_debug_span must be at least 1".to_string(),
            ));
        }
        if self.resource_entropy_threshold > 255 {
            return Err(Error::Config(
                "resource_entropy_threshold cannot exceed 255 distinct byte values".to_string(),
            ));
        }

        for (name, ratio) in [
            ("dispatch_window_ratio", self.vm.dispatch_window_ratio),
            ("handler_branch_ratio", self.vm.handler_branch_ratio),
            ("handler_type_ratio", self.vm.handler_type_ratio),
            ("complexity_ratio", self.vm.complexity_ratio),
            ("complex_method_ratio", self.vm.complex_method_ratio),
            ("container_field_ratio", self.vm.container_field_ratio),
            ("vm_type_module_ratio", self.vm.vm_type_module_ratio),
            ("global_density_ratio", self.vm.global_density_ratio),
            ("removal_handler_ratio", self.vm.removal_handler_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(Error::Config(format!(
                    "{} must be within (0, 1], got {}",
                    name, ratio
                )));
            }
        }

        if self.vm.handler_method_min > self.vm.handler_method_max {
            return Err(Error::Config(format!(
                "handler_method_min ({}) exceeds handler_method_max ({})",
                self.vm.handler_method_min, self.vm.handler_method_max
            )));
        }
        if self.vm.stub_min > self.vm.stub_max {
            return Err(Error::Config(format!(
                "stub_min ({}) exceeds stub_max ({})",
                self.vm.stub_min, self.vm.stub_max
            )));
        }

        Ok(())
    }
}
