//! Virtualization detection and removal.
//!
//! Code virtualization replaces method bodies with bytecode for a custom
//! interpreter embedded in the module: a dispatch loop, a table of handler
//! methods and a stub per virtualized method that enters the interpreter.
//! [`detector`] scores a module against five independent signals; any one of
//! them flags the module. [`removal`] then deletes the interpreter machinery
//! and rewrites the entry stubs back into direct calls where the original
//! target can still be recovered, falling back to a default-value return
//! where it cannot.

use crate::{
    model::Module,
    passes::{PassContext, ProtectionPass},
    Result,
};

pub mod detector;
pub mod removal;

/// Name fragments that mark virtualization machinery.
///
/// Matched as case-sensitive substrings against type, method and field names.
pub const VM_NAME_SIGNATURES: [&str; 13] = [
    "VM_",
    "Virtual",
    "Handler",
    "Opcode",
    "Context",
    "Stack",
    "Interpreter",
    "Execute",
    "Dispatch",
    "Runtime",
    "Engine",
    "Machine",
    "Processor",
];

/// Returns true if a symbol name carries a virtualization signature.
#[must_use]
pub fn has_vm_signature(name: &str) -> bool {
    VM_NAME_SIGNATURES
        .iter()
        .any(|signature| name.contains(signature))
}

/// What the detector found, one flag or count per signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmReport {
    /// A type, method or field name carries a signature fragment.
    pub name_signature: bool,
    /// Methods whose instruction windows match a dispatch-loop shape.
    pub dispatch_methods: usize,
    /// Large types dominated by handler-shaped methods.
    pub handler_types: usize,
    /// Types with advanced interpreter structure (complex methods or
    /// container-heavy field layouts), when they exceed the module ratio.
    pub advanced_types: usize,
    /// Module-wide dispatch-instruction density crossed the threshold.
    pub global_density: bool,
}

impl VmReport {
    /// Returns true when any signal fired.
    #[must_use]
    pub fn detected(&self) -> bool {
        self.name_signature
            || self.dispatch_methods > 0
            || self.handler_types > 0
            || self.advanced_types > 0
            || self.global_density
    }

    /// Human-readable list of the signals that fired.
    #[must_use]
    pub fn signals(&self) -> Vec<String> {
        let mut fired = Vec::new();
        if self.name_signature {
            fired.push("name signatures".to_string());
        }
        if self.dispatch_methods > 0 {
            fired.push(format!("{} dispatch method(s)", self.dispatch_methods));
        }
        if self.handler_types > 0 {
            fired.push(format!("{} handler-heavy type(s)", self.handler_types));
        }
        if self.advanced_types > 0 {
            fired.push(format!("{} advanced-structure type(s)", self.advanced_types));
        }
        if self.global_density {
            fired.push("global dispatch density".to_string());
        }
        fired
    }
}

/// Detects and removes virtualization machinery.
pub struct VirtualMachinePass;

impl ProtectionPass for VirtualMachinePass {
    fn name(&self) -> &'static str {
        "Virtual Machine Removal"
    }

    fn description(&self) -> &'static str {
        "Detect interpreter machinery, delete it and restore virtualized stubs"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let report = detector::detect(module, &ctx.config.vm);
        if !report.detected() {
            return Ok(false);
        }
        ctx.logger.info(&format!(
            "Virtualization detected: {}",
            report.signals().join(", ")
        ));

        let outcome = removal::remove_virtualization(module, ctx);
        ctx.logger.info(&format!(
            "Removed {} VM type(s), restored {} stub(s)",
            outcome.types_removed, outcome.stubs_restored
        ));
        Ok(outcome.types_removed > 0 || outcome.stubs_restored > 0)
    }
}
