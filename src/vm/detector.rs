//! Virtualization detection signals.
//!
//! Five independent signals, each sufficient on its own; thresholds come from
//! [`VmThresholds`] so a caller can tighten or relax the heuristics without
//! touching the scans. Everything here is read-only over the module.

use crate::{
    config::VmThresholds,
    model::{Body, MethodRef, Module, Opcode, TypeDef, TypeSig},
    vm::{has_vm_signature, VmReport},
};

/// The 4-instruction opcode windows a dispatch loop leaves behind: state
/// fetch, interpreter step and program-counter advance.
const DISPATCH_WINDOWS: [[Opcode; 4]; 3] = [
    [Opcode::LdSFld, Opcode::LdArg, Opcode::Call, Opcode::StSFld],
    [Opcode::LdLoc, Opcode::LdcI4, Opcode::Add, Opcode::StLoc],
    [Opcode::Switch, Opcode::LdLoc, Opcode::LdcI4, Opcode::Add],
];

/// Container shapes an interpreter keeps its state in.
const CONTAINER_TYPE_MARKERS: [&str; 3] = ["Dictionary", "Stack", "Queue"];

fn call_count(body: &Body) -> usize {
    body.iter()
        .filter(|(_, i)| matches!(i.opcode, Opcode::Call | Opcode::CallVirt))
        .count()
}

fn conditional_branch_count(body: &Body) -> usize {
    body.iter()
        .filter(|(_, i)| i.opcode.is_conditional_branch())
        .count()
}

fn has_switch(body: &Body) -> bool {
    body.iter().any(|(_, i)| i.opcode == Opcode::Switch)
}

/// Signal 2: a body dominated by dispatch-shaped instruction windows.
#[must_use]
pub fn is_dispatch_method(body: &Body, thresholds: &VmThresholds) -> bool {
    let opcodes: Vec<Opcode> = body.iter().map(|(_, i)| i.opcode).collect();
    if opcodes.len() < thresholds.min_method_instructions {
        return false;
    }

    let windows = opcodes.len() - 3;
    let matching = opcodes
        .windows(4)
        .filter(|window| DISPATCH_WINDOWS.iter().any(|shape| window == shape))
        .count();
    matching as f64 > thresholds.dispatch_window_ratio * windows as f64
}

/// The handler shape: a small method that either switches with almost no
/// calls or is mostly conditional branches.
#[must_use]
pub fn is_handler_shaped(body: &Body, thresholds: &VmThresholds) -> bool {
    let len = body.len();
    if len < thresholds.handler_method_min || len > thresholds.handler_method_max {
        return false;
    }
    if has_switch(body) && call_count(body) < thresholds.handler_call_limit {
        return true;
    }
    conditional_branch_count(body) as f64 > thresholds.handler_branch_ratio * len as f64
}

/// Fraction of a type's methods that are handler shaped.
#[must_use]
pub fn handler_ratio(type_def: &TypeDef, thresholds: &VmThresholds) -> f64 {
    if type_def.methods.is_empty() {
        return 0.0;
    }
    let handlers = type_def
        .methods
        .iter()
        .filter_map(|m| m.body.as_ref())
        .filter(|body| is_handler_shaped(body, thresholds))
        .count();
    handlers as f64 / type_def.methods.len() as f64
}

/// Weighted complexity of a body: switches weigh 3, conditional branches 2,
/// calls 1.
#[must_use]
pub fn complexity_score(body: &Body) -> usize {
    body.iter()
        .map(|(_, i)| match i.opcode {
            Opcode::Switch => 3,
            _ if i.opcode.is_conditional_branch() => 2,
            Opcode::Call | Opcode::CallVirt | Opcode::CallI | Opcode::NewObj => 1,
            _ => 0,
        })
        .sum()
}

fn is_complex_method(body: &Body, thresholds: &VmThresholds) -> bool {
    !body.is_empty()
        && complexity_score(body) as f64 > thresholds.complexity_ratio * body.len() as f64
}

fn is_container_field(sig: &TypeSig) -> bool {
    match sig {
        TypeSig::Array(_) => true,
        TypeSig::Named(name) => CONTAINER_TYPE_MARKERS
            .iter()
            .any(|marker| name.contains(marker)),
        _ => false,
    }
}

/// Signal 4: a type whose methods are mostly complex or whose field layout is
/// container heavy.
#[must_use]
pub fn has_advanced_structure(type_def: &TypeDef, thresholds: &VmThresholds) -> bool {
    if !type_def.methods.is_empty() {
        let complex = type_def
            .methods
            .iter()
            .filter_map(|m| m.body.as_ref())
            .filter(|body| is_complex_method(body, thresholds))
            .count();
        if complex as f64 > thresholds.complex_method_ratio * type_def.methods.len() as f64 {
            return true;
        }
    }
    if !type_def.fields.is_empty() {
        let containers = type_def
            .fields
            .iter()
            .filter(|f| is_container_field(&f.sig))
            .count();
        if containers as f64 > thresholds.container_field_ratio * type_def.fields.len() as f64 {
            return true;
        }
    }
    false
}

fn module_has_name_signature(module: &Module) -> bool {
    module.types.iter().any(|type_def| {
        has_vm_signature(&type_def.name)
            || type_def.methods.iter().any(|m| has_vm_signature(&m.name))
            || type_def.fields.iter().any(|f| has_vm_signature(&f.name))
    })
}

/// Signal 5: fraction of all instructions that are dispatch-flavored —
/// `switch`, `calli`, or calls to VM-named internal methods.
fn global_dispatch_density(module: &Module) -> f64 {
    let mut total = 0usize;
    let mut dispatch = 0usize;
    for method in module.methods() {
        let Some(body) = method.body.as_ref() else {
            continue;
        };
        for (_, instruction) in body.iter() {
            total += 1;
            match instruction.opcode {
                Opcode::Switch | Opcode::CallI => dispatch += 1,
                Opcode::Call | Opcode::CallVirt => {
                    let vm_named = match instruction.operand.as_method() {
                        Some(MethodRef::Def(token)) => module
                            .method(*token)
                            .is_some_and(|target| has_vm_signature(&target.name)),
                        Some(MethodRef::External(external)) => has_vm_signature(&external.name),
                        None => false,
                    };
                    if vm_named {
                        dispatch += 1;
                    }
                }
                _ => {}
            }
        }
    }
    if total == 0 {
        0.0
    } else {
        dispatch as f64 / total as f64
    }
}

/// Scores the module against all five signals.
#[must_use]
pub fn detect(module: &Module, thresholds: &VmThresholds) -> VmReport {
    let dispatch_methods = module
        .methods()
        .filter_map(|m| m.body.as_ref())
        .filter(|body| is_dispatch_method(body, thresholds))
        .count();

    let handler_types = module
        .types
        .iter()
        .filter(|type_def| {
            type_def.methods.len() > thresholds.handler_type_method_count
                && handler_ratio(type_def, thresholds) > thresholds.handler_type_ratio
        })
        .count();

    let advanced = module
        .types
        .iter()
        .filter(|type_def| has_advanced_structure(type_def, thresholds))
        .count();
    let advanced_types = if !module.types.is_empty()
        && advanced as f64 > thresholds.vm_type_module_ratio * module.types.len() as f64
    {
        advanced
    } else {
        0
    };

    VmReport {
        name_signature: module_has_name_signature(module),
        dispatch_methods,
        handler_types,
        advanced_types,
        global_density: global_dispatch_density(module) > thresholds.global_density_ratio,
    }
}
