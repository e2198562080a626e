//! Virtualization removal.
//!
//! Runs after the detector has flagged the module. Three phases:
//!
//! 1. delete every VM-flagged type, remembering for each deleted handler the
//!    first call it made to a non-VM method (the original implementation the
//!    handler was wrapping);
//! 2. rewrite virtualized stubs — small bodies that enter a deleted handler —
//!    either by splicing in the remembered original call or, when no original
//!    survives, by synthesizing a default-value return for the stub's
//!    declared type;
//! 3. a cleanup sweep over every surviving body: orphaned nops,
//!    branch-to-next, degenerate conditionals and unused locals, followed by
//!    integrity repair.

use std::collections::{HashMap, HashSet};

use crate::{
    config::VmThresholds,
    events::EventKind,
    flow, integrity,
    model::{
        Body, Instruction, MethodRef, Module, Opcode, Operand, Token, TypeDef, TypeSig,
    },
    passes::{stack, PassContext},
    vm::{detector, has_vm_signature},
};

/// What the removal accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalOutcome {
    /// VM types deleted.
    pub types_removed: usize,
    /// Virtualized stubs rewritten.
    pub stubs_restored: usize,
}

/// Marks a type for deletion: signature-named, clustered with handler-shaped
/// methods, or advanced interpreter structure.
#[must_use]
pub fn is_vm_type(type_def: &TypeDef, thresholds: &VmThresholds) -> bool {
    if has_vm_signature(&type_def.name) {
        return true;
    }
    if type_def.methods.len() > thresholds.removal_method_count
        && detector::handler_ratio(type_def, thresholds) > thresholds.removal_handler_ratio
    {
        return true;
    }
    detector::has_advanced_structure(type_def, thresholds)
}

/// Resolves the original method a handler was wrapping: the first call in its
/// body whose target is not itself VM machinery.
fn original_of_handler(module: &Module, body: &Body) -> Option<MethodRef> {
    for (_, instruction) in body.iter() {
        if !matches!(instruction.opcode, Opcode::Call | Opcode::CallVirt) {
            continue;
        }
        let Some(target) = instruction.operand.as_method() else {
            continue;
        };
        let vm_target = match target {
            MethodRef::Def(token) => module.method(*token).is_none_or(|method| {
                has_vm_signature(&method.name)
                    || module
                        .type_of_method(*token)
                        .is_some_and(|ty| has_vm_signature(&ty.name))
            }),
            MethodRef::External(external) => has_vm_signature(&external.name),
        };
        if !vm_target {
            return Some(target.clone());
        }
    }
    None
}

fn default_return_body(return_type: &TypeSig) -> Body {
    let mut body = Body::new();
    match return_type {
        TypeSig::Void => {}
        TypeSig::I4 => {
            body.push(Instruction::ldc_i4(0));
        }
        TypeSig::Str => {
            body.push(Instruction::ldstr(""));
        }
        _ => {
            body.push(Instruction::simple(Opcode::LdNull));
        }
    }
    body.push(Instruction::ret());
    body
}

fn is_stub_body(body: &Body, thresholds: &VmThresholds) -> bool {
    let len = body.len();
    len >= thresholds.stub_min
        && len <= thresholds.stub_max
        && body
            .last_id()
            .and_then(|id| body.get(id))
            .is_some_and(|i| i.opcode == Opcode::Ret)
}

/// Per-body cleanup after the machinery is gone.
fn cleanup_body(body: &mut Body) {
    flow::remove_nops(body);
    flow::remove_branches_to_next(body);

    // A conditional branch to the lexically next instruction decides nothing;
    // only the popped condition remains to account for.
    for id in body.ids().into_iter().rev() {
        let Some(instruction) = body.get(id) else {
            continue;
        };
        if !matches!(instruction.opcode, Opcode::BrTrue | Opcode::BrFalse) {
            continue;
        }
        let Some(target) = instruction.operand.as_target() else {
            continue;
        };
        if body.next_of(id) == Some(target) {
            if let Some(instruction) = body.get_mut(id) {
                instruction.opcode = Opcode::Pop;
                instruction.operand = Operand::None;
            }
        }
    }

    stack::compact_locals(body);
    integrity::repair_body(body);
}

/// Deletes VM types, restores stubs and sweeps the survivors.
pub fn remove_virtualization(module: &mut Module, ctx: &PassContext<'_>) -> RemovalOutcome {
    let thresholds = &ctx.config.vm;

    // Phase 1: decide what goes, and capture each doomed handler's original
    // call before the bodies disappear.
    let doomed: Vec<Token> = module
        .types
        .iter()
        .filter(|ty| is_vm_type(ty, thresholds))
        .map(|ty| ty.token)
        .collect();

    let mut removed_methods: HashSet<Token> = HashSet::new();
    let mut originals: HashMap<Token, MethodRef> = HashMap::new();
    for type_def in module.types.iter().filter(|ty| doomed.contains(&ty.token)) {
        for method in &type_def.methods {
            removed_methods.insert(method.token);
            if let Some(original) = method
                .body
                .as_ref()
                .and_then(|body| original_of_handler(module, body))
            {
                originals.insert(method.token, original);
            }
        }
    }

    let mut outcome = RemovalOutcome::default();
    module.types.retain(|type_def| {
        if doomed.contains(&type_def.token) {
            ctx.events
                .record(EventKind::TypeRemoved)
                .message(format!("VM type '{}' removed", type_def.full_name()));
            outcome.types_removed += 1;
            false
        } else {
            true
        }
    });

    // Phase 2: stubs that called into the deleted machinery.
    for type_def in &mut module.types {
        for method in &mut type_def.methods {
            let Some(body) = method.body.as_ref() else {
                continue;
            };
            if !is_stub_body(body, thresholds) {
                continue;
            }
            let handler_call = body.iter().find_map(|(id, instruction)| {
                if !matches!(instruction.opcode, Opcode::Call | Opcode::CallVirt) {
                    return None;
                }
                let target = instruction.operand.as_method().and_then(MethodRef::as_def)?;
                removed_methods.contains(&target).then_some((id, target))
            });
            let Some((call_id, handler)) = handler_call else {
                continue;
            };

            if let Some(original) = originals.get(&handler) {
                if let Some(call) = method.body.as_mut().and_then(|b| b.get_mut(call_id)) {
                    call.opcode = Opcode::Call;
                    call.operand = Operand::Method(original.clone());
                }
                ctx.events
                    .record(EventKind::StubRestored)
                    .method(method.token)
                    .message(format!(
                        "stub '{}' rewired to its original implementation",
                        method.name
                    ));
            } else {
                method.body = Some(default_return_body(&method.return_type));
                ctx.events
                    .record(EventKind::StubRestored)
                    .method(method.token)
                    .message(format!(
                        "stub '{}' replaced with a default {} return",
                        method.name, method.return_type
                    ));
            }
            outcome.stubs_restored += 1;
        }
    }

    // Phase 3.
    module.par_for_each_method_mut(|method| {
        if let Some(body) = method.body.as_mut() {
            cleanup_body(body);
        }
    });

    outcome
}
