//! Junk-code removal.
//!
//! The leftover debris of the other protections: planted methods whose body
//! is a bare `ret`, private fields nothing reads or writes, and dead
//! `pop`-then-filler instruction pairs. Method and field removal run against
//! module-wide usage scans completed before any mutation, so a symbol is only
//! deleted once it is provably unreferenced.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    events::EventKind,
    flow, integrity,
    model::{Body, MethodRef, Module, Opcode, Operand, Token},
    passes::{PassContext, ProtectionPass},
    Result,
};

/// Collects every internal method token referenced by any instruction.
fn referenced_methods(module: &Module) -> HashSet<Token> {
    module
        .methods()
        .filter_map(|method| method.body.as_ref())
        .flat_map(|body| body.iter())
        .filter_map(|(_, instruction)| {
            instruction.operand.as_method().and_then(MethodRef::as_def)
        })
        .collect()
}

/// Collects every field token referenced by any instruction.
fn referenced_fields(module: &Module) -> HashSet<Token> {
    module
        .methods()
        .filter_map(|method| method.body.as_ref())
        .flat_map(|body| body.iter())
        .filter_map(|(_, instruction)| instruction.operand.as_field())
        .collect()
}

fn is_empty_body(body: &Body) -> bool {
    body.len() == 1
        && body
            .iter()
            .next()
            .is_some_and(|(_, instruction)| instruction.opcode == Opcode::Ret)
}

/// Removes adjacent `pop; ldnull` and `pop; ldc.i4 0` filler pairs.
fn remove_dead_pairs(body: &mut Body) -> usize {
    let referenced = flow::branch_target_set(body);
    let order = body.ids();
    let mut removed = 0;

    let mut position = 0;
    while position + 1 < order.len() {
        let (pop_id, filler_id) = (order[position], order[position + 1]);
        let (Some(pop), Some(filler)) = (body.get(pop_id), body.get(filler_id)) else {
            position += 1;
            continue;
        };
        if referenced.contains(&pop_id) || referenced.contains(&filler_id) {
            position += 1;
            continue;
        }

        let is_filler = filler.opcode == Opcode::LdNull
            || (filler.opcode == Opcode::LdcI4 && filler.operand.as_int32() == Some(0));
        if pop.opcode == Opcode::Pop && is_filler {
            body.remove(pop_id);
            body.remove(filler_id);
            removed += 1;
            position += 2;
        } else {
            position += 1;
        }
    }
    removed
}

/// Removes planted empty methods, unused private fields and dead pairs.
pub struct JunkCodePass;

impl ProtectionPass for JunkCodePass {
    fn name(&self) -> &'static str {
        "Junk Code Removal"
    }

    fn description(&self) -> &'static str {
        "Remove empty junk methods, unused private fields and dead instruction pairs"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let called = referenced_methods(module);
        let entry_point = module.entry_point;
        let mut methods_removed = 0;
        for type_def in &mut module.types {
            type_def.methods.retain(|method| {
                let junk = method
                    .body
                    .as_ref()
                    .is_some_and(is_empty_body)
                    && !method.is_constructor()
                    && Some(method.token) != entry_point
                    && !called.contains(&method.token);
                if junk {
                    ctx.events
                        .record(EventKind::MethodRemoved)
                        .method(method.token)
                        .message(format!("empty method '{}' removed", method.name));
                    methods_removed += 1;
                }
                !junk
            });
        }

        let used_fields = referenced_fields(module);
        let mut fields_removed = 0;
        for type_def in &mut module.types {
            type_def.fields.retain(|field| {
                let junk = field.is_private() && !used_fields.contains(&field.token);
                if junk {
                    ctx.events
                        .record(EventKind::FieldRemoved)
                        .message(format!("unused field '{}' removed", field.name));
                    fields_removed += 1;
                }
                !junk
            });
        }

        let pairs_removed = AtomicUsize::new(0);
        module.par_for_each_method_mut(|method| {
            let token = method.token;
            let Some(body) = method.body.as_mut() else {
                return;
            };
            let pairs = remove_dead_pairs(body);
            let branches = flow::remove_branches_to_next(body);
            if pairs + branches > 0 {
                integrity::repair_body(body);
                pairs_removed.fetch_add(pairs + branches, Ordering::Relaxed);
                if pairs > 0 {
                    ctx.events
                        .record(EventKind::InstructionRemoved)
                        .method(token)
                        .message(format!("{pairs} dead pair(s) removed"));
                }
            }
        });

        let pairs = pairs_removed.load(Ordering::Relaxed);
        let total = methods_removed + fields_removed + pairs;
        if total > 0 {
            ctx.logger.info(&format!(
                "Removed {methods_removed} method(s), {fields_removed} field(s), {pairs} dead instruction(s)"
            ));
        }
        Ok(total > 0)
    }
}
