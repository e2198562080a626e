//! Stack-noise and local-variable cleanup.
//!
//! Stack confusion plants pairs that shuffle the evaluation stack without
//! computing anything (`dup; pop`, `ldloc N; stloc N`) and pads the local
//! signature with slots nothing reads. Both are undone here: noise pairs are
//! removed when neither half is a branch target or handler marker, then
//! locals that no surviving instruction touches are dropped and the
//! remaining slots renumbered.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    events::EventKind,
    flow, integrity,
    model::{Body, Module, Opcode, Operand},
    passes::{PassContext, ProtectionPass},
    Result,
};

/// Removes `dup; pop` and same-slot `ldloc; stloc` pairs.
///
/// A pair is only removed when neither instruction is referenced by a branch
/// or handler marker. Returns the number of pairs removed.
fn remove_noise_pairs(body: &mut Body) -> usize {
    let referenced = flow::branch_target_set(body);
    let order = body.ids();
    let mut removed = 0;

    let mut position = 0;
    while position + 1 < order.len() {
        let (first_id, second_id) = (order[position], order[position + 1]);
        let (Some(first), Some(second)) = (body.get(first_id), body.get(second_id)) else {
            position += 1;
            continue;
        };
        if referenced.contains(&first_id) || referenced.contains(&second_id) {
            position += 1;
            continue;
        }

        let dup_pop = first.opcode == Opcode::Dup && second.opcode == Opcode::Pop;
        let same_slot = first.opcode == Opcode::LdLoc
            && second.opcode == Opcode::StLoc
            && first.operand.as_local() == second.operand.as_local();

        if dup_pop || same_slot {
            body.remove(first_id);
            body.remove(second_id);
            removed += 1;
            position += 2;
        } else {
            position += 1;
        }
    }
    removed
}

/// Drops local slots nothing references and renumbers the survivors.
///
/// Bodies with exception handlers are left untouched: handler regions may
/// carry liveness the operand scan cannot see. The sweep also aborts when it
/// would remove more than half the signature, which in practice means the
/// method computes through means this model does not track.
///
/// Returns the number of slots removed.
pub(crate) fn compact_locals(body: &mut Body) -> usize {
    if !body.handlers.is_empty() || body.locals.is_empty() {
        return 0;
    }

    let mut used = vec![false; body.locals.len()];
    for (_, instruction) in body.iter() {
        if let Some(index) = instruction.operand.as_local() {
            if let Some(slot) = used.get_mut(index as usize) {
                *slot = true;
            }
        }
    }

    let unused = used.iter().filter(|in_use| !**in_use).count();
    if unused == 0 || unused * 2 > body.locals.len() {
        return 0;
    }

    let mut remap = vec![0u16; body.locals.len()];
    let mut next = 0u16;
    for (index, in_use) in used.iter().enumerate() {
        if *in_use {
            remap[index] = next;
            next += 1;
        }
    }

    let mut index = 0;
    body.locals.retain(|_| {
        let keep = used[index];
        index += 1;
        keep
    });

    for id in body.ids() {
        let Some(instruction) = body.get_mut(id) else {
            continue;
        };
        if let Operand::Local(slot) = instruction.operand {
            instruction.operand = Operand::Local(remap[slot as usize]);
        }
    }
    unused
}

/// Removes stack-noise pairs and compacts unused locals.
pub struct StackConfusionPass;

impl ProtectionPass for StackConfusionPass {
    fn name(&self) -> &'static str {
        "Stack Confusion"
    }

    fn description(&self) -> &'static str {
        "Remove stack-shuffle noise pairs and unused local slots"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let pairs_removed = AtomicUsize::new(0);
        let locals_removed = AtomicUsize::new(0);
        module.par_for_each_method_mut(|method| {
            let token = method.token;
            let Some(body) = method.body.as_mut() else {
                return;
            };

            let pairs = remove_noise_pairs(body);
            if pairs > 0 {
                integrity::repair_body(body);
                ctx.events
                    .record(EventKind::InstructionRemoved)
                    .method(token)
                    .message(format!("{pairs} stack-noise pair(s) removed"));
                pairs_removed.fetch_add(pairs, Ordering::Relaxed);
            }

            let locals = compact_locals(body);
            if locals > 0 {
                ctx.events
                    .record(EventKind::LocalsCompacted)
                    .method(token)
                    .message(format!("{locals} unused local(s) removed"));
                locals_removed.fetch_add(locals, Ordering::Relaxed);
            }
        });

        let pairs = pairs_removed.load(Ordering::Relaxed);
        let locals = locals_removed.load(Ordering::Relaxed);
        if pairs + locals > 0 {
            ctx.logger.info(&format!(
                "Removed {pairs} stack-noise pair(s) and {locals} unused local(s)"
            ));
        }
        Ok(pairs + locals > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExceptionHandler, Instruction, Local, TypeSig};
    use crate::test::{body_from, create_method, create_module, TestRun};

    #[test]
    fn test_dup_pop_pair_removed() {
        let mut module = create_module(vec![create_method(
            1,
            "Main",
            vec![
                Instruction::ldc_i4(1),
                Instruction::dup(),
                Instruction::pop(),
                Instruction::pop(),
                Instruction::ret(),
            ],
        )]);
        let run = TestRun::new();
        assert!(StackConfusionPass.run(&mut module, &run.ctx()).unwrap());

        let body = module.types[0].methods[0].body.as_ref().unwrap();
        let opcodes: Vec<Opcode> = body.iter().map(|(_, i)| i.opcode).collect();
        assert_eq!(opcodes, vec![Opcode::LdcI4, Opcode::Pop, Opcode::Ret]);
    }

    #[test]
    fn test_same_slot_load_store_removed() {
        let mut body = body_from(vec![
            Instruction::ldloc(0),
            Instruction::stloc(0),
            Instruction::ldloc(0),
            Instruction::ret(),
        ]);
        body.locals.push(Local::new(TypeSig::I4));
        assert_eq!(remove_noise_pairs(&mut body), 1);
        let opcodes: Vec<Opcode> = body.iter().map(|(_, i)| i.opcode).collect();
        assert_eq!(opcodes, vec![Opcode::LdLoc, Opcode::Ret]);
    }

    #[test]
    fn test_cross_slot_load_store_kept() {
        let mut body = body_from(vec![
            Instruction::ldloc(0),
            Instruction::stloc(1),
            Instruction::ret(),
        ]);
        body.locals.push(Local::new(TypeSig::I4));
        body.locals.push(Local::new(TypeSig::I4));
        assert_eq!(remove_noise_pairs(&mut body), 0);
        assert_eq!(body.len(), 3);
    }

    #[test]
    fn test_targeted_pair_kept() {
        let mut body = Body::new();
        body.push(Instruction::ldc_i4(1));
        let dup = body.push(Instruction::dup());
        body.push(Instruction::pop());
        body.push(Instruction::pop());
        let _branch = body.push(Instruction::br(dup));
        body.push(Instruction::ret());

        assert_eq!(remove_noise_pairs(&mut body), 0);
        assert!(body.contains(dup));
    }

    #[test]
    fn test_unused_locals_compacted_and_remapped() {
        let mut body = body_from(vec![
            Instruction::ldc_i4(5),
            Instruction::stloc(2),
            Instruction::ldloc(2),
            Instruction::pop(),
            Instruction::ret(),
        ]);
        body.locals.push(Local::new(TypeSig::I4));
        body.locals.push(Local::new(TypeSig::Str));
        body.locals.push(Local::new(TypeSig::I4));

        // Slot 2 is the only one used; dropping 2 of 3 would exceed the
        // half-signature guard, so pad usage with slot 0.
        if let Some(instruction) = body.get_mut(body.id_at(3).unwrap()) {
            instruction.opcode = Opcode::StLoc;
            instruction.operand = Operand::Local(0);
        }

        assert_eq!(compact_locals(&mut body), 1);
        assert_eq!(body.locals.len(), 2);
        let remapped: Vec<u16> = body
            .iter()
            .filter_map(|(_, i)| i.operand.as_local())
            .collect();
        assert_eq!(remapped, vec![1, 1, 0]);
    }

    #[test]
    fn test_compaction_aborts_past_half() {
        let mut body = body_from(vec![
            Instruction::ldloc(0),
            Instruction::pop(),
            Instruction::ret(),
        ]);
        for _ in 0..4 {
            body.locals.push(Local::new(TypeSig::I4));
        }
        assert_eq!(compact_locals(&mut body), 0);
        assert_eq!(body.locals.len(), 4);
    }

    #[test]
    fn test_compaction_skips_handler_bodies() {
        let mut body = body_from(vec![
            Instruction::nop(),
            Instruction::nop(),
            Instruction::pop(),
            Instruction::ret(),
        ]);
        body.locals.push(Local::new(TypeSig::I4));
        body.locals.push(Local::new(TypeSig::I4));
        let ids = body.ids();
        body.handlers.push(ExceptionHandler::try_catch(
            ids[0],
            ids[1],
            ids[2],
            ids[3],
            TypeSig::Object,
        ));

        assert_eq!(compact_locals(&mut body), 0);
        assert_eq!(body.locals.len(), 2);
    }
}
