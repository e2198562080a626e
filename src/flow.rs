//! Control-flow utilities shared by the passes.
//!
//! Everything here operates on a single [`Body`]. The functions are the
//! building blocks the control-flow passes and the engine's finalization
//! phase compose: reachability, unreachable-code removal, branch folding and
//! the small cleanups (branch-to-next, orphaned nops) that most passes want
//! to run after editing a body.
//!
//! None of these functions run reference integrity repair themselves; a
//! caller that removes instructions is expected to follow up with
//! [`crate::integrity::repair_body`] once its edits are complete.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::{Body, FlowControl, InstrId, Opcode, Operand};

/// Computes the set of instructions reachable from the method entry and from
/// every handler entry.
///
/// Successors follow the opcode's flow: fall-through unless the instruction
/// branches unconditionally, returns or throws, plus every branch and switch
/// target that still resolves to a live instruction.
#[must_use]
pub fn reachable_set(body: &Body) -> HashSet<InstrId> {
    let order = body.ids();
    let positions: HashMap<InstrId, usize> = order
        .iter()
        .enumerate()
        .map(|(position, id)| (*id, position))
        .collect();

    let mut reached = HashSet::new();
    let mut worklist = VecDeque::new();

    let mut seed = |id: Option<InstrId>, worklist: &mut VecDeque<InstrId>| {
        if let Some(id) = id {
            if body.contains(id) {
                worklist.push_back(id);
            }
        }
    };

    seed(body.first_id(), &mut worklist);
    for handler in &body.handlers {
        seed(handler.try_start, &mut worklist);
        seed(handler.handler_start, &mut worklist);
        seed(handler.filter_start, &mut worklist);
    }

    while let Some(id) = worklist.pop_front() {
        if !reached.insert(id) {
            continue;
        }
        let Some(instruction) = body.get(id) else {
            continue;
        };

        let flow = instruction.opcode.flow();
        if !matches!(flow, FlowControl::Branch | FlowControl::Return | FlowControl::Throw) {
            if let Some(position) = positions.get(&id) {
                if let Some(next) = order.get(position + 1) {
                    if body.contains(*next) {
                        worklist.push_back(*next);
                    }
                }
            }
        }

        match &instruction.operand {
            Operand::Target(target) => {
                if body.contains(*target) {
                    worklist.push_back(*target);
                }
            }
            Operand::Targets(targets) => {
                for target in targets {
                    if body.contains(*target) {
                        worklist.push_back(*target);
                    }
                }
            }
            _ => {}
        }
    }

    reached
}

/// Removes every instruction not in the reachable set.
///
/// Returns the number of instructions removed. Branch operands referencing
/// removed instructions are left dangling for integrity repair.
pub fn eliminate_dead_code(body: &mut Body) -> usize {
    let reached = reachable_set(body);
    let dead: Vec<InstrId> = body
        .ids()
        .into_iter()
        .filter(|id| !reached.contains(id))
        .collect();

    let mut removed = 0;
    for id in dead.into_iter().rev() {
        if body.remove(id).is_some() {
            removed += 1;
        }
    }
    removed
}

/// Folds branches until a fixed point is reached.
///
/// Two rewrites run alternately:
/// - an unconditional branch targeting another unconditional branch is
///   redirected to the final destination;
/// - a `brtrue`/`brfalse` immediately preceded by `ldc.i4` is decided
///   statically: if taken, the constant push becomes `br target` and the
///   conditional is removed, otherwise both are removed.
///
/// Returns the number of rewrites performed.
pub fn simplify_branches(body: &mut Body) -> usize {
    let mut total = 0;
    loop {
        let mut changed = false;

        // Branch-to-branch coalescing.
        for id in body.ids() {
            let Some(instruction) = body.get(id) else {
                continue;
            };
            if instruction.opcode != Opcode::Br {
                continue;
            }
            let Some(target) = instruction.operand.as_target() else {
                continue;
            };
            let Some(target_instruction) = body.get(target) else {
                continue;
            };
            if target_instruction.opcode != Opcode::Br {
                continue;
            }
            let Some(final_target) = target_instruction.operand.as_target() else {
                continue;
            };
            if final_target == target {
                continue;
            }
            if let Some(instruction) = body.get_mut(id) {
                instruction.operand = Operand::Target(final_target);
                changed = true;
                total += 1;
            }
        }

        // Constant-conditional folding.
        let order = body.ids();
        for position in (1..order.len()).rev() {
            let branch_id = order[position];
            let constant_id = order[position - 1];
            let (Some(branch), Some(constant)) = (body.get(branch_id), body.get(constant_id))
            else {
                continue;
            };
            if !matches!(branch.opcode, Opcode::BrTrue | Opcode::BrFalse) {
                continue;
            }
            if constant.opcode != Opcode::LdcI4 {
                continue;
            }
            let (Some(target), Some(value)) =
                (branch.operand.as_target(), constant.operand.as_int32())
            else {
                continue;
            };

            let taken = (value != 0) == (branch.opcode == Opcode::BrTrue);
            if taken {
                if let Some(constant) = body.get_mut(constant_id) {
                    constant.opcode = Opcode::Br;
                    constant.operand = Operand::Target(target);
                }
                body.remove(branch_id);
            } else {
                body.remove(branch_id);
                body.remove(constant_id);
            }
            changed = true;
            total += 1;
        }

        if !changed {
            return total;
        }
    }
}

/// Removes unconditional branches that target the lexically next instruction.
///
/// Runs back-to-front so that chains of such branches collapse in one sweep.
/// Returns the number of branches removed.
pub fn remove_branches_to_next(body: &mut Body) -> usize {
    let mut removed = 0;
    for id in body.ids().into_iter().rev() {
        let Some(instruction) = body.get(id) else {
            continue;
        };
        if instruction.opcode != Opcode::Br {
            continue;
        }
        let Some(target) = instruction.operand.as_target() else {
            continue;
        };
        if body.next_of(id) == Some(target) && body.remove(id).is_some() {
            removed += 1;
        }
    }
    removed
}

/// Removes `nop` instructions that nothing references.
///
/// A nop survives when it is a branch or switch target or marks a handler
/// boundary; removing those would change semantics or damage handler regions.
/// Returns the number of nops removed.
pub fn remove_nops(body: &mut Body) -> usize {
    let referenced = branch_target_set(body);
    let mut removed = 0;
    for id in body.ids().into_iter().rev() {
        let Some(instruction) = body.get(id) else {
            continue;
        };
        if instruction.is_nop() && !referenced.contains(&id) && body.remove(id).is_some() {
            removed += 1;
        }
    }
    removed
}

/// Collects every handle referenced by a branch or switch operand or by an
/// exception-handler marker.
#[must_use]
pub fn branch_target_set(body: &Body) -> HashSet<InstrId> {
    let mut referenced = HashSet::new();
    for (_, instruction) in body.iter() {
        match &instruction.operand {
            Operand::Target(target) => {
                referenced.insert(*target);
            }
            Operand::Targets(targets) => {
                referenced.extend(targets.iter().copied());
            }
            _ => {}
        }
    }
    for handler in &body.handlers {
        referenced.extend(handler.marker_ids());
    }
    referenced
}
