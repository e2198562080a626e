//! Control-flow cleanup passes.
//!
//! Two layers of control-flow obfuscation come apart here:
//!
//! - [`JumpControlFlowPass`] strips the cheap noise: unconditional branches
//!   to the lexically next instruction and nops that nothing references.
//! - [`ControlFlowPass`] undoes switch-based flattening. Each `switch` is
//!   rewritten into an explicit comparison chain,
//!
//! ```text
//! switch [t0, t1, t2]   →   dup; ldc.i4 0; beq t0
//!                           dup; ldc.i4 1; beq t1
//!                           dup; ldc.i4 2; beq t2
//! ```
//!
//!   after which branch folding and dead-code elimination shake out the
//!   dispatcher scaffolding the flattener left behind.

use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;

use crate::{
    events::EventKind,
    flow, integrity,
    model::{Body, Instruction, Module, Opcode, Token},
    passes::{PassContext, ProtectionPass},
    Result,
};

/// Removes redundant jumps and orphaned nops.
pub struct JumpControlFlowPass;

impl ProtectionPass for JumpControlFlowPass {
    fn name(&self) -> &'static str {
        "Jump Control Flow"
    }

    fn description(&self) -> &'static str {
        "Remove branches to the next instruction and unreferenced nops"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let cleaned = AtomicUsize::new(0);
        module.par_for_each_method_mut(|method| {
            let token = method.token;
            let Some(body) = method.body.as_mut() else {
                return;
            };
            let branches = flow::remove_branches_to_next(body);
            let nops = flow::remove_nops(body);
            if branches + nops == 0 {
                return;
            }
            integrity::repair_body(body);
            if branches > 0 {
                ctx.events
                    .record(EventKind::BranchSimplified)
                    .method(token)
                    .message(format!("{branches} jump(s) to the next instruction removed"));
            }
            if nops > 0 {
                ctx.events
                    .record(EventKind::InstructionRemoved)
                    .method(token)
                    .message(format!("{nops} orphaned nop(s) removed"));
            }
            cleaned.fetch_add(branches + nops, Ordering::Relaxed);
        });

        let total = cleaned.load(Ordering::Relaxed);
        if total > 0 {
            ctx.logger
                .info(&format!("Removed {total} redundant jump instruction(s)"));
        }
        Ok(total > 0)
    }
}

/// Unflattens switch dispatch and simplifies the remaining branches.
pub struct ControlFlowPass;

impl ControlFlowPass {
    /// Rewrites every switch in the body into a `dup; ldc.i4 k; beq` chain.
    ///
    /// Returns the number of switches unflattened.
    fn unflatten_switches(body: &mut Body, token: Token, ctx: &PassContext<'_>) -> Result<usize> {
        let mut unflattened = 0;
        for id in body.ids() {
            let Some(instruction) = body.get(id) else {
                continue;
            };
            if instruction.opcode != Opcode::Switch {
                continue;
            }
            let Some(targets) = instruction.operand.as_targets() else {
                continue;
            };
            let targets = targets.to_vec();
            let position = body.position_of(id).unwrap_or(0);

            for (case, target) in targets.iter().enumerate() {
                body.insert_before(id, Instruction::dup())?;
                body.insert_before(id, Instruction::ldc_i4(case as i32))?;
                body.insert_before(id, Instruction::beq(*target))?;
            }
            body.remove(id);

            ctx.events
                .record(EventKind::BranchSimplified)
                .at(token, position)
                .message(format!("switch over {} target(s) unflattened", targets.len()));
            unflattened += 1;
        }
        Ok(unflattened)
    }

    fn process_body(body: &mut Body, token: Token, ctx: &PassContext<'_>) -> Result<bool> {
        let switches = Self::unflatten_switches(body, token, ctx)?;
        let folds = flow::simplify_branches(body);
        let dead = flow::eliminate_dead_code(body);
        if switches + folds + dead == 0 {
            return Ok(false);
        }

        integrity::repair_body(body);
        if folds > 0 {
            ctx.events
                .record(EventKind::BranchSimplified)
                .method(token)
                .message(format!("{folds} branch(es) folded"));
        }
        if dead > 0 {
            ctx.events
                .record(EventKind::DeadCodeRemoved)
                .method(token)
                .message(format!("{dead} unreachable instruction(s) removed"));
        }
        Ok(true)
    }
}

impl ProtectionPass for ControlFlowPass {
    fn name(&self) -> &'static str {
        "Control Flow"
    }

    fn description(&self) -> &'static str {
        "Unflatten switch dispatch, fold branches and drop unreachable code"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let outcomes: Result<Vec<bool>> = module
            .types
            .par_iter_mut()
            .map(|ty| {
                let mut changed = false;
                for method in &mut ty.methods {
                    let token = method.token;
                    if let Some(body) = method.body.as_mut() {
                        changed |= Self::process_body(body, token, ctx)?;
                    }
                }
                Ok(changed)
            })
            .collect();

        let changed = outcomes?.into_iter().any(|c| c);
        if changed {
            ctx.logger.info("Control flow simplified");
        }
        Ok(changed)
    }
}
