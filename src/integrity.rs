//! Reference integrity repair.
//!
//! Passes are allowed to leave a body inconsistent while they work: removing
//! an instruction tombstones its slot but does nothing about branch operands
//! or handler markers still pointing at it. This module restores the
//! invariant that every reference resolves to a live instruction.
//!
//! Repair is deliberately conservative. Dangling branch targets are moved to
//! the surviving instruction whose original byte offset is closest to the
//! removed target's, which keeps the jump as near as possible to where the
//! obfuscated code went. Handlers that cannot be restored to a well-formed
//! region are dropped rather than left half-valid. Running repair on an
//! already-consistent body changes nothing.

use rayon::prelude::*;

use crate::model::{Body, ExceptionHandler, FlowControl, InstrId, Instruction, Module, Operand};

/// What a repair sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Branch, switch and handler-marker references moved to a live target.
    pub retargeted: usize,
    /// Handlers dropped because they could not be made well formed.
    pub handlers_dropped: usize,
    /// Terminators appended to bodies that no longer ended in one.
    pub terminators_appended: usize,
}

impl RepairReport {
    /// Returns true if the sweep found nothing to fix.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.total() == 0
    }

    /// Total number of individual repairs.
    #[must_use]
    pub fn total(&self) -> usize {
        self.retargeted + self.handlers_dropped + self.terminators_appended
    }

    /// Folds another report into this one.
    #[must_use]
    pub fn combine(mut self, other: RepairReport) -> Self {
        self.retargeted += other.retargeted;
        self.handlers_dropped += other.handlers_dropped;
        self.terminators_appended += other.terminators_appended;
        self
    }
}

/// Picks the live instruction whose recorded offset is nearest to the
/// dangling handle's. Ties go to the earlier instruction in program order;
/// a handle with no recorded offset falls back to the first instruction.
fn nearest_survivor(body: &Body, dangling: InstrId) -> Option<InstrId> {
    let wanted = match body.recorded_offset(dangling) {
        Some(offset) => offset,
        None => return body.first_id(),
    };

    let mut best: Option<(u32, InstrId)> = None;
    for (id, instruction) in body.iter() {
        let distance = instruction.offset.abs_diff(wanted);
        match best {
            Some((best_distance, _)) if best_distance <= distance => {}
            _ => best = Some((distance, id)),
        }
    }
    best.map(|(_, id)| id)
}

/// Repairs one body: dangling operands, handler regions, terminator.
pub fn repair_body(body: &mut Body) -> RepairReport {
    let mut report = RepairReport::default();

    // Operand handles. Fixes are planned against the current state and then
    // applied, since computing a replacement needs shared access to the body.
    let mut fixes: Vec<(InstrId, Operand)> = Vec::new();
    for (id, instruction) in body.iter() {
        match &instruction.operand {
            Operand::Target(target) if !body.contains(*target) => {
                if let Some(replacement) = nearest_survivor(body, *target) {
                    fixes.push((id, Operand::Target(replacement)));
                    report.retargeted += 1;
                }
            }
            Operand::Targets(targets) if targets.iter().any(|t| !body.contains(*t)) => {
                let mut repaired = Vec::with_capacity(targets.len());
                for target in targets {
                    if body.contains(*target) {
                        repaired.push(*target);
                    } else if let Some(replacement) = nearest_survivor(body, *target) {
                        repaired.push(replacement);
                        report.retargeted += 1;
                    }
                }
                fixes.push((id, Operand::Targets(repaired)));
            }
            _ => {}
        }
    }
    for (id, operand) in fixes {
        if let Some(instruction) = body.get_mut(id) {
            instruction.operand = operand;
        }
    }

    // Handler regions.
    let handlers = std::mem::take(&mut body.handlers);
    let mut kept = Vec::with_capacity(handlers.len());
    for mut handler in handlers {
        if !anchor_is_live(body, handler.try_start) || !anchor_is_live(body, handler.handler_start)
        {
            report.handlers_dropped += 1;
            continue;
        }

        for marker in [
            &mut handler.try_end,
            &mut handler.handler_end,
            &mut handler.filter_start,
        ] {
            if let Some(id) = *marker {
                if !body.contains(id) {
                    *marker = nearest_survivor(body, id);
                    report.retargeted += 1;
                }
            }
        }

        if region_is_inverted(body, &handler) {
            report.handlers_dropped += 1;
            continue;
        }
        kept.push(handler);
    }
    body.handlers = kept;

    // Terminator.
    let needs_terminator = match body.last_id().and_then(|id| body.get(id)) {
        None => true,
        Some(last) => !matches!(
            last.opcode.flow(),
            FlowControl::Return | FlowControl::Branch | FlowControl::Throw
        ),
    };
    if needs_terminator {
        body.push(Instruction::ret());
        report.terminators_appended += 1;
    }

    report
}

fn anchor_is_live(body: &Body, anchor: Option<InstrId>) -> bool {
    anchor.is_some_and(|id| body.contains(id))
}

fn region_is_inverted(body: &Body, handler: &ExceptionHandler) -> bool {
    let position = |id: Option<InstrId>| id.and_then(|id| body.position_of(id));

    let try_inverted = match (position(handler.try_start), position(handler.try_end)) {
        (Some(start), Some(end)) => end <= start,
        _ => false,
    };
    let handler_inverted = match (position(handler.handler_start), position(handler.handler_end)) {
        (Some(start), Some(end)) => end <= start,
        _ => false,
    };
    try_inverted || handler_inverted
}

/// Repairs every method body in the module.
///
/// Bodies are independent, so the sweep runs in parallel.
pub fn repair_module(module: &mut Module) -> RepairReport {
    module
        .types
        .par_iter_mut()
        .map(|type_def| {
            let mut report = RepairReport::default();
            for method in &mut type_def.methods {
                if let Some(body) = method.body.as_mut() {
                    report = report.combine(repair_body(body));
                }
            }
            report
        })
        .reduce(RepairReport::default, RepairReport::combine)
}
