//! Constant arithmetic recovery.
//!
//! Arithmetic obfuscation splits literals into constant expressions the
//! runtime recomputes on every use. Two passes undo it:
//!
//! - [`IntegerConfusionPass`] folds the classic xor split,
//!   `ldc.i4 a; ldc.i4 b; xor` → `ldc.i4 (a ^ b)`, and nothing else. The
//!   narrow shape keeps it safe to run early.
//! - [`ArithmeticPass`] folds every two-constant binary operation until the
//!   body stops changing, with wrapping 32-bit semantics; division and
//!   remainder by a constant zero are left alone. It then removes repeated
//!   `ldloc L; ldc.i4 c; add/sub` calculations, keeping only the first
//!   occurrence's result load.
//!
//! Folds mutate the first instruction of the matched window in place, so
//! branches into the window's start survive without retargeting.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    events::EventKind,
    integrity,
    model::{Body, Module, Opcode, Operand, Token},
    passes::{PassContext, ProtectionPass},
    Result,
};

/// Folds one binary operation over two i32 constants.
///
/// Wrapping semantics for the overflow-prone operations; `None` for
/// operations this pass does not fold, including division by zero.
fn fold(op: Opcode, a: i32, b: i32) -> Option<i32> {
    match op {
        Opcode::Add => Some(a.wrapping_add(b)),
        Opcode::Sub => Some(a.wrapping_sub(b)),
        Opcode::Mul => Some(a.wrapping_mul(b)),
        Opcode::Div if b != 0 => Some(a.wrapping_div(b)),
        Opcode::Rem if b != 0 => Some(a.wrapping_rem(b)),
        Opcode::And => Some(a & b),
        Opcode::Or => Some(a | b),
        Opcode::Xor => Some(a ^ b),
        _ => None,
    }
}

/// Repeatedly folds `ldc.i4 a; ldc.i4 b; op` windows accepted by `accepts`.
///
/// The window's first constant is rewritten to the folded value in place and
/// the other two instructions are removed. Restarts the scan after every
/// fold so cascaded constants collapse completely. Returns the fold count.
fn fold_constant_windows(
    body: &mut Body,
    token: Token,
    ctx: &PassContext<'_>,
    accepts: fn(Opcode) -> bool,
) -> usize {
    let mut folded = 0;
    loop {
        let order = body.ids();
        let mut applied = false;
        for position in 2..order.len() {
            let (first, second, third) = (
                order[position - 2],
                order[position - 1],
                order[position],
            );
            let (Some(a), Some(b), Some(op)) =
                (body.get(first), body.get(second), body.get(third))
            else {
                continue;
            };
            if a.opcode != Opcode::LdcI4 || b.opcode != Opcode::LdcI4 || !accepts(op.opcode) {
                continue;
            }
            let (Some(lhs), Some(rhs)) = (a.operand.as_int32(), b.operand.as_int32()) else {
                continue;
            };
            let Some(value) = fold(op.opcode, lhs, rhs) else {
                continue;
            };
            let mnemonic = op.opcode.mnemonic();

            if let Some(instruction) = body.get_mut(first) {
                instruction.opcode = Opcode::LdcI4;
                instruction.operand = Operand::Int32(value);
            }
            body.remove(second);
            body.remove(third);
            ctx.events
                .record(EventKind::ConstantFolded)
                .at(token, position - 2)
                .message(format!("{lhs} {mnemonic} {rhs} folded to {value}"));
            folded += 1;
            applied = true;
            break;
        }
        if !applied {
            return folded;
        }
    }
}

/// Removes repeated `ldloc L; ldc.i4 c; add/sub` calculations.
///
/// The first occurrence of each `(local, constant, op)` key is kept as the
/// canonical computation; repeats collapse to the bare `ldloc L`. Returns
/// the number of repeats removed.
fn dedup_calculations(body: &mut Body, token: Token, ctx: &PassContext<'_>) -> usize {
    let mut seen: HashSet<String> = HashSet::new();
    let mut removed = 0;
    let order = body.ids();
    let mut position = 2;
    while position < order.len() {
        let (first, second, third) = (
            order[position - 2],
            order[position - 1],
            order[position],
        );
        let (Some(load), Some(constant), Some(op)) =
            (body.get(first), body.get(second), body.get(third))
        else {
            position += 1;
            continue;
        };
        let matched = load.opcode == Opcode::LdLoc
            && constant.opcode == Opcode::LdcI4
            && matches!(op.opcode, Opcode::Add | Opcode::Sub);
        if !matched {
            position += 1;
            continue;
        }
        let (Some(local), Some(value)) =
            (load.operand.as_local(), constant.operand.as_int32())
        else {
            position += 1;
            continue;
        };

        let key = format!("{}_{}_{}", local, value, op.opcode.mnemonic());
        if seen.insert(key) {
            position += 3;
            continue;
        }
        // Repeat of a computation already on record; keep the local load.
        body.remove(second);
        body.remove(third);
        ctx.events
            .record(EventKind::ConstantFolded)
            .at(token, position - 2)
            .message(format!("redundant calculation on local {local} removed"));
        removed += 1;
        position += 3;
    }
    removed
}

/// Folds `ldc.i4 a; ldc.i4 b; xor` confusion triples.
pub struct IntegerConfusionPass;

impl ProtectionPass for IntegerConfusionPass {
    fn name(&self) -> &'static str {
        "Integer Confusion"
    }

    fn description(&self) -> &'static str {
        "Fold xor-split integer constants back into literals"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let folded = AtomicUsize::new(0);
        module.par_for_each_method_mut(|method| {
            let token = method.token;
            let Some(body) = method.body.as_mut() else {
                return;
            };
            let count = fold_constant_windows(body, token, ctx, |op| op == Opcode::Xor);
            if count > 0 {
                integrity::repair_body(body);
                folded.fetch_add(count, Ordering::Relaxed);
            }
        });

        let total = folded.load(Ordering::Relaxed);
        if total > 0 {
            ctx.logger
                .info(&format!("Folded {total} xor-split constant(s)"));
        }
        Ok(total > 0)
    }
}

/// Folds constant arithmetic chains and deduplicates repeated calculations.
pub struct ArithmeticPass;

impl ProtectionPass for ArithmeticPass {
    fn name(&self) -> &'static str {
        "Arithmetic"
    }

    fn description(&self) -> &'static str {
        "Fold constant arithmetic and remove duplicated calculations"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let changed = AtomicUsize::new(0);
        module.par_for_each_method_mut(|method| {
            let token = method.token;
            let Some(body) = method.body.as_mut() else {
                return;
            };
            let folded = fold_constant_windows(body, token, ctx, |op| {
                matches!(
                    op,
                    Opcode::Add
                        | Opcode::Sub
                        | Opcode::Mul
                        | Opcode::Div
                        | Opcode::Rem
                        | Opcode::And
                        | Opcode::Or
                        | Opcode::Xor
                )
            });
            let deduped = dedup_calculations(body, token, ctx);
            if folded + deduped > 0 {
                integrity::repair_body(body);
                changed.fetch_add(folded + deduped, Ordering::Relaxed);
            }
        });

        let total = changed.load(Ordering::Relaxed);
        if total > 0 {
            ctx.logger
                .info(&format!("Simplified {total} arithmetic pattern(s)"));
        }
        Ok(total > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Instruction;
    use crate::test::{create_method, create_module, TestRun};

    fn single_method_opcodes(module: &Module) -> Vec<Opcode> {
        module.types[0].methods[0]
            .body
            .as_ref()
            .unwrap()
            .iter()
            .map(|(_, i)| i.opcode)
            .collect()
    }

    #[test]
    fn test_fold_table() {
        assert_eq!(fold(Opcode::Add, 2, 3), Some(5));
        assert_eq!(fold(Opcode::Sub, 2, 3), Some(-1));
        assert_eq!(fold(Opcode::Mul, 4, 5), Some(20));
        assert_eq!(fold(Opcode::Div, 9, 2), Some(4));
        assert_eq!(fold(Opcode::Rem, 9, 2), Some(1));
        assert_eq!(fold(Opcode::Xor, 0xF0, 0x0F), Some(0xFF));
        assert_eq!(fold(Opcode::Add, i32::MAX, 1), Some(i32::MIN));
        assert_eq!(fold(Opcode::Div, 5, 0), None);
        assert_eq!(fold(Opcode::Rem, 5, 0), None);
        assert_eq!(fold(Opcode::Shl, 1, 4), None);
    }

    #[test]
    fn test_integer_confusion_folds_xor_only() {
        let mut module = create_module(vec![create_method(
            1,
            "Main",
            vec![
                Instruction::ldc_i4(0xF0),
                Instruction::ldc_i4(0x0F),
                Instruction::simple(Opcode::Xor),
                Instruction::ldc_i4(2),
                Instruction::ldc_i4(3),
                Instruction::simple(Opcode::Add),
                Instruction::ret(),
            ],
        )]);
        let run = TestRun::new();
        assert!(IntegerConfusionPass.run(&mut module, &run.ctx()).unwrap());

        let body = module.types[0].methods[0].body.as_ref().unwrap();
        let constants: Vec<i32> = body
            .iter()
            .filter_map(|(_, i)| i.operand.as_int32())
            .collect();
        // The xor collapsed; the add window is someone else's job.
        assert_eq!(constants, vec![0xFF, 2, 3]);
        assert!(body.iter().any(|(_, i)| i.opcode == Opcode::Add));
    }

    #[test]
    fn test_arithmetic_folds_chain_to_single_constant() {
        let mut module = create_module(vec![create_method(
            1,
            "Main",
            vec![
                Instruction::ldc_i4(2),
                Instruction::ldc_i4(3),
                Instruction::simple(Opcode::Add),
                Instruction::ldc_i4(4),
                Instruction::simple(Opcode::Mul),
                Instruction::ret(),
            ],
        )]);
        let run = TestRun::new();
        assert!(ArithmeticPass.run(&mut module, &run.ctx()).unwrap());

        assert_eq!(single_method_opcodes(&module), vec![Opcode::LdcI4, Opcode::Ret]);
        let body = module.types[0].methods[0].body.as_ref().unwrap();
        let value = body.iter().next().unwrap().1.operand.as_int32();
        assert_eq!(value, Some(20));
        assert_eq!(run.events.count_kind(EventKind::ConstantFolded), 2);
    }

    #[test]
    fn test_division_by_zero_left_unfolded() {
        let mut module = create_module(vec![create_method(
            1,
            "Main",
            vec![
                Instruction::ldc_i4(5),
                Instruction::ldc_i4(0),
                Instruction::simple(Opcode::Div),
                Instruction::ret(),
            ],
        )]);
        let run = TestRun::new();
        assert!(!ArithmeticPass.run(&mut module, &run.ctx()).unwrap());
        assert_eq!(module.types[0].methods[0].instruction_count(), 4);
    }

    #[test]
    fn test_redundant_calculation_deduplicated() {
        let mut module = create_module(vec![create_method(
            1,
            "Main",
            vec![
                Instruction::ldloc(0),
                Instruction::ldc_i4(5),
                Instruction::simple(Opcode::Add),
                Instruction::stloc(1),
                Instruction::ldloc(0),
                Instruction::ldc_i4(5),
                Instruction::simple(Opcode::Add),
                Instruction::stloc(2),
                Instruction::ret(),
            ],
        )]);
        let run = TestRun::new();
        assert!(ArithmeticPass.run(&mut module, &run.ctx()).unwrap());

        assert_eq!(
            single_method_opcodes(&module),
            vec![
                Opcode::LdLoc,
                Opcode::LdcI4,
                Opcode::Add,
                Opcode::StLoc,
                Opcode::LdLoc,
                Opcode::StLoc,
                Opcode::Ret,
            ]
        );
    }

    #[test]
    fn test_different_constants_not_deduplicated() {
        let mut module = create_module(vec![create_method(
            1,
            "Main",
            vec![
                Instruction::ldloc(0),
                Instruction::ldc_i4(5),
                Instruction::simple(Opcode::Add),
                Instruction::stloc(1),
                Instruction::ldloc(0),
                Instruction::ldc_i4(6),
                Instruction::simple(Opcode::Add),
                Instruction::stloc(2),
                Instruction::ret(),
            ],
        )]);
        let run = TestRun::new();
        assert!(!ArithmeticPass.run(&mut module, &run.ctx()).unwrap());
        assert_eq!(module.types[0].methods[0].instruction_count(), 9);
    }
}
