//! Local-to-field hoisting reversal.
//!
//! The Local2Field protection hoists method locals into private static fields
//! so that decompilers lose scoping information. The hoisted fields keep a
//! recognizable `local_` name prefix; every method that touches one gets a
//! fresh local slot back (`ldsfld` becomes `ldloc`, `stsfld` becomes
//! `stloc`), and the fields themselves are then deleted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    events::EventKind,
    model::{Local, Module, Opcode, Operand, Token, TypeSig},
    passes::{PassContext, ProtectionPass},
    Result,
};

/// Name prefix carried by hoisted locals.
const HOISTED_PREFIX: &str = "local_";

fn hoisted_fields(module: &Module) -> HashMap<Token, TypeSig> {
    module
        .types
        .iter()
        .flat_map(|t| t.fields.iter())
        .filter(|field| {
            field.is_static()
                && field.is_private()
                && field.name.to_lowercase().starts_with(HOISTED_PREFIX)
        })
        .map(|field| (field.token, field.sig.clone()))
        .collect()
}

/// Converts hoisted `local_*` static fields back into method locals.
pub struct LocalToFieldPass;

impl ProtectionPass for LocalToFieldPass {
    fn name(&self) -> &'static str {
        "Local2Field"
    }

    fn description(&self) -> &'static str {
        "Convert hoisted local_* static fields back into method locals"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let hoisted = hoisted_fields(module);
        if hoisted.is_empty() {
            return Ok(false);
        }

        let rewritten = AtomicUsize::new(0);
        module.par_for_each_method_mut(|method| {
            let Some(body) = method.body.as_mut() else {
                return;
            };
            // One fresh slot per distinct field per method.
            let mut slots: HashMap<Token, u16> = HashMap::new();
            let mut in_body = 0;
            for id in body.ids() {
                let Some(instruction) = body.get(id) else {
                    continue;
                };
                let access = match instruction.opcode {
                    Opcode::LdSFld => Opcode::LdLoc,
                    Opcode::StSFld => Opcode::StLoc,
                    _ => continue,
                };
                let Some(field) = instruction.operand.as_field() else {
                    continue;
                };
                let Some(sig) = hoisted.get(&field) else {
                    continue;
                };

                let slot = *slots.entry(field).or_insert_with(|| {
                    body.locals.push(Local::new(sig.clone()));
                    (body.locals.len() - 1) as u16
                });
                if let Some(instruction) = body.get_mut(id) {
                    instruction.opcode = access;
                    instruction.operand = Operand::Local(slot);
                }
                in_body += 1;
            }
            if in_body > 0 {
                rewritten.fetch_add(in_body, Ordering::Relaxed);
            }
        });

        for type_def in &mut module.types {
            type_def.fields.retain(|field| {
                if hoisted.contains_key(&field.token) {
                    ctx.events
                        .record(EventKind::FieldRemoved)
                        .message(format!("hoisted field '{}' removed", field.name));
                    false
                } else {
                    true
                }
            });
        }

        let accesses = rewritten.load(Ordering::Relaxed);
        ctx.logger.info(&format!(
            "Restored {} hoisted field(s) across {accesses} access(es)",
            hoisted.len()
        ));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldFlags, Instruction};
    use crate::test::{create_field, create_method, create_module, TestRun};

    fn hoisted_field(rid: u32, name: &str) -> crate::model::FieldDef {
        create_field(rid, name, TypeSig::I4)
            .with_flags(FieldFlags::STATIC | FieldFlags::PRIVATE)
    }

    #[test]
    fn test_field_accesses_become_locals() {
        let field = hoisted_field(1, "local_counter");
        let field_token = field.token;
        let method = create_method(
            1,
            "Main",
            vec![
                Instruction::ldc_i4(5),
                Instruction::stsfld(field_token),
                Instruction::ldsfld(field_token),
                Instruction::pop(),
                Instruction::ret(),
            ],
        );
        let mut module = create_module(vec![method]);
        module.types[0].fields.push(field);
        let run = TestRun::new();
        assert!(LocalToFieldPass.run(&mut module, &run.ctx()).unwrap());

        let method = &module.types[0].methods[0];
        let body = method.body.as_ref().unwrap();
        let opcodes: Vec<Opcode> = body.iter().map(|(_, i)| i.opcode).collect();
        assert_eq!(
            opcodes,
            vec![
                Opcode::LdcI4,
                Opcode::StLoc,
                Opcode::LdLoc,
                Opcode::Pop,
                Opcode::Ret
            ]
        );
        assert_eq!(body.locals.len(), 1);
        assert_eq!(body.locals[0].sig, TypeSig::I4);
        assert!(module.types[0].fields.is_empty());
        assert!(run.events.has(EventKind::FieldRemoved));
    }

    #[test]
    fn test_distinct_fields_get_distinct_slots() {
        let first = hoisted_field(1, "local_a");
        let second = hoisted_field(2, "Local_b");
        let (first_token, second_token) = (first.token, second.token);
        let method = create_method(
            1,
            "Main",
            vec![
                Instruction::ldsfld(first_token),
                Instruction::ldsfld(second_token),
                Instruction::ldsfld(first_token),
                Instruction::pop(),
                Instruction::pop(),
                Instruction::pop(),
                Instruction::ret(),
            ],
        );
        let mut module = create_module(vec![method]);
        module.types[0].fields.push(first);
        module.types[0].fields.push(second);
        let run = TestRun::new();
        assert!(LocalToFieldPass.run(&mut module, &run.ctx()).unwrap());

        let body = module.types[0].methods[0].body.as_ref().unwrap();
        assert_eq!(body.locals.len(), 2);
        let slots: Vec<u16> = body
            .iter()
            .filter_map(|(_, i)| i.operand.as_local())
            .collect();
        assert_eq!(slots[0], slots[2]);
        assert_ne!(slots[0], slots[1]);
    }

    #[test]
    fn test_ordinary_static_fields_untouched() {
        let field = create_field(1, "counter", TypeSig::I4)
            .with_flags(FieldFlags::STATIC | FieldFlags::PRIVATE);
        let field_token = field.token;
        let method = create_method(
            1,
            "Main",
            vec![
                Instruction::ldsfld(field_token),
                Instruction::pop(),
                Instruction::ret(),
            ],
        );
        let mut module = create_module(vec![method]);
        module.types[0].fields.push(field);
        let run = TestRun::new();
        assert!(!LocalToFieldPass.run(&mut module, &run.ctx()).unwrap());
        assert_eq!(module.types[0].fields.len(), 1);
    }

    #[test]
    fn test_instance_fields_excluded() {
        let field = create_field(1, "local_state", TypeSig::I4).with_flags(FieldFlags::PRIVATE);
        let mut module = create_module(vec![]);
        module.types[0].fields.push(field);
        let run = TestRun::new();
        assert!(!LocalToFieldPass.run(&mut module, &run.ctx()).unwrap());
        assert_eq!(module.types[0].fields.len(), 1);
    }
}
