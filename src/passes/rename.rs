//! Symbol renaming passes.
//!
//! Obfuscators reduce names to noise: single letters, digit runs, `<>`-mangled
//! compiler-style names or kilometer-long identifiers. Two passes restore
//! readability:
//!
//! - [`RenamerPass`] hands out sequential placeholder names
//!   (`RestoredClass0`, `restoredField1`, ...). Method renaming is guarded by
//!   a complexity check: in a module with a dense internal call graph a
//!   renamed method is more likely to confuse the reader than the obfuscated
//!   name was, so only types, fields and properties are touched there.
//! - [`StructureRecoveryPass`] runs later and renames whatever is still
//!   obfuscated to token-qualified names, which stay stable across runs and
//!   survive member reordering.

use crate::{
    events::EventKind,
    model::{MethodRef, Module, Opcode},
    passes::{PassContext, ProtectionPass},
    Result,
};

/// Decides whether a name carries any meaning worth keeping.
pub(crate) fn is_obfuscated_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with('<') || name.contains("__") || name.len() > 50 {
        return true;
    }
    let chars: Vec<char> = name.chars().collect();
    if chars.len() == 1 {
        return true;
    }
    if chars.iter().all(|c| *c == '_' || c.is_ascii_digit()) {
        return true;
    }
    chars.len() <= 2 && chars.iter().all(|c| c.is_ascii_alphabetic())
}

/// Counts `call`/`callvirt` instructions that target methods of this module.
fn internal_call_count(module: &Module) -> usize {
    module
        .methods()
        .filter_map(|method| method.body.as_ref())
        .flat_map(|body| body.iter())
        .filter(|(_, instruction)| {
            matches!(instruction.opcode, Opcode::Call | Opcode::CallVirt)
                && instruction
                    .operand
                    .as_method()
                    .and_then(MethodRef::as_def)
                    .is_some()
        })
        .count()
}

/// Renames obfuscated symbols to sequential placeholders.
pub struct RenamerPass;

impl ProtectionPass for RenamerPass {
    fn name(&self) -> &'static str {
        "Renamer"
    }

    fn description(&self) -> &'static str {
        "Rename obfuscated symbols to readable placeholder names"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let calls = internal_call_count(module);
        let rename_methods = calls <= ctx.config.renamer_call_limit
            && module.method_count() <= ctx.config.renamer_method_limit;
        if !rename_methods {
            ctx.logger.info(
                "Call graph too interconnected, leaving method names alone",
            );
        }

        let mut renamed = 0;
        let mut class_counter = 0;
        for type_def in &mut module.types {
            if !type_def.is_global_type() && is_obfuscated_name(&type_def.name) {
                let name = format!("RestoredClass{class_counter}");
                class_counter += 1;
                ctx.events
                    .record(EventKind::SymbolRenamed)
                    .message(format!("type '{}' renamed to '{name}'", type_def.name));
                type_def.name = name;
                renamed += 1;
            }

            if rename_methods {
                let mut method_counter = 0;
                for method in &mut type_def.methods {
                    if method.is_constructor() || !is_obfuscated_name(&method.name) {
                        continue;
                    }
                    let name = format!("RestoredMethod{method_counter}");
                    method_counter += 1;
                    ctx.events
                        .record(EventKind::SymbolRenamed)
                        .method(method.token)
                        .message(format!("method '{}' renamed to '{name}'", method.name));
                    method.name = name;
                    renamed += 1;
                }
            }

            let mut field_counter = 0;
            for field in &mut type_def.fields {
                if !is_obfuscated_name(&field.name) {
                    continue;
                }
                let name = format!("restoredField{field_counter}");
                field_counter += 1;
                ctx.events
                    .record(EventKind::SymbolRenamed)
                    .message(format!("field '{}' renamed to '{name}'", field.name));
                field.name = name;
                renamed += 1;
            }

            let mut property_counter = 0;
            for property in &mut type_def.properties {
                if !is_obfuscated_name(&property.name) {
                    continue;
                }
                let name = format!("RestoredProperty{property_counter}");
                property_counter += 1;
                ctx.events
                    .record(EventKind::SymbolRenamed)
                    .message(format!("property '{}' renamed to '{name}'", property.name));
                property.name = name;
                renamed += 1;
            }
        }

        if renamed > 0 {
            ctx.logger.info(&format!("Renamed {renamed} symbol(s)"));
        }
        Ok(renamed > 0)
    }
}

/// Renames still-obfuscated symbols to token-qualified names.
pub struct StructureRecoveryPass;

impl ProtectionPass for StructureRecoveryPass {
    fn name(&self) -> &'static str {
        "Data Structure Recovery"
    }

    fn description(&self) -> &'static str {
        "Token-qualified renaming of obfuscated data structures"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let mut recovered = 0;
        for type_def in &mut module.types {
            if !type_def.is_global_type() && is_obfuscated_name(&type_def.name) {
                let name = format!("RecoveredType_{:08X}", type_def.token.value());
                ctx.events
                    .record(EventKind::SymbolRenamed)
                    .message(format!("type '{}' recovered as '{name}'", type_def.name));
                type_def.name = name;
                recovered += 1;
            }
            for method in &mut type_def.methods {
                if method.is_constructor() || !is_obfuscated_name(&method.name) {
                    continue;
                }
                let name = format!("RecoveredMethod_{:08X}", method.token.value());
                ctx.events
                    .record(EventKind::SymbolRenamed)
                    .method(method.token)
                    .message(format!("method '{}' recovered as '{name}'", method.name));
                method.name = name;
                recovered += 1;
            }
            for field in &mut type_def.fields {
                if !is_obfuscated_name(&field.name) {
                    continue;
                }
                let name = format!("RecoveredField_{:08X}", field.token.value());
                ctx.events
                    .record(EventKind::SymbolRenamed)
                    .message(format!("field '{}' recovered as '{name}'", field.name));
                field.name = name;
                recovered += 1;
            }
        }

        if recovered > 0 {
            ctx.logger
                .info(&format!("Recovered {recovered} structure name(s)"));
        }
        Ok(recovered > 0)
    }
}
