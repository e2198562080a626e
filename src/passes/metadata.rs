//! Invalid-metadata repair.
//!
//! Some protectors blank out or digit-mangle metadata names so that decompilers
//! refuse to load the module. Names that can no longer identify anything are
//! replaced with token-derived placeholders, and an emptied module name gets a
//! fixed fallback.

use crate::{
    events::EventKind,
    model::{Module, Token},
    passes::{PassContext, ProtectionPass},
    Result,
};

/// Fallback for a blanked-out module name.
const RESTORED_MODULE_NAME: &str = "RestoredModule.exe";

fn is_invalid_name(name: &str) -> bool {
    name.is_empty() || name.chars().all(|c| c.is_ascii_digit())
}

fn restored_name(prefix: &str, token: Token) -> String {
    format!("{prefix}_{:08X}", token.value())
}

/// Restores empty or digit-only metadata names.
pub struct InvalidMetadataPass;

impl ProtectionPass for InvalidMetadataPass {
    fn name(&self) -> &'static str {
        "Invalid Metadata"
    }

    fn description(&self) -> &'static str {
        "Replace blanked-out or digit-only names with token-derived placeholders"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let mut repaired = 0;

        if module.name.is_empty() {
            module.name = RESTORED_MODULE_NAME.to_string();
            ctx.events
                .record(EventKind::SymbolRenamed)
                .message(format!("module renamed to '{RESTORED_MODULE_NAME}'"));
            repaired += 1;
        }

        for type_def in &mut module.types {
            if is_invalid_name(&type_def.name) {
                let name = restored_name("RestoredType", type_def.token);
                ctx.events
                    .record(EventKind::SymbolRenamed)
                    .message(format!("type '{}' renamed to '{name}'", type_def.name));
                type_def.name = name;
                repaired += 1;
            }
            for method in &mut type_def.methods {
                if is_invalid_name(&method.name) {
                    let name = restored_name("RestoredMethod", method.token);
                    ctx.events
                        .record(EventKind::SymbolRenamed)
                        .method(method.token)
                        .message(format!("method '{}' renamed to '{name}'", method.name));
                    method.name = name;
                    repaired += 1;
                }
            }
        }

        if repaired > 0 {
            ctx.logger
                .info(&format!("Repaired {repaired} metadata name(s)"));
        }
        Ok(repaired > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Instruction;
    use crate::test::{create_method, create_module, TestRun};

    #[test]
    fn test_invalid_name_predicate() {
        assert!(is_invalid_name(""));
        assert!(is_invalid_name("12345"));
        assert!(!is_invalid_name("Program"));
        assert!(!is_invalid_name("a1"));
    }

    #[test]
    fn test_empty_module_name_restored() {
        let mut module = create_module(vec![]);
        module.name = String::new();
        let run = TestRun::new();
        assert!(InvalidMetadataPass.run(&mut module, &run.ctx()).unwrap());
        assert_eq!(module.name, RESTORED_MODULE_NAME);
    }

    #[test]
    fn test_digit_names_get_token_placeholders() {
        let method = create_method(7, "123", vec![Instruction::ret()]);
        let mut module = create_module(vec![method]);
        module.types[0].name = "42".to_string();
        let run = TestRun::new();
        assert!(InvalidMetadataPass.run(&mut module, &run.ctx()).unwrap());

        assert_eq!(module.types[0].name, "RestoredType_02000001");
        assert_eq!(module.types[0].methods[0].name, "RestoredMethod_06000007");
        assert_eq!(run.events.count_kind(EventKind::SymbolRenamed), 2);
    }

    #[test]
    fn test_valid_names_untouched() {
        let mut module = create_module(vec![create_method(1, "Main", vec![Instruction::ret()])]);
        let run = TestRun::new();
        assert!(!InvalidMetadataPass.run(&mut module, &run.ctx()).unwrap());
        assert_eq!(module.types[0].methods[0].name, "Main");
    }
}
