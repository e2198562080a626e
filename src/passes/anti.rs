//! Anti-analysis probe removal.
//!
//! Protected binaries plant runtime probes that detect tampering, memory
//! dumps and attached debuggers, then retaliate inline (corrupt state, throw,
//! exit). Each probe family has a recognizable trigger call; the retaliation
//! logic sits in the instructions immediately after it. These passes delete
//! the trigger and the bounded span that follows, then repair the body.
//!
//! # Recognized triggers
//!
//! - **Anti-tamper**: `newobj` of `System.BadImageFormatException`.
//! - **Anti-dump**: `call` to
//!   `System.Runtime.InteropServices.Marshal::GetHINSTANCE`.
//! - **Anti-debug**: `call` to `System.Diagnostics.Debugger::get_IsAttached`
//!   or `::IsLogging`, or to `System.Environment::Exit` or
//!   `::GetEnvironmentVariable`.
//!
//! The fourth pass removes calls to planted junk methods (overlong, double
//! underscore or all-digit names). The junk methods themselves are left in
//! place for junk-code removal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    events::{truncate_string, EventKind},
    integrity,
    model::{Instruction, MethodRef, Module, Opcode, Token},
    passes::{PassContext, ProtectionPass},
    Result,
};

/// Debugger and environment probes matched by the anti-debug pass.
const DEBUG_PROBES: [(&str, &str); 4] = [
    ("System.Diagnostics.Debugger", "get_IsAttached"),
    ("System.Diagnostics.Debugger", "IsLogging"),
    ("System.Environment", "Exit"),
    ("System.Environment", "GetEnvironmentVariable"),
];

fn is_anti_tamper_trigger(instr: &Instruction) -> bool {
    instr.opcode == Opcode::NewObj
        && instr
            .operand
            .as_method()
            .and_then(MethodRef::as_external)
            .is_some_and(|r| r.full_type_name() == "System.BadImageFormatException")
}

fn is_anti_dump_trigger(instr: &Instruction) -> bool {
    instr.opcode == Opcode::Call
        && instr
            .operand
            .as_method()
            .and_then(MethodRef::as_external)
            .is_some_and(|r| {
                r.full_type_name() == "System.Runtime.InteropServices.Marshal"
                    && r.name == "GetHINSTANCE"
            })
}

fn is_anti_debug_trigger(instr: &Instruction) -> bool {
    instr.opcode == Opcode::Call
        && instr
            .operand
            .as_method()
            .and_then(MethodRef::as_external)
            .is_some_and(|r| {
                let full = r.full_type_name();
                DEBUG_PROBES
                    .iter()
                    .any(|(ty, name)| full == *ty && r.name == *name)
            })
}

/// Matches the naming pattern of planted junk methods.
fn is_junk_call_name(name: &str, max_len: usize) -> bool {
    name.len() > max_len
        || name.contains("__")
        || (!name.is_empty() && name.chars().all(|c| c.is_ascii_digit()))
}

/// Removes every trigger span in the module and repairs the touched bodies.
///
/// A span runs from the trigger instruction to at most `max_len` following
/// instructions, clipped at the end of the body. Returns the number of spans
/// removed.
fn strip_probe_spans<F>(
    module: &mut Module,
    ctx: &PassContext<'_>,
    max_len: usize,
    label: &'static str,
    is_trigger: F,
) -> usize
where
    F: Fn(&Instruction) -> bool + Send + Sync,
{
    let removed = AtomicUsize::new(0);
    module.par_for_each_method_mut(|method| {
        let token = method.token;
        let Some(body) = method.body.as_mut() else {
            return;
        };
        let mut spans = 0;
        let mut cursor = 0;
        loop {
            let ids = body.ids();
            let found = (cursor..ids.len()).find(|&p| body.get(ids[p]).is_some_and(&is_trigger));
            let Some(position) = found else {
                break;
            };
            let end = (position + max_len).min(ids.len() - 1);
            let count = body.remove_range(position, end).len();
            ctx.events
                .record(EventKind::InstructionRemoved)
                .at(token, position)
                .message(format!("{label} span of {count} instructions removed"));
            spans += 1;
            // The survivors shifted into the trigger's position.
            cursor = position;
        }
        if spans > 0 {
            integrity::repair_body(body);
            removed.fetch_add(spans, Ordering::Relaxed);
        }
    });
    removed.load(Ordering::Relaxed)
}

/// Removes anti-tamper probes and their retaliation spans.
pub struct AntiTamperPass;

impl ProtectionPass for AntiTamperPass {
    fn name(&self) -> &'static str {
        "Anti-Tamper"
    }

    fn description(&self) -> &'static str {
        "Remove tamper-detection probes and the retaliation code after them"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let spans = strip_probe_spans(
            module,
            ctx,
            ctx.config.max_anti_tamper_span,
            "anti-tamper",
            is_anti_tamper_trigger,
        );
        if spans > 0 {
            ctx.logger
                .info(&format!("Removed {spans} anti-tamper check(s)"));
        }
        Ok(spans > 0)
    }
}

/// Removes anti-dump probes and their retaliation spans.
pub struct AntiDumpPass;

impl ProtectionPass for AntiDumpPass {
    fn name(&self) -> &'static str {
        "Anti-Dump"
    }

    fn description(&self) -> &'static str {
        "Remove memory-dump detection probes and the code after them"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let spans = strip_probe_spans(
            module,
            ctx,
            ctx.config.max_anti_dump_span,
            "anti-dump",
            is_anti_dump_trigger,
        );
        if spans > 0 {
            ctx.logger.info(&format!("Removed {spans} anti-dump check(s)"));
        }
        Ok(spans > 0)
    }
}

/// Removes anti-debug probes and their retaliation spans.
pub struct AntiDebugPass;

impl ProtectionPass for AntiDebugPass {
    fn name(&self) -> &'static str {
        "Anti-Debug"
    }

    fn description(&self) -> &'static str {
        "Remove debugger-detection probes and the code after them"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let spans = strip_probe_spans(
            module,
            ctx,
            ctx.config.max_anti_debug_span,
            "anti-debug",
            is_anti_debug_trigger,
        );
        if spans > 0 {
            ctx.logger
                .info(&format!("Removed {spans} anti-debug check(s)"));
        }
        Ok(spans > 0)
    }
}

/// Removes calls to planted anti-tooling junk methods.
///
/// Only the call sites are removed here. The junk methods lose their callers
/// and fall to the junk-code pass later in the run.
pub struct AntiDe4DotPass;

impl ProtectionPass for AntiDe4DotPass {
    fn name(&self) -> &'static str {
        "Anti-De4Dot"
    }

    fn description(&self) -> &'static str {
        "Remove calls to planted junk methods with machine-generated names"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        // Module-wide scan first so the rewrite loop never needs the module.
        let junk: HashMap<Token, String> = module
            .methods()
            .filter(|m| is_junk_call_name(&m.name, ctx.config.junk_name_len))
            .map(|m| (m.token, m.name.clone()))
            .collect();
        if junk.is_empty() {
            return Ok(false);
        }

        let removed = AtomicUsize::new(0);
        module.par_for_each_method_mut(|method| {
            let token = method.token;
            let Some(body) = method.body.as_mut() else {
                return;
            };
            let mut in_body = 0;
            for id in body.ids() {
                let Some(instr) = body.get(id) else {
                    continue;
                };
                if instr.opcode != Opcode::Call {
                    continue;
                }
                let Some(target) = instr.operand.as_method().and_then(MethodRef::as_def) else {
                    continue;
                };
                let Some(name) = junk.get(&target) else {
                    continue;
                };
                let position = body.position_of(id).unwrap_or(0);
                let message = format!("junk call to '{}' removed", truncate_string(name, 32));
                body.remove(id);
                ctx.events
                    .record(EventKind::InstructionRemoved)
                    .at(token, position)
                    .message(message);
                in_body += 1;
            }
            if in_body > 0 {
                integrity::repair_body(body);
                removed.fetch_add(in_body, Ordering::Relaxed);
            }
        });

        let total = removed.load(Ordering::Relaxed);
        if total > 0 {
            ctx.logger.info(&format!("Removed {total} junk call(s)"));
        }
        Ok(total > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExternalRef;
    use crate::test::{create_method, create_module, TestRun};

    fn tamper_trigger() -> Instruction {
        Instruction::newobj(MethodRef::External(ExternalRef::new(
            "System",
            "BadImageFormatException",
            ".ctor",
        )))
    }

    #[test]
    fn test_anti_tamper_removes_trigger_span() {
        let mut instructions = vec![Instruction::ldc_i4(1), tamper_trigger()];
        for i in 0..12 {
            instructions.push(Instruction::ldc_i4(i));
        }
        instructions.push(Instruction::ret());

        let mut module = create_module(vec![create_method(1, "Main", instructions)]);
        let run = TestRun::new();
        let changed = AntiTamperPass.run(&mut module, &run.ctx()).unwrap();

        assert!(changed);
        let method = &module.types[0].methods[0];
        // Trigger plus ten following instructions are gone.
        assert_eq!(method.instruction_count(), 4);
        let body = method.body.as_ref().unwrap();
        assert!(body.iter().all(|(_, i)| i.opcode != Opcode::NewObj));
        assert!(run.events.has(EventKind::InstructionRemoved));
    }

    #[test]
    fn test_anti_tamper_span_clipped_and_terminated() {
        let instructions = vec![Instruction::ldc_i4(7), tamper_trigger(), Instruction::ret()];
        let mut module = create_module(vec![create_method(1, "Main", instructions)]);
        let run = TestRun::new();
        assert!(AntiTamperPass.run(&mut module, &run.ctx()).unwrap());

        let body = module.types[0].methods[0].body.as_ref().unwrap();
        let opcodes: Vec<Opcode> = body.iter().map(|(_, i)| i.opcode).collect();
        // Span swallowed the original ret; repair appended a fresh one.
        assert_eq!(opcodes, vec![Opcode::LdcI4, Opcode::Ret]);
    }

    #[test]
    fn test_anti_dump_trigger_matches() {
        let probe = Instruction::call(MethodRef::External(ExternalRef::new(
            "System.Runtime.InteropServices",
            "Marshal",
            "GetHINSTANCE",
        )));
        let mut module = create_module(vec![create_method(
            1,
            "Main",
            vec![probe, Instruction::pop(), Instruction::ret()],
        )]);
        let run = TestRun::new();
        assert!(AntiDumpPass.run(&mut module, &run.ctx()).unwrap());

        let body = module.types[0].methods[0].body.as_ref().unwrap();
        let opcodes: Vec<Opcode> = body.iter().map(|(_, i)| i.opcode).collect();
        assert_eq!(opcodes, vec![Opcode::Ret]);
    }

    #[test]
    fn test_anti_debug_matches_every_probe() {
        for (ty, name) in [
            ("System.Diagnostics.Debugger", "get_IsAttached"),
            ("System.Diagnostics.Debugger", "IsLogging"),
            ("System.Environment", "Exit"),
            ("System.Environment", "GetEnvironmentVariable"),
        ] {
            let (namespace, type_name) = ty.rsplit_once('.').unwrap();
            let probe = Instruction::call(MethodRef::External(ExternalRef::new(
                namespace, type_name, name,
            )));
            let mut module = create_module(vec![create_method(
                1,
                "Main",
                vec![probe, Instruction::pop(), Instruction::ret()],
            )]);
            let run = TestRun::new();
            assert!(
                AntiDebugPass.run(&mut module, &run.ctx()).unwrap(),
                "{ty}::{name} not matched"
            );
        }
    }

    #[test]
    fn test_unrelated_calls_untouched() {
        let call = Instruction::call(MethodRef::External(ExternalRef::new(
            "System",
            "Console",
            "WriteLine",
        )));
        let mut module = create_module(vec![create_method(
            1,
            "Main",
            vec![Instruction::ldstr("hi"), call, Instruction::ret()],
        )]);
        let run = TestRun::new();
        assert!(!AntiTamperPass.run(&mut module, &run.ctx()).unwrap());
        assert!(!AntiDumpPass.run(&mut module, &run.ctx()).unwrap());
        assert!(!AntiDebugPass.run(&mut module, &run.ctx()).unwrap());
        assert_eq!(module.types[0].methods[0].instruction_count(), 3);
    }

    #[test]
    fn test_junk_call_name_predicate() {
        assert!(is_junk_call_name(&"a".repeat(21), 20));
        assert!(is_junk_call_name("b__7", 20));
        assert!(is_junk_call_name("123456", 20));
        assert!(!is_junk_call_name("Main", 20));
        assert!(!is_junk_call_name("CalculateTotal", 20));
    }

    #[test]
    fn test_de4dot_removes_junk_calls_keeps_method() {
        let junk_name = "a".repeat(25);
        let junk = create_method(2, &junk_name, vec![Instruction::ret()]);
        let junk_token = junk.token;
        let helper = create_method(3, "Helper", vec![Instruction::ret()]);
        let helper_token = helper.token;

        let caller = create_method(
            1,
            "Main",
            vec![
                Instruction::call(MethodRef::Def(junk_token)),
                Instruction::call(MethodRef::Def(helper_token)),
                Instruction::call(MethodRef::Def(junk_token)),
                Instruction::ret(),
            ],
        );
        let mut module = create_module(vec![caller, junk, helper]);
        let run = TestRun::new();
        assert!(AntiDe4DotPass.run(&mut module, &run.ctx()).unwrap());

        let body = module.types[0].methods[0].body.as_ref().unwrap();
        let calls: Vec<Token> = body
            .iter()
            .filter_map(|(_, i)| i.operand.as_method().and_then(MethodRef::as_def))
            .collect();
        assert_eq!(calls, vec![helper_token]);
        // The junk method itself survives for junk-code removal.
        assert!(module.method(junk_token).is_some());
    }
}
