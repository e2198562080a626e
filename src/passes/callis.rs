//! Call-indirection restoration.
//!
//! Call indirection hides a direct call behind a function pointer: the
//! protected body loads the target with `ldftn` and invokes it through
//! `calli`. Both halves are statically known, so the pair collapses back to
//! a plain `call` on the original target.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    events::EventKind,
    integrity,
    model::{MethodRef, Module, Opcode, Operand},
    passes::{PassContext, ProtectionPass},
    Result,
};

/// Restores `ldftn; calli` pairs to direct calls.
pub struct CallIndirectionPass;

impl ProtectionPass for CallIndirectionPass {
    fn name(&self) -> &'static str {
        "Callis"
    }

    fn description(&self) -> &'static str {
        "Collapse ldftn/calli indirection back to direct calls"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let restored = AtomicUsize::new(0);
        module.par_for_each_method_mut(|method| {
            let token = method.token;
            let Some(body) = method.body.as_mut() else {
                return;
            };
            let mut in_body = 0;
            let order = body.ids();
            for position in 1..order.len() {
                let (ldftn_id, calli_id) = (order[position - 1], order[position]);
                let (Some(ldftn), Some(calli)) = (body.get(ldftn_id), body.get(calli_id)) else {
                    continue;
                };
                if ldftn.opcode != Opcode::LdFtn || calli.opcode != Opcode::CallI {
                    continue;
                }
                // Only internal targets are rewritten; an external pointer may
                // have a calling convention the direct form cannot express.
                let Some(target) = ldftn.operand.as_method().and_then(MethodRef::as_def) else {
                    continue;
                };

                if let Some(calli) = body.get_mut(calli_id) {
                    calli.opcode = Opcode::Call;
                    calli.operand = Operand::Method(MethodRef::Def(target));
                }
                body.remove(ldftn_id);
                ctx.events
                    .record(EventKind::CallRestored)
                    .at(token, position - 1)
                    .message(format!("indirect call restored to {target}"));
                in_body += 1;
            }
            if in_body > 0 {
                integrity::repair_body(body);
                restored.fetch_add(in_body, Ordering::Relaxed);
            }
        });

        let total = restored.load(Ordering::Relaxed);
        if total > 0 {
            ctx.logger
                .info(&format!("Restored {total} indirect call(s)"));
        }
        Ok(total > 0)
    }
}
