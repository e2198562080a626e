//! Proxy method resolution.
//!
//! Proxy obfuscation hides a value or a call target behind a trivial
//! intermediate method. Three flavors are resolved here:
//!
//! - **Constant proxies** return a numeric literal (`ldc.i4 42; ret`); call
//!   sites are rewritten into the literal push itself.
//! - **String proxies** do the same for `ldstr` literals.
//! - **Forwarding proxies** contain a single real call; call sites are
//!   redirected to the forwarded target.
//!
//! Candidates are found by name (a configurable prefix, or any name
//! containing `"proxy"`) or by structure alone, so renamed proxies still
//! resolve. The candidate scan is memoized in [`RunCaches`] since all three
//! passes share it. Each pass plans its rewrites against a complete proxy
//! map before touching any call site; rewrites mutate the call instruction
//! in place, so branch targets and handler regions stay valid without a
//! repair sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{
    events::{truncate_string, EventKind},
    model::{Body, MethodDef, MethodRef, Module, Opcode, Operand, Token},
    passes::{PassContext, ProtectionPass, RunCaches},
    Result,
};

/// Name prefix the proxy passes scan for.
const PROXY_PREFIX: &str = "Proxy";

/// Finds proxy candidates by name hint or body shape, memoized per prefix.
fn find_proxy_methods(module: &Module, prefix: &str, caches: &RunCaches) -> Arc<Vec<Token>> {
    if let Some(cached) = caches.proxies.get(prefix) {
        return Arc::clone(&cached);
    }
    let found: Vec<Token> = module
        .methods()
        .filter(|method| is_proxy_candidate(method, prefix))
        .map(|method| method.token)
        .collect();
    let found = Arc::new(found);
    caches.proxies.insert(prefix.to_string(), Arc::clone(&found));
    found
}

fn is_proxy_candidate(method: &MethodDef, prefix: &str) -> bool {
    let Some(body) = method.body.as_ref() else {
        return false;
    };
    if method.name.starts_with(prefix) || method.name.to_lowercase().contains("proxy") {
        return true;
    }
    is_proxy_shaped(body)
}

/// Recognizes proxy bodies without any name hint.
///
/// Either a constant return (`ldc`/`ldstr` directly before `ret`) or a pure
/// forwarder: nothing but argument loads around exactly one call, ending in
/// `ret`.
fn is_proxy_shaped(body: &Body) -> bool {
    let ids = body.ids();
    if ids.len() < 2 {
        return false;
    }
    let Some(last) = body.get(ids[ids.len() - 1]) else {
        return false;
    };
    if last.opcode != Opcode::Ret {
        return false;
    }
    if body
        .get(ids[ids.len() - 2])
        .is_some_and(|i| matches!(i.opcode, Opcode::LdcI4 | Opcode::LdcR8 | Opcode::LdStr))
    {
        return true;
    }

    let mut calls = 0;
    for id in &ids {
        let Some(instruction) = body.get(*id) else {
            return false;
        };
        match instruction.opcode {
            Opcode::Call => calls += 1,
            Opcode::LdArg | Opcode::Ret | Opcode::Nop => {}
            _ => return false,
        }
    }
    calls == 1
}

/// Extracts the payload of a constant-returning proxy body.
///
/// Returns the opcode and operand of the push directly before the final
/// `ret`, filtered through `accepts`.
fn constant_payload(
    body: &Body,
    accepts: fn(Opcode) -> bool,
) -> Option<(Opcode, Operand)> {
    let ids = body.ids();
    if ids.len() < 2 {
        return None;
    }
    if body.get(ids[ids.len() - 1])?.opcode != Opcode::Ret {
        return None;
    }
    let push = body.get(ids[ids.len() - 2])?;
    if accepts(push.opcode) {
        Some((push.opcode, push.operand.clone()))
    } else {
        None
    }
}

/// Rewrites every `call` to a planned proxy in place.
///
/// `rewrite` receives the planned payload and produces the replacement
/// opcode and operand for the call instruction. Returns the number of call
/// sites rewritten.
fn apply_plan<P: Sync>(
    module: &mut Module,
    ctx: &PassContext<'_>,
    plan: &HashMap<Token, P>,
    kind: EventKind,
    describe: impl Fn(&P) -> String + Sync,
    rewrite: impl Fn(&P) -> (Opcode, Operand) + Sync,
) -> usize {
    let rewritten = AtomicUsize::new(0);
    module.par_for_each_method_mut(|method| {
        let caller = method.token;
        // Proxy bodies themselves are left alone; rewriting a proxy's
        // internals would invalidate the plan mid-apply.
        if plan.contains_key(&caller) {
            return;
        }
        let Some(body) = method.body.as_mut() else {
            return;
        };
        let mut in_body = 0;
        for id in body.ids() {
            let Some(instruction) = body.get(id) else {
                continue;
            };
            if instruction.opcode != Opcode::Call {
                continue;
            }
            let Some(target) = instruction.operand.as_method().and_then(MethodRef::as_def) else {
                continue;
            };
            let Some(payload) = plan.get(&target) else {
                continue;
            };
            let position = body.position_of(id).unwrap_or(0);
            let (opcode, operand) = rewrite(payload);
            if let Some(instruction) = body.get_mut(id) {
                instruction.opcode = opcode;
                instruction.operand = operand;
            }
            ctx.events
                .record(kind)
                .at(caller, position)
                .message(describe(payload));
            in_body += 1;
        }
        if in_body > 0 {
            rewritten.fetch_add(in_body, Ordering::Relaxed);
        }
    });
    rewritten.load(Ordering::Relaxed)
}

/// Inlines numeric constant proxies at their call sites.
pub struct ProxyConstantPass;

impl ProtectionPass for ProxyConstantPass {
    fn name(&self) -> &'static str {
        "Proxy Constants"
    }

    fn description(&self) -> &'static str {
        "Replace calls to constant-returning proxies with the constant push"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let candidates = find_proxy_methods(module, PROXY_PREFIX, ctx.caches);
        let mut plan: HashMap<Token, (Opcode, Operand)> = HashMap::new();
        for token in candidates.iter() {
            let Some(body) = module.method(*token).and_then(|m| m.body.as_ref()) else {
                continue;
            };
            if let Some(payload) = constant_payload(body, |op| {
                matches!(op, Opcode::LdcI4 | Opcode::LdcR8)
            }) {
                plan.insert(*token, payload);
            }
        }
        if plan.is_empty() {
            return Ok(false);
        }

        let rewritten = apply_plan(
            module,
            ctx,
            &plan,
            EventKind::ProxyInlined,
            |(_, operand)| format!("constant proxy inlined as {operand:?}"),
            |(opcode, operand)| (*opcode, operand.clone()),
        );
        if rewritten > 0 {
            ctx.logger
                .info(&format!("Inlined {rewritten} constant proxy call(s)"));
        }
        Ok(rewritten > 0)
    }
}

/// Inlines string proxies at their call sites.
pub struct ProxyStringPass;

impl ProtectionPass for ProxyStringPass {
    fn name(&self) -> &'static str {
        "Proxy Strings"
    }

    fn description(&self) -> &'static str {
        "Replace calls to string-returning proxies with the literal push"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let candidates = find_proxy_methods(module, PROXY_PREFIX, ctx.caches);
        let mut plan: HashMap<Token, (Opcode, Operand)> = HashMap::new();
        for token in candidates.iter() {
            let Some(body) = module.method(*token).and_then(|m| m.body.as_ref()) else {
                continue;
            };
            if let Some(payload) = constant_payload(body, |op| op == Opcode::LdStr) {
                plan.insert(*token, payload);
            }
        }
        if plan.is_empty() {
            return Ok(false);
        }

        let rewritten = apply_plan(
            module,
            ctx,
            &plan,
            EventKind::ProxyInlined,
            |(_, operand)| {
                let literal = operand.as_str().unwrap_or_default();
                format!("string proxy inlined as '{}'", truncate_string(literal, 40))
            },
            |(opcode, operand)| (*opcode, operand.clone()),
        );
        if rewritten > 0 {
            ctx.logger
                .info(&format!("Inlined {rewritten} string proxy call(s)"));
        }
        Ok(rewritten > 0)
    }
}

/// Redirects calls through forwarding proxies to the real target.
pub struct ProxyMethodPass;

impl ProxyMethodPass {
    /// Resolves the forwarded target of a proxy body.
    ///
    /// The first `call` decides; a proxy that calls itself, or whose target
    /// name still looks like a proxy, is skipped.
    fn forwarded_target(module: &Module, proxy: Token) -> Option<MethodRef> {
        let body = module.method(proxy)?.body.as_ref()?;
        let first_call = body
            .iter()
            .find(|(_, i)| i.opcode == Opcode::Call)
            .and_then(|(_, i)| i.operand.as_method().cloned())?;

        let target_name = match &first_call {
            MethodRef::Def(token) => {
                if *token == proxy {
                    return None;
                }
                module.method(*token)?.name.clone()
            }
            MethodRef::External(external) => external.name.clone(),
        };
        if target_name.to_lowercase().contains("proxy") {
            return None;
        }
        Some(first_call)
    }
}

impl ProtectionPass for ProxyMethodPass {
    fn name(&self) -> &'static str {
        "Proxy Methods"
    }

    fn description(&self) -> &'static str {
        "Redirect calls through forwarding proxies to their real targets"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let candidates = find_proxy_methods(module, PROXY_PREFIX, ctx.caches);
        let mut plan: HashMap<Token, MethodRef> = HashMap::new();
        for token in candidates.iter() {
            if let Some(target) = Self::forwarded_target(module, *token) {
                plan.insert(*token, target);
            }
        }
        if plan.is_empty() {
            return Ok(false);
        }

        let rewritten = apply_plan(
            module,
            ctx,
            &plan,
            EventKind::CallRestored,
            |target| format!("proxy call redirected to {target:?}"),
            |target| (Opcode::Call, Operand::Method(target.clone())),
        );
        if rewritten > 0 {
            ctx.logger
                .info(&format!("Redirected {rewritten} proxied call(s)"));
        }
        Ok(rewritten > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Instruction;
    use crate::test::{create_method, create_module, TestRun};

    #[test]
    fn test_constant_proxy_inlined_in_place() {
        let proxy = create_method(
            2,
            "Proxy_GetAnswer",
            vec![Instruction::ldc_i4(42), Instruction::ret()],
        );
        let proxy_token = proxy.token;
        let caller = create_method(
            1,
            "Main",
            vec![
                Instruction::call(MethodRef::Def(proxy_token)),
                Instruction::pop(),
                Instruction::ret(),
            ],
        );
        let mut module = create_module(vec![caller, proxy]);
        let run = TestRun::new();
        assert!(ProxyConstantPass.run(&mut module, &run.ctx()).unwrap());

        let body = module.types[0].methods[0].body.as_ref().unwrap();
        let first = body.iter().next().unwrap().1;
        assert_eq!(first.opcode, Opcode::LdcI4);
        assert_eq!(first.operand.as_int32(), Some(42));
        assert!(run.events.has(EventKind::ProxyInlined));
    }

    #[test]
    fn test_structural_proxy_needs_no_name_hint() {
        let proxy = create_method(2, "a", vec![Instruction::ldc_i4(7), Instruction::ret()]);
        let proxy_token = proxy.token;
        let caller = create_method(
            1,
            "Main",
            vec![
                Instruction::call(MethodRef::Def(proxy_token)),
                Instruction::pop(),
                Instruction::ret(),
            ],
        );
        let mut module = create_module(vec![caller, proxy]);
        let run = TestRun::new();
        assert!(ProxyConstantPass.run(&mut module, &run.ctx()).unwrap());
        let body = module.types[0].methods[0].body.as_ref().unwrap();
        assert_eq!(body.iter().next().unwrap().1.operand.as_int32(), Some(7));
    }

    #[test]
    fn test_string_proxy_inlined() {
        let proxy = create_method(
            2,
            "GetProxyString",
            vec![Instruction::ldstr("secret"), Instruction::ret()],
        );
        let proxy_token = proxy.token;
        let caller = create_method(
            1,
            "Main",
            vec![
                Instruction::call(MethodRef::Def(proxy_token)),
                Instruction::pop(),
                Instruction::ret(),
            ],
        );
        let mut module = create_module(vec![caller, proxy]);
        let run = TestRun::new();
        assert!(ProxyStringPass.run(&mut module, &run.ctx()).unwrap());

        let body = module.types[0].methods[0].body.as_ref().unwrap();
        let first = body.iter().next().unwrap().1;
        assert_eq!(first.opcode, Opcode::LdStr);
        assert_eq!(first.operand.as_str(), Some("secret"));
    }

    #[test]
    fn test_forwarding_proxy_redirected() {
        let real = create_method(3, "RealWork", vec![Instruction::ret()]);
        let real_token = real.token;
        let proxy = create_method(
            2,
            "Proxy_Call",
            vec![
                Instruction::ldarg(0),
                Instruction::call(MethodRef::Def(real_token)),
                Instruction::ret(),
            ],
        );
        let proxy_token = proxy.token;
        let caller = create_method(
            1,
            "Main",
            vec![
                Instruction::call(MethodRef::Def(proxy_token)),
                Instruction::ret(),
            ],
        );
        let mut module = create_module(vec![caller, proxy, real]);
        let run = TestRun::new();
        assert!(ProxyMethodPass.run(&mut module, &run.ctx()).unwrap());

        let body = module.types[0].methods[0].body.as_ref().unwrap();
        let first = body.iter().next().unwrap().1;
        assert_eq!(first.opcode, Opcode::Call);
        assert_eq!(
            first.operand.as_method().and_then(MethodRef::as_def),
            Some(real_token)
        );
        assert!(run.events.has(EventKind::CallRestored));
    }

    #[test]
    fn test_self_referential_proxy_skipped() {
        let proxy_token = Token::new(0x0600_0002);
        let proxy = create_method(
            2,
            "Proxy_Loop",
            vec![
                Instruction::call(MethodRef::Def(proxy_token)),
                Instruction::ret(),
            ],
        );
        let caller = create_method(
            1,
            "Main",
            vec![
                Instruction::call(MethodRef::Def(proxy_token)),
                Instruction::ret(),
            ],
        );
        let mut module = create_module(vec![caller, proxy]);
        let run = TestRun::new();
        assert!(!ProxyMethodPass.run(&mut module, &run.ctx()).unwrap());

        let body = module.types[0].methods[0].body.as_ref().unwrap();
        let first = body.iter().next().unwrap().1;
        assert_eq!(
            first.operand.as_method().and_then(MethodRef::as_def),
            Some(proxy_token)
        );
    }

    #[test]
    fn test_candidate_scan_is_shared_between_passes() {
        let proxy = create_method(
            2,
            "Proxy_GetAnswer",
            vec![Instruction::ldc_i4(1), Instruction::ret()],
        );
        let caller = create_method(1, "Main", vec![Instruction::ret()]);
        let mut module = create_module(vec![caller, proxy]);
        let run = TestRun::new();

        let _ = ProxyConstantPass.run(&mut module, &run.ctx()).unwrap();
        let _ = ProxyStringPass.run(&mut module, &run.ctx()).unwrap();
        let _ = ProxyMethodPass.run(&mut module, &run.ctx()).unwrap();
        assert_eq!(run.caches.proxies.len(), 1);
    }
}
