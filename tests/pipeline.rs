//! End-to-end runs through the full engine against crafted modules.

use std::sync::Arc;

use cilstrip::model::{MethodRef, TypeSig};
use cilstrip::{
    integrity, Body, EngineConfig, Error, EventKind, Instruction, MethodDef, Module, NullLogger,
    Opcode, PassContext, ProtectionEngine, ProtectionFlags, ProtectionPass, Token, TypeDef,
};

fn method(rid: u32, name: &str, instructions: Vec<Instruction>) -> MethodDef {
    let mut body = Body::new();
    for instruction in instructions {
        body.push(instruction);
    }
    MethodDef::new(Token::new(0x0600_0000 + rid), name).with_body(body)
}

fn app_type(rid: u32, name: &str, methods: Vec<MethodDef>) -> TypeDef {
    let mut type_def = TypeDef::new(Token::new(0x0200_0000 + rid), name, "App");
    for m in methods {
        type_def = type_def.with_method(m);
    }
    type_def
}

fn opcodes(module: &Module, type_index: usize, method_index: usize) -> Vec<Opcode> {
    module.types[type_index].methods[method_index]
        .body
        .as_ref()
        .unwrap()
        .iter()
        .map(|(_, i)| i.opcode)
        .collect()
}

#[test]
fn test_default_run_cleans_layered_protections() {
    let proxy = method(
        2,
        "Proxy_GetAnswer",
        vec![Instruction::ldc_i4(42), Instruction::ret()],
    );
    let proxy_token = proxy.token;
    let main = method(
        1,
        "Main",
        vec![
            Instruction::ldstr("powered by obfuscator v3"),
            Instruction::pop(),
            Instruction::ldc_i4(0xF0),
            Instruction::ldc_i4(0x0F),
            Instruction::simple(Opcode::Xor),
            Instruction::pop(),
            Instruction::call(MethodRef::Def(proxy_token)),
            Instruction::pop(),
            Instruction::ret(),
        ],
    );
    let entry = main.token;
    let mut module = Module::new("app.exe")
        .with_type(app_type(1, "Program", vec![main, proxy]))
        .with_entry_point(entry);

    let mut engine = ProtectionEngine::new(EngineConfig::default());
    let summary = engine.process(&mut module, &NullLogger).unwrap();

    assert_eq!(summary.failed, 0);
    assert!(summary.applied >= 3);
    assert!(summary.applied_flags.contains(ProtectionFlags::WATERMARKS));
    assert!(summary
        .applied_flags
        .contains(ProtectionFlags::PROXY_CONSTANTS));

    let body = module.types[0].methods[0].body.as_ref().unwrap();
    assert!(body.iter().all(|(_, i)| i.operand.as_str().is_none()));
    let constants: Vec<i32> = body
        .iter()
        .filter_map(|(_, i)| i.operand.as_int32())
        .collect();
    assert!(constants.contains(&0xFF));
    assert!(constants.contains(&42));
    assert!(summary.events.has(EventKind::WatermarkRemoved));
    assert!(summary.events.has(EventKind::ProxyInlined));
    assert!(summary.events.has(EventKind::ConstantFolded));
}

#[test]
fn test_run_leaves_module_repair_clean() {
    let mut dangling = Body::new();
    dangling.push(Instruction::ldc_i4(1));
    let victim = dangling.push(Instruction::nop());
    dangling.push(Instruction::br(victim));
    dangling.push(Instruction::pop());
    dangling.push(Instruction::ret());
    dangling.remove(victim);

    let mut module = Module::new("app.exe").with_type(
        app_type(
            1,
            "Program",
            vec![MethodDef::new(Token::new(0x0600_0001), "Main").with_body(dangling)],
        ),
    );

    let mut engine = ProtectionEngine::new(EngineConfig::default());
    engine.process(&mut module, &NullLogger).unwrap();

    // Whatever the passes did, a follow-up repair sweep finds nothing left.
    let report = integrity::repair_module(&mut module);
    assert!(report.is_clean(), "second repair found work: {report:?}");
}

#[test]
fn test_arithmetic_chain_collapses_through_engine() {
    let mut module = Module::new("app.exe").with_type(app_type(
        1,
        "Program",
        vec![method(
            1,
            "Main",
            vec![
                Instruction::ldc_i4(2),
                Instruction::ldc_i4(3),
                Instruction::simple(Opcode::Add),
                Instruction::ldc_i4(4),
                Instruction::simple(Opcode::Mul),
                Instruction::pop(),
                Instruction::ret(),
            ],
        )],
    ));

    let mut engine = ProtectionEngine::new(
        EngineConfig::default().with_passes(ProtectionFlags::ARITHMETIC),
    );
    let summary = engine.process(&mut module, &NullLogger).unwrap();

    assert_eq!(summary.applied, 1);
    assert_eq!(
        opcodes(&module, 0, 0),
        vec![Opcode::LdcI4, Opcode::Pop, Opcode::Ret]
    );
    let body = module.types[0].methods[0].body.as_ref().unwrap();
    assert_eq!(body.iter().next().unwrap().1.operand.as_int32(), Some(20));
}

fn handler_method(rid: u32) -> MethodDef {
    let mut body = Body::new();
    let exit = body.push(Instruction::ret());
    body.push(Instruction::ldloc(0));
    body.push(Instruction::switch(vec![exit]));
    body.push(Instruction::ldc_i4(1));
    body.push(Instruction::pop());
    MethodDef::new(Token::new(0x0600_0100 + rid), &format!("h{rid}")).with_body(body)
}

#[test]
fn test_virtualized_module_restored() {
    let handlers: Vec<MethodDef> = (1..=60).map(handler_method).collect();
    let handler_token = handlers[0].token;

    let stub = method(
        1,
        "Lookup",
        vec![
            Instruction::ldarg(0),
            Instruction::call(MethodRef::Def(handler_token)),
            Instruction::ret(),
        ],
    )
    .with_return_type(TypeSig::Str);

    let mut module = Module::new("app.exe")
        .with_type(app_type(1, "Program", vec![stub]))
        .with_type(app_type(2, "Core", handlers));

    let mut engine = ProtectionEngine::new(
        EngineConfig::default().with_passes(ProtectionFlags::VIRTUAL_MACHINES),
    );
    let summary = engine.process(&mut module, &NullLogger).unwrap();

    assert_eq!(summary.applied, 1);
    assert_eq!(module.types.len(), 1);
    assert_eq!(module.types[0].name, "Program");

    // The interpreter handlers carried no recoverable original, so the stub
    // becomes a default-value return for its declared string type.
    assert_eq!(opcodes(&module, 0, 0), vec![Opcode::LdStr, Opcode::Ret]);
    let body = module.types[0].methods[0].body.as_ref().unwrap();
    assert_eq!(body.iter().next().unwrap().1.operand.as_str(), Some(""));
    assert!(summary.events.has(EventKind::TypeRemoved));
    assert!(summary.events.has(EventKind::StubRestored));
}

struct ExplodingPass;

impl ProtectionPass for ExplodingPass {
    fn name(&self) -> &'static str {
        "Exploding"
    }

    fn run(&self, _module: &mut Module, _ctx: &PassContext<'_>) -> cilstrip::Result<bool> {
        Err(Error::Pass("synthetic failure".to_string()))
    }
}

#[test]
fn test_extension_failure_does_not_abort_run() {
    let mut module = Module::new("app.exe").with_type(app_type(
        1,
        "Program",
        vec![method(
            1,
            "Main",
            vec![
                Instruction::ldstr("watermark.png"),
                Instruction::pop(),
                Instruction::ret(),
            ],
        )],
    ));

    let mut engine = ProtectionEngine::new(
        EngineConfig::default().enable(ProtectionFlags::EXTENSIONS),
    );
    engine.register_pass(Arc::new(ExplodingPass));
    let summary = engine.process(&mut module, &NullLogger).unwrap();

    assert_eq!(summary.failed, 1);
    assert!(summary.events.has(EventKind::PassFailed));
    // The built-in passes before and after still did their work.
    assert!(summary.events.has(EventKind::WatermarkRemoved));
}

#[test]
fn test_self_proxy_left_untouched() {
    let proxy_token = Token::new(0x0600_0002);
    let proxy = method(
        2,
        "Proxy_Loop",
        vec![
            Instruction::call(MethodRef::Def(proxy_token)),
            Instruction::ret(),
        ],
    );
    let main = method(
        1,
        "Main",
        vec![
            Instruction::call(MethodRef::Def(proxy_token)),
            Instruction::ret(),
        ],
    );
    let mut module = Module::new("app.exe").with_type(app_type(1, "Program", vec![main, proxy]));

    let mut engine = ProtectionEngine::new(EngineConfig::default());
    let changed = engine
        .apply_pass(&mut module, "Proxy Methods", &NullLogger)
        .unwrap();

    assert!(!changed);
    let body = module.types[0].methods[0].body.as_ref().unwrap();
    let target = body
        .iter()
        .find_map(|(_, i)| i.operand.as_method().and_then(MethodRef::as_def));
    assert_eq!(target, Some(proxy_token));
}

#[test]
fn test_apply_pass_rejects_unknown_name() {
    let mut module = Module::new("app.exe");
    let mut engine = ProtectionEngine::new(EngineConfig::default());
    let result = engine.apply_pass(&mut module, "Does Not Exist", &NullLogger);
    assert!(matches!(result, Err(Error::UnknownPass(name)) if name == "Does Not Exist"));
}

#[test]
fn test_module_round_trips_through_interchange_json() {
    let mut module = Module::new("app.exe").with_type(app_type(
        1,
        "Program",
        vec![method(
            1,
            "Main",
            vec![Instruction::ldc_i4(7), Instruction::pop(), Instruction::ret()],
        )],
    ));

    let serialized = serde_json::to_string(&module).unwrap();
    let mut reloaded: Module = serde_json::from_str(&serialized).unwrap();

    let mut engine = ProtectionEngine::new(EngineConfig::minimal());
    engine.process(&mut reloaded, &NullLogger).unwrap();
    engine.process(&mut module, &NullLogger).unwrap();
    assert_eq!(opcodes(&module, 0, 0), opcodes(&reloaded, 0, 0));
}
