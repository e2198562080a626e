//! Shared factories and fixtures for unit tests.

use std::sync::Mutex;

use crate::{
    config::EngineConfig,
    events::EventLog,
    logger::{Logger, NullLogger},
    model::{Body, FieldDef, Instruction, MethodDef, MethodFlags, Module, Token, TypeDef, TypeSig},
    passes::{PassContext, RunCaches},
};

// Helper function to build a body from an instruction list
pub(crate) fn body_from(instructions: Vec<Instruction>) -> Body {
    let mut body = Body::new();
    for instr in instructions {
        body.push(instr);
    }
    body
}

// Helper function to create a method with a body
pub(crate) fn create_method(rid: u32, name: &str, instructions: Vec<Instruction>) -> MethodDef {
    MethodDef::new(Token::new(0x0600_0000 + rid), name).with_body(body_from(instructions))
}

// Helper function to create a static method with a body
pub(crate) fn create_static_method(
    rid: u32,
    name: &str,
    instructions: Vec<Instruction>,
) -> MethodDef {
    create_method(rid, name, instructions).with_flags(MethodFlags::STATIC)
}

// Helper function to create a private field
pub(crate) fn create_field(rid: u32, name: &str, sig: TypeSig) -> FieldDef {
    FieldDef::new(Token::new(0x0400_0000 + rid), name, sig)
}

// Helper function to create a type holding the given methods
pub(crate) fn create_type(rid: u32, name: &str, methods: Vec<MethodDef>) -> TypeDef {
    let mut ty = TypeDef::new(Token::new(0x0200_0000 + rid), name, "Test");
    for method in methods {
        ty = ty.with_method(method);
    }
    ty
}

// Helper function to create a module with one type holding the given methods
pub(crate) fn create_module(methods: Vec<MethodDef>) -> Module {
    Module::new("test.exe").with_type(create_type(1, "Program", methods))
}

/// Everything a pass invocation borrows, owned in one place so tests can
/// create a [`PassContext`] with one call.
pub(crate) struct TestRun {
    pub config: EngineConfig,
    pub events: EventLog,
    pub caches: RunCaches,
    logger: NullLogger,
}

impl TestRun {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            events: EventLog::new(),
            caches: RunCaches::new(),
            logger: NullLogger,
        }
    }

    pub fn ctx(&self) -> PassContext<'_> {
        PassContext {
            config: &self.config,
            events: &self.events,
            logger: &self.logger,
            caches: &self.caches,
        }
    }
}

/// Logger that stores every message for assertions.
#[derive(Debug, Default)]
pub(crate) struct CollectingLogger {
    pub entries: Mutex<Vec<(&'static str, String)>>,
}

impl CollectingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|(_, message)| message.contains(needle))
    }

    pub fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Logger for CollectingLogger {
    fn info(&self, message: &str) {
        self.entries.lock().unwrap().push(("info", message.to_string()));
    }

    fn warning(&self, message: &str) {
        self.entries
            .lock()
            .unwrap()
            .push(("warning", message.to_string()));
    }

    fn error(&self, message: &str) {
        self.entries.lock().unwrap().push(("error", message.to_string()));
    }

    fn success(&self, message: &str) {
        self.entries
            .lock()
            .unwrap()
            .push(("success", message.to_string()));
    }
}
