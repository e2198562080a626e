//! CIL instruction representation.
//!
//! An [`crate::model::Instruction`] pairs an opcode with its decoded operand. The opcode
//! set covers the subset of CIL that protection schemes manipulate: constant loads,
//! local and field accesses, calls, branches, arithmetic, and stack shuffling.
//! Branch operands reference other instructions by [`crate::model::InstrId`] handle
//! rather than by byte offset, so transformations never have to recompute offsets
//! while editing a body.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::body::InstrId;
use crate::model::token::Token;

/// How an instruction transfers control to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowControl {
    /// Control falls through to the next instruction in program order.
    Next,
    /// Control transfers unconditionally to the branch target.
    Branch,
    /// Control transfers to the target or falls through, depending on the stack.
    CondBranch,
    /// Control enters a callee and returns to the next instruction.
    Call,
    /// Control leaves the method (or the current handler region).
    Return,
    /// Control raises an exception.
    Throw,
}

/// The opcodes understood by the transformation passes.
///
/// Operand shape is fixed per opcode; see [`Operand`] for the carrier type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// Push a 32-bit integer constant.
    LdcI4,
    /// Push a 64-bit float constant.
    LdcR8,
    /// Push a string literal.
    LdStr,
    /// Push a null reference.
    LdNull,
    /// Push the value of a local variable.
    LdLoc,
    /// Pop the stack into a local variable.
    StLoc,
    /// Push the value of an argument.
    LdArg,
    /// Push the value of an instance field.
    LdFld,
    /// Pop the stack into an instance field.
    StFld,
    /// Push the value of a static field.
    LdSFld,
    /// Pop the stack into a static field.
    StSFld,
    /// Call a method directly.
    Call,
    /// Call a method through its virtual slot.
    CallVirt,
    /// Call through a function pointer on the stack.
    CallI,
    /// Push a function pointer for a method.
    LdFtn,
    /// Allocate an object and call its constructor.
    NewObj,
    /// Branch unconditionally.
    Br,
    /// Leave a protected region, branching to the target.
    Leave,
    /// Branch if the popped value is non-zero.
    BrTrue,
    /// Branch if the popped value is zero.
    BrFalse,
    /// Branch if the two popped values are equal.
    Beq,
    /// Branch if the two popped values are unequal.
    Bne,
    /// Branch if the first popped value is less than the second.
    Blt,
    /// Branch if the first popped value is less than or equal to the second.
    Ble,
    /// Branch if the first popped value is greater than the second.
    Bgt,
    /// Branch if the first popped value is greater than or equal to the second.
    Bge,
    /// Jump through a target table indexed by the popped value.
    Switch,
    /// Integer or float addition.
    Add,
    /// Integer or float subtraction.
    Sub,
    /// Integer or float multiplication.
    Mul,
    /// Integer or float division.
    Div,
    /// Integer remainder.
    Rem,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise exclusive or.
    Xor,
    /// Shift left.
    Shl,
    /// Shift right.
    Shr,
    /// Bitwise complement.
    Not,
    /// Arithmetic negation.
    Neg,
    /// Duplicate the top stack value.
    Dup,
    /// Discard the top stack value.
    Pop,
    /// Return from the method.
    Ret,
    /// Return from a finally handler.
    EndFinally,
    /// Raise the popped exception object.
    Throw,
    /// Do nothing.
    Nop,
}

impl Opcode {
    /// Returns the control-flow behavior of this opcode.
    #[must_use]
    pub fn flow(&self) -> FlowControl {
        match self {
            Opcode::Br | Opcode::Leave => FlowControl::Branch,
            Opcode::BrTrue
            | Opcode::BrFalse
            | Opcode::Beq
            | Opcode::Bne
            | Opcode::Blt
            | Opcode::Ble
            | Opcode::Bgt
            | Opcode::Bge
            | Opcode::Switch => FlowControl::CondBranch,
            Opcode::Call | Opcode::CallVirt | Opcode::CallI | Opcode::NewObj => FlowControl::Call,
            Opcode::Ret | Opcode::EndFinally => FlowControl::Return,
            Opcode::Throw => FlowControl::Throw,
            _ => FlowControl::Next,
        }
    }

    /// Returns true for unconditional and conditional branches alike.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(self.flow(), FlowControl::Branch | FlowControl::CondBranch)
    }

    /// Returns true for branches whose target may or may not be taken.
    #[must_use]
    pub fn is_conditional_branch(&self) -> bool {
        self.flow() == FlowControl::CondBranch
    }

    /// Returns true for two-operand arithmetic and bitwise opcodes.
    #[must_use]
    pub fn is_binary_arithmetic(&self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Rem
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Shl
                | Opcode::Shr
        )
    }

    /// Returns the CIL mnemonic for this opcode.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::LdcI4 => "ldc.i4",
            Opcode::LdcR8 => "ldc.r8",
            Opcode::LdStr => "ldstr",
            Opcode::LdNull => "ldnull",
            Opcode::LdLoc => "ldloc",
            Opcode::StLoc => "stloc",
            Opcode::LdArg => "ldarg",
            Opcode::LdFld => "ldfld",
            Opcode::StFld => "stfld",
            Opcode::LdSFld => "ldsfld",
            Opcode::StSFld => "stsfld",
            Opcode::Call => "call",
            Opcode::CallVirt => "callvirt",
            Opcode::CallI => "calli",
            Opcode::LdFtn => "ldftn",
            Opcode::NewObj => "newobj",
            Opcode::Br => "br",
            Opcode::Leave => "leave",
            Opcode::BrTrue => "brtrue",
            Opcode::BrFalse => "brfalse",
            Opcode::Beq => "beq",
            Opcode::Bne => "bne.un",
            Opcode::Blt => "blt",
            Opcode::Ble => "ble",
            Opcode::Bgt => "bgt",
            Opcode::Bge => "bge",
            Opcode::Switch => "switch",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Rem => "rem",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Shl => "shl",
            Opcode::Shr => "shr",
            Opcode::Not => "not",
            Opcode::Neg => "neg",
            Opcode::Dup => "dup",
            Opcode::Pop => "pop",
            Opcode::Ret => "ret",
            Opcode::EndFinally => "endfinally",
            Opcode::Throw => "throw",
            Opcode::Nop => "nop",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// A reference to a method defined outside the current module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalRef {
    /// Namespace of the declaring type, e.g. `System.Diagnostics`.
    pub namespace: String,
    /// Simple name of the declaring type, e.g. `Debugger`.
    pub type_name: String,
    /// Name of the referenced member, e.g. `get_IsAttached`.
    pub name: String,
}

impl ExternalRef {
    /// Creates an external method reference.
    #[must_use]
    pub fn new(namespace: &str, type_name: &str, name: &str) -> Self {
        ExternalRef {
            namespace: namespace.to_string(),
            type_name: type_name.to_string(),
            name: name.to_string(),
        }
    }

    /// Returns the namespace-qualified name of the declaring type.
    #[must_use]
    pub fn full_type_name(&self) -> String {
        if self.namespace.is_empty() {
            self.type_name.clone()
        } else {
            format!("{}.{}", self.namespace, self.type_name)
        }
    }
}

/// The callee of a call-shaped instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodRef {
    /// A method defined in the current module, identified by token.
    Def(Token),
    /// A method defined in another module or the runtime.
    External(ExternalRef),
}

impl MethodRef {
    /// Returns the token if this references a method in the current module.
    #[must_use]
    pub fn as_def(&self) -> Option<Token> {
        match self {
            MethodRef::Def(token) => Some(*token),
            MethodRef::External(_) => None,
        }
    }

    /// Returns the external reference if this targets another module.
    #[must_use]
    pub fn as_external(&self) -> Option<&ExternalRef> {
        match self {
            MethodRef::Def(_) => None,
            MethodRef::External(external) => Some(external),
        }
    }
}

/// The decoded operand of an instruction.
///
/// Every opcode carries exactly one operand shape; operand-less opcodes
/// carry [`Operand::None`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// No operand.
    None,
    /// A 32-bit integer constant.
    Int32(i32),
    /// A 64-bit float constant.
    Float64(f64),
    /// A string literal.
    Str(String),
    /// A local variable index.
    Local(u16),
    /// An argument index.
    Arg(u16),
    /// A field token.
    Field(Token),
    /// A method reference.
    Method(MethodRef),
    /// A branch target handle.
    Target(InstrId),
    /// A switch target table.
    Targets(Vec<InstrId>),
}

impl Operand {
    /// Returns the integer constant, if this is an [`Operand::Int32`].
    #[must_use]
    pub fn as_int32(&self) -> Option<i32> {
        match self {
            Operand::Int32(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the string literal, if this is an [`Operand::Str`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Operand::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the local index, if this is an [`Operand::Local`].
    #[must_use]
    pub fn as_local(&self) -> Option<u16> {
        match self {
            Operand::Local(index) => Some(*index),
            _ => None,
        }
    }

    /// Returns the argument index, if this is an [`Operand::Arg`].
    #[must_use]
    pub fn as_arg(&self) -> Option<u16> {
        match self {
            Operand::Arg(index) => Some(*index),
            _ => None,
        }
    }

    /// Returns the field token, if this is an [`Operand::Field`].
    #[must_use]
    pub fn as_field(&self) -> Option<Token> {
        match self {
            Operand::Field(token) => Some(*token),
            _ => None,
        }
    }

    /// Returns the method reference, if this is an [`Operand::Method`].
    #[must_use]
    pub fn as_method(&self) -> Option<&MethodRef> {
        match self {
            Operand::Method(method) => Some(method),
            _ => None,
        }
    }

    /// Returns the branch target, if this is an [`Operand::Target`].
    #[must_use]
    pub fn as_target(&self) -> Option<InstrId> {
        match self {
            Operand::Target(id) => Some(*id),
            _ => None,
        }
    }

    /// Returns the switch table, if this is an [`Operand::Targets`].
    #[must_use]
    pub fn as_targets(&self) -> Option<&[InstrId]> {
        match self {
            Operand::Targets(ids) => Some(ids),
            _ => None,
        }
    }
}

/// A single CIL instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Byte offset of the instruction in the original encoding. Informational
    /// only; transformations key on handles, not offsets.
    pub offset: u32,
    /// The operation performed.
    pub opcode: Opcode,
    /// The decoded operand.
    pub operand: Operand,
}

impl Instruction {
    /// Creates an instruction with no recorded byte offset.
    #[must_use]
    pub fn new(opcode: Opcode, operand: Operand) -> Self {
        Instruction {
            offset: 0,
            opcode,
            operand,
        }
    }

    /// Creates an operand-less instruction.
    #[must_use]
    pub fn simple(opcode: Opcode) -> Self {
        Instruction::new(opcode, Operand::None)
    }

    /// Creates a `nop`.
    #[must_use]
    pub fn nop() -> Self {
        Instruction::simple(Opcode::Nop)
    }

    /// Creates a `ret`.
    #[must_use]
    pub fn ret() -> Self {
        Instruction::simple(Opcode::Ret)
    }

    /// Creates a `dup`.
    #[must_use]
    pub fn dup() -> Self {
        Instruction::simple(Opcode::Dup)
    }

    /// Creates a `pop`.
    #[must_use]
    pub fn pop() -> Self {
        Instruction::simple(Opcode::Pop)
    }

    /// Creates an `ldc.i4` pushing `value`.
    #[must_use]
    pub fn ldc_i4(value: i32) -> Self {
        Instruction::new(Opcode::LdcI4, Operand::Int32(value))
    }

    /// Creates an `ldc.r8` pushing `value`.
    #[must_use]
    pub fn ldc_r8(value: f64) -> Self {
        Instruction::new(Opcode::LdcR8, Operand::Float64(value))
    }

    /// Creates an `ldstr` pushing `value`.
    #[must_use]
    pub fn ldstr(value: &str) -> Self {
        Instruction::new(Opcode::LdStr, Operand::Str(value.to_string()))
    }

    /// Creates an `ldloc` for local `index`.
    #[must_use]
    pub fn ldloc(index: u16) -> Self {
        Instruction::new(Opcode::LdLoc, Operand::Local(index))
    }

    /// Creates an `stloc` for local `index`.
    #[must_use]
    pub fn stloc(index: u16) -> Self {
        Instruction::new(Opcode::StLoc, Operand::Local(index))
    }

    /// Creates an `ldarg` for argument `index`.
    #[must_use]
    pub fn ldarg(index: u16) -> Self {
        Instruction::new(Opcode::LdArg, Operand::Arg(index))
    }

    /// Creates an `ldsfld` for the field identified by `token`.
    #[must_use]
    pub fn ldsfld(token: Token) -> Self {
        Instruction::new(Opcode::LdSFld, Operand::Field(token))
    }

    /// Creates an `stsfld` for the field identified by `token`.
    #[must_use]
    pub fn stsfld(token: Token) -> Self {
        Instruction::new(Opcode::StSFld, Operand::Field(token))
    }

    /// Creates a `call` to `method`.
    #[must_use]
    pub fn call(method: MethodRef) -> Self {
        Instruction::new(Opcode::Call, Operand::Method(method))
    }

    /// Creates a `callvirt` to `method`.
    #[must_use]
    pub fn callvirt(method: MethodRef) -> Self {
        Instruction::new(Opcode::CallVirt, Operand::Method(method))
    }

    /// Creates an `ldftn` for `method`.
    #[must_use]
    pub fn ldftn(method: MethodRef) -> Self {
        Instruction::new(Opcode::LdFtn, Operand::Method(method))
    }

    /// Creates a `newobj` allocating through `ctor`.
    #[must_use]
    pub fn newobj(ctor: MethodRef) -> Self {
        Instruction::new(Opcode::NewObj, Operand::Method(ctor))
    }

    /// Creates an unconditional branch to `target`.
    #[must_use]
    pub fn br(target: InstrId) -> Self {
        Instruction::new(Opcode::Br, Operand::Target(target))
    }

    /// Creates a `brtrue` branch to `target`.
    #[must_use]
    pub fn brtrue(target: InstrId) -> Self {
        Instruction::new(Opcode::BrTrue, Operand::Target(target))
    }

    /// Creates a `brfalse` branch to `target`.
    #[must_use]
    pub fn brfalse(target: InstrId) -> Self {
        Instruction::new(Opcode::BrFalse, Operand::Target(target))
    }

    /// Creates a `beq` branch to `target`.
    #[must_use]
    pub fn beq(target: InstrId) -> Self {
        Instruction::new(Opcode::Beq, Operand::Target(target))
    }

    /// Creates a `switch` over `targets`.
    #[must_use]
    pub fn switch(targets: Vec<InstrId>) -> Self {
        Instruction::new(Opcode::Switch, Operand::Targets(targets))
    }

    /// Returns true if this instruction is a `nop`.
    #[must_use]
    pub fn is_nop(&self) -> bool {
        self.opcode == Opcode::Nop
    }

    /// Returns the single branch target, if this instruction has one.
    #[must_use]
    pub fn branch_target(&self) -> Option<InstrId> {
        if self.opcode.is_branch() {
            self.operand.as_target()
        } else {
            None
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operand {
            Operand::None => write!(f, "{}", self.opcode),
            Operand::Int32(value) => write!(f, "{} {}", self.opcode, value),
            Operand::Float64(value) => write!(f, "{} {}", self.opcode, value),
            Operand::Str(value) => write!(f, "{} \"{}\"", self.opcode, value),
            Operand::Local(index) => write!(f, "{}.{}", self.opcode, index),
            Operand::Arg(index) => write!(f, "{}.{}", self.opcode, index),
            Operand::Field(token) => write!(f, "{} {}", self.opcode, token),
            Operand::Method(MethodRef::Def(token)) => write!(f, "{} {}", self.opcode, token),
            Operand::Method(MethodRef::External(external)) => {
                write!(f, "{} {}::{}", self.opcode, external.full_type_name(), external.name)
            }
            Operand::Target(id) => write!(f, "{} @{}", self.opcode, id.index()),
            Operand::Targets(ids) => {
                write!(f, "{} (", self.opcode)?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "@{}", id.index())?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_control_classification() {
        assert_eq!(Opcode::Nop.flow(), FlowControl::Next);
        assert_eq!(Opcode::LdcI4.flow(), FlowControl::Next);
        assert_eq!(Opcode::Br.flow(), FlowControl::Branch);
        assert_eq!(Opcode::Leave.flow(), FlowControl::Branch);
        assert_eq!(Opcode::BrTrue.flow(), FlowControl::CondBranch);
        assert_eq!(Opcode::Switch.flow(), FlowControl::CondBranch);
        assert_eq!(Opcode::Call.flow(), FlowControl::Call);
        assert_eq!(Opcode::NewObj.flow(), FlowControl::Call);
        assert_eq!(Opcode::Ret.flow(), FlowControl::Return);
        assert_eq!(Opcode::EndFinally.flow(), FlowControl::Return);
        assert_eq!(Opcode::Throw.flow(), FlowControl::Throw);
    }

    #[test]
    fn test_branch_predicates() {
        assert!(Opcode::Br.is_branch());
        assert!(Opcode::Beq.is_branch());
        assert!(!Opcode::Call.is_branch());
        assert!(Opcode::Switch.is_conditional_branch());
        assert!(!Opcode::Br.is_conditional_branch());
    }

    #[test]
    fn test_binary_arithmetic_predicate() {
        assert!(Opcode::Add.is_binary_arithmetic());
        assert!(Opcode::Xor.is_binary_arithmetic());
        assert!(!Opcode::Neg.is_binary_arithmetic());
        assert!(!Opcode::LdcI4.is_binary_arithmetic());
    }

    #[test]
    fn test_operand_accessors() {
        assert_eq!(Operand::Int32(42).as_int32(), Some(42));
        assert_eq!(Operand::Str("x".to_string()).as_str(), Some("x"));
        assert_eq!(Operand::Local(3).as_local(), Some(3));
        assert_eq!(Operand::Field(Token::new(0x04000001)).as_field(), Some(Token::new(0x04000001)));
        assert_eq!(Operand::None.as_int32(), None);
        assert_eq!(Operand::Int32(1).as_str(), None);
    }

    #[test]
    fn test_instruction_constructors() {
        let ldc = Instruction::ldc_i4(7);
        assert_eq!(ldc.opcode, Opcode::LdcI4);
        assert_eq!(ldc.operand.as_int32(), Some(7));

        let ldstr = Instruction::ldstr("hello");
        assert_eq!(ldstr.operand.as_str(), Some("hello"));

        assert!(Instruction::nop().is_nop());
        assert!(!Instruction::ret().is_nop());
    }

    #[test]
    fn test_external_ref_full_type_name() {
        let reference = ExternalRef::new("System.Diagnostics", "Debugger", "get_IsAttached");
        assert_eq!(reference.full_type_name(), "System.Diagnostics.Debugger");

        let global = ExternalRef::new("", "Helper", "Run");
        assert_eq!(global.full_type_name(), "Helper");
    }

    #[test]
    fn test_method_ref_accessors() {
        let def = MethodRef::Def(Token::new(0x06000001));
        assert_eq!(def.as_def(), Some(Token::new(0x06000001)));
        assert!(def.as_external().is_none());

        let ext = MethodRef::External(ExternalRef::new("System", "Console", "WriteLine"));
        assert!(ext.as_def().is_none());
        assert_eq!(ext.as_external().map(|e| e.name.as_str()), Some("WriteLine"));
    }

    #[test]
    fn test_instruction_display() {
        assert_eq!(format!("{}", Instruction::ldc_i4(5)), "ldc.i4 5");
        assert_eq!(format!("{}", Instruction::ldstr("abc")), "ldstr \"abc\"");
        assert_eq!(format!("{}", Instruction::ldloc(2)), "ldloc.2");
        assert_eq!(format!("{}", Instruction::nop()), "nop");
    }
}
