//! In-memory representation of a managed module.
//!
//! The model is built around two ideas:
//!
//! - **Token identity**: types, methods, fields and properties are identified
//!   by [`Token`] values that survive renaming, so cross-references stay valid
//!   while names change underneath them.
//! - **Arena bodies**: instruction streams live in a [`Body`] arena addressed
//!   by stable [`InstrId`] handles. Removing an instruction tombstones its
//!   slot; operands elsewhere may dangle until reference integrity repair
//!   brings the body back to a consistent state.
//!
//! # Key Types
//!
//! - [`Module`] - A loaded module with its types and resources
//! - [`TypeDef`] / [`MethodDef`] / [`FieldDef`] / [`PropertyDef`] - Definitions
//! - [`Body`] - Instruction arena plus program order, locals and handlers
//! - [`Instruction`] / [`Opcode`] / [`Operand`] - Individual instructions

pub mod body;
pub mod instruction;
pub mod module;
pub mod token;

pub use body::{Body, ExceptionHandler, InstrId, Local};
pub use instruction::{ExternalRef, FlowControl, Instruction, MethodRef, Opcode, Operand};
pub use module::{
    FieldDef, FieldFlags, MethodDef, MethodFlags, Module, PropertyDef, Resource, TypeDef, TypeSig,
};
pub use token::Token;
