//! Module-level model: types, methods, fields, properties and resources.
//!
//! This is the in-memory shape the transformation passes operate on. It is
//! deliberately independent of any on-disk container format; a loader decodes
//! into [`Module`] and a writer encodes back out of it. Identity is carried by
//! [`Token`] values, which survive renaming and make cross-references cheap to
//! follow while bodies are being rewritten.

use bitflags::bitflags;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::body::Body;
use crate::model::token::Token;

/// A type shape, covering the signatures the passes reason about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeSig {
    /// No value.
    Void,
    /// Boolean.
    Bool,
    /// 32-bit signed integer.
    I4,
    /// 64-bit float.
    R8,
    /// String.
    Str,
    /// Object reference.
    Object,
    /// Single-dimensional array of the element type.
    Array(Box<TypeSig>),
    /// Any other type, carried by full name.
    Named(String),
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSig::Void => f.write_str("void"),
            TypeSig::Bool => f.write_str("bool"),
            TypeSig::I4 => f.write_str("int32"),
            TypeSig::R8 => f.write_str("float64"),
            TypeSig::Str => f.write_str("string"),
            TypeSig::Object => f.write_str("object"),
            TypeSig::Array(element) => write!(f, "{}[]", element),
            TypeSig::Named(name) => f.write_str(name),
        }
    }
}

bitflags! {
    /// Attributes of a method definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MethodFlags: u8 {
        /// The method has no `this` parameter.
        const STATIC = 1 << 0;
        /// The method is an instance constructor (`.ctor`).
        const CTOR = 1 << 1;
        /// The method is a type initializer (`.cctor`).
        const CCTOR = 1 << 2;
    }
}

bitflags! {
    /// Attributes of a field definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FieldFlags: u8 {
        /// The field is static.
        const STATIC = 1 << 0;
        /// The field is private to its declaring type.
        const PRIVATE = 1 << 1;
    }
}

/// A method definition with its optional body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    /// Identity of the method.
    pub token: Token,
    /// Method name.
    pub name: String,
    /// Method attributes.
    pub flags: MethodFlags,
    /// Declared return type.
    pub return_type: TypeSig,
    /// Declared parameter types, excluding `this`.
    pub params: Vec<TypeSig>,
    /// The instruction stream; `None` for abstract and external methods.
    pub body: Option<Body>,
}

impl MethodDef {
    /// Creates a bodiless void method with no parameters.
    #[must_use]
    pub fn new(token: Token, name: &str) -> Self {
        MethodDef {
            token,
            name: name.to_string(),
            flags: MethodFlags::empty(),
            return_type: TypeSig::Void,
            params: Vec::new(),
            body: None,
        }
    }

    /// Sets the method body.
    #[must_use]
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets the method attributes.
    #[must_use]
    pub fn with_flags(mut self, flags: MethodFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the return type.
    #[must_use]
    pub fn with_return_type(mut self, return_type: TypeSig) -> Self {
        self.return_type = return_type;
        self
    }

    /// Sets the parameter types.
    #[must_use]
    pub fn with_params(mut self, params: Vec<TypeSig>) -> Self {
        self.params = params;
        self
    }

    /// Returns true if the method is static.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    /// Returns true for instance constructors and type initializers alike.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.flags.intersects(MethodFlags::CTOR | MethodFlags::CCTOR)
    }

    /// Returns true if the method has a body.
    #[must_use]
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Number of live instructions, zero for bodiless methods.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.body.as_ref().map_or(0, Body::len)
    }
}

/// A field definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Identity of the field.
    pub token: Token,
    /// Field name.
    pub name: String,
    /// Declared type.
    pub sig: TypeSig,
    /// Field attributes.
    pub flags: FieldFlags,
}

impl FieldDef {
    /// Creates a field with empty attributes.
    #[must_use]
    pub fn new(token: Token, name: &str, sig: TypeSig) -> Self {
        FieldDef {
            token,
            name: name.to_string(),
            sig,
            flags: FieldFlags::empty(),
        }
    }

    /// Sets the field attributes.
    #[must_use]
    pub fn with_flags(mut self, flags: FieldFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Returns true if the field is static.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldFlags::STATIC)
    }

    /// Returns true if the field is private.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.flags.contains(FieldFlags::PRIVATE)
    }
}

/// A property definition. Accessors are ordinary methods of the declaring
/// type; the property record itself only carries name and identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    /// Identity of the property.
    pub token: Token,
    /// Property name.
    pub name: String,
}

impl PropertyDef {
    /// Creates a property definition.
    #[must_use]
    pub fn new(token: Token, name: &str) -> Self {
        PropertyDef {
            token,
            name: name.to_string(),
        }
    }
}

/// An embedded resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource name.
    pub name: String,
    /// Raw resource bytes.
    pub data: Vec<u8>,
}

impl Resource {
    /// Creates a resource from its name and raw bytes.
    #[must_use]
    pub fn new(name: &str, data: Vec<u8>) -> Self {
        Resource {
            name: name.to_string(),
            data,
        }
    }
}

/// A type definition and its members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Identity of the type.
    pub token: Token,
    /// Simple type name.
    pub name: String,
    /// Namespace; empty for the global namespace.
    pub namespace: String,
    /// Methods declared by this type.
    pub methods: Vec<MethodDef>,
    /// Fields declared by this type.
    pub fields: Vec<FieldDef>,
    /// Properties declared by this type.
    pub properties: Vec<PropertyDef>,
}

impl TypeDef {
    /// Creates an empty type definition.
    #[must_use]
    pub fn new(token: Token, name: &str, namespace: &str) -> Self {
        TypeDef {
            token,
            name: name.to_string(),
            namespace: namespace.to_string(),
            methods: Vec::new(),
            fields: Vec::new(),
            properties: Vec::new(),
        }
    }

    /// Adds a method.
    #[must_use]
    pub fn with_method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    /// Adds a field.
    #[must_use]
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    /// Returns the namespace-qualified name.
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// Returns true for the compiler-emitted global type.
    #[must_use]
    pub fn is_global_type(&self) -> bool {
        self.name == "<Module>"
    }
}

/// A loaded module: the unit every pass operates on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Module name, usually the file name it was loaded from.
    pub name: String,
    /// Types defined by the module.
    pub types: Vec<TypeDef>,
    /// Embedded resources.
    pub resources: Vec<Resource>,
    /// Token of the entry-point method, when the module is executable.
    pub entry_point: Option<Token>,
}

impl Module {
    /// Creates an empty module.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Module {
            name: name.to_string(),
            types: Vec::new(),
            resources: Vec::new(),
            entry_point: None,
        }
    }

    /// Adds a type.
    #[must_use]
    pub fn with_type(mut self, type_def: TypeDef) -> Self {
        self.types.push(type_def);
        self
    }

    /// Adds a resource.
    #[must_use]
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }

    /// Marks the entry-point method.
    #[must_use]
    pub fn with_entry_point(mut self, token: Token) -> Self {
        self.entry_point = Some(token);
        self
    }

    /// Looks up a method by token.
    #[must_use]
    pub fn method(&self, token: Token) -> Option<&MethodDef> {
        self.types
            .iter()
            .flat_map(|t| t.methods.iter())
            .find(|m| m.token == token)
    }

    /// Looks up a method by token, mutably.
    pub fn method_mut(&mut self, token: Token) -> Option<&mut MethodDef> {
        self.types
            .iter_mut()
            .flat_map(|t| t.methods.iter_mut())
            .find(|m| m.token == token)
    }

    /// Returns the type declaring the method with the given token.
    #[must_use]
    pub fn type_of_method(&self, token: Token) -> Option<&TypeDef> {
        self.types
            .iter()
            .find(|t| t.methods.iter().any(|m| m.token == token))
    }

    /// Looks up a field by token.
    #[must_use]
    pub fn field(&self, token: Token) -> Option<&FieldDef> {
        self.types
            .iter()
            .flat_map(|t| t.fields.iter())
            .find(|f| f.token == token)
    }

    /// Iterates every method in the module.
    pub fn methods(&self) -> impl Iterator<Item = &MethodDef> + '_ {
        self.types.iter().flat_map(|t| t.methods.iter())
    }

    /// Total number of methods across all types.
    #[must_use]
    pub fn method_count(&self) -> usize {
        self.types.iter().map(|t| t.methods.len()).sum()
    }

    /// Applies `f` to every method, sequentially.
    pub fn for_each_method_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut MethodDef),
    {
        for type_def in &mut self.types {
            for method in &mut type_def.methods {
                f(method);
            }
        }
    }

    /// Applies `f` to every method in parallel. Methods are mutated
    /// independently, so this is only suitable for per-method sweeps that
    /// never look across method boundaries.
    pub fn par_for_each_method_mut<F>(&mut self, f: F)
    where
        F: Fn(&mut MethodDef) + Send + Sync,
    {
        self.types.par_iter_mut().for_each(|type_def| {
            for method in &mut type_def.methods {
                f(method);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::instruction::Instruction;

    fn sample_module() -> Module {
        let mut body = Body::new();
        body.push(Instruction::ldc_i4(1));
        body.push(Instruction::ret());

        Module::new("sample.exe").with_type(
            TypeDef::new(Token::new(0x02000001), "Widget", "Sample")
                .with_method(
                    MethodDef::new(Token::new(0x06000001), "Run")
                        .with_flags(MethodFlags::STATIC)
                        .with_return_type(TypeSig::I4)
                        .with_body(body),
                )
                .with_field(
                    FieldDef::new(Token::new(0x04000001), "count", TypeSig::I4)
                        .with_flags(FieldFlags::STATIC | FieldFlags::PRIVATE),
                )
                .with_property(PropertyDef::new(Token::new(0x17000001), "Count")),
        )
    }

    #[test]
    fn test_method_lookup_by_token() {
        let module = sample_module();
        let method = module.method(Token::new(0x06000001)).expect("method");
        assert_eq!(method.name, "Run");
        assert!(method.is_static());
        assert_eq!(method.instruction_count(), 2);

        assert!(module.method(Token::new(0x06000099)).is_none());
    }

    #[test]
    fn test_method_mut_lookup() {
        let mut module = sample_module();
        module
            .method_mut(Token::new(0x06000001))
            .expect("method")
            .name = "Renamed".to_string();
        assert_eq!(module.method(Token::new(0x06000001)).map(|m| m.name.as_str()), Some("Renamed"));
    }

    #[test]
    fn test_type_of_method() {
        let module = sample_module();
        let owner = module.type_of_method(Token::new(0x06000001)).expect("type");
        assert_eq!(owner.full_name(), "Sample.Widget");
    }

    #[test]
    fn test_field_lookup_and_flags() {
        let module = sample_module();
        let field = module.field(Token::new(0x04000001)).expect("field");
        assert!(field.is_static());
        assert!(field.is_private());
    }

    #[test]
    fn test_global_type_detection() {
        let global = TypeDef::new(Token::new(0x02000001), "<Module>", "");
        assert!(global.is_global_type());
        assert_eq!(global.full_name(), "<Module>");
    }

    #[test]
    fn test_constructor_flags() {
        let ctor = MethodDef::new(Token::new(0x06000002), ".ctor").with_flags(MethodFlags::CTOR);
        let cctor = MethodDef::new(Token::new(0x06000003), ".cctor")
            .with_flags(MethodFlags::CCTOR | MethodFlags::STATIC);
        let plain = MethodDef::new(Token::new(0x06000004), "Run");

        assert!(ctor.is_constructor());
        assert!(cctor.is_constructor());
        assert!(!plain.is_constructor());
    }

    #[test]
    fn test_typesig_display() {
        assert_eq!(TypeSig::I4.to_string(), "int32");
        assert_eq!(TypeSig::Array(Box::new(TypeSig::Str)).to_string(), "string[]");
        assert_eq!(
            TypeSig::Named("System.Collections.Generic.Dictionary`2".to_string()).to_string(),
            "System.Collections.Generic.Dictionary`2"
        );
    }

    #[test]
    fn test_for_each_method_mut_visits_all() {
        let mut module = sample_module();
        let mut seen = 0;
        module.for_each_method_mut(|_| seen += 1);
        assert_eq!(seen, 1);
        assert_eq!(module.method_count(), 1);
    }
}
