//! In-memory module metadata: the row-level view of a loaded module.
//!
//! The byte-format reader (PE headers, heaps, table decoding) is an external
//! collaborator of this crate; what the layout engine consumes is the decoded
//! row data modelled here. A [`ModuleMetadata`] holds `TypeDef` rows with
//! their field/method/override rows and a `TypeRef` table mapping local
//! reference tokens to `(module, token)` targets — the key-value lookup
//! service the registry resolves against.
//!
//! Rows are immutable once a module is registered; the registry treats them
//! as deterministic, side-effect-free inputs.

use bitflags::bitflags;

use crate::metadata::{
    signatures::TypeShape,
    token::{Token, TABLE_TYPEDEF, TABLE_TYPEREF},
};

/// Identifier of a loaded module within a registry.
///
/// Module 0 is reserved for the registry's intrinsic core library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(pub u32);

bitflags! {
    /// `TypeAttributes` bits (ECMA-335 II.23.1.15), reduced to the bits the
    /// layout engine consumes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeAttributes: u32 {
        /// Type is visible outside the assembly
        const PUBLIC = 0x0000_0001;
        /// Fields are laid out sequentially in declaration order
        const SEQUENTIAL_LAYOUT = 0x0000_0008;
        /// Field offsets are supplied explicitly
        const EXPLICIT_LAYOUT = 0x0000_0010;
        /// Type is an interface
        const INTERFACE = 0x0000_0020;
        /// Type is abstract
        const ABSTRACT = 0x0000_0080;
        /// Type cannot be derived from
        const SEALED = 0x0000_0100;
    }
}

bitflags! {
    /// `FieldAttributes` bits (ECMA-335 II.23.1.5).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldAttributes: u32 {
        /// Accessible only within the defining type
        const PRIVATE = 0x0000_0001;
        /// Accessible to everyone
        const PUBLIC = 0x0000_0006;
        /// Field belongs to the type, not to instances
        const STATIC = 0x0000_0010;
        /// Field can only be initialized, not written after init
        const INIT_ONLY = 0x0000_0020;
        /// Compile-time constant with no backing storage
        const LITERAL = 0x0000_0040;
    }
}

bitflags! {
    /// `MethodAttributes` bits (ECMA-335 II.23.1.10).
    ///
    /// The low three bits form the accessibility value; use
    /// [`MethodAttributes::accessibility`] rather than testing them as flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodAttributes: u32 {
        /// Accessibility: private
        const PRIVATE = 0x0000_0001;
        /// Accessibility: family and assembly
        const FAM_AND_ASSEM = 0x0000_0002;
        /// Accessibility: assembly
        const ASSEMBLY = 0x0000_0003;
        /// Accessibility: family (protected)
        const FAMILY = 0x0000_0004;
        /// Accessibility: family or assembly
        const FAM_OR_ASSEM = 0x0000_0005;
        /// Accessibility: public
        const PUBLIC = 0x0000_0006;
        /// Method belongs to the type, not to instances
        const STATIC = 0x0000_0010;
        /// Method cannot be overridden
        const FINAL = 0x0000_0020;
        /// Method participates in virtual dispatch
        const VIRTUAL = 0x0000_0040;
        /// Hidden by name+signature rather than by name
        const HIDE_BY_SIG = 0x0000_0080;
        /// Method always gets a new vtable slot (vs. reusing a match)
        const NEW_SLOT = 0x0000_0100;
        /// Method has no body at this level
        const ABSTRACT = 0x0000_0400;
        /// Name carries special meaning (.cctor etc.)
        const SPECIAL_NAME = 0x0000_0800;
    }
}

/// Accessibility rank extracted from the low bits of [`MethodAttributes`].
///
/// Ordered from least to most accessible so ranks compare directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MethodAccessibility {
    /// Compiler-controlled (no accessibility)
    CompilerControlled,
    /// Private to the defining type
    Private,
    /// Family and assembly
    FamAndAssem,
    /// Assembly
    Assembly,
    /// Family (protected)
    Family,
    /// Family or assembly
    FamOrAssem,
    /// Public
    Public,
}

impl MethodAttributes {
    /// Extract the accessibility value encoded in the low three bits.
    #[must_use]
    pub fn accessibility(&self) -> MethodAccessibility {
        match self.bits() & 0x7 {
            0x1 => MethodAccessibility::Private,
            0x2 => MethodAccessibility::FamAndAssem,
            0x3 => MethodAccessibility::Assembly,
            0x4 => MethodAccessibility::Family,
            0x5 => MethodAccessibility::FamOrAssem,
            0x6 => MethodAccessibility::Public,
            _ => MethodAccessibility::CompilerControlled,
        }
    }
}

/// Variance of one generic parameter, from the `GenericParam` row's
/// attribute bits (ECMA-335 II.23.1.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenericVariance {
    /// No variance; arguments must match exactly
    #[default]
    Invariant,
    /// Covariant (`out`); a more derived argument is acceptable
    Covariant,
    /// Contravariant (`in`); a less derived argument is acceptable
    Contravariant,
}

/// One `Field` row: name, attribute bits, raw signature blob and (under
/// explicit layout) the declared byte offset.
#[derive(Debug, Clone)]
pub struct FieldRow {
    /// Field name
    pub name: String,
    /// Attribute bits
    pub flags: FieldAttributes,
    /// Raw field-signature bytes (leading `FIELD` tag + encoded type)
    pub signature: Vec<u8>,
    /// Explicit byte offset from the `FieldLayout` table, if any
    pub explicit_offset: Option<u32>,
}

impl FieldRow {
    /// Instance field with the given declared shape.
    #[must_use]
    pub fn instance(name: &str, shape: &TypeShape) -> Self {
        FieldRow {
            name: name.to_string(),
            flags: FieldAttributes::PUBLIC,
            signature: shape.to_field_signature(),
            explicit_offset: None,
        }
    }

    /// Static field with the given declared shape.
    #[must_use]
    pub fn static_field(name: &str, shape: &TypeShape) -> Self {
        FieldRow {
            name: name.to_string(),
            flags: FieldAttributes::PUBLIC | FieldAttributes::STATIC,
            signature: shape.to_field_signature(),
            explicit_offset: None,
        }
    }

    /// Literal (compile-time constant) field; skipped during static layout.
    #[must_use]
    pub fn literal(name: &str, shape: &TypeShape) -> Self {
        FieldRow {
            name: name.to_string(),
            flags: FieldAttributes::PUBLIC | FieldAttributes::STATIC | FieldAttributes::LITERAL,
            signature: shape.to_field_signature(),
            explicit_offset: None,
        }
    }

    /// Attach an explicit layout offset to this row.
    #[must_use]
    pub fn at_offset(mut self, offset: u32) -> Self {
        self.explicit_offset = Some(offset);
        self
    }
}

/// One `MethodDef` row.
///
/// Parameter and return types arrive pre-decoded as [`TypeShape`]s; the
/// signature-blob round trip only matters for fields, where the malformed-
/// signature poisoning path lives.
#[derive(Debug, Clone)]
pub struct MethodRow {
    /// Method name
    pub name: String,
    /// Attribute bits
    pub flags: MethodAttributes,
    /// Method has an IL body (false for abstract declarations)
    pub has_body: bool,
    /// Declared parameter shapes, in order
    pub params: Vec<TypeShape>,
    /// Declared return shape
    pub returns: TypeShape,
}

impl MethodRow {
    /// Public virtual method introducing a new slot, with a body.
    #[must_use]
    pub fn virtual_new(name: &str, params: Vec<TypeShape>, returns: TypeShape) -> Self {
        MethodRow {
            name: name.to_string(),
            flags: MethodAttributes::PUBLIC
                | MethodAttributes::VIRTUAL
                | MethodAttributes::HIDE_BY_SIG
                | MethodAttributes::NEW_SLOT,
            has_body: true,
            params,
            returns,
        }
    }

    /// Public virtual method reusing an inherited slot by name+signature.
    #[must_use]
    pub fn virtual_reuse(name: &str, params: Vec<TypeShape>, returns: TypeShape) -> Self {
        MethodRow {
            name: name.to_string(),
            flags: MethodAttributes::PUBLIC
                | MethodAttributes::VIRTUAL
                | MethodAttributes::HIDE_BY_SIG,
            has_body: true,
            params,
            returns,
        }
    }

    /// Abstract virtual declaration (interface or abstract class member).
    #[must_use]
    pub fn abstract_virtual(name: &str, params: Vec<TypeShape>, returns: TypeShape) -> Self {
        MethodRow {
            name: name.to_string(),
            flags: MethodAttributes::PUBLIC
                | MethodAttributes::VIRTUAL
                | MethodAttributes::HIDE_BY_SIG
                | MethodAttributes::NEW_SLOT
                | MethodAttributes::ABSTRACT,
            has_body: false,
            params,
            returns,
        }
    }

    /// Non-virtual instance method.
    #[must_use]
    pub fn plain(name: &str, params: Vec<TypeShape>, returns: TypeShape) -> Self {
        MethodRow {
            name: name.to_string(),
            flags: MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG,
            has_body: true,
            params,
            returns,
        }
    }

    /// Replace the attribute bits wholesale.
    #[must_use]
    pub fn with_flags(mut self, flags: MethodAttributes) -> Self {
        self.flags = flags;
        self
    }
}

/// One `MethodImpl` row: "`body` overrides declared method `declaration` of
/// `declaring_type`".
#[derive(Debug, Clone)]
pub struct MethodImplRow {
    /// Shape of the type declaring the overridden method (an ancestor class
    /// or an implemented interface, possibly a generic instantiation)
    pub declaring_type: TypeShape,
    /// Name of the overridden declaration within `declaring_type`
    pub declaration: String,
    /// Index into this type's method rows of the overriding body
    pub body_index: usize,
}

/// One `TypeDef` row plus its owned member rows.
#[derive(Debug, Clone)]
pub struct TypeDefRow {
    /// Namespace (may be empty)
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// Attribute bits
    pub flags: TypeAttributes,
    /// Shape of the parent type (`None` only for the root object type and
    /// for interfaces)
    pub extends: Option<TypeShape>,
    /// Shapes of the directly implemented interfaces
    pub interfaces: Vec<TypeShape>,
    /// Number of generic parameters (0 for non-generic types)
    pub generic_param_count: u16,
    /// Per-parameter variance; parameters past the end are invariant
    pub variance: Vec<GenericVariance>,
    /// Packing-size directive (0 = default)
    pub packing_size: u16,
    /// Explicit class-size directive (0 = none)
    pub class_size: u32,
    /// Field rows, in declaration order
    pub fields: Vec<FieldRow>,
    /// Method rows, in declaration order
    pub methods: Vec<MethodRow>,
    /// Explicit override rows
    pub overrides: Vec<MethodImplRow>,
    /// Row belongs to a builder that has not finished assembling the type;
    /// field resolution is deferred while set
    pub under_construction: bool,
}

impl TypeDefRow {
    /// Minimal row with automatic layout and no members.
    #[must_use]
    pub fn new(namespace: &str, name: &str, flags: TypeAttributes) -> Self {
        TypeDefRow {
            namespace: namespace.to_string(),
            name: name.to_string(),
            flags,
            extends: None,
            interfaces: Vec::new(),
            generic_param_count: 0,
            variance: Vec::new(),
            packing_size: 0,
            class_size: 0,
            fields: Vec::new(),
            methods: Vec::new(),
            overrides: Vec::new(),
            under_construction: false,
        }
    }

    /// Set the parent shape.
    #[must_use]
    pub fn extends(mut self, parent: TypeShape) -> Self {
        self.extends = Some(parent);
        self
    }

    /// Add a directly implemented interface.
    #[must_use]
    pub fn implements(mut self, iface: TypeShape) -> Self {
        self.interfaces.push(iface);
        self
    }

    /// Add a field row.
    #[must_use]
    pub fn field(mut self, field: FieldRow) -> Self {
        self.fields.push(field);
        self
    }

    /// Add a method row.
    #[must_use]
    pub fn method(mut self, method: MethodRow) -> Self {
        self.methods.push(method);
        self
    }

    /// Add an explicit override row.
    #[must_use]
    pub fn overrides(mut self, row: MethodImplRow) -> Self {
        self.overrides.push(row);
        self
    }

    /// Mark the row generic with `count` type parameters.
    #[must_use]
    pub fn generic(mut self, count: u16) -> Self {
        self.generic_param_count = count;
        self
    }

    /// Declare per-parameter variance, in parameter order.
    #[must_use]
    pub fn variance(mut self, variance: Vec<GenericVariance>) -> Self {
        self.variance = variance;
        self
    }

    /// Set packing and explicit class size directives.
    #[must_use]
    pub fn layout_directives(mut self, packing_size: u16, class_size: u32) -> Self {
        self.packing_size = packing_size;
        self.class_size = class_size;
        self
    }

    /// Full name (`Namespace.Name`, or just `Name` for the empty namespace).
    #[must_use]
    pub fn fullname(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

/// One `TypeRef` row: a local reference token resolved to a type definition
/// in another (or the same) module.
#[derive(Debug, Clone, Copy)]
pub struct TypeRefRow {
    /// Module defining the referenced type
    pub module: ModuleId,
    /// `TypeDef` token within that module
    pub token: Token,
}

/// The decoded row tables of one loaded module.
#[derive(Debug, Default)]
pub struct ModuleMetadata {
    /// Module name, for diagnostics only
    pub name: String,
    type_defs: Vec<TypeDefRow>,
    type_refs: Vec<TypeRefRow>,
}

impl ModuleMetadata {
    /// Empty module with the given name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        ModuleMetadata {
            name: name.to_string(),
            type_defs: Vec::new(),
            type_refs: Vec::new(),
        }
    }

    /// Append a `TypeDef` row, returning its token.
    pub fn add_type(&mut self, row: TypeDefRow) -> Token {
        self.type_defs.push(row);
        Token::typedef(self.type_defs.len() as u32)
    }

    /// Append a `TypeRef` row targeting `(module, token)`, returning the
    /// local reference token.
    pub fn add_type_ref(&mut self, module: ModuleId, token: Token) -> Token {
        self.type_refs.push(TypeRefRow { module, token });
        Token::typeref(self.type_refs.len() as u32)
    }

    /// Row lookup by `TypeDef` token (1-based rows).
    #[must_use]
    pub fn type_def(&self, token: Token) -> Option<&TypeDefRow> {
        if token.table() != TABLE_TYPEDEF {
            return None;
        }
        self.type_defs.get(token.row().checked_sub(1)? as usize)
    }

    /// Mutable row lookup, available until the module is registered.
    pub fn type_def_mut(&mut self, token: Token) -> Option<&mut TypeDefRow> {
        if token.table() != TABLE_TYPEDEF {
            return None;
        }
        self.type_defs.get_mut(token.row().checked_sub(1)? as usize)
    }

    /// Resolve a local `TypeRef` token to its `(module, token)` target.
    #[must_use]
    pub fn type_ref(&self, token: Token) -> Option<TypeRefRow> {
        if token.table() != TABLE_TYPEREF {
            return None;
        }
        self.type_refs
            .get(token.row().checked_sub(1)? as usize)
            .copied()
    }

    /// Number of `TypeDef` rows.
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.type_defs.len()
    }

    /// Tokens of all `TypeDef` rows.
    pub fn type_tokens(&self) -> impl Iterator<Item = Token> + '_ {
        (1..=self.type_defs.len() as u32).map(Token::typedef)
    }
}
