//! Shared fixtures for the integration suite: a small builder over the
//! row tables so individual tests read as type declarations rather than
//! as plumbing.
#![allow(dead_code)]

use cilclass::prelude::*;

/// Module id of the registry's intrinsic core library.
pub const CORE: ModuleId = ModuleId(0);

/// Bootstrap row numbers of the core types, stable across registries.
pub const OBJECT_ROW: u32 = 1;
pub const VALUE_TYPE_ROW: u32 = 2;
pub const ENUM_ROW: u32 = 3;

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

pub fn prim(kind: PrimitiveKind) -> TypeShape {
    TypeShape::Primitive(kind)
}

/// One module under construction, with reference tokens to the core
/// types already in place.
pub struct ModuleBuilder {
    pub module: ModuleMetadata,
    object: Token,
    value_type: Token,
    enum_type: Token,
}

impl ModuleBuilder {
    pub fn new(name: &str) -> Self {
        let mut module = ModuleMetadata::new(name);
        let object = module.add_type_ref(CORE, Token::typedef(OBJECT_ROW));
        let value_type = module.add_type_ref(CORE, Token::typedef(VALUE_TYPE_ROW));
        let enum_type = module.add_type_ref(CORE, Token::typedef(ENUM_ROW));
        ModuleBuilder {
            module,
            object,
            value_type,
            enum_type,
        }
    }

    /// Shape referencing `System.Object`.
    pub fn object(&self) -> TypeShape {
        TypeShape::Class(self.object)
    }

    /// Auto-layout class extending `System.Object`.
    pub fn class(&self, name: &str) -> TypeDefRow {
        TypeDefRow::new("Fix", name, TypeAttributes::PUBLIC).extends(self.object())
    }

    /// Sequential-layout value type extending `System.ValueType`.
    pub fn strukt(&self, name: &str) -> TypeDefRow {
        TypeDefRow::new(
            "Fix",
            name,
            TypeAttributes::PUBLIC | TypeAttributes::SEALED | TypeAttributes::SEQUENTIAL_LAYOUT,
        )
        .extends(TypeShape::Class(self.value_type))
    }

    /// Explicit-layout value type extending `System.ValueType`.
    pub fn explicit_strukt(&self, name: &str) -> TypeDefRow {
        TypeDefRow::new(
            "Fix",
            name,
            TypeAttributes::PUBLIC | TypeAttributes::SEALED | TypeAttributes::EXPLICIT_LAYOUT,
        )
        .extends(TypeShape::Class(self.value_type))
    }

    /// Enum extending `System.Enum`, with the canonical `value__` field.
    pub fn enumeration(&self, name: &str, underlying: PrimitiveKind) -> TypeDefRow {
        TypeDefRow::new(
            "Fix",
            name,
            TypeAttributes::PUBLIC | TypeAttributes::SEALED,
        )
        .extends(TypeShape::Class(self.enum_type))
        .field(FieldRow::instance("value__", &prim(underlying)))
    }

    /// Abstract interface row.
    pub fn iface(&self, name: &str) -> TypeDefRow {
        TypeDefRow::new(
            "Fix",
            name,
            TypeAttributes::PUBLIC | TypeAttributes::INTERFACE | TypeAttributes::ABSTRACT,
        )
    }

    pub fn add(&mut self, row: TypeDefRow) -> Token {
        self.module.add_type(row)
    }

    pub fn register(self, registry: &TypeRegistry) -> ModuleId {
        registry.add_module(self.module)
    }
}

/// Field descriptor by name, after the owner has been initialized.
pub fn field_named(ty: &TypeRc, name: &str) -> FieldRc {
    ty.fields()
        .expect("fields materialized")
        .iter()
        .find(|f| f.name == name)
        .unwrap_or_else(|| panic!("{ty} has no field {name}"))
        .clone()
}

/// Method descriptor by name.
pub fn method_named(ty: &TypeRc, name: &str) -> MethodRc {
    ty.methods()
        .expect("methods materialized")
        .iter()
        .find(|m| m.name == name)
        .unwrap_or_else(|| panic!("{ty} has no method {name}"))
        .clone()
}
