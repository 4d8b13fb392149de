#![warn(missing_docs)]
//! # cilclass
//!
//! A class metadata resolution and layout engine for CIL type systems:
//! the subsystem of a runtime that turns decoded metadata rows into fully
//! laid-out runtime types with field offsets, instance sizes, interface
//! dispatch tables and virtual method tables.
//!
//! The engine is a pure in-process library: it consumes in-memory module
//! row tables (see [`metadata::modules`]) and raw field signatures, and
//! produces interned, immutable-once-published type descriptors. Parsing
//! binary images, verifying bytecode, and executing code are out of
//! scope.
//!
//! ## Core properties
//!
//! - **Interning**: one descriptor per type per registry; pointer
//!   identity is type identity, including for generic instantiations and
//!   constructed shapes (arrays, pointers).
//! - **Lazy, phased computation**: initialization, field layout,
//!   supertype chains, interface offsets, and vtables run independently
//!   and on demand; each publishes its result exactly once.
//! - **Lock-free reads**: published results are read without locks; a
//!   single coarse loader lock serializes only first-time publication.
//! - **Permanent failure**: the first error against a type poisons it;
//!   every later operation reports that original failure, with causes
//!   chained through dependent types.
//!
//! ## Example
//!
//! ```
//! use cilclass::prelude::*;
//!
//! let registry = TypeRegistry::new();
//! let mut module = ModuleMetadata::new("demo");
//! let object = module.add_type_ref(ModuleId(0), Token::typedef(1));
//! let point = module.add_type(
//!     TypeDefRow::new("Demo", "Point", TypeAttributes::PUBLIC)
//!         .extends(TypeShape::Class(object))
//!         .field(FieldRow::instance("x", &TypeShape::Primitive(PrimitiveKind::I4)))
//!         .field(FieldRow::instance("y", &TypeShape::Primitive(PrimitiveKind::I4))),
//! );
//! let module = registry.add_module(module);
//!
//! let point = registry.get(module, point)?;
//! assert_eq!(registry.instance_size(&point)?, 16);
//! # Ok::<(), cilclass::Error>(())
//! ```

#[macro_use]
mod error;
pub mod metadata;
pub mod prelude;

pub use error::Error;

/// Crate-wide result type with [`Error`] as the default error.
pub type Result<T, E = Error> = std::result::Result<T, E>;
