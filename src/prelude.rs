//! Commonly used types, re-exported for glob import.
//!
//! ```
//! use cilclass::prelude::*;
//! ```

pub use crate::{
    metadata::{
        modules::{
            FieldAttributes, FieldRow, GenericVariance, MethodAttributes, MethodImplRow,
            MethodRow, ModuleId, ModuleMetadata, TypeAttributes, TypeDefRow,
        },
        signatures::{PrimitiveKind, TypeShape},
        token::Token,
        typesystem::{
            FieldRc, MethodRc, RegistryOptions, SizeInfo, TypeHandle, TypeRc, TypeRegistry, VTable,
        },
    },
    Error, Result,
};
