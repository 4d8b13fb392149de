//! Metadata model: tokens, module rows, signatures, and the type system.
//!
//! The layers build on each other from raw identity up to computed layout:
//!
//! - [`token`] - table-tagged row identifiers
//! - [`modules`] - decoded per-module row tables
//! - [`signatures`] - field-signature bytes decoded into [`signatures::TypeShape`]
//! - [`typesystem`] - interned descriptors, field layout, interface offsets
//!   and virtual dispatch tables

pub mod modules;
pub mod signatures;
pub mod token;
pub mod typesystem;
