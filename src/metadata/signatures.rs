//! Field signature parsing and the decoded type-shape model.
//!
//! Raw metadata stores a field's declared type as a byte-encoded signature
//! (ECMA-335 II.23.2.4): a leading `FIELD` calling-convention tag followed by
//! a single encoded type. This module decodes those bytes into a [`TypeShape`]
//! tree, the structural description consumed by the type resolver. Shapes are
//! deliberately *unresolved*: tokens stay tokens and generic parameters stay
//! indices until [`crate::metadata::typesystem::TypeRegistry`] turns them
//! into interned descriptors.
//!
//! Shapes also carry the inflation primitive: substituting concrete argument
//! shapes for `Var` occurrences, with the no-allocation fast path for shapes
//! that contain no type parameters at all.

use crate::{
    metadata::token::{Token, TABLE_TYPEDEF, TABLE_TYPEREF, TABLE_TYPESPEC},
    Error, Result,
};

#[allow(non_snake_case, dead_code, missing_docs)]
/// Possible bytes that represent various 'Types' for a signature - from coreclr
pub mod ELEMENT_TYPE {
    //Marks end of a list
    pub const END: u8 = 0x00;
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0a;
    pub const U8: u8 = 0x0b;
    pub const R4: u8 = 0x0c;
    pub const R8: u8 = 0x0d;
    pub const STRING: u8 = 0x0e;
    // Followed by type
    pub const PTR: u8 = 0x0f;
    // Followed by TypeDef or TypeRef token
    pub const VALUETYPE: u8 = 0x11;
    // Followed by TypeDef or TypeRef token
    pub const CLASS: u8 = 0x12;
    // Generic parameter in a generic type definition, represented as number
    pub const VAR: u8 = 0x13;
    // Generic type instantiation. Followed by type type-arg-count type-1 ... type-n
    pub const GENERICINST: u8 = 0x15;
    // System.IntPtr
    pub const I: u8 = 0x18;
    // System.UIntPtr
    pub const U: u8 = 0x19;
    // Followed by full method signature
    pub const FNPTR: u8 = 0x1b;
    // System.Object
    pub const OBJECT: u8 = 0x1c;
    // Single-dim array with 0 lower bound
    pub const SZARRAY: u8 = 0x1d;
}

/// Leading calling-convention byte of a field signature (ECMA-335 II.23.2.4)
pub const SIG_FIELD: u8 = 0x06;

/// Built-in primitive kinds with fixed size and alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum PrimitiveKind {
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    I,
    U,
    Object,
    String,
}

impl PrimitiveKind {
    /// Namespace of the corresponding runtime type (always `System`).
    #[must_use]
    pub fn namespace(&self) -> &'static str {
        "System"
    }

    /// Simple name of the corresponding runtime type.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            PrimitiveKind::Void => "Void",
            PrimitiveKind::Boolean => "Boolean",
            PrimitiveKind::Char => "Char",
            PrimitiveKind::I1 => "SByte",
            PrimitiveKind::U1 => "Byte",
            PrimitiveKind::I2 => "Int16",
            PrimitiveKind::U2 => "UInt16",
            PrimitiveKind::I4 => "Int32",
            PrimitiveKind::U4 => "UInt32",
            PrimitiveKind::I8 => "Int64",
            PrimitiveKind::U8 => "UInt64",
            PrimitiveKind::R4 => "Single",
            PrimitiveKind::R8 => "Double",
            PrimitiveKind::I => "IntPtr",
            PrimitiveKind::U => "UIntPtr",
            PrimitiveKind::Object => "Object",
            PrimitiveKind::String => "String",
        }
    }

    /// Byte size of the primitive, with pointer-sized kinds resolved
    /// against `pointer_size`. `Void` has size 0.
    #[must_use]
    pub fn size(&self, pointer_size: u32) -> u32 {
        match self {
            PrimitiveKind::Void => 0,
            PrimitiveKind::Boolean | PrimitiveKind::I1 | PrimitiveKind::U1 => 1,
            PrimitiveKind::Char | PrimitiveKind::I2 | PrimitiveKind::U2 => 2,
            PrimitiveKind::I4 | PrimitiveKind::U4 | PrimitiveKind::R4 => 4,
            PrimitiveKind::I8 | PrimitiveKind::U8 | PrimitiveKind::R8 => 8,
            PrimitiveKind::I
            | PrimitiveKind::U
            | PrimitiveKind::Object
            | PrimitiveKind::String => pointer_size,
        }
    }

    /// True for the value-typed primitives (everything except `Void`,
    /// `Object` and `String`).
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        !matches!(
            self,
            PrimitiveKind::Void | PrimitiveKind::Object | PrimitiveKind::String
        )
    }

    /// True for kinds that are legal as an enum's underlying representation.
    #[must_use]
    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            PrimitiveKind::Boolean
                | PrimitiveKind::Char
                | PrimitiveKind::I1
                | PrimitiveKind::U1
                | PrimitiveKind::I2
                | PrimitiveKind::U2
                | PrimitiveKind::I4
                | PrimitiveKind::U4
                | PrimitiveKind::I8
                | PrimitiveKind::U8
                | PrimitiveKind::I
                | PrimitiveKind::U
        )
    }
}

/// Structural description of a declared type, decoded from a signature but
/// not yet resolved against the registry.
///
/// `Class`/`ValueType`/`GenericInst` carry the `TypeDef`/`TypeRef` token from
/// the defining module's tables; `Var` carries the 0-based index of a type
/// parameter of the *enclosing* generic type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeShape {
    /// A built-in primitive
    Primitive(PrimitiveKind),
    /// A reference type identified by token
    Class(Token),
    /// A value type identified by token
    ValueType(Token),
    /// Single-dimensional, zero-based array of the element shape
    SzArray(Box<TypeShape>),
    /// Unmanaged pointer to the pointee shape
    Pointer(Box<TypeShape>),
    /// Function pointer with the given parameter and return shapes
    FnPtr {
        /// Parameter shapes in declaration order
        params: Vec<TypeShape>,
        /// Return shape
        returns: Box<TypeShape>,
    },
    /// Generic type parameter of the enclosing type, by index
    Var(u32),
    /// Instantiation of a generic definition with the given argument shapes
    GenericInst {
        /// The definition is a value type (`struct`) rather than a class
        value_type: bool,
        /// Token of the generic definition
        definition: Token,
        /// Argument shapes in declaration order
        args: Vec<TypeShape>,
    },
}

impl TypeShape {
    /// Shorthand for `TypeShape::Primitive(PrimitiveKind::I4)` and friends,
    /// used pervasively by tests and fixtures.
    #[must_use]
    pub fn primitive(kind: PrimitiveKind) -> Self {
        TypeShape::Primitive(kind)
    }

    /// Encode this shape as a field signature blob (tag byte + type).
    ///
    /// The inverse of [`parse_field_signature`]; used by metadata producers
    /// and test fixtures.
    #[must_use]
    pub fn to_field_signature(&self) -> Vec<u8> {
        let mut out = vec![SIG_FIELD];
        self.encode(&mut out);
        out
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            TypeShape::Primitive(kind) => out.push(match kind {
                PrimitiveKind::Void => ELEMENT_TYPE::VOID,
                PrimitiveKind::Boolean => ELEMENT_TYPE::BOOLEAN,
                PrimitiveKind::Char => ELEMENT_TYPE::CHAR,
                PrimitiveKind::I1 => ELEMENT_TYPE::I1,
                PrimitiveKind::U1 => ELEMENT_TYPE::U1,
                PrimitiveKind::I2 => ELEMENT_TYPE::I2,
                PrimitiveKind::U2 => ELEMENT_TYPE::U2,
                PrimitiveKind::I4 => ELEMENT_TYPE::I4,
                PrimitiveKind::U4 => ELEMENT_TYPE::U4,
                PrimitiveKind::I8 => ELEMENT_TYPE::I8,
                PrimitiveKind::U8 => ELEMENT_TYPE::U8,
                PrimitiveKind::R4 => ELEMENT_TYPE::R4,
                PrimitiveKind::R8 => ELEMENT_TYPE::R8,
                PrimitiveKind::I => ELEMENT_TYPE::I,
                PrimitiveKind::U => ELEMENT_TYPE::U,
                PrimitiveKind::Object => ELEMENT_TYPE::OBJECT,
                PrimitiveKind::String => ELEMENT_TYPE::STRING,
            }),
            TypeShape::Class(token) => {
                out.push(ELEMENT_TYPE::CLASS);
                write_compressed_u32(out, encode_typedef_or_ref(*token));
            }
            TypeShape::ValueType(token) => {
                out.push(ELEMENT_TYPE::VALUETYPE);
                write_compressed_u32(out, encode_typedef_or_ref(*token));
            }
            TypeShape::SzArray(inner) => {
                out.push(ELEMENT_TYPE::SZARRAY);
                inner.encode(out);
            }
            TypeShape::Pointer(inner) => {
                out.push(ELEMENT_TYPE::PTR);
                inner.encode(out);
            }
            TypeShape::FnPtr { params, returns } => {
                out.push(ELEMENT_TYPE::FNPTR);
                write_compressed_u32(out, params.len() as u32);
                returns.encode(out);
                for param in params {
                    param.encode(out);
                }
            }
            TypeShape::Var(index) => {
                out.push(ELEMENT_TYPE::VAR);
                write_compressed_u32(out, *index);
            }
            TypeShape::GenericInst {
                value_type,
                definition,
                args,
            } => {
                out.push(ELEMENT_TYPE::GENERICINST);
                out.push(if *value_type {
                    ELEMENT_TYPE::VALUETYPE
                } else {
                    ELEMENT_TYPE::CLASS
                });
                write_compressed_u32(out, encode_typedef_or_ref(*definition));
                write_compressed_u32(out, args.len() as u32);
                for arg in args {
                    arg.encode(out);
                }
            }
        }
    }
}

/// Maximum nesting depth accepted while decoding a single signature
const MAX_SIGNATURE_DEPTH: usize = 64;

/// Parse a field signature blob into its declared [`TypeShape`].
///
/// Validates the leading `FIELD` tag byte and that the blob contains exactly
/// one well-formed type with no trailing bytes.
///
/// # Errors
/// Returns [`Error::MalformedSignature`] on a wrong tag byte, truncated
/// data, unknown element bytes, or trailing garbage, and
/// [`Error::RecursionLimit`] on absurdly nested shapes.
pub fn parse_field_signature(data: &[u8]) -> Result<TypeShape> {
    let mut reader = SignatureReader::new(data);
    let tag = reader.read_u8()?;
    if tag != SIG_FIELD {
        return Err(malformed_error!(
            "Field signature has invalid leading tag byte 0x{:02x}, expected 0x{:02x}",
            tag,
            SIG_FIELD
        ));
    }
    let shape = reader.read_type(0)?;
    if !reader.is_at_end() {
        return Err(malformed_error!(
            "Field signature has {} trailing byte(s)",
            reader.remaining()
        ));
    }
    Ok(shape)
}

/// Cursor over raw signature bytes
struct SignatureReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SignatureReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        SignatureReader { data, pos: 0 }
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> Result<u8> {
        let Some(&byte) = self.data.get(self.pos) else {
            return Err(malformed_error!("Signature ended unexpectedly"));
        };
        self.pos += 1;
        Ok(byte)
    }

    /// ECMA-335 II.23.2 compressed unsigned integer
    fn read_compressed_u32(&mut self) -> Result<u32> {
        let b0 = self.read_u8()?;
        if b0 & 0x80 == 0 {
            return Ok(u32::from(b0));
        }
        if b0 & 0xC0 == 0x80 {
            let b1 = self.read_u8()?;
            return Ok((u32::from(b0 & 0x3F) << 8) | u32::from(b1));
        }
        if b0 & 0xE0 == 0xC0 {
            let b1 = self.read_u8()?;
            let b2 = self.read_u8()?;
            let b3 = self.read_u8()?;
            return Ok((u32::from(b0 & 0x1F) << 24)
                | (u32::from(b1) << 16)
                | (u32::from(b2) << 8)
                | u32::from(b3));
        }
        Err(malformed_error!(
            "Invalid compressed integer prefix 0x{:02x}",
            b0
        ))
    }

    fn read_typedef_or_ref(&mut self) -> Result<Token> {
        let coded = self.read_compressed_u32()?;
        decode_typedef_or_ref(coded)
    }

    fn read_type(&mut self, depth: usize) -> Result<TypeShape> {
        if depth >= MAX_SIGNATURE_DEPTH {
            return Err(Error::RecursionLimit(MAX_SIGNATURE_DEPTH));
        }

        let element = self.read_u8()?;
        match element {
            ELEMENT_TYPE::VOID => Ok(TypeShape::Primitive(PrimitiveKind::Void)),
            ELEMENT_TYPE::BOOLEAN => Ok(TypeShape::Primitive(PrimitiveKind::Boolean)),
            ELEMENT_TYPE::CHAR => Ok(TypeShape::Primitive(PrimitiveKind::Char)),
            ELEMENT_TYPE::I1 => Ok(TypeShape::Primitive(PrimitiveKind::I1)),
            ELEMENT_TYPE::U1 => Ok(TypeShape::Primitive(PrimitiveKind::U1)),
            ELEMENT_TYPE::I2 => Ok(TypeShape::Primitive(PrimitiveKind::I2)),
            ELEMENT_TYPE::U2 => Ok(TypeShape::Primitive(PrimitiveKind::U2)),
            ELEMENT_TYPE::I4 => Ok(TypeShape::Primitive(PrimitiveKind::I4)),
            ELEMENT_TYPE::U4 => Ok(TypeShape::Primitive(PrimitiveKind::U4)),
            ELEMENT_TYPE::I8 => Ok(TypeShape::Primitive(PrimitiveKind::I8)),
            ELEMENT_TYPE::U8 => Ok(TypeShape::Primitive(PrimitiveKind::U8)),
            ELEMENT_TYPE::R4 => Ok(TypeShape::Primitive(PrimitiveKind::R4)),
            ELEMENT_TYPE::R8 => Ok(TypeShape::Primitive(PrimitiveKind::R8)),
            ELEMENT_TYPE::I => Ok(TypeShape::Primitive(PrimitiveKind::I)),
            ELEMENT_TYPE::U => Ok(TypeShape::Primitive(PrimitiveKind::U)),
            ELEMENT_TYPE::OBJECT => Ok(TypeShape::Primitive(PrimitiveKind::Object)),
            ELEMENT_TYPE::STRING => Ok(TypeShape::Primitive(PrimitiveKind::String)),
            ELEMENT_TYPE::CLASS => Ok(TypeShape::Class(self.read_typedef_or_ref()?)),
            ELEMENT_TYPE::VALUETYPE => Ok(TypeShape::ValueType(self.read_typedef_or_ref()?)),
            ELEMENT_TYPE::SZARRAY => {
                Ok(TypeShape::SzArray(Box::new(self.read_type(depth + 1)?)))
            }
            ELEMENT_TYPE::PTR => Ok(TypeShape::Pointer(Box::new(self.read_type(depth + 1)?))),
            ELEMENT_TYPE::VAR => Ok(TypeShape::Var(self.read_compressed_u32()?)),
            ELEMENT_TYPE::FNPTR => {
                let param_count = self.read_compressed_u32()?;
                let returns = Box::new(self.read_type(depth + 1)?);
                let mut params = Vec::with_capacity(param_count as usize);
                for _ in 0..param_count {
                    params.push(self.read_type(depth + 1)?);
                }
                Ok(TypeShape::FnPtr { params, returns })
            }
            ELEMENT_TYPE::GENERICINST => {
                let kind = self.read_u8()?;
                let value_type = match kind {
                    ELEMENT_TYPE::CLASS => false,
                    ELEMENT_TYPE::VALUETYPE => true,
                    other => {
                        return Err(malformed_error!(
                            "GENERICINST must be followed by CLASS or VALUETYPE, found 0x{:02x}",
                            other
                        ))
                    }
                };
                let definition = self.read_typedef_or_ref()?;
                let arg_count = self.read_compressed_u32()?;
                let mut args = Vec::with_capacity(arg_count as usize);
                for _ in 0..arg_count {
                    args.push(self.read_type(depth + 1)?);
                }
                Ok(TypeShape::GenericInst {
                    value_type,
                    definition,
                    args,
                })
            }
            other => Err(malformed_error!(
                "Unknown element type 0x{:02x} in signature",
                other
            )),
        }
    }
}

/// Encode a `TypeDefOrRef` coded index (ECMA-335 II.24.2.6)
fn encode_typedef_or_ref(token: Token) -> u32 {
    let tag = match token.table() {
        TABLE_TYPEDEF => 0,
        TABLE_TYPEREF => 1,
        _ => 2,
    };
    (token.row() << 2) | tag
}

/// Decode a `TypeDefOrRef` coded index back into a token
fn decode_typedef_or_ref(coded: u32) -> Result<Token> {
    let row = coded >> 2;
    match coded & 0x3 {
        0 => Ok(Token::typedef(row)),
        1 => Ok(Token::typeref(row)),
        2 => Ok(Token::new((u32::from(TABLE_TYPESPEC) << 24) | row)),
        _ => Err(malformed_error!(
            "Invalid TypeDefOrRef coded index 0x{:x}",
            coded
        )),
    }
}

/// Append a compressed unsigned integer (ECMA-335 II.23.2)
pub fn write_compressed_u32(out: &mut Vec<u8>, value: u32) {
    if value < 0x80 {
        out.push(value as u8);
    } else if value < 0x4000 {
        out.push(0x80 | (value >> 8) as u8);
        out.push(value as u8);
    } else {
        out.push(0xC0 | (value >> 24) as u8);
        out.push((value >> 16) as u8);
        out.push((value >> 8) as u8);
        out.push(value as u8);
    }
}
