use std::fmt;

/// Metadata table tag for `TypeDef` tokens (high byte `0x02`).
pub const TABLE_TYPEDEF: u8 = 0x02;
/// Metadata table tag for `TypeRef` tokens (high byte `0x01`).
pub const TABLE_TYPEREF: u8 = 0x01;
/// Metadata table tag for `TypeSpec` tokens (high byte `0x1B`).
pub const TABLE_TYPESPEC: u8 = 0x1B;

/// A metadata token representing a reference to a metadata table entry.
///
/// Tokens consist of a 32-bit value where:
/// - The high byte (bits 24-31) indicates the table type
/// - The low 24 bits (bits 0-23) indicate the row index within that table
///
/// Descriptors for constructed types (arrays, pointers, generic instances)
/// carry artificial tokens in the `0xF000_0000`+ range handed out by the
/// registry; those never collide with real metadata rows.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u32);

impl Token {
    /// Creates a new token from a raw 32-bit value
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a `TypeDef` token for the given 1-based row index
    #[must_use]
    pub fn typedef(row: u32) -> Self {
        Token((u32::from(TABLE_TYPEDEF) << 24) | (row & 0x00FF_FFFF))
    }

    /// Creates a `TypeRef` token for the given 1-based row index
    #[must_use]
    pub fn typeref(row: u32) -> Self {
        Token((u32::from(TABLE_TYPEREF) << 24) | (row & 0x00FF_FFFF))
    }

    /// Returns the raw token value
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Extracts the table type from the token (high byte)
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Extracts the row index from the token (low 24 bits)
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns true if this is a null token (value 0)
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
