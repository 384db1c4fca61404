//! Opcode enumeration, local-value subtypes, the register file layout,
//! and the bytecode image framing constants.
//!
//! Opcode byte values are the enum discriminants, assigned densely in one
//! contiguous block; decoding is a table lookup via `from_repr`.

use strum::{Display, FromRepr};

/// Image signature bytes following the [`Opcode::Signature`] byte.
pub const SIGNATURE: [u8; 4] = [8, 5, 20, 21];

/// Compiler version bytes following the [`Opcode::Version`] byte.
pub const VERSION: [u8; 4] = [0, 1, 0, 0];

/// Every instruction the VM understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum Opcode {
    Signature = 0,
    Version,
    Module,
    EndOfModule,
    ConstTable,
    LineInfo,
    Local,
    Register,
    Assign,
    MemberGet,
    MemberSet,
    SubGet,
    SubSet,
    Call,
    EndOfExec,
    EndOfStmt,
    EndOfBlock,
    EndOfFunc,
    Block,
    LoopPoint,
    WhileStmt,
    DoStmt,
    IfStmt,
    Skip,
    Anchor,
    WhenStmt,
    Goto,
    BreakLoop,
    ContinueLoop,
    VarDecl,
    FuncDecl,
    ClassDecl,
    StructDecl,
    TypeAliasDecl,
    ImportDecl,
    LogicalOr,
    LogicalAnd,
    Equal,
    NotEqual,
    Lesser,
    Greater,
    LesserOrEqual,
    GreaterOrEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Negative,
    LogicalNot,
    TypeAs,
    TypeIs,
    TypeIsNot,
    TypeOf,
}

impl Opcode {
    /// Decodes a byte into an opcode, if it is one.
    #[must_use]
    pub fn decode(byte: u8) -> Option<Self> {
        Self::from_repr(byte)
    }
}

/// Subtype byte following [`Opcode::Local`], selecting what kind of value
/// to load into the value register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum LocalType {
    Null = 0,
    Boolean,
    ConstInt,
    ConstFloat,
    ConstString,
    StringInterpolation,
    Identifier,
    Group,
    List,
    Struct,
    Function,
    Type,
}

impl LocalType {
    #[must_use]
    pub fn decode(byte: u8) -> Option<Self> {
        Self::from_repr(byte)
    }
}

/// The sixteen named register slots, encoded as indices into the VM's
/// register file.
///
/// [`Register::Value`] is the implicit result slot every evaluation
/// writes; binary operators take their left operand from the dedicated
/// per-precedence slot and the right operand from `Value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum Register {
    Value = 0,
    Identifier,
    LeftValue,
    RefType,
    TypeArgs,
    LoopCount,
    Anchor,
    Assign,
    OrLeft,
    AndLeft,
    EqualLeft,
    RelationLeft,
    AddLeft,
    MultiplyLeft,
    PostfixObject,
    PostfixKey,
}

/// Number of register slots in the file.
pub const REGISTER_COUNT: usize = 16;

impl Register {
    #[must_use]
    pub fn decode(byte: u8) -> Option<Self> {
        Self::from_repr(byte)
    }

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_decode_round_trip() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Opcode::decode(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(Opcode::decode(Opcode::TypeOf as u8), Some(Opcode::TypeOf));
        assert_eq!(Opcode::decode(200), None);
    }

    #[test]
    fn opcode_block_is_contiguous() {
        let last = Opcode::TypeOf as u8;
        for byte in 0..=last {
            assert!(Opcode::decode(byte).is_some(), "gap at opcode byte {byte}");
        }
    }

    #[test]
    fn register_file_has_sixteen_slots() {
        assert_eq!(Register::PostfixKey.index() + 1, REGISTER_COUNT);
        assert_eq!(Register::decode(0), Some(Register::Value));
        assert_eq!(Register::decode(15), Some(Register::PostfixKey));
        assert_eq!(Register::decode(16), None);
    }
}
