//! Loaded bytecode images.
//!
//! An image is one compiled bundle: the framed header, the constant
//! table, and the module blocks. Loading validates the signature and
//! version and deserializes the constant pools; module blocks execute
//! sequentially from `code_start`, switching module context at each
//! `module` opcode.

use std::rc::Rc;

use crate::{
    consttable::ConstTable,
    error::{ErrorCode, QuillError, QuillResult},
    opcode::{Opcode, SIGNATURE, VERSION},
};

/// One loaded bytecode image. Module byte offsets inside [`Self::bytes`]
/// stay valid for the lifetime of the interpreter, so function entry
/// points and stored initializers reference `(image, offset)` pairs.
#[derive(Debug)]
pub struct Image {
    pub bytes: Rc<[u8]>,
    pub consts: ConstTable,
    /// Offset of the first `module` opcode.
    pub code_start: usize,
}

impl Image {
    /// Validates the framing and deserializes the constant table.
    pub fn from_bytes(bytes: Vec<u8>) -> QuillResult<Self> {
        let mut reader = Reader::new(&bytes);
        if reader.u8()? != Opcode::Signature as u8 || reader.take(4)? != SIGNATURE {
            return Err(QuillError::positionless(
                ErrorCode::BytesSignature,
                "not a bytecode image: bad signature",
            ));
        }
        if reader.u8()? != Opcode::Version as u8 {
            return Err(QuillError::positionless(
                ErrorCode::BytesSignature,
                "not a bytecode image: missing version block",
            ));
        }
        let version = reader.take(4)?;
        if version != VERSION {
            return Err(QuillError::positionless(
                ErrorCode::BytecodeVersion,
                format!(
                    "incompatible bytecode version {version:?}, expected {VERSION:?}"
                ),
            ));
        }
        if reader.u8()? != Opcode::ConstTable as u8 {
            return Err(QuillError::positionless(
                ErrorCode::BytesSignature,
                "not a bytecode image: missing constant table",
            ));
        }
        let mut consts = ConstTable::new();
        let int_count = reader.u16()?;
        for _ in 0..int_count {
            consts.intern_int(reader.i64()?);
        }
        let float_count = reader.u16()?;
        for _ in 0..float_count {
            consts.intern_float(reader.f64()?);
        }
        let string_count = reader.u16()?;
        for _ in 0..string_count {
            let len = reader.u16()? as usize;
            let raw = reader.take(len)?;
            let text = std::str::from_utf8(raw).map_err(|_| {
                QuillError::positionless(ErrorCode::BytesSignature, "constant table holds invalid UTF-8")
            })?;
            consts.intern_str(text);
        }
        let code_start = reader.position();
        Ok(Self {
            bytes: Rc::from(bytes),
            consts,
            code_start,
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> QuillResult<&'a [u8]> {
        let end = self.pos + len;
        if end > self.bytes.len() {
            return Err(QuillError::positionless(
                ErrorCode::BytesSignature,
                "truncated bytecode image",
            ));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> QuillResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> QuillResult<u16> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn i64(&mut self) -> QuillResult<i64> {
        let raw = self.take(8)?;
        Ok(i64::from_be_bytes(raw.try_into().expect("length checked")))
    }

    fn f64(&mut self) -> QuillResult<f64> {
        let raw = self.take(8)?;
        Ok(f64::from_be_bytes(raw.try_into().expect("length checked")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_signature() {
        let err = Image::from_bytes(vec![0, 9, 9, 9, 9]).unwrap_err();
        assert_eq!(err.code, ErrorCode::BytesSignature);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut bytes = vec![Opcode::Signature as u8];
        bytes.extend_from_slice(&SIGNATURE);
        bytes.push(Opcode::Version as u8);
        bytes.extend_from_slice(&[9, 9, 9, 9]);
        let err = Image::from_bytes(bytes).unwrap_err();
        assert_eq!(err.code, ErrorCode::BytecodeVersion);
    }

    #[test]
    fn round_trips_constant_table() {
        let mut table = ConstTable::new();
        table.intern_int(42);
        table.intern_float(2.5);
        table.intern_str("hello");
        let mut builder = crate::bytes::BytecodeBuilder::new();
        builder.op(Opcode::Signature);
        for byte in SIGNATURE {
            builder.u8(byte);
        }
        builder.op(Opcode::Version);
        for byte in VERSION {
            builder.u8(byte);
        }
        table.write(&mut builder);
        let image = Image::from_bytes(builder.into_bytes()).expect("valid image");
        assert_eq!(image.consts.get_int(0), Some(42));
        assert_eq!(image.consts.get_float(0), Some(2.5));
        assert_eq!(image.consts.get_str(0), Some("hello"));
        assert_eq!(image.code_start, image.bytes.len());
    }
}
