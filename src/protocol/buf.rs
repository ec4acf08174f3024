//! Buffer helpers shared by every wire format in the crate
//!
//! All multi-byte structures are built from the same primitives: LEB128
//! var-ints, single byte booleans, var-int prefixed byte arrays and strings,
//! and UUIDs written as two big-endian u64 halves.

use bytes::{Buf, BufMut, Bytes};
use uuid::Uuid;

use super::CodecError;

/// A u32 never needs more than 5 LEB128 bytes.
pub const MAX_VAR_U32_LEN: usize = 5;

/// Number of bytes `value` occupies as a var-int
pub fn var_u32_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

/// Parse a var-int from the start of `bytes` without consuming anything.
///
/// Returns `Ok(None)` when the var-int is not complete yet, otherwise the
/// value and the number of bytes it spans.
pub fn peek_var_u32(bytes: &[u8]) -> Result<Option<(u32, usize)>, CodecError> {
    let mut value: u32 = 0;
    for (i, byte) in bytes.iter().take(MAX_VAR_U32_LEN).enumerate() {
        let part = (byte & 0x7F) as u32;
        if i == MAX_VAR_U32_LEN - 1 && part > 0x0F {
            return Err(CodecError::VarIntTooLong);
        }
        value |= part << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if bytes.len() >= MAX_VAR_U32_LEN {
        Err(CodecError::VarIntTooLong)
    } else {
        Ok(None)
    }
}

/// Reading side of the wire primitives
pub trait BufReadExt: Buf {
    fn get_var_u32_checked(&mut self) -> Result<u32, CodecError> {
        let mut value: u32 = 0;
        for i in 0..MAX_VAR_U32_LEN {
            if !self.has_remaining() {
                return Err(CodecError::Malformed("truncated var-int"));
            }
            let byte = self.get_u8();
            let part = (byte & 0x7F) as u32;
            if i == MAX_VAR_U32_LEN - 1 && part > 0x0F {
                return Err(CodecError::VarIntTooLong);
            }
            value |= part << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::VarIntTooLong)
    }

    fn get_bool_checked(&mut self) -> Result<bool, CodecError> {
        if !self.has_remaining() {
            return Err(CodecError::Malformed("truncated boolean"));
        }
        match self.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(CodecError::Malformed("boolean out of range")),
        }
    }

    fn get_u8_checked(&mut self) -> Result<u8, CodecError> {
        if !self.has_remaining() {
            return Err(CodecError::Malformed("truncated byte"));
        }
        Ok(self.get_u8())
    }

    fn get_uuid_checked(&mut self) -> Result<Uuid, CodecError> {
        if self.remaining() < 16 {
            return Err(CodecError::Malformed("truncated uuid"));
        }
        let high = self.get_u64();
        let low = self.get_u64();
        Ok(Uuid::from_u64_pair(high, low))
    }

    fn get_byte_array(&mut self) -> Result<Bytes, CodecError> {
        let len = self.get_var_u32_checked()? as usize;
        if self.remaining() < len {
            return Err(CodecError::Malformed("byte array exceeds buffer"));
        }
        Ok(self.copy_to_bytes(len))
    }

    fn get_string(&mut self) -> Result<String, CodecError> {
        let raw = self.get_byte_array()?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

impl<B: Buf + ?Sized> BufReadExt for B {}

/// Writing side of the wire primitives
pub trait BufWriteExt: BufMut {
    fn put_var_u32(&mut self, mut value: u32) {
        loop {
            if value & !0x7F == 0 {
                self.put_u8(value as u8);
                return;
            }
            self.put_u8(((value & 0x7F) | 0x80) as u8);
            value >>= 7;
        }
    }

    fn put_bool(&mut self, value: bool) {
        self.put_u8(value as u8);
    }

    fn put_uuid(&mut self, id: &Uuid) {
        let (high, low) = id.as_u64_pair();
        self.put_u64(high);
        self.put_u64(low);
    }

    fn put_byte_array(&mut self, bytes: &[u8]) {
        self.put_var_u32(bytes.len() as u32);
        self.put_slice(bytes);
    }

    fn put_string(&mut self, value: &str) {
        self.put_byte_array(value.as_bytes());
    }
}

impl<B: BufMut + ?Sized> BufWriteExt for B {}
