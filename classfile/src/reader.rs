use crate::ClassFormatError;
use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read};

/// Big-endian reader over the raw class-file bytes. Every read names the
/// structure it was fetching so truncation errors say what was missing.
pub struct ClassReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> ClassReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    pub fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len();
        len.saturating_sub(self.position())
    }

    pub fn u1(&mut self, what: &'static str) -> Result<u8, ClassFormatError> {
        self.cursor
            .read_u8()
            .map_err(|_| ClassFormatError::TruncatedFile(what))
    }

    pub fn i1(&mut self, what: &'static str) -> Result<i8, ClassFormatError> {
        self.cursor
            .read_i8()
            .map_err(|_| ClassFormatError::TruncatedFile(what))
    }

    pub fn u2(&mut self, what: &'static str) -> Result<u16, ClassFormatError> {
        self.cursor
            .read_u16::<BigEndian>()
            .map_err(|_| ClassFormatError::TruncatedFile(what))
    }

    pub fn u4(&mut self, what: &'static str) -> Result<u32, ClassFormatError> {
        self.cursor
            .read_u32::<BigEndian>()
            .map_err(|_| ClassFormatError::TruncatedFile(what))
    }

    pub fn i4(&mut self, what: &'static str) -> Result<i32, ClassFormatError> {
        self.cursor
            .read_i32::<BigEndian>()
            .map_err(|_| ClassFormatError::TruncatedFile(what))
    }

    pub fn i8(&mut self, what: &'static str) -> Result<i64, ClassFormatError> {
        self.cursor
            .read_i64::<BigEndian>()
            .map_err(|_| ClassFormatError::TruncatedFile(what))
    }

    pub fn f4(&mut self, what: &'static str) -> Result<f32, ClassFormatError> {
        self.cursor
            .read_f32::<BigEndian>()
            .map_err(|_| ClassFormatError::TruncatedFile(what))
    }

    pub fn f8(&mut self, what: &'static str) -> Result<f64, ClassFormatError> {
        self.cursor
            .read_f64::<BigEndian>()
            .map_err(|_| ClassFormatError::TruncatedFile(what))
    }

    /// Reads exactly `len` bytes. The length is checked against the bytes
    /// actually left so a lying length prefix cannot trigger a huge
    /// allocation.
    pub fn bytes(&mut self, len: usize, what: &'static str) -> Result<Vec<u8>, ClassFormatError> {
        if len > self.remaining() {
            return Err(ClassFormatError::TruncatedFile(what));
        }
        let mut buf = vec![0u8; len];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| ClassFormatError::TruncatedFile(what))?;
        Ok(buf)
    }
}
