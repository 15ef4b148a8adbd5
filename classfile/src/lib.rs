//! Parser for JVM class files, producing the [`ParsedClass`] record the
//! rook runtime executes from. The pool keeps the on-disk two-level shape
//! (an ordered index plus per-kind arrays) so bytecode can resolve entries
//! by cp index without chasing owned pointers.

pub mod attributes;
pub mod constant_pool;
pub mod descriptor;
pub mod reader;

use crate::attributes::{
    parse_constant_value, parse_exceptions_attribute, parse_method_parameters, read_attribute,
    CodeAttribute, MethodParameter, RawAttribute,
};
use crate::constant_pool::ConstantPool;
use crate::reader::ClassReader;
use bitflags::bitflags;
use thiserror::Error;

const MAGIC: u32 = 0xCAFE_BABE;
/// Java SE 11.
const MAX_MAJOR_VERSION: u16 = 55;

#[derive(Error, Debug)]
pub enum ClassFormatError {
    #[error("class file ends before {0}")]
    TruncatedFile(&'static str),
    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported class file version {0} (newest supported is {MAX_MAJOR_VERSION})")]
    UnsupportedVersion(u16),
    #[error("constant pool count of zero")]
    EmptyConstantPool,
    #[error("unknown constant pool tag {0}")]
    UnknownCpTag(u8),
    #[error("malformed modified-UTF-8 in constant pool entry {0}")]
    MalformedUtf8(u16),
    #[error("constant pool index {0} out of range")]
    CpIndexOutOfRange(u16),
    #[error("constant pool entry {index} is {found}, expected {expected}")]
    CpKindMismatch {
        index: u16,
        expected: &'static str,
        found: &'static str,
    },
    #[error("bad method handle kind {0}")]
    BadMethodHandleKind(u8),
    #[error("`{0}` is not an unqualified name")]
    BadUnqualifiedName(String),
    #[error("malformed descriptor `{0}`")]
    MalformedDescriptor(String),
}

bitflags! {
    /// Class, field and method access flags. The sets overlap in the class
    /// file format, so one type covers all three uses, the synonymous bits
    /// carrying both names.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const SUPER = 0x0020;
        const BRIDGE = 0x0040;
        const VOLATILE = 0x0040;
        const VARARGS = 0x0080;
        const TRANSIENT = 0x0080;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const MODULE = 0x8000;
    }
}

/// A parsed field. `name_idx`/`desc_idx` are slots into the pool's utf8
/// array, not cp indices.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldInfo {
    pub access_flags: AccessFlags,
    pub name_idx: u16,
    pub desc_idx: u16,
    /// cp index from a ConstantValue attribute, if the field carried one.
    pub constant_value: Option<u16>,
    pub attributes: Vec<RawAttribute>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodInfo {
    pub access_flags: AccessFlags,
    pub name_idx: u16,
    pub desc_idx: u16,
    pub code: Option<CodeAttribute>,
    /// utf8 slots of the declared checked-exception class names.
    pub exceptions: Vec<u16>,
    pub parameters: Vec<MethodParameter>,
    pub attributes: Vec<RawAttribute>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParsedClass {
    pub minor_version: u16,
    pub major_version: u16,
    pub cp: ConstantPool,
    pub access_flags: AccessFlags,
    pub this_class: u16,
    pub super_class: u16,
    /// cp indices of the implemented interfaces.
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<RawAttribute>,
}

impl ParsedClass {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFormatError> {
        let mut r = ClassReader::new(bytes);

        let magic = r.u4("magic number")?;
        if magic != MAGIC {
            return Err(ClassFormatError::BadMagic(magic));
        }
        let minor_version = r.u2("minor version")?;
        let major_version = r.u2("major version")?;
        if major_version > MAX_MAJOR_VERSION {
            return Err(ClassFormatError::UnsupportedVersion(major_version));
        }

        let cp = ConstantPool::parse(&mut r)?;

        let access_flags = AccessFlags::from_bits_truncate(r.u2("access flags")?);
        let this_class = r.u2("this_class index")?;
        cp.class_name_at(this_class)?;
        let super_class = r.u2("super_class index")?;
        if super_class != 0 {
            cp.class_name_at(super_class)?;
        }

        let interface_count = r.u2("interface count")?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            let idx = r.u2("interface index")?;
            cp.class_name_at(idx)?;
            interfaces.push(idx);
        }

        let field_count = r.u2("field count")?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            fields.push(Self::parse_field(&mut r, &cp)?);
        }

        let method_count = r.u2("method count")?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            methods.push(Self::parse_method(&mut r, &cp)?);
        }

        let attr_count = r.u2("class attribute count")?;
        let mut attributes = Vec::with_capacity(attr_count as usize);
        for _ in 0..attr_count {
            let (_, name_slot, body) = read_attribute(&mut r, &cp)?;
            attributes.push(RawAttribute {
                name_slot,
                bytes: body,
            });
        }

        let parsed = Self {
            minor_version,
            major_version,
            cp,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        };
        log::trace!(
            "parsed class {} (version {}.{}, {} fields, {} methods)",
            parsed.class_name().unwrap_or("?"),
            parsed.major_version,
            parsed.minor_version,
            parsed.fields.len(),
            parsed.methods.len(),
        );
        Ok(parsed)
    }

    fn parse_field(r: &mut ClassReader, cp: &ConstantPool) -> Result<FieldInfo, ClassFormatError> {
        let access_flags = AccessFlags::from_bits_truncate(r.u2("field access flags")?);
        let name_idx = cp.utf8_slot_at(r.u2("field name index")?)?;
        let desc_idx = cp.utf8_slot_at(r.u2("field descriptor index")?)?;

        let attr_count = r.u2("field attribute count")?;
        let mut constant_value = None;
        let mut attributes = Vec::new();
        for _ in 0..attr_count {
            let (name, name_slot, body) = read_attribute(r, cp)?;
            if name == "ConstantValue" {
                constant_value = Some(parse_constant_value(&body)?);
            } else {
                attributes.push(RawAttribute {
                    name_slot,
                    bytes: body,
                });
            }
        }

        Ok(FieldInfo {
            access_flags,
            name_idx,
            desc_idx,
            constant_value,
            attributes,
        })
    }

    fn parse_method(
        r: &mut ClassReader,
        cp: &ConstantPool,
    ) -> Result<MethodInfo, ClassFormatError> {
        let access_flags = AccessFlags::from_bits_truncate(r.u2("method access flags")?);
        let name_idx = cp.utf8_slot_at(r.u2("method name index")?)?;
        let desc_idx = cp.utf8_slot_at(r.u2("method descriptor index")?)?;

        let attr_count = r.u2("method attribute count")?;
        let mut code = None;
        let mut exceptions = Vec::new();
        let mut parameters = Vec::new();
        let mut attributes = Vec::new();
        for _ in 0..attr_count {
            let (name, name_slot, body) = read_attribute(r, cp)?;
            match name {
                "Code" => code = Some(CodeAttribute::parse(&body, cp)?),
                "Exceptions" => exceptions = parse_exceptions_attribute(&body, cp)?,
                "MethodParameters" => parameters = parse_method_parameters(&body, cp)?,
                _ => attributes.push(RawAttribute {
                    name_slot,
                    bytes: body,
                }),
            }
        }

        Ok(MethodInfo {
            access_flags,
            name_idx,
            desc_idx,
            code,
            exceptions,
            parameters,
            attributes,
        })
    }

    pub fn class_name(&self) -> Result<&str, ClassFormatError> {
        self.cp.class_name_at(self.this_class)
    }

    /// `None` for java/lang/Object, which has no superclass.
    pub fn super_class_name(&self) -> Result<Option<&str>, ClassFormatError> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.cp.class_name_at(self.super_class).map(Some)
    }

    pub fn method_name(&self, i: usize) -> Option<&str> {
        self.cp.utf8_text(self.methods.get(i)?.name_idx)
    }

    pub fn field_name(&self, i: usize) -> Option<&str> {
        self.cp.utf8_text(self.fields.get(i)?.name_idx)
    }

    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|m| {
            self.cp.utf8_text(m.name_idx) == Some(name)
                && self.cp.utf8_text(m.desc_idx) == Some(descriptor)
        })
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods
            .iter()
            .any(|m| self.cp.utf8_text(m.name_idx) == Some(name))
    }
}

pub use constant_pool::CpSlot;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Builds a syntactically valid class file from parts.
    pub(crate) struct ClassBytesBuilder {
        cp: Vec<Vec<u8>>,
        cp_slots: u16,
        access_flags: u16,
        this_class: u16,
        super_class: u16,
        fields: Vec<Vec<u8>>,
        methods: Vec<Vec<u8>>,
    }

    impl ClassBytesBuilder {
        pub fn new() -> Self {
            Self {
                cp: Vec::new(),
                cp_slots: 0,
                access_flags: 0x0021, // public super
                this_class: 0,
                super_class: 0,
                fields: Vec::new(),
                methods: Vec::new(),
            }
        }

        pub fn utf8(&mut self, text: &str) -> u16 {
            let mut entry = vec![1u8];
            entry.extend((text.len() as u16).to_be_bytes());
            entry.extend(text.as_bytes());
            self.push_entry(entry, 1)
        }

        pub fn class(&mut self, name_idx: u16) -> u16 {
            let mut entry = vec![7u8];
            entry.extend(name_idx.to_be_bytes());
            self.push_entry(entry, 1)
        }

        fn push_entry(&mut self, entry: Vec<u8>, width: u16) -> u16 {
            self.cp.push(entry);
            self.cp_slots += width;
            self.cp_slots
        }

        pub fn this_class(&mut self, idx: u16) {
            self.this_class = idx;
        }

        pub fn super_class(&mut self, idx: u16) {
            self.super_class = idx;
        }

        pub fn method(&mut self, flags: u16, name_idx: u16, desc_idx: u16, attrs: &[Vec<u8>]) {
            let mut m = Vec::new();
            m.extend(flags.to_be_bytes());
            m.extend(name_idx.to_be_bytes());
            m.extend(desc_idx.to_be_bytes());
            m.extend((attrs.len() as u16).to_be_bytes());
            for attr in attrs {
                m.extend(attr);
            }
            self.methods.push(m);
        }

        pub fn attribute(name_idx: u16, body: &[u8]) -> Vec<u8> {
            let mut a = Vec::new();
            a.extend(name_idx.to_be_bytes());
            a.extend((body.len() as u32).to_be_bytes());
            a.extend(body);
            a
        }

        pub fn build(&self) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend(MAGIC.to_be_bytes());
            out.extend(0u16.to_be_bytes()); // minor
            out.extend(55u16.to_be_bytes()); // major: Java 11
            out.extend((self.cp_slots + 1).to_be_bytes());
            for entry in &self.cp {
                out.extend(entry);
            }
            out.extend(self.access_flags.to_be_bytes());
            out.extend(self.this_class.to_be_bytes());
            out.extend(self.super_class.to_be_bytes());
            out.extend(0u16.to_be_bytes()); // interfaces
            out.extend((self.fields.len() as u16).to_be_bytes());
            for f in &self.fields {
                out.extend(f);
            }
            out.extend((self.methods.len() as u16).to_be_bytes());
            for m in &self.methods {
                out.extend(m);
            }
            out.extend(0u16.to_be_bytes()); // class attributes
            out
        }
    }

    fn empty_class(name: &str, super_name: &str) -> Vec<u8> {
        let mut b = ClassBytesBuilder::new();
        let name_idx = b.utf8(name);
        let this = b.class(name_idx);
        let super_idx = b.utf8(super_name);
        let sup = b.class(super_idx);
        b.this_class(this);
        b.super_class(sup);
        b.build()
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = empty_class("Main", "java/lang/Object");
        bytes[0] = 0xDE;
        assert!(matches!(
            ParsedClass::parse(&bytes),
            Err(ClassFormatError::BadMagic(_))
        ));
    }

    #[test]
    fn rejects_future_versions() {
        let mut bytes = empty_class("Main", "java/lang/Object");
        bytes[6] = 0x00;
        bytes[7] = 61; // Java 17
        assert!(matches!(
            ParsedClass::parse(&bytes),
            Err(ClassFormatError::UnsupportedVersion(61))
        ));
    }

    #[test]
    fn zero_member_class_parses_empty() {
        let bytes = empty_class("Empty", "java/lang/Object");
        let parsed = ParsedClass::parse(&bytes).unwrap();
        assert_eq!(parsed.class_name().unwrap(), "Empty");
        assert_eq!(
            parsed.super_class_name().unwrap(),
            Some("java/lang/Object")
        );
        assert!(parsed.fields.is_empty());
        assert!(parsed.methods.is_empty());
        assert!(parsed.access_flags.contains(AccessFlags::PUBLIC));
    }

    #[test]
    fn method_name_round_trips_through_the_pool() {
        let mut b = ClassBytesBuilder::new();
        let name_idx = b.utf8("Main");
        let this = b.class(name_idx);
        let obj_idx = b.utf8("java/lang/Object");
        let sup = b.class(obj_idx);
        let code_name = b.utf8("Code");
        let m_name = b.utf8("main");
        let m_desc = b.utf8("([Ljava/lang/String;)V");
        b.this_class(this);
        b.super_class(sup);

        let code_body: Vec<u8> = [
            &0x02u16.to_be_bytes()[..],      // max_stack
            &0x01u16.to_be_bytes()[..],      // max_locals
            &0x00000001u32.to_be_bytes()[..], // code length
            &[0xB1][..],                     // return
            &0x0000u16.to_be_bytes()[..],    // exception table
            &0x0000u16.to_be_bytes()[..],    // attributes
        ]
        .concat();
        let attr = ClassBytesBuilder::attribute(code_name, &code_body);
        b.method(0x0009, m_name, m_desc, &[attr]); // public static

        let parsed = ParsedClass::parse(&b.build()).unwrap();
        assert_eq!(parsed.method_name(0).unwrap(), "main");
        let method = parsed.find_method("main", "([Ljava/lang/String;)V").unwrap();
        let code = method.code.as_ref().unwrap();
        assert_eq!(code.max_stack, 2);
        assert_eq!(code.max_locals, 1);
        assert_eq!(code.code, vec![0xB1]);
        assert_eq!(
            parsed.cp.utf8_text(method.desc_idx).unwrap(),
            "([Ljava/lang/String;)V"
        );
    }

    #[test]
    fn truncated_file_reports_what_was_missing() {
        let bytes = empty_class("Main", "java/lang/Object");
        // cut the file in the middle of the field count
        let cut = &bytes[..bytes.len() - 5];
        assert!(matches!(
            ParsedClass::parse(cut),
            Err(ClassFormatError::TruncatedFile(_))
        ));
    }
}
