use crate::constant_pool::ConstantPool;
use crate::reader::ClassReader;
use crate::ClassFormatError;

/// An attribute the core does not interpret, kept as raw bytes so nothing
/// is lost. `name_slot` indexes the pool's utf8 array.
#[derive(Clone, Debug, PartialEq)]
pub struct RawAttribute {
    pub name_slot: u16,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// cp index of the ClassRef naming the caught type; 0 catches anything.
    pub catch_type: u16,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    /// LineNumberTable and friends, kept raw.
    pub attributes: Vec<RawAttribute>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodParameter {
    pub name: String,
    pub access_flags: u16,
}

/// Reads one `attribute_info` (name index, u4 length, body) and resolves
/// the name. Shared by field, method, Code-inner and class-level attribute
/// parsing.
pub fn read_attribute<'cp>(
    r: &mut ClassReader,
    cp: &'cp ConstantPool,
) -> Result<(&'cp str, u16, Vec<u8>), ClassFormatError> {
    let name_idx = r.u2("attribute name index")?;
    let name_slot = cp.utf8_slot_at(name_idx)?;
    let len = r.u4("attribute length")? as usize;
    let bytes = r.bytes(len, "attribute body")?;
    // the slot came out of utf8_slot_at, so the direct index is safe
    Ok((&cp.utf8[name_slot as usize], name_slot, bytes))
}

impl CodeAttribute {
    pub fn parse(body: &[u8], cp: &ConstantPool) -> Result<Self, ClassFormatError> {
        let mut r = ClassReader::new(body);
        let max_stack = r.u2("Code max_stack")?;
        let max_locals = r.u2("Code max_locals")?;
        let code_len = r.u4("Code length")? as usize;
        let code = r.bytes(code_len, "Code bytes")?;

        let handler_count = r.u2("Code exception table length")?;
        let mut exception_table = Vec::with_capacity(handler_count as usize);
        for _ in 0..handler_count {
            exception_table.push(ExceptionTableEntry {
                start_pc: r.u2("handler start_pc")?,
                end_pc: r.u2("handler end_pc")?,
                handler_pc: r.u2("handler handler_pc")?,
                catch_type: r.u2("handler catch_type")?,
            });
        }

        let attr_count = r.u2("Code attribute count")?;
        let mut attributes = Vec::with_capacity(attr_count as usize);
        for _ in 0..attr_count {
            let (_, name_slot, bytes) = read_attribute(&mut r, cp)?;
            attributes.push(RawAttribute { name_slot, bytes });
        }

        Ok(Self {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }
}

/// `Exceptions` attribute: a list of ClassRef cp indices naming the checked
/// exceptions a method declares. Returns the utf8 slots of those class
/// names.
pub fn parse_exceptions_attribute(
    body: &[u8],
    cp: &ConstantPool,
) -> Result<Vec<u16>, ClassFormatError> {
    let mut r = ClassReader::new(body);
    let count = r.u2("Exceptions count")?;
    let mut slots = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let class_idx = r.u2("Exceptions class index")?;
        let slot = cp.slot(class_idx)?;
        if slot.kind != crate::constant_pool::CpKind::ClassRef {
            return Err(ClassFormatError::CpKindMismatch {
                index: class_idx,
                expected: "Class",
                found: slot.kind.name(),
            });
        }
        let name_idx = cp.class_refs[slot.slot as usize];
        slots.push(cp.utf8_slot_at(name_idx)?);
    }
    Ok(slots)
}

/// `MethodParameters` attribute. Parameter names must be unqualified names;
/// a name index of 0 means the parameter is unnamed.
pub fn parse_method_parameters(
    body: &[u8],
    cp: &ConstantPool,
) -> Result<Vec<MethodParameter>, ClassFormatError> {
    let mut r = ClassReader::new(body);
    let count = r.u1("MethodParameters count")?;
    let mut params = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_idx = r.u2("parameter name index")?;
        let access_flags = r.u2("parameter access flags")?;
        let name = if name_idx == 0 {
            String::new()
        } else {
            let name = cp.utf8_at(name_idx)?;
            if !validate_unqualified_name(name, false) {
                return Err(ClassFormatError::BadUnqualifiedName(name.to_string()));
            }
            name.to_string()
        };
        params.push(MethodParameter { name, access_flags });
    }
    Ok(params)
}

/// `ConstantValue` attribute body: a single cp index.
pub fn parse_constant_value(body: &[u8]) -> Result<u16, ClassFormatError> {
    let mut r = ClassReader::new(body);
    r.u2("ConstantValue index")
}

/// JVMS 4.2.2: an unqualified name contains none of `.` `;` `[` `/`.
/// Method names additionally may not contain `<` or `>` except for the two
/// compiler-generated names `<init>` and `<clinit>`.
pub fn validate_unqualified_name(name: &str, method_name: bool) -> bool {
    if name.is_empty() {
        return false;
    }
    if name.chars().any(|c| matches!(c, '.' | ';' | '[' | '/')) {
        return false;
    }
    if method_name && name.contains(['<', '>']) {
        return name == "<init>" || name == "<clinit>";
    }
    true
}
