use crate::reader::ClassReader;
use crate::ClassFormatError;
use cesu8str::{Cesu8Str, Variant};
use discrim::FromDiscriminant;

/// Discriminant for one `cp_index` entry. The numeric values are the
/// class-file tags so parse and debug output line up with the format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpKind {
    /// Entry 0, and the shadow slot after a Long/Double entry.
    Unused,
    Utf8,
    IntConst,
    FloatConst,
    LongConst,
    DoubleConst,
    ClassRef,
    StringRef,
    FieldRef,
    MethodRef,
    InterfaceMethodRef,
    NameAndType,
    MethodHandle,
    MethodType,
    Dynamic,
    InvokeDynamic,
    Module,
    Package,
}

impl CpKind {
    pub fn name(self) -> &'static str {
        match self {
            CpKind::Unused => "(unused)",
            CpKind::Utf8 => "Utf8",
            CpKind::IntConst => "Integer",
            CpKind::FloatConst => "Float",
            CpKind::LongConst => "Long",
            CpKind::DoubleConst => "Double",
            CpKind::ClassRef => "Class",
            CpKind::StringRef => "String",
            CpKind::FieldRef => "Fieldref",
            CpKind::MethodRef => "Methodref",
            CpKind::InterfaceMethodRef => "InterfaceMethodref",
            CpKind::NameAndType => "NameAndType",
            CpKind::MethodHandle => "MethodHandle",
            CpKind::MethodType => "MethodType",
            CpKind::Dynamic => "Dynamic",
            CpKind::InvokeDynamic => "InvokeDynamic",
            CpKind::Module => "Module",
            CpKind::Package => "Package",
        }
    }
}

/// One entry of the ordered pool index: its kind plus the slot in the
/// matching per-kind array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpSlot {
    pub kind: CpKind,
    pub slot: u16,
}

impl CpSlot {
    pub const UNUSED: CpSlot = CpSlot {
        kind: CpKind::Unused,
        slot: 0,
    };
}

/// CONSTANT_Fieldref / Methodref / InterfaceMethodref body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefEntry {
    pub class_idx: u16,
    pub name_and_type_idx: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NameAndTypeEntry {
    pub name_idx: u16,
    pub desc_idx: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromDiscriminant)]
#[repr(u8)]
pub enum MethodHandleKind {
    GetField = 1,
    GetStatic = 2,
    PutField = 3,
    PutStatic = 4,
    InvokeVirtual = 5,
    InvokeStatic = 6,
    InvokeSpecial = 7,
    NewInvokeSpecial = 8,
    InvokeInterface = 9,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodHandleEntry {
    pub kind: MethodHandleKind,
    pub reference_idx: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DynamicEntry {
    pub bootstrap_method_attr_idx: u16,
    pub name_and_type_idx: u16,
}

/// The two-level constant pool: `index` is the ordered 1..cp_count view,
/// each entry pointing into the per-kind array for its tag. Long and Double
/// constants occupy two index slots; the second is `CpSlot::UNUSED`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConstantPool {
    pub cp_count: u16,
    pub index: Vec<CpSlot>,
    pub utf8: Vec<String>,
    pub ints: Vec<i32>,
    pub floats: Vec<f32>,
    pub longs: Vec<i64>,
    pub doubles: Vec<f64>,
    /// cp index of the Utf8 entry holding the class name.
    pub class_refs: Vec<u16>,
    /// cp index of the Utf8 entry holding the string text.
    pub string_refs: Vec<u16>,
    pub field_refs: Vec<RefEntry>,
    pub method_refs: Vec<RefEntry>,
    pub interface_method_refs: Vec<RefEntry>,
    pub name_and_types: Vec<NameAndTypeEntry>,
    pub method_handles: Vec<MethodHandleEntry>,
    /// cp index of the Utf8 entry holding the descriptor.
    pub method_types: Vec<u16>,
    pub dynamics: Vec<DynamicEntry>,
    pub invoke_dynamics: Vec<DynamicEntry>,
    pub modules: Vec<u16>,
    pub packages: Vec<u16>,
}

impl ConstantPool {
    pub fn parse(r: &mut ClassReader) -> Result<Self, ClassFormatError> {
        let cp_count = r.u2("constant pool count")?;
        if cp_count == 0 {
            return Err(ClassFormatError::EmptyConstantPool);
        }

        let mut cp = ConstantPool {
            cp_count,
            index: Vec::with_capacity(cp_count as usize),
            ..ConstantPool::default()
        };
        cp.index.push(CpSlot::UNUSED); // entry 0 is reserved

        let mut i = 1u16;
        while i < cp_count {
            let tag = r.u1("constant pool tag")?;
            let mut width = 1;
            let slot = match tag {
                1 => {
                    let len = r.u2("Utf8 length")? as usize;
                    let raw = r.bytes(len, "Utf8 bytes")?;
                    let text: String = Cesu8Str::from_cesu8(&raw, Variant::Java)
                        .map_err(|_| ClassFormatError::MalformedUtf8(i))?
                        .into_str()
                        .into_owned();
                    cp.utf8.push(text);
                    CpSlot {
                        kind: CpKind::Utf8,
                        slot: (cp.utf8.len() - 1) as u16,
                    }
                }
                3 => {
                    cp.ints.push(r.i4("Integer constant")?);
                    CpSlot {
                        kind: CpKind::IntConst,
                        slot: (cp.ints.len() - 1) as u16,
                    }
                }
                4 => {
                    cp.floats.push(r.f4("Float constant")?);
                    CpSlot {
                        kind: CpKind::FloatConst,
                        slot: (cp.floats.len() - 1) as u16,
                    }
                }
                5 => {
                    width = 2;
                    cp.longs.push(r.i8("Long constant")?);
                    CpSlot {
                        kind: CpKind::LongConst,
                        slot: (cp.longs.len() - 1) as u16,
                    }
                }
                6 => {
                    width = 2;
                    cp.doubles.push(r.f8("Double constant")?);
                    CpSlot {
                        kind: CpKind::DoubleConst,
                        slot: (cp.doubles.len() - 1) as u16,
                    }
                }
                7 => {
                    cp.class_refs.push(r.u2("Class name index")?);
                    CpSlot {
                        kind: CpKind::ClassRef,
                        slot: (cp.class_refs.len() - 1) as u16,
                    }
                }
                8 => {
                    cp.string_refs.push(r.u2("String index")?);
                    CpSlot {
                        kind: CpKind::StringRef,
                        slot: (cp.string_refs.len() - 1) as u16,
                    }
                }
                9 | 10 | 11 => {
                    let entry = RefEntry {
                        class_idx: r.u2("ref class index")?,
                        name_and_type_idx: r.u2("ref name-and-type index")?,
                    };
                    let (kind, list) = match tag {
                        9 => (CpKind::FieldRef, &mut cp.field_refs),
                        10 => (CpKind::MethodRef, &mut cp.method_refs),
                        _ => (CpKind::InterfaceMethodRef, &mut cp.interface_method_refs),
                    };
                    list.push(entry);
                    CpSlot {
                        kind,
                        slot: (list.len() - 1) as u16,
                    }
                }
                12 => {
                    cp.name_and_types.push(NameAndTypeEntry {
                        name_idx: r.u2("NameAndType name index")?,
                        desc_idx: r.u2("NameAndType descriptor index")?,
                    });
                    CpSlot {
                        kind: CpKind::NameAndType,
                        slot: (cp.name_and_types.len() - 1) as u16,
                    }
                }
                15 => {
                    let raw_kind = r.u1("MethodHandle kind")?;
                    let kind = MethodHandleKind::from_discriminant(raw_kind)
                        .map_err(|_| ClassFormatError::BadMethodHandleKind(raw_kind))?;
                    cp.method_handles.push(MethodHandleEntry {
                        kind,
                        reference_idx: r.u2("MethodHandle reference index")?,
                    });
                    CpSlot {
                        kind: CpKind::MethodHandle,
                        slot: (cp.method_handles.len() - 1) as u16,
                    }
                }
                16 => {
                    cp.method_types.push(r.u2("MethodType descriptor index")?);
                    CpSlot {
                        kind: CpKind::MethodType,
                        slot: (cp.method_types.len() - 1) as u16,
                    }
                }
                17 | 18 => {
                    let entry = DynamicEntry {
                        bootstrap_method_attr_idx: r.u2("Dynamic bootstrap index")?,
                        name_and_type_idx: r.u2("Dynamic name-and-type index")?,
                    };
                    let (kind, list) = if tag == 17 {
                        (CpKind::Dynamic, &mut cp.dynamics)
                    } else {
                        (CpKind::InvokeDynamic, &mut cp.invoke_dynamics)
                    };
                    list.push(entry);
                    CpSlot {
                        kind,
                        slot: (list.len() - 1) as u16,
                    }
                }
                19 => {
                    cp.modules.push(r.u2("Module name index")?);
                    CpSlot {
                        kind: CpKind::Module,
                        slot: (cp.modules.len() - 1) as u16,
                    }
                }
                20 => {
                    cp.packages.push(r.u2("Package name index")?);
                    CpSlot {
                        kind: CpKind::Package,
                        slot: (cp.packages.len() - 1) as u16,
                    }
                }
                other => return Err(ClassFormatError::UnknownCpTag(other)),
            };

            cp.index.push(slot);
            if width == 2 {
                // the second slot of a Long/Double is never addressable
                cp.index.push(CpSlot::UNUSED);
            }
            i += width;
        }

        cp.cross_check()?;
        Ok(cp)
    }

    /// Validates every inter-entry reference once, right after parsing, so
    /// downstream lookups can trust the shape of the pool.
    fn cross_check(&self) -> Result<(), ClassFormatError> {
        for &idx in &self.class_refs {
            self.expect_kind(idx, CpKind::Utf8)?;
        }
        for &idx in &self.string_refs {
            self.expect_kind(idx, CpKind::Utf8)?;
        }
        for entry in self
            .field_refs
            .iter()
            .chain(&self.method_refs)
            .chain(&self.interface_method_refs)
        {
            self.expect_kind(entry.class_idx, CpKind::ClassRef)?;
            self.expect_kind(entry.name_and_type_idx, CpKind::NameAndType)?;
        }
        for entry in &self.name_and_types {
            self.expect_kind(entry.name_idx, CpKind::Utf8)?;
            self.expect_kind(entry.desc_idx, CpKind::Utf8)?;
        }
        for &idx in &self.method_types {
            self.expect_kind(idx, CpKind::Utf8)?;
        }
        Ok(())
    }

    pub fn slot(&self, index: u16) -> Result<CpSlot, ClassFormatError> {
        if index == 0 || index >= self.cp_count || (index as usize) >= self.index.len() {
            return Err(ClassFormatError::CpIndexOutOfRange(index));
        }
        Ok(self.index[index as usize])
    }

    fn expect_kind(&self, index: u16, expected: CpKind) -> Result<CpSlot, ClassFormatError> {
        let slot = self.slot(index)?;
        if slot.kind != expected {
            return Err(ClassFormatError::CpKindMismatch {
                index,
                expected: expected.name(),
                found: slot.kind.name(),
            });
        }
        Ok(slot)
    }

    /// The central Utf8 accessor: validates the cp index, the entry kind,
    /// and the inner slot before handing out the string.
    pub fn utf8_at(&self, index: u16) -> Result<&str, ClassFormatError> {
        let slot = self.utf8_slot_at(index)?;
        Ok(&self.utf8[slot as usize])
    }

    /// Like [`ConstantPool::utf8_at`] but returns the slot in the utf8
    /// array instead of the text.
    pub fn utf8_slot_at(&self, index: u16) -> Result<u16, ClassFormatError> {
        let slot = self.expect_kind(index, CpKind::Utf8)?;
        if (slot.slot as usize) >= self.utf8.len() {
            return Err(ClassFormatError::CpIndexOutOfRange(index));
        }
        Ok(slot.slot)
    }

    /// Text of a utf8 slot (not a cp index). `None` if the slot is stale.
    pub fn utf8_text(&self, slot: u16) -> Option<&str> {
        self.utf8.get(slot as usize).map(String::as_str)
    }

    /// Resolves a ClassRef cp index to the class name it points at.
    pub fn class_name_at(&self, index: u16) -> Result<&str, ClassFormatError> {
        let slot = self.expect_kind(index, CpKind::ClassRef)?;
        let name_idx = self.class_refs[slot.slot as usize];
        self.utf8_at(name_idx)
    }

    pub fn name_and_type_at(&self, index: u16) -> Result<NameAndTypeEntry, ClassFormatError> {
        let slot = self.expect_kind(index, CpKind::NameAndType)?;
        Ok(self.name_and_types[slot.slot as usize])
    }

    pub fn field_ref_at(&self, index: u16) -> Result<RefEntry, ClassFormatError> {
        let slot = self.expect_kind(index, CpKind::FieldRef)?;
        Ok(self.field_refs[slot.slot as usize])
    }

    /// Accepts both Methodref and InterfaceMethodref, the way invoke sites
    /// must.
    pub fn method_ref_at(&self, index: u16) -> Result<RefEntry, ClassFormatError> {
        let slot = self.slot(index)?;
        match slot.kind {
            CpKind::MethodRef => Ok(self.method_refs[slot.slot as usize]),
            CpKind::InterfaceMethodRef => Ok(self.interface_method_refs[slot.slot as usize]),
            other => Err(ClassFormatError::CpKindMismatch {
                index,
                expected: CpKind::MethodRef.name(),
                found: other.name(),
            }),
        }
    }

    /// Class name, member name and descriptor for a Fieldref/Methodref.
    pub fn member_ref_at(
        &self,
        index: u16,
        field: bool,
    ) -> Result<(&str, &str, &str), ClassFormatError> {
        let entry = if field {
            self.field_ref_at(index)?
        } else {
            self.method_ref_at(index)?
        };
        let class_name = self.class_name_at(entry.class_idx)?;
        let nat = self.name_and_type_at(entry.name_and_type_idx)?;
        Ok((class_name, self.utf8_at(nat.name_idx)?, self.utf8_at(nat.desc_idx)?))
    }
}
