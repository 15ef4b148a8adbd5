//! The method area: the process-wide registry of loaded classes and the
//! statics table. Loading and linking happen here; running `<clinit>` is
//! the virtual machine's job since it needs the interpreter.

use crate::natives::{NativeFn, NativeRegistry};
use crate::object::new_java_string;
use crate::value::Value;
use crate::{ClassBytesSource, LoadError};
use parking_lot::RwLock;
use rook_classfile::attributes::ExceptionTableEntry;
use rook_classfile::constant_pool::CpKind;
use rook_classfile::{AccessFlags, FieldInfo, ParsedClass};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub const OBJECT_CLASS: &str = "java/lang/Object";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ClassStatus {
    Loaded = 0,
    Linking = 1,
    Initialized = 2,
    Erroneous = 3,
}

impl ClassStatus {
    fn from_u8(raw: u8) -> ClassStatus {
        match raw {
            0 => ClassStatus::Loaded,
            1 => ClassStatus::Linking,
            2 => ClassStatus::Initialized,
            _ => ClassStatus::Erroneous,
        }
    }
}

/// A loaded class: its parsed form, its superclass binary name, and its
/// load/initialization status.
pub struct Klass {
    pub name: String,
    pub super_name: Option<String>,
    pub parsed: ParsedClass,
    status: AtomicU8,
}

impl Klass {
    fn new(name: String, super_name: Option<String>, parsed: ParsedClass) -> Self {
        Self {
            name,
            super_name,
            parsed,
            status: AtomicU8::new(ClassStatus::Linking as u8),
        }
    }

    pub fn status(&self) -> ClassStatus {
        ClassStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: ClassStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn declares_clinit(&self) -> bool {
        self.parsed.find_method("<clinit>", "()V").is_some()
    }

    pub fn field_name<'a>(&'a self, field: &FieldInfo) -> Option<&'a str> {
        self.parsed.cp.utf8_text(field.name_idx)
    }

    pub fn field_desc<'a>(&'a self, field: &FieldInfo) -> Option<&'a str> {
        self.parsed.cp.utf8_text(field.desc_idx)
    }
}

/// A bytecode method ready to execute: the owning class (for its constant
/// pool) plus the decoded Code attribute.
#[derive(Clone)]
pub struct JmEntry {
    pub klass: Arc<Klass>,
    pub code: Arc<[u8]>,
    pub exception_table: Arc<[ExceptionTableEntry]>,
    pub max_stack: u16,
    pub max_locals: u16,
}

/// What a method lookup dispatches to: a registered host handler or a
/// bytecode entry.
pub enum MethodTableEntry {
    Native(NativeFn),
    Bytecode(JmEntry),
}

#[derive(Clone, Debug)]
pub struct StaticEntry {
    pub desc: String,
    pub value: Value,
}

pub struct MethodArea {
    classes: RwLock<HashMap<String, Arc<Klass>>>,
    statics: RwLock<HashMap<String, StaticEntry>>,
}

impl MethodArea {
    pub fn new() -> Self {
        Self {
            classes: RwLock::new(HashMap::new()),
            statics: RwLock::new(HashMap::new()),
        }
    }

    pub fn fetch(&self, name: &str) -> Option<Arc<Klass>> {
        self.classes.read().get(name).cloned()
    }

    /// Registers an already-parsed class under `name`, bypassing the bytes
    /// source. Hosts use this to predefine synthetic classes.
    pub fn define(&self, name: &str, parsed: ParsedClass) -> Arc<Klass> {
        let super_name = parsed
            .super_class_name()
            .ok()
            .flatten()
            .map(str::to_string);
        let klass = Arc::new(Klass::new(name.to_string(), super_name, parsed));
        klass.set_status(ClassStatus::Loaded);
        self.classes
            .write()
            .insert(name.to_string(), klass.clone());
        klass
    }

    /// Loads `name` (and, recursively, its superclasses) into the method
    /// area. Already-loaded classes return immediately unless a previous
    /// attempt left them Erroneous.
    pub fn load_by_name(
        &self,
        name: &str,
        source: &dyn ClassBytesSource,
    ) -> Result<Arc<Klass>, LoadError> {
        if let Some(klass) = self.fetch(name) {
            return match klass.status() {
                ClassStatus::Erroneous => Err(LoadError::Erroneous(name.to_string())),
                _ => Ok(klass),
            };
        }

        let bytes = match source.fetch(name) {
            Some(bytes) => bytes,
            None if name == OBJECT_CLASS => {
                // the chain has to bottom out even without a class library
                let klass = Arc::new(Klass::new(name.to_string(), None, synthetic_object()));
                klass.set_status(ClassStatus::Loaded);
                self.classes
                    .write()
                    .entry(name.to_string())
                    .or_insert_with(|| klass.clone());
                return Ok(klass);
            }
            None => return Err(LoadError::NotFound(name.to_string())),
        };

        let parsed = match ParsedClass::parse(&bytes) {
            Ok(parsed) => parsed,
            Err(source) => {
                // record the failure so later loads fail fast instead of
                // re-parsing bad bytes
                let stub = Arc::new(Klass::new(name.to_string(), None, synthetic_object()));
                stub.set_status(ClassStatus::Erroneous);
                self.classes.write().insert(name.to_string(), stub);
                return Err(LoadError::Format {
                    name: name.to_string(),
                    source,
                });
            }
        };

        if let Ok(parsed_name) = parsed.class_name() {
            if parsed_name != name {
                log::warn!("class {name} was loaded from bytes declaring {parsed_name}");
            }
        }
        let super_name = parsed
            .super_class_name()
            .map_err(|source| LoadError::Format {
                name: name.to_string(),
                source,
            })?
            .map(str::to_string);

        let klass = Arc::new(Klass::new(name.to_string(), super_name.clone(), parsed));
        self.classes
            .write()
            .insert(name.to_string(), klass.clone());
        log::trace!("linking class {name}");

        if let Some(super_name) = &super_name {
            if let Err(err) = self.load_by_name(super_name, source) {
                klass.set_status(ClassStatus::Erroneous);
                return Err(LoadError::Superclass {
                    name: name.to_string(),
                    super_name: super_name.clone(),
                    source: Box::new(err),
                });
            }
        }

        klass.set_status(ClassStatus::Loaded);
        Ok(klass)
    }

    /// Finds `name`+`descriptor` on the class or the nearest superclass
    /// that declares it. Each step of the walk consults the native
    /// registry first, so host handlers can shadow (or stand in for)
    /// classes the source cannot provide.
    pub fn fetch_method(
        &self,
        natives: &NativeRegistry,
        class_name: &str,
        method_name: &str,
        descriptor: &str,
    ) -> Option<MethodTableEntry> {
        let mut current = class_name.to_string();
        loop {
            if let Some(handler) = natives.lookup(&current, method_name, descriptor) {
                return Some(MethodTableEntry::Native(handler));
            }
            let klass = self.fetch(&current)?;
            if let Some(method) = klass.parsed.find_method(method_name, descriptor) {
                let code = method.code.as_ref()?;
                return Some(MethodTableEntry::Bytecode(JmEntry {
                    klass: klass.clone(),
                    code: Arc::from(code.code.as_slice()),
                    exception_table: Arc::from(code.exception_table.as_slice()),
                    max_stack: code.max_stack,
                    max_locals: code.max_locals,
                }));
            }
            current = klass.super_name.clone()?;
        }
    }

    /// Whether the class (or a superclass) declares the method at all,
    /// regardless of whether it carries code.
    pub fn method_is_native(
        &self,
        class_name: &str,
        method_name: &str,
        descriptor: &str,
    ) -> bool {
        let mut current = class_name.to_string();
        while let Some(klass) = self.fetch(&current) {
            if let Some(method) = klass.parsed.find_method(method_name, descriptor) {
                return method.access_flags.contains(AccessFlags::NATIVE);
            }
            match &klass.super_name {
                Some(next) => current = next.clone(),
                None => break,
            }
        }
        false
    }

    /// Inserts the entry unless the key is already present; the first
    /// value wins.
    pub fn add_static(&self, full_name: &str, entry: StaticEntry) {
        self.statics
            .write()
            .entry(full_name.to_string())
            .or_insert(entry);
    }

    pub fn get_static(&self, full_name: &str) -> Option<StaticEntry> {
        self.statics.read().get(full_name).cloned()
    }

    /// `putstatic`: overwrites the value, keeping the declared descriptor.
    pub fn set_static(&self, full_name: &str, value: Value) {
        if let Some(entry) = self.statics.write().get_mut(full_name) {
            entry.value = value;
        }
    }

    /// Creates the statics-table entries for every static field of the
    /// class, applying ConstantValue attributes. Idempotent: re-adding a
    /// key is a no-op.
    pub fn install_statics(&self, klass: &Klass) -> Result<(), LoadError> {
        for field in &klass.parsed.fields {
            if !field.access_flags.contains(AccessFlags::STATIC) {
                continue;
            }
            let field_name = klass.field_name(field).unwrap_or_default().to_string();
            let desc = klass.field_desc(field).unwrap_or_default().to_string();

            let mut value =
                Value::default_for_desc(&desc).ok_or_else(|| LoadError::BadFieldDescriptor {
                    class: klass.name.clone(),
                    field: field_name.clone(),
                    desc: desc.clone(),
                })?;

            if let Some(cv_index) = field.constant_value {
                value = self.constant_value(klass, cv_index).ok_or_else(|| {
                    LoadError::BadConstantValue {
                        class: klass.name.clone(),
                        field: field_name.clone(),
                    }
                })?;
            }

            let full_name = format!("{}.{}", klass.name, field_name);
            self.add_static(&full_name, StaticEntry { desc, value });
        }
        Ok(())
    }

    fn constant_value(&self, klass: &Klass, cv_index: u16) -> Option<Value> {
        let cp = &klass.parsed.cp;
        let slot = cp.slot(cv_index).ok()?;
        Some(match slot.kind {
            CpKind::IntConst => Value::Int(i64::from(cp.ints[slot.slot as usize])),
            CpKind::LongConst => Value::Int(cp.longs[slot.slot as usize]),
            CpKind::FloatConst => Value::Float(f64::from(cp.floats[slot.slot as usize])),
            CpKind::DoubleConst => Value::Float(cp.doubles[slot.slot as usize]),
            CpKind::StringRef => {
                let text_idx = cp.string_refs[slot.slot as usize];
                let text = cp.utf8_at(text_idx).ok()?;
                Value::Ref(Some(new_java_string(text)))
            }
            _ => return None,
        })
    }

    /// Integration point for a future scheduler: blocks until the class
    /// leaves Linking. Today loading is synchronous, so this only reports
    /// the terminal state.
    pub fn wait_for_class_status(&self, name: &str) -> Result<(), LoadError> {
        match self.fetch(name) {
            Some(klass) if klass.status() == ClassStatus::Erroneous => {
                Err(LoadError::Erroneous(name.to_string()))
            }
            Some(_) => Ok(()),
            None => Err(LoadError::NotFound(name.to_string())),
        }
    }
}

impl Default for MethodArea {
    fn default() -> Self {
        Self::new()
    }
}

/// A stand-in java/lang/Object for hosts that cannot provide a class
/// library: no fields, no methods, nothing to initialize.
fn synthetic_object() -> ParsedClass {
    use rook_classfile::constant_pool::{ConstantPool, CpSlot};
    let cp = ConstantPool {
        cp_count: 1,
        index: vec![CpSlot::UNUSED],
        ..ConstantPool::default()
    };
    ParsedClass {
        minor_version: 0,
        major_version: 55,
        cp,
        access_flags: AccessFlags::PUBLIC,
        this_class: 0,
        super_class: 0,
        interfaces: Vec::new(),
        fields: Vec::new(),
        methods: Vec::new(),
        attributes: Vec::new(),
    }
}
