//! Heap object records: plain instances, the two field-storage shapes, and
//! array objects with their typed backing buffers.

use crate::value::{HeapRef, ObjRef, Value};
use highway::{HighwayHash, HighwayHasher, Key};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// The mark word. Only the identity hash lives here today; lock state
/// would join it under a real scheduler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Mark {
    pub hash: u32,
}

#[derive(Clone, Debug)]
pub struct FieldSlot {
    pub desc: String,
    pub value: Value,
}

/// Instance fields. Declaration order is enough when only the class itself
/// contributes fields; once superclasses add theirs, slots are keyed by
/// name instead.
#[derive(Clone, Debug)]
pub enum FieldStorage {
    Indexed(Vec<FieldSlot>),
    Named(IndexMap<String, FieldSlot>),
}

impl FieldStorage {
    pub fn len(&self) -> usize {
        match self {
            FieldStorage::Indexed(v) => v.len(),
            FieldStorage::Named(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn by_index(&self, idx: usize) -> Option<&FieldSlot> {
        match self {
            FieldStorage::Indexed(v) => v.get(idx),
            FieldStorage::Named(m) => m.get_index(idx).map(|(_, slot)| slot),
        }
    }

    pub fn by_index_mut(&mut self, idx: usize) -> Option<&mut FieldSlot> {
        match self {
            FieldStorage::Indexed(v) => v.get_mut(idx),
            FieldStorage::Named(m) => m.get_index_mut(idx).map(|(_, slot)| slot),
        }
    }

    pub fn by_name(&self, name: &str) -> Option<&FieldSlot> {
        match self {
            FieldStorage::Indexed(_) => None,
            FieldStorage::Named(m) => m.get(name),
        }
    }

    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut FieldSlot> {
        match self {
            FieldStorage::Indexed(_) => None,
            FieldStorage::Named(m) => m.get_mut(name),
        }
    }
}

/// The typed backing buffer of an array object. The element descriptor is
/// folded onto four buffer shapes: bytes and booleans share a byte buffer,
/// float and double share the f64 buffer, references get their own, and
/// every other integral kind rides in the i64 buffer.
#[derive(Clone, Debug)]
pub enum ArrayBacking {
    Bytes(Vec<i8>),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Refs(Vec<ObjRef>),
}

impl ArrayBacking {
    pub fn for_element(elem_desc: &str, len: usize) -> Option<ArrayBacking> {
        Some(match elem_desc.as_bytes().first()? {
            b'B' | b'Z' => ArrayBacking::Bytes(vec![0; len]),
            b'F' | b'D' => ArrayBacking::Floats(vec![0.0; len]),
            b'L' | b'[' => ArrayBacking::Refs(vec![None; len]),
            b'C' | b'I' | b'J' | b'S' => ArrayBacking::Ints(vec![0; len]),
            _ => return None,
        })
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayBacking::Bytes(v) => v.len(),
            ArrayBacking::Ints(v) => v.len(),
            ArrayBacking::Floats(v) => v.len(),
            ArrayBacking::Refs(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Either ordinary instance fields or an array's single backing buffer.
#[derive(Clone, Debug)]
pub enum ObjectBody {
    Fields(FieldStorage),
    Array { desc: String, backing: ArrayBacking },
}

#[derive(Clone, Debug)]
pub struct Object {
    pub mark: Mark,
    pub klass_name: String,
    pub body: ObjectBody,
}

impl Object {
    pub fn is_array(&self) -> bool {
        matches!(self.body, ObjectBody::Array { .. })
    }

    pub fn fields(&self) -> Option<&FieldStorage> {
        match &self.body {
            ObjectBody::Fields(fields) => Some(fields),
            ObjectBody::Array { .. } => None,
        }
    }

    pub fn fields_mut(&mut self) -> Option<&mut FieldStorage> {
        match &mut self.body {
            ObjectBody::Fields(fields) => Some(fields),
            ObjectBody::Array { .. } => None,
        }
    }
}

const MARK_HASH_KEY: Key = Key([
    0x0706_0504_0302_0100,
    0x0F0E_0D0C_0B0A_0908,
    0x1716_1514_1312_1110,
    0x1F1E_1D1C_1B1A_1918,
]);

/// The 32-bit identity hash seeded from the allocation address of the
/// object record. Stable for the object's lifetime; distinguishable
/// between live objects.
fn identity_hash(addr: usize) -> u32 {
    let mut hasher = HighwayHasher::new(MARK_HASH_KEY);
    hasher.append(&(addr as u64).to_le_bytes());
    hasher.finalize64() as u32
}

/// Allocates an object record and seeds its mark hash from the allocation
/// identity.
pub fn allocate(klass_name: impl Into<String>, body: ObjectBody) -> HeapRef {
    let obj = Arc::new(RwLock::new(Object {
        mark: Mark::default(),
        klass_name: klass_name.into(),
        body,
    }));
    let hash = identity_hash(Arc::as_ptr(&obj) as usize);
    obj.write().mark.hash = hash;
    obj
}

/// A 1-D array object. The object's descriptor is `[` + the element
/// descriptor; primitive buffers come back zeroed, reference buffers
/// null-filled. The caller has already rejected negative sizes.
pub fn new_array_1d(elem_desc: &str, len: usize) -> Option<HeapRef> {
    let backing = ArrayBacking::for_element(elem_desc, len)?;
    let desc = format!("[{elem_desc}");
    Some(allocate(
        desc.clone(),
        ObjectBody::Array { desc, backing },
    ))
}

/// A 2-D array: an outer reference array whose elements are 1-D arrays of
/// `elem_desc`, each `inner` long.
pub fn new_array_2d(outer: usize, inner: usize, elem_desc: &str) -> Option<HeapRef> {
    let elements: Vec<ObjRef> = (0..outer)
        .map(|_| new_array_1d(elem_desc, inner).map(Some))
        .collect::<Option<_>>()?;
    let desc = format!("[[{elem_desc}");
    Some(allocate(
        desc.clone(),
        ObjectBody::Array {
            desc,
            backing: ArrayBacking::Refs(elements),
        },
    ))
}

pub const STRING_CLASS: &str = "java/lang/String";

/// Builds a `java/lang/String` the way the class library lays one out
/// post-JDK-9: a `value` array, a `coder`, the cached `hash`, and the
/// `hashIsZero` flag. The char data is held as UTF-16 units so `charAt`
/// semantics survive.
pub fn new_java_string(text: &str) -> HeapRef {
    let units: Vec<i64> = text.encode_utf16().map(i64::from).collect();
    let value_array = allocate(
        "[C",
        ObjectBody::Array {
            desc: "[C".to_string(),
            backing: ArrayBacking::Ints(units),
        },
    );

    let fields = vec![
        FieldSlot {
            desc: "[C".to_string(),
            value: Value::Ref(Some(value_array)),
        },
        FieldSlot {
            desc: "B".to_string(),
            value: Value::Int(1), // UTF-16 coder
        },
        FieldSlot {
            desc: "I".to_string(),
            value: Value::Int(0), // hash, computed lazily by the library
        },
        FieldSlot {
            desc: "Z".to_string(),
            value: Value::Int(0),
        },
    ];
    allocate(STRING_CLASS, ObjectBody::Fields(FieldStorage::Indexed(fields)))
}

/// Reads the text back out of a `java/lang/String` object. `None` if the
/// object is not string-shaped.
pub fn string_text(obj: &HeapRef) -> Option<String> {
    let guard = obj.read();
    if guard.klass_name != STRING_CLASS {
        return None;
    }
    let value = guard.fields()?.by_index(0)?.value.clone();
    let array = match value {
        Value::Ref(Some(array)) => array,
        _ => return None,
    };
    let array = array.read();
    match &array.body {
        ObjectBody::Array {
            backing: ArrayBacking::Ints(units),
            ..
        } => {
            let units: Vec<u16> = units.iter().map(|&u| u as u16).collect();
            Some(String::from_utf16_lossy(&units))
        }
        _ => None,
    }
}
