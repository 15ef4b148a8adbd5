use crate::object::Object;
use crate::InterpreterError;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// A live object on the host heap.
pub type HeapRef = Arc<RwLock<Object>>;

/// A Java reference: either null or a shared handle to an object record.
pub type ObjRef = Option<HeapRef>;

/// One operand-stack or local-variable slot. Ints of every Java width ride
/// in an `i64`, floats and doubles in an `f64`, exactly as the slot model
/// in the frame layout prescribes. Slot kinds are not statically enforced;
/// pop sites assert the tag they need.
#[derive(Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Ref(ObjRef),
}

impl Value {
    pub const NULL: Value = Value::Ref(None);

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Ref(_) => "reference",
        }
    }

    pub fn as_int(&self) -> Result<i64, InterpreterError> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(InterpreterError::WrongValueKind {
                expected: "int",
                found: other.kind_name(),
            }),
        }
    }

    pub fn as_float(&self) -> Result<f64, InterpreterError> {
        match self {
            Value::Float(v) => Ok(*v),
            other => Err(InterpreterError::WrongValueKind {
                expected: "float",
                found: other.kind_name(),
            }),
        }
    }

    pub fn as_obj_ref(&self) -> Result<ObjRef, InterpreterError> {
        match self {
            Value::Ref(r) => Ok(r.clone()),
            other => Err(InterpreterError::WrongValueKind {
                expected: "reference",
                found: other.kind_name(),
            }),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Ref(None))
    }

    /// The default a freshly created field of the given descriptor holds:
    /// null for references, zero for the integral kinds, 0.0 for the
    /// floating-point kinds.
    pub fn default_for_desc(desc: &str) -> Option<Value> {
        match desc.as_bytes().first()? {
            b'L' | b'[' => Some(Value::NULL),
            b'B' | b'C' | b'I' | b'J' | b'S' | b'Z' => Some(Value::Int(0)),
            b'F' | b'D' => Some(Value::Float(0.0)),
            _ => None,
        }
    }

    /// Slots the value takes when it travels through locals or the operand
    /// stack, by the descriptor that produced it.
    pub fn width_of_desc(desc: &str) -> u8 {
        match desc.as_bytes().first() {
            Some(b'J') | Some(b'D') => 2,
            _ => 1,
        }
    }
}

impl fmt::Debug for Value {
    // references print as their identity hash; recursing into the object
    // graph could chase a cycle through a reference array
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "Int({v})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::Ref(None) => write!(f, "Ref(null)"),
            Value::Ref(Some(obj)) => match obj.try_read() {
                Some(o) => write!(f, "Ref({}@{:08x})", o.klass_name, o.mark.hash),
                None => write!(f, "Ref(<locked>)"),
            },
        }
    }
}
