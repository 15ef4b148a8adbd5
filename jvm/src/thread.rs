//! Call frames and the single-threaded execution stack.

use crate::method_area::{JmEntry, Klass};
use crate::value::{ObjRef, Value};
use crate::InterpreterError;
use rook_classfile::attributes::ExceptionTableEntry;
use rook_classfile::constant_pool::ConstantPool;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

/// One method invocation: its code, operand stack, locals, and program
/// counter. The frame keeps a handle on the owning class so bytecode can
/// resolve through that class's constant pool.
pub struct Frame {
    pub klass: Arc<Klass>,
    pub method_name: String,
    pub descriptor: String,
    pub code: Arc<[u8]>,
    pub exception_table: Arc<[ExceptionTableEntry]>,
    pub stack: Vec<Value>,
    pub locals: Vec<Value>,
    pub pc: usize,
}

impl Frame {
    pub fn new(
        klass: Arc<Klass>,
        method_name: impl Into<String>,
        descriptor: impl Into<String>,
        entry: &JmEntry,
    ) -> Self {
        Self {
            klass,
            method_name: method_name.into(),
            descriptor: descriptor.into(),
            code: entry.code.clone(),
            exception_table: entry.exception_table.clone(),
            stack: Vec::with_capacity(entry.max_stack as usize),
            locals: vec![Value::Int(0); entry.max_locals as usize],
            pc: 0,
        }
    }

    /// A codeless frame that only exists to receive a return value, used as
    /// the bottom of the stack by [`crate::VirtualMachine::call`].
    pub fn entry_frame(klass: Arc<Klass>) -> Self {
        Self {
            klass,
            method_name: "<entry>".to_string(),
            descriptor: "()V".to_string(),
            code: Arc::from(Vec::new()),
            exception_table: Arc::from(Vec::new()),
            stack: Vec::with_capacity(2),
            locals: Vec::new(),
            pc: 0,
        }
    }

    pub fn cp(&self) -> &ConstantPool {
        &self.klass.parsed.cp
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Result<Value, InterpreterError> {
        self.stack.pop().ok_or(InterpreterError::StackUnderflow)
    }

    pub fn peek(&self) -> Result<&Value, InterpreterError> {
        self.stack.last().ok_or(InterpreterError::StackUnderflow)
    }

    pub fn pop_int(&mut self) -> Result<i64, InterpreterError> {
        self.pop()?.as_int()
    }

    pub fn pop_float(&mut self) -> Result<f64, InterpreterError> {
        self.pop()?.as_float()
    }

    pub fn pop_ref(&mut self) -> Result<ObjRef, InterpreterError> {
        self.pop()?.as_obj_ref()
    }

    /// Longs occupy two adjacent stack slots; the value rides in both.
    pub fn push_wide_int(&mut self, value: i64) {
        self.push(Value::Int(value));
        self.push(Value::Int(value));
    }

    pub fn push_wide_float(&mut self, value: f64) {
        self.push(Value::Float(value));
        self.push(Value::Float(value));
    }

    pub fn pop_wide_int(&mut self) -> Result<i64, InterpreterError> {
        let value = self.pop_int()?;
        self.pop()?;
        Ok(value)
    }

    pub fn pop_wide_float(&mut self) -> Result<f64, InterpreterError> {
        let value = self.pop_float()?;
        self.pop()?;
        Ok(value)
    }

    pub fn load(&self, index: usize) -> Result<Value, InterpreterError> {
        self.locals
            .get(index)
            .cloned()
            .ok_or(InterpreterError::BadLocalIndex(index))
    }

    pub fn store(&mut self, index: usize, value: Value) -> Result<(), InterpreterError> {
        match self.locals.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(InterpreterError::BadLocalIndex(index)),
        }
    }

    /// Long/double stores land in `locals[n]` and replicate into
    /// `locals[n+1]`.
    pub fn store_wide(&mut self, index: usize, value: Value) -> Result<(), InterpreterError> {
        self.store(index, value.clone())?;
        self.store(index + 1, value)
    }
}

/// A thread of execution: a LIFO frame stack plus a process-unique id.
/// The core runs one thread at a time; `<clinit>` gets a thread of its own.
pub struct Thread {
    pub id: u32,
    pub frames: Vec<Frame>,
}

impl Thread {
    pub fn new() -> Self {
        Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            frames: Vec::new(),
        }
    }

    pub fn current(&mut self) -> Result<&mut Frame, InterpreterError> {
        self.frames
            .last_mut()
            .ok_or(InterpreterError::EmptyFrameStack)
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}
