//! The rook virtual machine core: a method area caching loaded classes, a
//! statics table, heap object records, and a bytecode interpreter driving
//! a frame stack. The host supplies class bytes, native method handlers,
//! and the fatal-exit hook; everything else lives here.

pub mod exceptions;
pub mod interpreter;
pub mod method_area;
pub mod natives;
pub mod object;
pub mod opcodes;
pub mod thread;
pub mod value;

mod tests;

use crate::exceptions::JavaThrowable;
use crate::method_area::{ClassStatus, Klass, MethodArea, MethodTableEntry};
use crate::natives::NativeRegistry;
use crate::object::{FieldSlot, FieldStorage, ObjectBody};
use crate::thread::{Frame, Thread};
use crate::value::{HeapRef, Value};
use indexmap::IndexMap;
use rook_classfile::descriptor::MethodDescriptor;
use rook_classfile::{AccessFlags, ClassFormatError};
use std::sync::Arc;
use thiserror::Error;

/// Host-provided access to class bytes, by binary name
/// (`java/lang/Object`). Where the bytes come from (directories, jars, a
/// test table) is the host's business.
pub trait ClassBytesSource {
    fn fetch(&self, binary_name: &str) -> Option<Vec<u8>>;
}

/// Exit codes handed to the host's fatal hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownCode {
    Ok = 0,
    /// An uncaught Java-level exception.
    AppException = 1,
    /// The VM itself failed.
    JvmError = 2,
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("no class bytes available for {0}")]
    NotFound(String),
    #[error("class {name} is malformed")]
    Format {
        name: String,
        #[source]
        source: ClassFormatError,
    },
    #[error("superclass {super_name} of {name} failed to load")]
    Superclass {
        name: String,
        super_name: String,
        #[source]
        source: Box<LoadError>,
    },
    #[error("class {0} previously failed to load")]
    Erroneous(String),
    #[error("field {class}.{field} has an invalid descriptor `{desc}`")]
    BadFieldDescriptor {
        class: String,
        field: String,
        desc: String,
    },
    #[error("ConstantValue of {class}.{field} points at an unusable constant")]
    BadConstantValue { class: String, field: String },
}

/// Fatal, non-Java failures inside the dispatch loop. These unwind the
/// frame stack; Java exceptions travel separately as
/// [`exceptions::JavaThrowable`].
#[derive(Error, Debug)]
pub enum InterpreterError {
    #[error("invalid bytecode {opcode:#04x} at pc {pc} in {method}")]
    InvalidBytecode {
        opcode: u8,
        pc: usize,
        method: String,
    },
    #[error("constant pool mismatch: {0}")]
    CpMismatch(#[from] ClassFormatError),
    #[error("method body ends inside the instruction at pc {0}")]
    TruncatedMethod(usize),
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("expected {expected} on the operand stack, found {found}")]
    WrongValueKind {
        expected: &'static str,
        found: &'static str,
    },
    #[error("local variable index {0} out of range")]
    BadLocalIndex(usize),
    #[error("no frame on the frame stack")]
    EmptyFrameStack,
    #[error("native method {0} is not registered")]
    MissingNative(String),
    #[error("method {0} not found")]
    MethodNotFound(String),
    #[error("arrays of {0} dimensions are not supported")]
    UnsupportedArrayShape(usize),
    #[error("initialization of {0} failed")]
    Initialization(String),
    #[error(transparent)]
    Load(#[from] LoadError),
}

#[derive(Error, Debug)]
pub enum VmError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Interpreter(#[from] InterpreterError),
    #[error("uncaught exception {0}")]
    UncaughtException(String),
    #[error("method {0} not found")]
    MethodNotFound(String),
    #[error("cannot instantiate array class `{0}`")]
    BadArrayClass(String),
}

pub struct VirtualMachine {
    method_area: MethodArea,
    natives: NativeRegistry,
    source: Box<dyn ClassBytesSource>,
    on_fatal: Box<dyn Fn(ShutdownCode)>,
}

impl VirtualMachine {
    /// A VM whose fatal hook terminates the process, the way a standalone
    /// `java` launcher behaves.
    pub fn new(source: Box<dyn ClassBytesSource>) -> Self {
        Self::with_fatal_hook(
            source,
            Box::new(|code| std::process::exit(code as i32)),
        )
    }

    /// A VM with a host-chosen fatal hook. Tests install a recording hook
    /// here; embedders can turn fatal exits into their own teardown.
    pub fn with_fatal_hook(
        source: Box<dyn ClassBytesSource>,
        on_fatal: Box<dyn Fn(ShutdownCode)>,
    ) -> Self {
        let vm = Self {
            method_area: MethodArea::new(),
            natives: NativeRegistry::new(),
            source,
            on_fatal,
        };
        // constructors chain up to Object.<init> even when the host cannot
        // supply a class library, so the root constructor is built in
        vm.natives
            .register("java/lang/Object.<init>()V", |_, _| (None, 1));
        vm.natives
            .register("java/lang/Object.registerNatives()V", |_, _| (None, 1));
        vm
    }

    pub fn method_area(&self) -> &MethodArea {
        &self.method_area
    }

    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    pub fn class_bytes_source(&self) -> &dyn ClassBytesSource {
        &*self.source
    }

    /// Loads the named class if necessary and returns its record.
    pub fn load_class(&self, name: &str) -> Result<Arc<Klass>, LoadError> {
        self.method_area.load_by_name(name, &*self.source)
    }

    /// Creates an instance of the named class: loads the class and its
    /// superclass chain, creates the instance fields (top-down through the
    /// chain), then makes sure the class is initialized. Array class names
    /// (leading `[`) construct an empty array object directly.
    pub fn instantiate(&self, name: &str) -> Result<HeapRef, VmError> {
        if let Some(elem) = name.strip_prefix('[') {
            let dims = name.bytes().take_while(|&b| b == b'[').count();
            if dims > 3 {
                return Err(VmError::BadArrayClass(name.to_string()));
            }
            return object::new_array_1d(elem, 0)
                .ok_or_else(|| VmError::BadArrayClass(name.to_string()));
        }

        let klass = self.load_class(name)?;

        // superclass chain, java/lang/Object first
        let mut chain = vec![klass];
        while let Some(super_name) = chain.last().and_then(|k| k.super_name.clone()) {
            chain.push(self.load_class(&super_name)?);
        }
        chain.reverse();

        let storage = build_instance_fields(&chain)?;
        let obj = object::allocate(name, ObjectBody::Fields(storage));

        self.ensure_initialized(name)?;
        Ok(obj)
    }

    /// Runs the class's static initialization exactly once: superclass
    /// first, then the statics-table entries, then `<clinit>` if the class
    /// declares one. A call that arrives while the class is already
    /// Linking is a no-op.
    pub fn ensure_initialized(&self, name: &str) -> Result<Arc<Klass>, VmError> {
        let klass = self.load_class(name)?;
        match klass.status() {
            ClassStatus::Initialized | ClassStatus::Linking => return Ok(klass),
            ClassStatus::Erroneous => {
                return Err(LoadError::Erroneous(name.to_string()).into())
            }
            ClassStatus::Loaded => {}
        }
        klass.set_status(ClassStatus::Linking);

        if let Some(super_name) = klass.super_name.clone() {
            self.ensure_initialized(&super_name)?;
        }

        if let Err(err) = self.method_area.install_statics(&klass) {
            klass.set_status(ClassStatus::Erroneous);
            return Err(err.into());
        }

        if klass.declares_clinit() {
            if let Err(err) = self.run_clinit(&klass) {
                klass.set_status(ClassStatus::Erroneous);
                return Err(err);
            }
        }

        klass.set_status(ClassStatus::Initialized);
        Ok(klass)
    }

    fn run_clinit(&self, klass: &Arc<Klass>) -> Result<(), VmError> {
        let entry = match self
            .method_area
            .fetch_method(&self.natives, &klass.name, "<clinit>", "()V")
        {
            Some(MethodTableEntry::Bytecode(entry)) => entry,
            _ => return Err(VmError::MethodNotFound(format!("{}.<clinit>", klass.name))),
        };

        log::trace!("running <clinit> of {}", klass.name);
        let mut thread = Thread::new();
        thread
            .frames
            .push(Frame::new(entry.klass.clone(), "<clinit>", "()V", &entry));

        match self.run_frame(&mut thread)? {
            interpreter::FrameResult::Completed => Ok(()),
            interpreter::FrameResult::Threw(throwable) => {
                self.report_uncaught(&throwable);
                Err(VmError::UncaughtException(throwable.class_name))
            }
        }
    }

    /// Invokes a static method from the host: builds a fresh thread whose
    /// bottom frame receives the return value, runs the dispatch loop, and
    /// hands back the result (if the method returns one).
    pub fn call(
        &self,
        class_name: &str,
        method_name: &str,
        descriptor: &str,
        args: &[Value],
    ) -> Result<Option<Value>, VmError> {
        let qualified = format!("{class_name}.{method_name}{descriptor}");
        let klass = self.ensure_initialized(class_name)?;
        let entry = self
            .method_area
            .fetch_method(&self.natives, class_name, method_name, descriptor)
            .ok_or_else(|| VmError::MethodNotFound(qualified.clone()))?;

        let md = MethodDescriptor::try_from(descriptor)
            .map_err(|e| VmError::Interpreter(InterpreterError::CpMismatch(e)))?;

        let mut thread = Thread::new();
        thread.frames.push(Frame::entry_frame(klass));

        let entry = match entry {
            MethodTableEntry::Bytecode(entry) => entry,
            MethodTableEntry::Native(handler) => {
                // host-to-native calls short-circuit the dispatch loop
                let frame = thread.current()?;
                let (ret, _) = handler(frame, args);
                return Ok(ret);
            }
        };

        let mut frame = Frame::new(entry.klass.clone(), method_name, descriptor, &entry);
        let mut slot = 0usize;
        for (arg, param) in args.iter().zip(&md.params) {
            if param.slot_width() == 2 {
                frame.store_wide(slot, arg.clone())?;
                slot += 2;
            } else {
                frame.store(slot, arg.clone())?;
                slot += 1;
            }
        }
        thread.frames.push(frame);

        match self.run_frame(&mut thread)? {
            interpreter::FrameResult::Completed => {}
            interpreter::FrameResult::Threw(throwable) => {
                self.report_uncaught(&throwable);
                return Err(VmError::UncaughtException(throwable.class_name));
            }
        }
        thread.frames.pop();

        let bottom = thread.current()?;
        Ok(md.ret.and_then(|_| bottom.stack.pop()))
    }

    /// Loads the main class and runs `main(String[])` with an empty
    /// argument array.
    pub fn start(&self, class_name: &str) -> Result<(), VmError> {
        let args = object::new_array_1d("Ljava/lang/String;", 0)
            .expect("string array descriptor is well-formed");
        self.call(
            class_name,
            "main",
            "([Ljava/lang/String;)V",
            &[Value::Ref(Some(args))],
        )?;
        Ok(())
    }

    /// An exception ran off the bottom of the frame stack: report it and
    /// signal the host. The hook may never return; if it does, the error
    /// still propagates to the caller.
    pub(crate) fn report_uncaught(&self, throwable: &JavaThrowable) {
        log::error!(
            "uncaught exception {}: {}",
            throwable.class_name,
            throwable.message
        );
        (self.on_fatal)(ShutdownCode::AppException);
    }
}

/// Field slots for a new instance. Declaration order is kept when only the
/// instantiated class contributes instance fields; a contribution from any
/// superclass switches the object to name-keyed slots.
fn build_instance_fields(chain: &[Arc<Klass>]) -> Result<FieldStorage, VmError> {
    let (this_klass, supers) = chain.split_last().expect("chain contains the class itself");

    let make_slot = |klass: &Arc<Klass>,
                         field: &rook_classfile::FieldInfo|
     -> Result<(String, FieldSlot), VmError> {
        let name = klass.field_name(field).unwrap_or_default().to_string();
        let desc = klass.field_desc(field).unwrap_or_default().to_string();
        let value = Value::default_for_desc(&desc).ok_or_else(|| LoadError::BadFieldDescriptor {
            class: klass.name.clone(),
            field: name.clone(),
            desc: desc.clone(),
        })?;
        Ok((name, FieldSlot { desc, value }))
    };

    let super_contributes = supers.iter().any(|k| {
        k.parsed
            .fields
            .iter()
            .any(|f| !f.access_flags.contains(AccessFlags::STATIC))
    });

    if super_contributes {
        let mut fields = IndexMap::new();
        for klass in chain {
            for field in &klass.parsed.fields {
                if field.access_flags.contains(AccessFlags::STATIC) {
                    continue;
                }
                let (name, slot) = make_slot(klass, field)?;
                fields.insert(name, slot);
            }
        }
        Ok(FieldStorage::Named(fields))
    } else {
        let mut fields = Vec::new();
        for field in &this_klass.parsed.fields {
            if field.access_flags.contains(AccessFlags::STATIC) {
                continue;
            }
            let (_, slot) = make_slot(this_klass, field)?;
            fields.push(slot);
        }
        Ok(FieldStorage::Indexed(fields))
    }
}
