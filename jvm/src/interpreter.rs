//! The bytecode dispatch loop. One call to [`VirtualMachine::run_frame`]
//! executes the frame on top of the thread's stack to completion; invoke
//! opcodes push a callee frame and recurse, exactly mirroring the LIFO
//! discipline of the frame stack itself.

use crate::exceptions::{JavaExceptionKind, JavaThrowable};
use crate::method_area::MethodTableEntry;
use crate::object::{self, ArrayBacking, FieldSlot, FieldStorage, ObjectBody};
use crate::opcodes::*;
use crate::thread::{Frame, Thread};
use crate::value::Value;
use crate::{InterpreterError, VirtualMachine, VmError};
use discrim::FromDiscriminant;
use rook_classfile::constant_pool::CpKind;
use rook_classfile::descriptor::MethodDescriptor;

/// How a frame finished: it returned (or ran off the end of its code), or
/// an exception left it without finding a handler.
pub enum FrameResult {
    Completed,
    Threw(JavaThrowable),
}

/// What the current instruction asks the outer loop to do once the frame
/// borrow is released.
enum Flow {
    Continue,
    Return { value: Option<Value>, wide: bool },
    Raise { throwable: JavaThrowable, pc: usize },
    Invoke(CallSite),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InvokeKind {
    Static,
    Special,
    Virtual,
}

struct CallSite {
    class_name: String,
    method_name: String,
    descriptor: String,
    kind: InvokeKind,
    pc: usize,
}

/// `newarray` primitive type codes (JVMS table 6.5.newarray-A).
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromDiscriminant)]
#[repr(u8)]
enum ArrayTypeCode {
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
}

impl ArrayTypeCode {
    fn descriptor(self) -> &'static str {
        match self {
            ArrayTypeCode::Boolean => "Z",
            ArrayTypeCode::Char => "C",
            ArrayTypeCode::Float => "F",
            ArrayTypeCode::Double => "D",
            ArrayTypeCode::Byte => "B",
            ArrayTypeCode::Short => "S",
            ArrayTypeCode::Int => "I",
            ArrayTypeCode::Long => "J",
        }
    }
}

fn u1_operand(frame: &mut Frame) -> Result<u8, InterpreterError> {
    let byte = *frame
        .code
        .get(frame.pc)
        .ok_or(InterpreterError::TruncatedMethod(frame.pc))?;
    frame.pc += 1;
    Ok(byte)
}

fn i1_operand(frame: &mut Frame) -> Result<i8, InterpreterError> {
    Ok(u1_operand(frame)? as i8)
}

fn u2_operand(frame: &mut Frame) -> Result<u16, InterpreterError> {
    let hi = u1_operand(frame)?;
    let lo = u1_operand(frame)?;
    Ok(u16::from_be_bytes([hi, lo]))
}

fn i2_operand(frame: &mut Frame) -> Result<i16, InterpreterError> {
    Ok(u2_operand(frame)? as i16)
}

fn raise(kind: JavaExceptionKind, message: impl Into<String>, pc: usize) -> Flow {
    Flow::Raise {
        throwable: JavaThrowable::new(kind.class_name(), message),
        pc,
    }
}

/// IEEE 754 remainder (round-to-nearest-even quotient), the semantics
/// `frem`/`drem` use here.
fn ieee_remainder(x: f64, y: f64) -> f64 {
    if x.is_nan() || y.is_nan() || x.is_infinite() || y == 0.0 {
        return f64::NAN;
    }
    if x == 0.0 || y.is_infinite() {
        return x;
    }
    let n = (x / y).round_ties_even();
    x - n * y
}

/// −1/0/+1 comparison with the NaN result supplied by the `l`/`g` opcode
/// variant.
fn float_compare(a: f64, b: f64, nan_result: i64) -> i64 {
    if a.is_nan() || b.is_nan() {
        nan_result
    } else if a > b {
        1
    } else if a < b {
        -1
    } else {
        0
    }
}

impl VirtualMachine {
    /// Runs the frame on top of `thread` until it returns or an exception
    /// escapes it. Fatal interpreter errors unwind through `Err`.
    pub fn run_frame(&self, thread: &mut Thread) -> Result<FrameResult, InterpreterError> {
        loop {
            let flow = {
                let frame = thread.current()?;
                if frame.pc >= frame.code.len() {
                    return Ok(FrameResult::Completed);
                }
                self.step(frame)?
            };

            match flow {
                Flow::Continue => {}
                Flow::Return { value, wide } => {
                    let depth = thread.frames.len();
                    if let Some(value) = value {
                        if depth >= 2 {
                            let caller = &mut thread.frames[depth - 2];
                            caller.push(value.clone());
                            if wide {
                                caller.push(value);
                            }
                        }
                    }
                    return Ok(FrameResult::Completed);
                }
                Flow::Raise { throwable, pc } => {
                    if let Some(unhandled) = self.dispatch_throwable(thread, throwable, pc)? {
                        return Ok(FrameResult::Threw(unhandled));
                    }
                }
                Flow::Invoke(site) => {
                    if let Some(unhandled) = self.invoke(thread, site)? {
                        return Ok(FrameResult::Threw(unhandled));
                    }
                }
            }
        }
    }

    /// One instruction. Operates on the frame alone; work that needs the
    /// whole thread (calls, returns, exception transfer) is handed back as
    /// a [`Flow`].
    fn step(&self, frame: &mut Frame) -> Result<Flow, InterpreterError> {
        let op_pc = frame.pc;
        let opcode = u1_operand(frame)?;

        if log::log_enabled!(log::Level::Trace) {
            log::trace!(
                "class: {:<12} meth: {:<10} pc: {:3} {:<14} tos: {:?}",
                frame.klass.name,
                frame.method_name,
                op_pc,
                OPCODE_NAMES[opcode as usize],
                frame.stack.last(),
            );
        }

        match opcode {
            NOP => {}

            // ---- constants ----
            ACONST_NULL => frame.push(Value::NULL),
            ICONST_M1..=ICONST_5 => {
                frame.push(Value::Int(i64::from(opcode) - i64::from(ICONST_0)))
            }
            LCONST_0 | LCONST_1 => frame.push_wide_int(i64::from(opcode - LCONST_0)),
            FCONST_0 | FCONST_1 | FCONST_2 => {
                frame.push(Value::Float(f64::from(opcode - FCONST_0)))
            }
            DCONST_0 | DCONST_1 => frame.push_wide_float(f64::from(opcode - DCONST_0)),
            BIPUSH => {
                let v = i1_operand(frame)?;
                frame.push(Value::Int(i64::from(v)));
            }
            SIPUSH => {
                let v = i2_operand(frame)?;
                frame.push(Value::Int(i64::from(v)));
            }
            LDC => {
                let idx = u16::from(u1_operand(frame)?);
                return self.load_constant(frame, idx, false, op_pc);
            }
            LDC_W => {
                let idx = u2_operand(frame)?;
                return self.load_constant(frame, idx, false, op_pc);
            }
            LDC2_W => {
                let idx = u2_operand(frame)?;
                return self.load_constant(frame, idx, true, op_pc);
            }

            // ---- loads ----
            ILOAD | FLOAD | ALOAD => {
                let idx = u1_operand(frame)? as usize;
                let v = frame.load(idx)?;
                frame.push(v);
            }
            LLOAD | DLOAD => {
                let idx = u1_operand(frame)? as usize;
                let v = frame.load(idx)?;
                frame.push(v.clone());
                frame.push(v);
            }
            ILOAD_0..=ILOAD_3 => {
                let v = frame.load((opcode - ILOAD_0) as usize)?;
                frame.push(v);
            }
            LLOAD_0..=LLOAD_3 => {
                let v = frame.load((opcode - LLOAD_0) as usize)?;
                frame.push(v.clone());
                frame.push(v);
            }
            FLOAD_0..=FLOAD_3 => {
                let v = frame.load((opcode - FLOAD_0) as usize)?;
                frame.push(v);
            }
            DLOAD_0..=DLOAD_3 => {
                let v = frame.load((opcode - DLOAD_0) as usize)?;
                frame.push(v.clone());
                frame.push(v);
            }
            ALOAD_0..=ALOAD_3 => {
                let v = frame.load((opcode - ALOAD_0) as usize)?;
                frame.push(v);
            }

            // ---- stores ----
            ISTORE | FSTORE | ASTORE => {
                let idx = u1_operand(frame)? as usize;
                let v = frame.pop()?;
                frame.store(idx, v)?;
            }
            LSTORE | DSTORE => {
                let idx = u1_operand(frame)? as usize;
                let v = frame.pop()?;
                frame.pop()?;
                frame.store_wide(idx, v)?;
            }
            ISTORE_0..=ISTORE_3 => {
                let v = Value::Int(frame.pop_int()?);
                frame.store((opcode - ISTORE_0) as usize, v)?;
            }
            LSTORE_0..=LSTORE_3 => {
                let v = frame.pop()?;
                frame.pop()?;
                frame.store_wide((opcode - LSTORE_0) as usize, v)?;
            }
            FSTORE_0..=FSTORE_3 => {
                let v = Value::Float(frame.pop_float()?);
                frame.store((opcode - FSTORE_0) as usize, v)?;
            }
            DSTORE_0..=DSTORE_3 => {
                let v = frame.pop()?;
                frame.pop()?;
                frame.store_wide((opcode - DSTORE_0) as usize, v)?;
            }
            ASTORE_0..=ASTORE_3 => {
                let v = frame.pop()?;
                frame.store((opcode - ASTORE_0) as usize, v)?;
            }

            // ---- array loads ----
            IALOAD | CALOAD | SALOAD | BALOAD | FALOAD | AALOAD | LALOAD | DALOAD => {
                let index = frame.pop_int()?;
                let array_ref = frame.pop_ref()?;
                let array = match array_ref {
                    Some(array) => array,
                    None => {
                        return Ok(raise(
                            JavaExceptionKind::NullPointer,
                            "null reference to an array",
                            op_pc,
                        ))
                    }
                };
                let guard = array.read();
                let backing = match &guard.body {
                    ObjectBody::Array { backing, .. } => backing,
                    ObjectBody::Fields(_) => {
                        return Err(InterpreterError::WrongValueKind {
                            expected: "array",
                            found: "object",
                        })
                    }
                };
                if index < 0 || index as usize >= backing.len() {
                    return Ok(raise(
                        JavaExceptionKind::ArrayIndexOutOfBounds,
                        format!("array index {index} out of bounds for length {}", backing.len()),
                        op_pc,
                    ));
                }
                let i = index as usize;
                match (opcode, backing) {
                    (IALOAD | CALOAD | SALOAD, ArrayBacking::Ints(v)) => {
                        frame.push(Value::Int(v[i]))
                    }
                    (BALOAD, ArrayBacking::Bytes(v)) => frame.push(Value::Int(i64::from(v[i]))),
                    (LALOAD, ArrayBacking::Ints(v)) => frame.push_wide_int(v[i]),
                    (FALOAD, ArrayBacking::Floats(v)) => frame.push(Value::Float(v[i])),
                    (DALOAD, ArrayBacking::Floats(v)) => frame.push_wide_float(v[i]),
                    (AALOAD, ArrayBacking::Refs(v)) => frame.push(Value::Ref(v[i].clone())),
                    _ => {
                        return Ok(raise(
                            JavaExceptionKind::ArrayStore,
                            "array element type does not match the access",
                            op_pc,
                        ))
                    }
                }
            }

            // ---- array stores ----
            IASTORE | CASTORE | SASTORE | BASTORE | FASTORE | AASTORE | LASTORE | DASTORE => {
                let value = match opcode {
                    LASTORE => {
                        let v = frame.pop_int()?;
                        frame.pop()?;
                        Value::Int(v)
                    }
                    DASTORE => {
                        let v = frame.pop_float()?;
                        frame.pop()?;
                        Value::Float(v)
                    }
                    _ => frame.pop()?,
                };
                let index = frame.pop_int()?;
                let array_ref = frame.pop_ref()?;
                let array = match array_ref {
                    Some(array) => array,
                    None => {
                        return Ok(raise(
                            JavaExceptionKind::NullPointer,
                            "null reference to an array",
                            op_pc,
                        ))
                    }
                };
                let mut guard = array.write();
                let backing = match &mut guard.body {
                    ObjectBody::Array { backing, .. } => backing,
                    ObjectBody::Fields(_) => {
                        return Err(InterpreterError::WrongValueKind {
                            expected: "array",
                            found: "object",
                        })
                    }
                };
                if index < 0 || index as usize >= backing.len() {
                    return Ok(raise(
                        JavaExceptionKind::ArrayIndexOutOfBounds,
                        format!("array index {index} out of bounds for length {}", backing.len()),
                        op_pc,
                    ));
                }
                let i = index as usize;
                match (opcode, backing) {
                    (IASTORE | CASTORE | SASTORE | LASTORE, ArrayBacking::Ints(v)) => {
                        v[i] = value.as_int()?
                    }
                    (BASTORE, ArrayBacking::Bytes(v)) => v[i] = value.as_int()? as i8,
                    (FASTORE | DASTORE, ArrayBacking::Floats(v)) => v[i] = value.as_float()?,
                    (AASTORE, ArrayBacking::Refs(v)) => v[i] = value.as_obj_ref()?,
                    _ => {
                        return Ok(raise(
                            JavaExceptionKind::ArrayStore,
                            "array element type does not match the store",
                            op_pc,
                        ))
                    }
                }
            }

            ARRAYLENGTH => {
                let array_ref = frame.pop_ref()?;
                let array = match array_ref {
                    Some(array) => array,
                    None => {
                        return Ok(raise(
                            JavaExceptionKind::NullPointer,
                            "null reference to an array",
                            op_pc,
                        ))
                    }
                };
                let guard = array.read();
                match &guard.body {
                    ObjectBody::Array { backing, .. } => {
                        frame.push(Value::Int(backing.len() as i64))
                    }
                    ObjectBody::Fields(_) => {
                        return Err(InterpreterError::WrongValueKind {
                            expected: "array",
                            found: "object",
                        })
                    }
                }
            }

            // ---- stack manipulation ----
            POP => {
                frame.pop()?;
            }
            POP2 => {
                frame.pop()?;
                frame.pop()?;
            }
            DUP => {
                let top = frame.peek()?.clone();
                frame.push(top);
            }
            DUP_X1 => {
                let top = frame.pop()?;
                let next = frame.pop()?;
                frame.push(top.clone());
                frame.push(next);
                frame.push(top);
            }
            DUP_X2 => {
                let top = frame.pop()?;
                let next = frame.pop()?;
                let third = frame.pop()?;
                frame.push(top.clone());
                frame.push(third);
                frame.push(next);
                frame.push(top);
            }
            DUP2 => {
                let top = frame.pop()?;
                let next = frame.peek()?.clone();
                frame.push(top.clone());
                frame.push(next);
                frame.push(top);
            }
            DUP2_X1 => {
                let top = frame.pop()?;
                let next = frame.pop()?;
                let third = frame.pop()?;
                frame.push(next.clone());
                frame.push(top.clone());
                frame.push(third);
                frame.push(next);
                frame.push(top);
            }
            DUP2_X2 => {
                let top = frame.pop()?;
                let next = frame.pop()?;
                let third = frame.pop()?;
                let fourth = frame.pop()?;
                frame.push(next.clone());
                frame.push(top.clone());
                frame.push(fourth);
                frame.push(third);
                frame.push(next);
                frame.push(top);
            }
            SWAP => {
                let top = frame.pop()?;
                let next = frame.pop()?;
                frame.push(top);
                frame.push(next);
            }

            // ---- integer arithmetic (i32 wrap, widened on the stack) ----
            IADD => int_binop(frame, |a, b| a.wrapping_add(b))?,
            ISUB => int_binop(frame, |a, b| a.wrapping_sub(b))?,
            IMUL => int_binop(frame, |a, b| a.wrapping_mul(b))?,
            IDIV | IREM => {
                let b = frame.pop_int()?;
                let a = frame.pop_int()?;
                if b == 0 {
                    return Ok(raise(JavaExceptionKind::Arithmetic, "/ by zero", op_pc));
                }
                let (a, b) = (a as i32, b as i32);
                let r = if opcode == IDIV {
                    a.wrapping_div(b)
                } else {
                    a.wrapping_rem(b)
                };
                frame.push(Value::Int(i64::from(r)));
            }
            INEG => {
                let v = frame.pop_int()? as i32;
                frame.push(Value::Int(i64::from(v.wrapping_neg())));
            }

            // ---- long arithmetic ----
            LADD => long_binop(frame, |a, b| a.wrapping_add(b))?,
            LSUB => long_binop(frame, |a, b| a.wrapping_sub(b))?,
            LMUL => long_binop(frame, |a, b| a.wrapping_mul(b))?,
            LDIV | LREM => {
                let b = frame.pop_wide_int()?;
                let a = frame.pop_wide_int()?;
                if b == 0 {
                    return Ok(raise(JavaExceptionKind::Arithmetic, "/ by zero", op_pc));
                }
                let r = if opcode == LDIV {
                    a.wrapping_div(b)
                } else {
                    a.wrapping_rem(b)
                };
                frame.push_wide_int(r);
            }
            LNEG => {
                let v = frame.pop_wide_int()?;
                frame.push_wide_int(v.wrapping_neg());
            }

            // ---- float arithmetic (f32 precision, widened for storage) ----
            FADD => float_binop(frame, |a, b| a + b)?,
            FSUB => float_binop(frame, |a, b| a - b)?,
            FMUL => float_binop(frame, |a, b| a * b)?,
            FDIV => float_binop(frame, |a, b| a / b)?,
            FREM => {
                let b = frame.pop_float()?;
                let a = frame.pop_float()?;
                frame.push(Value::Float(f64::from(ieee_remainder(a, b) as f32)));
            }
            FNEG => {
                let v = frame.pop_float()?;
                frame.push(Value::Float(-v));
            }

            // ---- double arithmetic ----
            DADD => double_binop(frame, |a, b| a + b)?,
            DSUB => double_binop(frame, |a, b| a - b)?,
            DMUL => double_binop(frame, |a, b| a * b)?,
            DDIV => double_binop(frame, |a, b| a / b)?,
            DREM => {
                let b = frame.pop_wide_float()?;
                let a = frame.pop_wide_float()?;
                frame.push_wide_float(ieee_remainder(a, b));
            }
            DNEG => {
                let v = frame.pop_wide_float()?;
                frame.push_wide_float(-v);
            }

            // ---- shifts and bitwise ----
            ISHL => int_binop(frame, |a, b| a.wrapping_shl(b as u32 & 0x1F))?,
            ISHR => int_binop(frame, |a, b| a.wrapping_shr(b as u32 & 0x1F))?,
            IUSHR => int_binop(frame, |a, b| ((a as u32) >> (b as u32 & 0x1F)) as i32)?,
            IAND => int_binop(frame, |a, b| a & b)?,
            IOR => int_binop(frame, |a, b| a | b)?,
            IXOR => int_binop(frame, |a, b| a ^ b)?,
            LSHL | LSHR | LUSHR => {
                // the shift count is a plain int, not a two-slot long
                let count = frame.pop_int()? as u32 & 0x3F;
                let v = frame.pop_wide_int()?;
                let r = match opcode {
                    LSHL => v.wrapping_shl(count),
                    LSHR => v.wrapping_shr(count),
                    _ => ((v as u64) >> count) as i64,
                };
                frame.push_wide_int(r);
            }
            LAND => long_binop(frame, |a, b| a & b)?,
            LOR => long_binop(frame, |a, b| a | b)?,
            LXOR => long_binop(frame, |a, b| a ^ b)?,

            IINC => {
                let idx = u1_operand(frame)? as usize;
                let delta = i1_operand(frame)?;
                let orig = frame.load(idx)?.as_int()? as i32;
                frame.store(idx, Value::Int(i64::from(orig.wrapping_add(i32::from(delta)))))?;
            }

            // ---- conversions ----
            I2L => {
                // ints already occupy 64 bits; widen onto a second slot
                let v = frame.peek()?.as_int()?;
                frame.push(Value::Int(v));
            }
            I2F => {
                let v = frame.pop_int()?;
                frame.push(Value::Float(f64::from(v as i32 as f32)));
            }
            I2D => {
                let v = frame.pop_int()?;
                frame.push_wide_float(f64::from(v as i32));
            }
            L2I => {
                let v = frame.pop_wide_int()?;
                frame.push(Value::Int(i64::from(v as i32)));
            }
            L2F => {
                let v = frame.pop_wide_int()?;
                frame.push(Value::Float(f64::from(v as f32)));
            }
            L2D => {
                let v = frame.pop_wide_int()?;
                frame.push_wide_float(v as f64);
            }
            F2I => {
                let v = frame.pop_float()?;
                frame.push(Value::Int(i64::from(v as f32 as i32)));
            }
            F2L => {
                let v = frame.pop_float()?;
                frame.push_wide_int(v as f32 as i64);
            }
            F2D => {
                let v = frame.pop_float()?;
                frame.push_wide_float(v);
            }
            D2I => {
                let v = frame.pop_wide_float()?;
                frame.push(Value::Int(i64::from(v as i32)));
            }
            D2L => {
                let v = frame.pop_wide_float()?;
                frame.push_wide_int(v as i64);
            }
            D2F => {
                let v = frame.pop_wide_float()?;
                frame.push(Value::Float(f64::from(v as f32)));
            }
            I2B => {
                let v = frame.pop_int()?;
                frame.push(Value::Int(i64::from(v as i8)));
            }
            I2C => {
                let v = frame.pop_int()?;
                frame.push(Value::Int(i64::from(v as u16)));
            }
            I2S => {
                let v = frame.pop_int()?;
                frame.push(Value::Int(i64::from(v as i16)));
            }

            // ---- comparisons ----
            LCMP => {
                let b = frame.pop_wide_int()?;
                let a = frame.pop_wide_int()?;
                frame.push(Value::Int(match a.cmp(&b) {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                }));
            }
            FCMPL | FCMPG => {
                let b = frame.pop_float()?;
                let a = frame.pop_float()?;
                let nan = if opcode == FCMPG { 1 } else { -1 };
                frame.push(Value::Int(float_compare(a, b, nan)));
            }
            DCMPL | DCMPG => {
                let b = frame.pop_wide_float()?;
                let a = frame.pop_wide_float()?;
                let nan = if opcode == DCMPG { 1 } else { -1 };
                frame.push(Value::Int(float_compare(a, b, nan)));
            }

            // ---- branches (offsets are relative to the branch opcode) ----
            IFEQ | IFNE | IFLT | IFGE | IFGT | IFLE => {
                let offset = i2_operand(frame)?;
                let v = frame.pop_int()?;
                let taken = match opcode {
                    IFEQ => v == 0,
                    IFNE => v != 0,
                    IFLT => v < 0,
                    IFGE => v >= 0,
                    IFGT => v > 0,
                    _ => v <= 0,
                };
                if taken {
                    frame.pc = branch_target(op_pc, offset);
                }
            }
            IF_ICMPEQ | IF_ICMPNE | IF_ICMPLT | IF_ICMPGE | IF_ICMPGT | IF_ICMPLE => {
                let offset = i2_operand(frame)?;
                let b = frame.pop_int()? as i32;
                let a = frame.pop_int()? as i32;
                let taken = match opcode {
                    IF_ICMPEQ => a == b,
                    IF_ICMPNE => a != b,
                    IF_ICMPLT => a < b,
                    IF_ICMPGE => a >= b,
                    IF_ICMPGT => a > b,
                    _ => a <= b,
                };
                if taken {
                    frame.pc = branch_target(op_pc, offset);
                }
            }
            IF_ACMPEQ | IF_ACMPNE => {
                let offset = i2_operand(frame)?;
                let b = frame.pop_ref()?;
                let a = frame.pop_ref()?;
                let same = match (&a, &b) {
                    (None, None) => true,
                    (Some(a), Some(b)) => std::sync::Arc::ptr_eq(a, b),
                    _ => false,
                };
                let taken = (opcode == IF_ACMPEQ) == same;
                if taken {
                    frame.pc = branch_target(op_pc, offset);
                }
            }
            IFNULL | IFNONNULL => {
                let offset = i2_operand(frame)?;
                let v = frame.pop_ref()?;
                let taken = (opcode == IFNULL) == v.is_none();
                if taken {
                    frame.pc = branch_target(op_pc, offset);
                }
            }
            GOTO => {
                let offset = i2_operand(frame)?;
                frame.pc = branch_target(op_pc, offset);
            }

            // ---- returns ----
            IRETURN => {
                let v = frame.pop_int()?;
                return Ok(Flow::Return {
                    value: Some(Value::Int(v)),
                    wide: false,
                });
            }
            LRETURN => {
                let v = frame.pop_wide_int()?;
                return Ok(Flow::Return {
                    value: Some(Value::Int(v)),
                    wide: true,
                });
            }
            FRETURN => {
                let v = frame.pop_float()?;
                return Ok(Flow::Return {
                    value: Some(Value::Float(v)),
                    wide: false,
                });
            }
            DRETURN => {
                let v = frame.pop_wide_float()?;
                return Ok(Flow::Return {
                    value: Some(Value::Float(v)),
                    wide: true,
                });
            }
            ARETURN => {
                let v = frame.pop_ref()?;
                return Ok(Flow::Return {
                    value: Some(Value::Ref(v)),
                    wide: false,
                });
            }
            RETURN => {
                frame.stack.clear();
                return Ok(Flow::Return {
                    value: None,
                    wide: false,
                });
            }

            // ---- statics ----
            GETSTATIC | PUTSTATIC => {
                let idx = u2_operand(frame)?;
                return self.static_access(frame, idx, opcode == PUTSTATIC);
            }

            // ---- instance fields ----
            GETFIELD => {
                let idx = u2_operand(frame)?;
                let cp_slot = frame.cp().slot(idx)?;
                if cp_slot.kind != CpKind::FieldRef {
                    return Err(InterpreterError::CpMismatch(
                        rook_classfile::ClassFormatError::CpKindMismatch {
                            index: idx,
                            expected: "Fieldref",
                            found: cp_slot.kind.name(),
                        },
                    ));
                }
                let (_, field_name, _) = frame.cp().member_ref_at(idx, true)?;
                let field_name = field_name.to_string();

                let obj_ref = frame.pop_ref()?;
                let obj = match obj_ref {
                    Some(obj) => obj,
                    None => {
                        return Ok(raise(
                            JavaExceptionKind::NullPointer,
                            format!("getfield {field_name} on a null reference"),
                            op_pc,
                        ))
                    }
                };
                let guard = obj.read();
                let fields = guard.fields().ok_or(InterpreterError::WrongValueKind {
                    expected: "object",
                    found: "array",
                })?;
                let slot = match fields {
                    FieldStorage::Indexed(_) => fields.by_index(cp_slot.slot as usize),
                    FieldStorage::Named(_) => fields.by_name(&field_name),
                }
                .ok_or(InterpreterError::BadLocalIndex(cp_slot.slot as usize))?;
                let wide = Value::width_of_desc(&slot.desc) == 2;
                let value = slot.value.clone();
                drop(guard);
                frame.push(value.clone());
                if wide {
                    frame.push(value);
                }
            }
            PUTFIELD => {
                let idx = u2_operand(frame)?;
                let cp_slot = frame.cp().slot(idx)?;
                if cp_slot.kind != CpKind::FieldRef {
                    return Err(InterpreterError::CpMismatch(
                        rook_classfile::ClassFormatError::CpKindMismatch {
                            index: idx,
                            expected: "Fieldref",
                            found: cp_slot.kind.name(),
                        },
                    ));
                }
                let (_, field_name, desc) = frame.cp().member_ref_at(idx, true)?;
                let field_name = field_name.to_string();
                let wide = Value::width_of_desc(desc) == 2;

                let value = frame.pop()?;
                if wide {
                    frame.pop()?;
                }
                let obj_ref = frame.pop_ref()?;
                let obj = match obj_ref {
                    Some(obj) => obj,
                    None => {
                        return Ok(raise(
                            JavaExceptionKind::NullPointer,
                            format!("putfield {field_name} on a null reference"),
                            op_pc,
                        ))
                    }
                };
                let mut guard = obj.write();
                let fields = guard.fields_mut().ok_or(InterpreterError::WrongValueKind {
                    expected: "object",
                    found: "array",
                })?;
                let slot = match fields {
                    FieldStorage::Indexed(_) => fields.by_index_mut(cp_slot.slot as usize),
                    FieldStorage::Named(_) => fields.by_name_mut(&field_name),
                }
                .ok_or(InterpreterError::BadLocalIndex(cp_slot.slot as usize))?;
                slot.value = value;
            }

            // ---- invocation ----
            INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC => {
                let idx = u2_operand(frame)?;
                let (class_name, method_name, descriptor) = frame.cp().member_ref_at(idx, false)?;
                let kind = match opcode {
                    INVOKEVIRTUAL => InvokeKind::Virtual,
                    INVOKESPECIAL => InvokeKind::Special,
                    _ => InvokeKind::Static,
                };
                return Ok(Flow::Invoke(CallSite {
                    class_name: class_name.to_string(),
                    method_name: method_name.to_string(),
                    descriptor: descriptor.to_string(),
                    kind,
                    pc: op_pc,
                }));
            }

            // ---- object and array creation ----
            NEW => {
                let idx = u2_operand(frame)?;
                let class_name = frame.cp().class_name_at(idx)?.to_string();
                let obj = self.instantiate(&class_name).map_err(vm_to_interp)?;
                frame.push(Value::Ref(Some(obj)));
            }
            NEWARRAY => {
                let size = frame.pop_int()?;
                let raw_type = u1_operand(frame)?;
                let code = ArrayTypeCode::from_discriminant(raw_type).map_err(|_| {
                    InterpreterError::InvalidBytecode {
                        opcode,
                        pc: op_pc,
                        method: frame.method_name.clone(),
                    }
                })?;
                if size < 0 {
                    return Ok(raise(
                        JavaExceptionKind::NegativeArraySize,
                        format!("array size {size}"),
                        op_pc,
                    ));
                }
                let array = object::new_array_1d(code.descriptor(), size as usize)
                    .expect("primitive descriptors always map to a backing");
                frame.push(Value::Ref(Some(array)));
            }
            ANEWARRAY => {
                let size = frame.pop_int()?;
                let idx = u2_operand(frame)?;
                let elem_class = frame.cp().class_name_at(idx)?;
                let elem_desc = if elem_class.starts_with('[') {
                    elem_class.to_string()
                } else {
                    format!("L{elem_class};")
                };
                if size < 0 {
                    return Ok(raise(
                        JavaExceptionKind::NegativeArraySize,
                        format!("array size {size}"),
                        op_pc,
                    ));
                }
                let array = object::new_array_1d(&elem_desc, size as usize)
                    .expect("element descriptor derived from a class name");
                frame.push(Value::Ref(Some(array)));
            }
            MULTIANEWARRAY => {
                let idx = u2_operand(frame)?;
                let array_desc = frame.cp().class_name_at(idx)?.to_string();
                let dim_count = u1_operand(frame)? as usize;
                return self.multianewarray(frame, &array_desc, dim_count, op_pc);
            }

            ATHROW => {
                let thrown = frame.pop_ref()?;
                let obj = match thrown {
                    Some(obj) => obj,
                    None => {
                        return Ok(raise(
                            JavaExceptionKind::NullPointer,
                            "athrow on a null reference",
                            op_pc,
                        ))
                    }
                };
                let class_name = obj.read().klass_name.clone();
                let mut throwable = JavaThrowable::new(class_name, "");
                throwable.object = Some(obj);
                return Ok(Flow::Raise {
                    throwable,
                    pc: op_pc,
                });
            }

            other => {
                return Err(InterpreterError::InvalidBytecode {
                    opcode: other,
                    pc: op_pc,
                    method: format!("{}.{}", frame.klass.name, frame.method_name),
                })
            }
        }

        Ok(Flow::Continue)
    }

    /// `ldc`/`ldc_w`/`ldc2_w`: fetch a loadable constant by cp index.
    fn load_constant(
        &self,
        frame: &mut Frame,
        idx: u16,
        wide: bool,
        op_pc: usize,
    ) -> Result<Flow, InterpreterError> {
        let cp = frame.cp();
        let slot = cp.slot(idx)?;
        let loaded = match slot.kind {
            CpKind::IntConst if !wide => Some(Value::Int(i64::from(cp.ints[slot.slot as usize]))),
            CpKind::FloatConst if !wide => {
                Some(Value::Float(f64::from(cp.floats[slot.slot as usize])))
            }
            CpKind::LongConst if wide => Some(Value::Int(cp.longs[slot.slot as usize])),
            CpKind::DoubleConst if wide => Some(Value::Float(cp.doubles[slot.slot as usize])),
            CpKind::StringRef if !wide => {
                let text_idx = cp.string_refs[slot.slot as usize];
                let text = cp.utf8_at(text_idx)?;
                Some(Value::Ref(Some(object::new_java_string(text))))
            }
            // a class constant degrades to its name; there is no Class
            // object in this runtime
            CpKind::ClassRef if !wide => {
                let name = cp.class_name_at(idx)?;
                Some(Value::Ref(Some(object::new_java_string(name))))
            }
            _ => None,
        };

        match loaded {
            Some(value) if wide => {
                frame.push(value.clone());
                frame.push(value);
                Ok(Flow::Continue)
            }
            Some(value) => {
                frame.push(value);
                Ok(Flow::Continue)
            }
            None => Ok(raise(
                JavaExceptionKind::InaccessibleObject,
                format!("constant pool entry {idx} is not loadable here"),
                op_pc,
            )),
        }
    }

    /// `getstatic`/`putstatic`. Initialization of the owning class strictly
    /// precedes the access; an entry missing from the statics table is
    /// created with the field's default value.
    fn static_access(
        &self,
        frame: &mut Frame,
        idx: u16,
        is_put: bool,
    ) -> Result<Flow, InterpreterError> {
        let (class_name, field_name, desc) = frame.cp().member_ref_at(idx, true)?;
        let (class_name, field_name, desc) =
            (class_name.to_string(), field_name.to_string(), desc.to_string());

        self.ensure_initialized(&class_name).map_err(vm_to_interp)?;

        let full_name = format!("{class_name}.{field_name}");
        let wide = Value::width_of_desc(&desc) == 2;

        if is_put {
            let value = frame.pop()?;
            if wide {
                frame.pop()?;
            }
            self.method_area().add_static(
                &full_name,
                crate::method_area::StaticEntry {
                    desc,
                    value: value.clone(),
                },
            );
            self.method_area().set_static(&full_name, value);
        } else {
            let entry = match self.method_area().get_static(&full_name) {
                Some(entry) => entry,
                None => {
                    let value = Value::default_for_desc(&desc).ok_or_else(|| {
                        InterpreterError::Load(crate::LoadError::BadFieldDescriptor {
                            class: class_name.clone(),
                            field: field_name.clone(),
                            desc: desc.clone(),
                        })
                    })?;
                    let entry = crate::method_area::StaticEntry { desc, value };
                    self.method_area().add_static(&full_name, entry.clone());
                    entry
                }
            };
            frame.push(entry.value.clone());
            if wide {
                frame.push(entry.value);
            }
        }
        Ok(Flow::Continue)
    }

    /// `multianewarray`: sizes are popped last-dimension-first; a zero
    /// dimension truncates everything deeper.
    fn multianewarray(
        &self,
        frame: &mut Frame,
        array_desc: &str,
        dim_count: usize,
        op_pc: usize,
    ) -> Result<Flow, InterpreterError> {
        if dim_count > 3 {
            return Err(InterpreterError::UnsupportedArrayShape(dim_count));
        }
        let elem_desc: String = array_desc.trim_start_matches('[').to_string();

        let mut sizes = vec![0i64; dim_count];
        for i in (0..dim_count).rev() {
            sizes[i] = frame.pop_int()?;
        }
        if let Some(negative) = sizes.iter().find(|&&s| s < 0) {
            return Ok(raise(
                JavaExceptionKind::NegativeArraySize,
                format!("array size {negative}"),
                op_pc,
            ));
        }
        if let Some(zero_at) = sizes.iter().position(|&s| s == 0) {
            if zero_at + 1 < sizes.len() {
                log::warn!("multianewarray dimension of size 0 truncates the deeper dimensions");
            }
            sizes.truncate(zero_at + 1);
        }

        let array = match sizes.len() {
            3 => {
                let outer = object::new_array_1d(&format!("[[{elem_desc}"), sizes[0] as usize)
                    .expect("descriptor built from a parsed array class");
                {
                    let mut guard = outer.write();
                    if let ObjectBody::Array {
                        backing: ArrayBacking::Refs(rows),
                        ..
                    } = &mut guard.body
                    {
                        for row in rows.iter_mut() {
                            *row = object::new_array_2d(
                                sizes[1] as usize,
                                sizes[2] as usize,
                                &elem_desc,
                            );
                        }
                    }
                }
                outer
            }
            2 => object::new_array_2d(sizes[0] as usize, sizes[1] as usize, &elem_desc)
                .ok_or_else(|| InterpreterError::UnsupportedArrayShape(dim_count))?,
            _ => {
                let len = sizes.first().copied().unwrap_or(0) as usize;
                object::new_array_1d(&elem_desc, len)
                    .ok_or_else(|| InterpreterError::UnsupportedArrayShape(dim_count))?
            }
        };
        frame.push(Value::Ref(Some(array)));
        Ok(Flow::Continue)
    }

    /// Carries out an invoke site: unpacks arguments off the caller's
    /// stack, dispatches native or bytecode, and routes any exception the
    /// callee failed to handle through this frame's handler table. Returns
    /// the throwable if it escapes this frame too.
    fn invoke(
        &self,
        thread: &mut Thread,
        site: CallSite,
    ) -> Result<Option<JavaThrowable>, InterpreterError> {
        let qualified = format!(
            "{}.{}{}",
            site.class_name, site.method_name, site.descriptor
        );
        let md = MethodDescriptor::try_from(site.descriptor.as_str())?;

        // parameters leave the caller's stack in reverse declared order
        let mut args_rev: Vec<(Value, u8)> = Vec::with_capacity(md.params.len());
        {
            let frame = thread.current()?;
            for param in md.params.iter().rev() {
                if param.slot_width() == 2 {
                    let v = frame.pop()?;
                    frame.pop()?;
                    args_rev.push((v, 2));
                } else {
                    args_rev.push((frame.pop()?, 1));
                }
            }
        }

        let receiver = if site.kind == InvokeKind::Static {
            None
        } else {
            Some(thread.current()?.pop()?.as_obj_ref()?)
        };

        if let Some(None) = receiver {
            let throwable = JavaThrowable::new(
                JavaExceptionKind::NullPointer.class_name(),
                format!("invoking {qualified} on a null receiver"),
            );
            return self.dispatch_throwable(thread, throwable, site.pc);
        }

        // dynamic dispatch starts at the receiver's runtime class; static
        // and special calls start at the class the cp names
        let resolve_start = match (&site.kind, &receiver) {
            (InvokeKind::Virtual, Some(Some(obj))) => obj.read().klass_name.clone(),
            _ => site.class_name.clone(),
        };

        let resolve = |start: &str| {
            self.method_area()
                .fetch_method(self.natives(), start, &site.method_name, &site.descriptor)
                .or_else(|| {
                    if start != site.class_name {
                        self.method_area().fetch_method(
                            self.natives(),
                            &site.class_name,
                            &site.method_name,
                            &site.descriptor,
                        )
                    } else {
                        None
                    }
                })
        };

        let mut resolved = resolve(&resolve_start);
        if resolved.is_none() {
            // the named class may simply not have been loaded yet
            if site.kind == InvokeKind::Static {
                self.ensure_initialized(&site.class_name).map_err(vm_to_interp)?;
            } else {
                self.load_class(&resolve_start)?;
            }
            resolved = resolve(&resolve_start);
        }

        let entry = match resolved {
            Some(MethodTableEntry::Native(handler)) => {
                let mut args: Vec<Value> = Vec::with_capacity(md.params.len() + 1);
                if let Some(Some(obj)) = receiver {
                    args.push(Value::Ref(Some(obj)));
                }
                args.extend(args_rev.into_iter().rev().map(|(v, _)| v));

                let frame = thread.current()?;
                let (ret, slots) = handler(frame, &args);
                if let Some(value) = ret {
                    frame.push(value.clone());
                    if slots == 2 {
                        frame.push(value);
                    }
                }
                return Ok(None);
            }
            Some(MethodTableEntry::Bytecode(entry)) => entry,
            None => {
                return Err(
                    if self.method_area().method_is_native(
                        &resolve_start,
                        &site.method_name,
                        &site.descriptor,
                    ) {
                        InterpreterError::MissingNative(qualified)
                    } else {
                        InterpreterError::MethodNotFound(qualified)
                    },
                )
            }
        };

        if site.kind == InvokeKind::Static {
            self.ensure_initialized(&entry.klass.name).map_err(vm_to_interp)?;
        }

        let mut callee = Frame::new(
            entry.klass.clone(),
            &site.method_name,
            &site.descriptor,
            &entry,
        );
        let mut slot = 0usize;
        if let Some(Some(obj)) = receiver {
            callee.store(0, Value::Ref(Some(obj)))?;
            slot = 1;
        }
        for (value, width) in args_rev.into_iter().rev() {
            if width == 2 {
                callee.store_wide(slot, value)?;
                slot += 2;
            } else {
                callee.store(slot, value)?;
                slot += 1;
            }
        }

        thread.frames.push(callee);
        let result = self.run_frame(thread)?;
        thread.frames.pop();

        match result {
            FrameResult::Completed => Ok(None),
            FrameResult::Threw(throwable) => {
                self.dispatch_throwable(thread, throwable, site.pc)
            }
        }
    }

    /// Searches the current frame's exception table for a handler covering
    /// `pc`. On a match the operand stack is cleared, the throwable pushed,
    /// and control transferred; otherwise the throwable pops out of this
    /// frame for the caller to try.
    fn dispatch_throwable(
        &self,
        thread: &mut Thread,
        mut throwable: JavaThrowable,
        pc: usize,
    ) -> Result<Option<JavaThrowable>, InterpreterError> {
        if throwable.object.is_none() {
            throwable.object = Some(self.allocate_throwable(&throwable));
        }

        let handler = {
            let frame = thread.current()?;
            let table = frame.exception_table.clone();
            let mut found = None;
            for entry in table.iter() {
                if pc < entry.start_pc as usize || pc >= entry.end_pc as usize {
                    continue;
                }
                let matches = if entry.catch_type == 0 {
                    true
                } else {
                    let catch_name = frame.cp().class_name_at(entry.catch_type)?;
                    self.exception_matches(&throwable.class_name, catch_name)
                };
                if matches {
                    found = Some(entry.handler_pc as usize);
                    break;
                }
            }
            found
        };

        match handler {
            Some(handler_pc) => {
                log::trace!(
                    "{} caught, transferring to pc {handler_pc}",
                    throwable.class_name
                );
                let frame = thread.current()?;
                frame.stack.clear();
                frame.push(Value::Ref(throwable.object.clone()));
                frame.pc = handler_pc;
                Ok(None)
            }
            None => Ok(Some(throwable)),
        }
    }

    /// Whether a thrown class is caught by a handler naming `catch_name`:
    /// an exact match, a walk up the thrown class's loaded superclass
    /// chain, or one of the catch-all library roots (whose class files the
    /// host usually cannot supply).
    fn exception_matches(&self, thrown: &str, catch_name: &str) -> bool {
        if thrown == catch_name {
            return true;
        }
        if matches!(
            catch_name,
            "java/lang/Throwable" | "java/lang/Exception" | "java/lang/RuntimeException"
        ) {
            return true;
        }
        let mut current = thrown.to_string();
        while let Some(klass) = self.method_area().fetch(&current) {
            match &klass.super_name {
                Some(super_name) if super_name == catch_name => return true,
                Some(super_name) => current = super_name.clone(),
                None => break,
            }
        }
        false
    }

    /// Best-effort throwable object: a real instance when the class is
    /// loadable, otherwise a bare record carrying the message.
    fn allocate_throwable(&self, throwable: &JavaThrowable) -> crate::value::HeapRef {
        match self.instantiate(&throwable.class_name) {
            Ok(obj) => obj,
            Err(_) => object::allocate(
                throwable.class_name.clone(),
                ObjectBody::Fields(FieldStorage::Indexed(vec![FieldSlot {
                    desc: "Ljava/lang/String;".to_string(),
                    value: Value::Ref(Some(object::new_java_string(&throwable.message))),
                }])),
            ),
        }
    }
}

fn branch_target(op_pc: usize, offset: i16) -> usize {
    (op_pc as i64 + i64::from(offset)) as usize
}

fn int_binop(frame: &mut Frame, op: impl Fn(i32, i32) -> i32) -> Result<(), InterpreterError> {
    let b = frame.pop_int()? as i32;
    let a = frame.pop_int()? as i32;
    frame.push(Value::Int(i64::from(op(a, b))));
    Ok(())
}

fn long_binop(frame: &mut Frame, op: impl Fn(i64, i64) -> i64) -> Result<(), InterpreterError> {
    let b = frame.pop_wide_int()?;
    let a = frame.pop_wide_int()?;
    frame.push_wide_int(op(a, b));
    Ok(())
}

fn float_binop(frame: &mut Frame, op: impl Fn(f32, f32) -> f32) -> Result<(), InterpreterError> {
    let b = frame.pop_float()? as f32;
    let a = frame.pop_float()? as f32;
    frame.push(Value::Float(f64::from(op(a, b))));
    Ok(())
}

fn double_binop(frame: &mut Frame, op: impl Fn(f64, f64) -> f64) -> Result<(), InterpreterError> {
    let b = frame.pop_wide_float()?;
    let a = frame.pop_wide_float()?;
    frame.push_wide_float(op(a, b));
    Ok(())
}

/// VM-level failures surfacing inside the dispatch loop become interpreter
/// errors so they unwind the frame stack like any other fatal condition.
fn vm_to_interp(err: VmError) -> InterpreterError {
    match err {
        VmError::Load(e) => InterpreterError::Load(e),
        VmError::Interpreter(e) => e,
        VmError::UncaughtException(name) => InterpreterError::Initialization(name),
        VmError::MethodNotFound(name) => InterpreterError::MethodNotFound(name),
        VmError::BadArrayClass(name) => InterpreterError::MethodNotFound(name),
    }
}
