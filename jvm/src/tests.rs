#![cfg(test)]

use crate::method_area::StaticEntry;
use crate::object::{ArrayBacking, FieldStorage, ObjectBody};
use crate::thread::Frame;
use crate::value::Value;
use crate::{ClassBytesSource, ShutdownCode, VirtualMachine, VmError};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rook_classfile::attributes::{CodeAttribute, ExceptionTableEntry};
use rook_classfile::constant_pool::{ConstantPool, CpKind, CpSlot, NameAndTypeEntry, RefEntry};
use rook_classfile::{AccessFlags, FieldInfo, MethodInfo, ParsedClass};
use std::sync::Arc;

struct NoSource;

impl ClassBytesSource for NoSource {
    fn fetch(&self, _binary_name: &str) -> Option<Vec<u8>> {
        None
    }
}

/// A VM whose fatal hook records the codes it was handed instead of
/// exiting.
fn recording_vm() -> (VirtualMachine, Arc<Mutex<Vec<ShutdownCode>>>) {
    let codes = Arc::new(Mutex::new(Vec::new()));
    let sink = codes.clone();
    let vm = VirtualMachine::with_fatal_hook(
        Box::new(NoSource),
        Box::new(move |code| sink.lock().push(code)),
    );
    (vm, codes)
}

/// Hand-built constant pools, the same two-level shape the parser emits.
struct PoolBuilder {
    cp: ConstantPool,
}

impl PoolBuilder {
    fn new() -> Self {
        Self {
            cp: ConstantPool {
                cp_count: 1,
                index: vec![CpSlot::UNUSED],
                ..ConstantPool::default()
            },
        }
    }

    fn push(&mut self, kind: CpKind, slot: u16) -> u16 {
        self.cp.index.push(CpSlot { kind, slot });
        self.cp.cp_count += 1;
        (self.cp.index.len() - 1) as u16
    }

    /// A bare utf8 slot (no index entry), the form method/field name and
    /// descriptor indices use.
    fn utf8_slot(&mut self, text: &str) -> u16 {
        self.cp.utf8.push(text.to_string());
        (self.cp.utf8.len() - 1) as u16
    }

    fn utf8(&mut self, text: &str) -> u16 {
        let slot = self.utf8_slot(text);
        self.push(CpKind::Utf8, slot)
    }

    fn int(&mut self, value: i32) -> u16 {
        self.cp.ints.push(value);
        let slot = (self.cp.ints.len() - 1) as u16;
        self.push(CpKind::IntConst, slot)
    }

    fn string(&mut self, text: &str) -> u16 {
        let utf8_idx = self.utf8(text);
        self.cp.string_refs.push(utf8_idx);
        let slot = (self.cp.string_refs.len() - 1) as u16;
        self.push(CpKind::StringRef, slot)
    }

    fn class(&mut self, name: &str) -> u16 {
        let utf8_idx = self.utf8(name);
        self.cp.class_refs.push(utf8_idx);
        let slot = (self.cp.class_refs.len() - 1) as u16;
        self.push(CpKind::ClassRef, slot)
    }

    fn name_and_type(&mut self, name: &str, desc: &str) -> u16 {
        let name_idx = self.utf8(name);
        let desc_idx = self.utf8(desc);
        self.cp.name_and_types.push(NameAndTypeEntry { name_idx, desc_idx });
        let slot = (self.cp.name_and_types.len() - 1) as u16;
        self.push(CpKind::NameAndType, slot)
    }

    fn field_ref(&mut self, class_idx: u16, nat_idx: u16) -> u16 {
        self.cp.field_refs.push(RefEntry {
            class_idx,
            name_and_type_idx: nat_idx,
        });
        let slot = (self.cp.field_refs.len() - 1) as u16;
        self.push(CpKind::FieldRef, slot)
    }

    fn method_ref(&mut self, class_idx: u16, nat_idx: u16) -> u16 {
        self.cp.method_refs.push(RefEntry {
            class_idx,
            name_and_type_idx: nat_idx,
        });
        let slot = (self.cp.method_refs.len() - 1) as u16;
        self.push(CpKind::MethodRef, slot)
    }
}

struct ClassBuilder {
    pool: PoolBuilder,
    this_class: u16,
    super_class: u16,
    fields: Vec<FieldInfo>,
    methods: Vec<MethodInfo>,
}

impl ClassBuilder {
    fn new() -> Self {
        Self {
            pool: PoolBuilder::new(),
            this_class: 0,
            super_class: 0,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    fn pool(&mut self) -> &mut PoolBuilder {
        &mut self.pool
    }

    fn superclass(&mut self, name: &str) -> u16 {
        let idx = self.pool.class(name);
        self.super_class = idx;
        idx
    }

    fn static_method(&mut self, name: &str, desc: &str, code: CodeAttribute) {
        self.method(
            AccessFlags::PUBLIC | AccessFlags::STATIC,
            name,
            desc,
            code,
        );
    }

    fn method(&mut self, flags: AccessFlags, name: &str, desc: &str, code: CodeAttribute) {
        let name_idx = self.pool.utf8_slot(name);
        let desc_idx = self.pool.utf8_slot(desc);
        self.methods.push(MethodInfo {
            access_flags: flags,
            name_idx,
            desc_idx,
            code: Some(code),
            exceptions: Vec::new(),
            parameters: Vec::new(),
            attributes: Vec::new(),
        });
    }

    fn field(&mut self, flags: AccessFlags, name: &str, desc: &str, constant_value: Option<u16>) {
        let name_idx = self.pool.utf8_slot(name);
        let desc_idx = self.pool.utf8_slot(desc);
        self.fields.push(FieldInfo {
            access_flags: flags,
            name_idx,
            desc_idx,
            constant_value,
            attributes: Vec::new(),
        });
    }

    fn build(self) -> ParsedClass {
        ParsedClass {
            minor_version: 0,
            major_version: 55,
            cp: self.pool.cp,
            access_flags: AccessFlags::PUBLIC,
            this_class: self.this_class,
            super_class: self.super_class,
            interfaces: Vec::new(),
            fields: self.fields,
            methods: self.methods,
            attributes: Vec::new(),
        }
    }
}

fn code(bytes: &[u8], max_stack: u16, max_locals: u16) -> CodeAttribute {
    CodeAttribute {
        max_stack,
        max_locals,
        code: bytes.to_vec(),
        exception_table: Vec::new(),
        attributes: Vec::new(),
    }
}

/// Defines a one-method class and runs that method, returning its result.
fn run_static(
    vm: &VirtualMachine,
    class_name: &str,
    desc: &str,
    body: CodeAttribute,
) -> Result<Option<Value>, VmError> {
    let mut builder = ClassBuilder::new();
    builder.static_method("run", desc, body);
    vm.method_area().define(class_name, builder.build());
    vm.call(class_name, "run", desc, &[])
}

fn expect_uncaught(result: Result<Option<Value>, VmError>, class_name: &str) {
    match result {
        Err(VmError::UncaughtException(thrown)) => assert_eq!(thrown, class_name),
        other => panic!("expected uncaught {class_name}, got {other:?}"),
    }
}

// ---- arithmetic and stack semantics ----

#[test]
fn iconst_iadd_ireturn_returns_three() {
    let (vm, codes) = recording_vm();
    // iconst_1 iconst_2 iadd ireturn
    let result = run_static(&vm, "AddTest", "()I", code(&[0x04, 0x05, 0x60, 0xAC], 2, 0));
    assert_eq!(result.unwrap().unwrap().as_int().unwrap(), 3);
    assert!(codes.lock().is_empty());
}

#[test]
fn iadd_wraps_like_a_32_bit_int() {
    let (vm, _) = recording_vm();
    let mut builder = ClassBuilder::new();
    let max_idx = builder.pool().int(i32::MAX);
    builder.static_method(
        "run",
        "()I",
        // ldc <int max> iconst_1 iadd ireturn
        code(&[0x12, max_idx as u8, 0x04, 0x60, 0xAC], 2, 0),
    );
    vm.method_area().define("WrapTest", builder.build());
    let result = vm.call("WrapTest", "run", "()I", &[]).unwrap().unwrap();
    assert_eq!(result.as_int().unwrap(), i64::from(i32::MIN));
}

#[test]
fn idiv_by_zero_raises_and_signals_the_host() {
    let (vm, codes) = recording_vm();
    // iconst_1 iconst_0 idiv ireturn
    let result = run_static(&vm, "DivTest", "()I", code(&[0x04, 0x03, 0x6C, 0xAC], 2, 0));
    expect_uncaught(result, "java/lang/ArithmeticException");
    assert_eq!(*codes.lock(), vec![ShutdownCode::AppException]);
}

#[test]
fn long_add_is_stack_width_invariant() {
    let (vm, _) = recording_vm();
    // lconst_1 lconst_1 ladd lreturn
    let result = run_static(&vm, "LongAdd", "()J", code(&[0x0A, 0x0A, 0x61, 0xAD], 4, 0));
    assert_eq!(result.unwrap().unwrap().as_int().unwrap(), 2);
}

#[test]
fn long_survives_a_local_round_trip() {
    let (vm, _) = recording_vm();
    // lconst_1 lstore_0 lload_0 lreturn
    let result = run_static(&vm, "LongLocal", "()J", code(&[0x0A, 0x3F, 0x1E, 0xAD], 2, 2));
    assert_eq!(result.unwrap().unwrap().as_int().unwrap(), 1);
}

#[test]
fn iinc_adds_in_place() {
    let (vm, _) = recording_vm();
    // bipush 5; istore_0; iinc 0, +3; iload_0; ireturn
    let result = run_static(
        &vm,
        "IincTest",
        "()I",
        code(&[0x10, 0x05, 0x3B, 0x84, 0x00, 0x03, 0x1A, 0xAC], 1, 1),
    );
    assert_eq!(result.unwrap().unwrap().as_int().unwrap(), 8);
}

#[test]
fn swap_and_isub_order() {
    let (vm, _) = recording_vm();
    // iconst_1 iconst_2 swap isub ireturn -> 2 - 1
    let result = run_static(&vm, "SwapTest", "()I", code(&[0x04, 0x05, 0x5F, 0x64, 0xAC], 2, 0));
    assert_eq!(result.unwrap().unwrap().as_int().unwrap(), 1);
}

#[test]
fn dup_x1_reorders_the_stack() {
    let (vm, _) = recording_vm();
    // iconst_1 iconst_2 dup_x1 pop pop ireturn -> bottom copy of 2
    let result = run_static(
        &vm,
        "DupTest",
        "()I",
        code(&[0x04, 0x05, 0x5A, 0x57, 0x57, 0xAC], 3, 0),
    );
    assert_eq!(result.unwrap().unwrap().as_int().unwrap(), 2);
}

#[test]
fn fcmpg_and_fcmpl_disagree_only_on_nan() {
    let (vm, _) = recording_vm();
    // fconst_0 fconst_0 fdiv (NaN) fconst_0 fcmpg ireturn
    let g = run_static(
        &vm,
        "CmpG",
        "()I",
        code(&[0x0B, 0x0B, 0x6E, 0x0B, 0x96, 0xAC], 2, 0),
    );
    assert_eq!(g.unwrap().unwrap().as_int().unwrap(), 1);

    let l = run_static(
        &vm,
        "CmpL",
        "()I",
        code(&[0x0B, 0x0B, 0x6E, 0x0B, 0x95, 0xAC], 2, 0),
    );
    assert_eq!(l.unwrap().unwrap().as_int().unwrap(), -1);
}

#[test]
fn d2i_on_nan_is_zero() {
    let (vm, _) = recording_vm();
    // dconst_0 dconst_0 ddiv d2i ireturn
    let result = run_static(&vm, "NanTest", "()I", code(&[0x0E, 0x0E, 0x6F, 0x8E, 0xAC], 4, 0));
    assert_eq!(result.unwrap().unwrap().as_int().unwrap(), 0);
}

#[test]
fn i2b_truncates_and_sign_extends() {
    let (vm, _) = recording_vm();
    // sipush 200; i2b; ireturn
    let result = run_static(&vm, "I2bTest", "()I", code(&[0x11, 0x00, 0xC8, 0x91, 0xAC], 1, 0));
    assert_eq!(result.unwrap().unwrap().as_int().unwrap(), -56);
}

#[test]
fn long_shift_count_is_masked_to_six_bits() {
    let (vm, _) = recording_vm();
    // lconst_1; bipush 65; lshl; l2i; ireturn -> 1 << 1
    let result = run_static(
        &vm,
        "ShiftTest",
        "()I",
        code(&[0x0A, 0x10, 0x41, 0x79, 0x88, 0xAC], 4, 0),
    );
    assert_eq!(result.unwrap().unwrap().as_int().unwrap(), 2);
}

// ---- branches ----

#[test]
fn ifeq_branches_relative_to_the_opcode() {
    let (vm, _) = recording_vm();
    // iconst_0; ifeq +5; iconst_1; ireturn; iconst_2; ireturn
    let result = run_static(
        &vm,
        "BranchTest",
        "()I",
        code(&[0x03, 0x99, 0x00, 0x05, 0x04, 0xAC, 0x05, 0xAC], 1, 0),
    );
    assert_eq!(result.unwrap().unwrap().as_int().unwrap(), 2);
}

#[test]
fn ifnull_takes_the_branch_for_null() {
    let (vm, _) = recording_vm();
    // aconst_null; ifnull +5; iconst_1; ireturn; iconst_2; ireturn
    let result = run_static(
        &vm,
        "NullBranch",
        "()I",
        code(&[0x01, 0xC6, 0x00, 0x05, 0x04, 0xAC, 0x05, 0xAC], 1, 0),
    );
    assert_eq!(result.unwrap().unwrap().as_int().unwrap(), 2);
}

// ---- arrays ----

#[test]
fn iaload_past_the_end_raises_bounds_exception() {
    let (vm, codes) = recording_vm();
    // iconst_0; newarray int; iconst_0; iaload; ireturn
    let result = run_static(
        &vm,
        "BoundsTest",
        "()I",
        code(&[0x03, 0xBC, 0x0A, 0x03, 0x2E, 0xAC], 2, 0),
    );
    expect_uncaught(result, "java/lang/ArrayIndexOutOfBoundsException");
    assert_eq!(*codes.lock(), vec![ShutdownCode::AppException]);
}

#[test]
fn newarray_rejects_negative_sizes() {
    let (vm, _) = recording_vm();
    // iconst_m1; newarray int; areturn
    let result = run_static(
        &vm,
        "NegSize",
        "()[I",
        code(&[0x02, 0xBC, 0x0A, 0xB0], 1, 0),
    );
    expect_uncaught(result, "java/lang/NegativeArraySizeException");
}

#[test]
fn array_access_through_null_raises_npe() {
    let (vm, _) = recording_vm();
    // aconst_null; iconst_0; iaload; ireturn
    let result = run_static(&vm, "NullArray", "()I", code(&[0x01, 0x03, 0x2E, 0xAC], 2, 0));
    expect_uncaught(result, "java/lang/NullPointerException");
}

#[test]
fn typed_store_into_wrong_backing_is_an_array_store_exception() {
    let (vm, _) = recording_vm();
    // iconst_1; newarray int; dup; iconst_0; fconst_0; fastore; return
    let result = run_static(
        &vm,
        "StoreTest",
        "()V",
        code(&[0x04, 0xBC, 0x0A, 0x59, 0x03, 0x0B, 0x51, 0xB1], 3, 0),
    );
    expect_uncaught(result, "java/lang/ArrayStoreException");
}

#[test]
fn int_array_round_trip() {
    let (vm, _) = recording_vm();
    // iconst_2; newarray int; dup; iconst_0; bipush 17; iastore;
    // iconst_0; iaload; ireturn
    let result = run_static(
        &vm,
        "ArrayRoundTrip",
        "()I",
        code(
            &[0x05, 0xBC, 0x0A, 0x59, 0x03, 0x10, 0x11, 0x4F, 0x03, 0x2E, 0xAC],
            3,
            0,
        ),
    );
    assert_eq!(result.unwrap().unwrap().as_int().unwrap(), 17);
}

#[test]
fn multianewarray_truncates_after_a_zero_dimension() {
    let (vm, _) = recording_vm();
    let mut builder = ClassBuilder::new();
    let desc_idx = builder.pool().class("[[[I");
    let [hi, lo] = desc_idx.to_be_bytes();
    builder.static_method(
        "run",
        "()I",
        // bipush 2; bipush 0; bipush 3; multianewarray #desc 3;
        // arraylength; ireturn
        code(
            &[0x10, 0x02, 0x10, 0x00, 0x10, 0x03, 0xC5, hi, lo, 0x03, 0xBE, 0xAC],
            3,
            0,
        ),
    );
    vm.method_area().define("MultiTest", builder.build());
    let result = vm.call("MultiTest", "run", "()I", &[]).unwrap().unwrap();
    assert_eq!(result.as_int().unwrap(), 2);
}

// ---- constants from the pool ----

#[test]
fn ldc_of_a_string_allocates_a_java_string() {
    let (vm, _) = recording_vm();
    let mut builder = ClassBuilder::new();
    let str_idx = builder.pool().string("hi");
    builder.static_method(
        "run",
        "()Ljava/lang/String;",
        code(&[0x12, str_idx as u8, 0xB0], 1, 0),
    );
    vm.method_area().define("LdcTest", builder.build());
    let result = vm
        .call("LdcTest", "run", "()Ljava/lang/String;", &[])
        .unwrap()
        .unwrap();
    let obj = result.as_obj_ref().unwrap().unwrap();
    assert_eq!(crate::object::string_text(&obj).unwrap(), "hi");
}

// ---- statics and initialization ----

#[test]
fn constant_value_static_is_readable_after_initialization() {
    let (vm, _) = recording_vm();
    let mut builder = ClassBuilder::new();
    let cv_idx = builder.pool().int(42);
    builder.field(
        AccessFlags::PUBLIC | AccessFlags::STATIC | AccessFlags::FINAL,
        "answer",
        "I",
        Some(cv_idx),
    );
    vm.method_area().define("Config", builder.build());

    vm.ensure_initialized("Config").unwrap();
    let entry = vm.method_area().get_static("Config.answer").unwrap();
    assert_eq!(entry.desc, "I");
    assert_eq!(entry.value.as_int().unwrap(), 42);
}

#[test]
fn getstatic_reads_a_constant_value_field() {
    let (vm, _) = recording_vm();
    let mut builder = ClassBuilder::new();
    let cv_idx = builder.pool().int(42);
    let class_idx = builder.pool().class("Config2");
    let nat_idx = builder.pool().name_and_type("answer", "I");
    let field_idx = builder.pool().field_ref(class_idx, nat_idx);
    let [hi, lo] = field_idx.to_be_bytes();
    builder.field(
        AccessFlags::PUBLIC | AccessFlags::STATIC | AccessFlags::FINAL,
        "answer",
        "I",
        Some(cv_idx),
    );
    builder.static_method("run", "()I", code(&[0xB2, hi, lo, 0xAC], 1, 0));
    vm.method_area().define("Config2", builder.build());

    let result = vm.call("Config2", "run", "()I", &[]).unwrap().unwrap();
    assert_eq!(result.as_int().unwrap(), 42);
}

#[test]
fn clinit_runs_exactly_once() {
    let (vm, _) = recording_vm();
    let mut builder = ClassBuilder::new();
    let class_idx = builder.pool().class("Counter");
    let nat_idx = builder.pool().name_and_type("count", "I");
    let field_idx = builder.pool().field_ref(class_idx, nat_idx);
    let [hi, lo] = field_idx.to_be_bytes();
    builder.field(AccessFlags::PUBLIC | AccessFlags::STATIC, "count", "I", None);
    builder.static_method(
        "<clinit>",
        "()V",
        // getstatic count; iconst_1; iadd; putstatic count; return
        code(&[0xB2, hi, lo, 0x04, 0x60, 0xB3, hi, lo, 0xB1], 2, 0),
    );
    vm.method_area().define("Counter", builder.build());

    vm.ensure_initialized("Counter").unwrap();
    vm.ensure_initialized("Counter").unwrap();
    let entry = vm.method_area().get_static("Counter.count").unwrap();
    assert_eq!(entry.value.as_int().unwrap(), 1);
}

#[test]
fn statics_table_keeps_the_first_value() {
    let (vm, _) = recording_vm();
    vm.method_area().add_static(
        "X.f",
        StaticEntry {
            desc: "I".to_string(),
            value: Value::Int(1),
        },
    );
    vm.method_area().add_static(
        "X.f",
        StaticEntry {
            desc: "I".to_string(),
            value: Value::Int(2),
        },
    );
    assert_eq!(
        vm.method_area().get_static("X.f").unwrap().value.as_int().unwrap(),
        1
    );
}

// ---- invocation ----

#[test]
fn invokestatic_unpacks_arguments_in_declared_order() {
    let (vm, _) = recording_vm();

    let mut callee = ClassBuilder::new();
    // iload_0; iload_1; isub; ireturn
    callee.static_method("sub", "(II)I", code(&[0x1A, 0x1B, 0x64, 0xAC], 2, 2));
    vm.method_area().define("Callee", callee.build());

    let mut caller = ClassBuilder::new();
    let class_idx = caller.pool().class("Callee");
    let nat_idx = caller.pool().name_and_type("sub", "(II)I");
    let method_idx = caller.pool().method_ref(class_idx, nat_idx);
    let [hi, lo] = method_idx.to_be_bytes();
    // bipush 9; bipush 3; invokestatic Callee.sub; ireturn -> 9 - 3
    caller.static_method(
        "run",
        "()I",
        code(&[0x10, 0x09, 0x10, 0x03, 0xB8, hi, lo, 0xAC], 2, 0),
    );
    vm.method_area().define("Caller", caller.build());

    let result = vm.call("Caller", "run", "()I", &[]).unwrap().unwrap();
    assert_eq!(result.as_int().unwrap(), 6);
}

#[test]
fn invokestatic_passes_wide_arguments() {
    let (vm, _) = recording_vm();

    let mut callee = ClassBuilder::new();
    // lload_0; l2i; ireturn
    callee.static_method("low", "(J)I", code(&[0x1E, 0x88, 0xAC], 2, 2));
    vm.method_area().define("WideCallee", callee.build());

    let mut caller = ClassBuilder::new();
    let class_idx = caller.pool().class("WideCallee");
    let nat_idx = caller.pool().name_and_type("low", "(J)I");
    let method_idx = caller.pool().method_ref(class_idx, nat_idx);
    let [hi, lo] = method_idx.to_be_bytes();
    // lconst_1; invokestatic WideCallee.low; ireturn
    caller.static_method("run", "()I", code(&[0x0A, 0xB8, hi, lo, 0xAC], 2, 0));
    vm.method_area().define("WideCaller", caller.build());

    let result = vm.call("WideCaller", "run", "()I", &[]).unwrap().unwrap();
    assert_eq!(result.as_int().unwrap(), 1);
}

#[test]
fn invokevirtual_dispatches_on_the_runtime_type() {
    let (vm, _) = recording_vm();

    let mut base = ClassBuilder::new();
    base.method(AccessFlags::PUBLIC, "speak", "()I", code(&[0x04, 0xAC], 1, 1));
    vm.method_area().define("Base", base.build());

    let mut derived = ClassBuilder::new();
    derived.superclass("Base");
    derived.method(AccessFlags::PUBLIC, "speak", "()I", code(&[0x05, 0xAC], 1, 1));
    vm.method_area().define("Derived", derived.build());

    let mut caller = ClassBuilder::new();
    let class_idx = caller.pool().class("Base");
    let nat_idx = caller.pool().name_and_type("speak", "()I");
    let method_idx = caller.pool().method_ref(class_idx, nat_idx);
    let [hi, lo] = method_idx.to_be_bytes();
    // aload_0; invokevirtual Base.speak; ireturn
    caller.static_method("dispatch", "(LBase;)I", code(&[0x2A, 0xB6, hi, lo, 0xAC], 2, 1));
    vm.method_area().define("Dispatcher", caller.build());

    let derived_obj = vm.instantiate("Derived").unwrap();
    let result = vm
        .call("Dispatcher", "dispatch", "(LBase;)I", &[Value::Ref(Some(derived_obj))])
        .unwrap()
        .unwrap();
    assert_eq!(result.as_int().unwrap(), 2);

    let base_obj = vm.instantiate("Base").unwrap();
    let result = vm
        .call("Dispatcher", "dispatch", "(LBase;)I", &[Value::Ref(Some(base_obj))])
        .unwrap()
        .unwrap();
    assert_eq!(result.as_int().unwrap(), 1);
}

#[test]
fn invoking_on_a_null_receiver_raises_npe() {
    let (vm, _) = recording_vm();
    let mut caller = ClassBuilder::new();
    let class_idx = caller.pool().class("Base");
    let nat_idx = caller.pool().name_and_type("speak", "()I");
    let method_idx = caller.pool().method_ref(class_idx, nat_idx);
    let [hi, lo] = method_idx.to_be_bytes();
    // aconst_null; invokevirtual Base.speak; ireturn
    caller.static_method("run", "()I", code(&[0x01, 0xB6, hi, lo, 0xAC], 2, 0));
    vm.method_area().define("NullCaller", caller.build());

    let result = vm.call("NullCaller", "run", "()I", &[]);
    expect_uncaught(result, "java/lang/NullPointerException");
}

#[test]
fn registered_native_handles_the_call_and_pushes_its_result() {
    let (vm, _) = recording_vm();
    vm.natives()
        .register("Util.seven()I", |_: &mut Frame, _: &[Value]| {
            (Some(Value::Int(7)), 1)
        });

    let mut caller = ClassBuilder::new();
    let class_idx = caller.pool().class("Util");
    let nat_idx = caller.pool().name_and_type("seven", "()I");
    let method_idx = caller.pool().method_ref(class_idx, nat_idx);
    let [hi, lo] = method_idx.to_be_bytes();
    caller.static_method("run", "()I", code(&[0xB8, hi, lo, 0xAC], 1, 0));
    vm.method_area().define("NativeCaller", caller.build());

    let result = vm.call("NativeCaller", "run", "()I", &[]).unwrap().unwrap();
    assert_eq!(result.as_int().unwrap(), 7);
}

// ---- objects and fields ----

#[test]
fn new_putfield_getfield_round_trip() {
    let (vm, _) = recording_vm();
    let mut builder = ClassBuilder::new();
    let point_idx = builder.pool().class("PointHolder");
    let nat_idx = builder.pool().name_and_type("x", "I");
    let field_idx = builder.pool().field_ref(point_idx, nat_idx);
    let [phi, plo] = point_idx.to_be_bytes();
    let [fhi, flo] = field_idx.to_be_bytes();
    builder.field(AccessFlags::PUBLIC, "x", "I", None);
    builder.field(AccessFlags::PUBLIC, "y", "I", None);
    builder.static_method(
        "run",
        "()I",
        // new PointHolder; dup; bipush 11; putfield x; getfield x; ireturn
        code(
            &[0xBB, phi, plo, 0x59, 0x10, 0x0B, 0xB5, fhi, flo, 0xB4, fhi, flo, 0xAC],
            3,
            0,
        ),
    );
    vm.method_area().define("PointHolder", builder.build());

    let result = vm.call("PointHolder", "run", "()I", &[]).unwrap().unwrap();
    assert_eq!(result.as_int().unwrap(), 11);
}

#[test]
fn instantiate_uses_named_fields_when_a_superclass_contributes() {
    let (vm, _) = recording_vm();

    let mut base = ClassBuilder::new();
    base.field(AccessFlags::PUBLIC, "a", "I", None);
    vm.method_area().define("FieldBase", base.build());

    let mut derived = ClassBuilder::new();
    derived.superclass("FieldBase");
    derived.field(AccessFlags::PUBLIC, "b", "J", None);
    vm.method_area().define("FieldDerived", derived.build());

    let obj = vm.instantiate("FieldDerived").unwrap();
    let guard = obj.read();
    match guard.fields() {
        Some(FieldStorage::Named(map)) => {
            assert_eq!(map.len(), 2);
            assert_eq!(map.get("a").unwrap().desc, "I");
            assert_eq!(map.get("b").unwrap().desc, "J");
        }
        other => panic!("expected named fields, got {other:?}"),
    }

    let simple = vm.instantiate("FieldBase").unwrap();
    let guard = simple.read();
    assert!(matches!(guard.fields(), Some(FieldStorage::Indexed(v)) if v.len() == 1));
}

#[test]
fn instantiate_builds_array_objects_for_array_class_names() {
    let (vm, _) = recording_vm();
    let arr = vm.instantiate("[I").unwrap();
    let guard = arr.read();
    match &guard.body {
        ObjectBody::Array {
            desc,
            backing: ArrayBacking::Ints(v),
        } => {
            assert_eq!(desc, "[I");
            assert!(v.is_empty());
        }
        other => panic!("expected int array, got {other:?}"),
    }
}

// ---- exception tables ----

fn catch_class(catch_type: u16) -> Vec<ExceptionTableEntry> {
    vec![ExceptionTableEntry {
        start_pc: 0,
        end_pc: 4,
        handler_pc: 4,
        catch_type,
    }]
}

/// iconst_1 iconst_0 idiv ireturn | pop bipush 9 ireturn
const DIV_WITH_HANDLER: [u8; 8] = [0x04, 0x03, 0x6C, 0xAC, 0x57, 0x10, 0x09, 0xAC];

#[test]
fn exception_table_catches_and_transfers_control() {
    let (vm, codes) = recording_vm();
    let mut builder = ClassBuilder::new();
    let mut body = code(&DIV_WITH_HANDLER, 2, 0);
    body.exception_table = catch_class(0); // catch anything
    builder.static_method("run", "()I", body);
    vm.method_area().define("CatchAll", builder.build());

    let result = vm.call("CatchAll", "run", "()I", &[]).unwrap().unwrap();
    assert_eq!(result.as_int().unwrap(), 9);
    assert!(codes.lock().is_empty());
}

#[test]
fn typed_handler_catches_a_matching_exception() {
    let (vm, _) = recording_vm();
    let mut builder = ClassBuilder::new();
    let catch_idx = builder.pool().class("java/lang/ArithmeticException");
    let mut body = code(&DIV_WITH_HANDLER, 2, 0);
    body.exception_table = catch_class(catch_idx);
    builder.static_method("run", "()I", body);
    vm.method_area().define("CatchTyped", builder.build());

    let result = vm.call("CatchTyped", "run", "()I", &[]).unwrap().unwrap();
    assert_eq!(result.as_int().unwrap(), 9);
}

#[test]
fn non_matching_handler_lets_the_exception_escape() {
    let (vm, codes) = recording_vm();
    let mut builder = ClassBuilder::new();
    let catch_idx = builder.pool().class("java/io/IOException");
    let mut body = code(&DIV_WITH_HANDLER, 2, 0);
    body.exception_table = catch_class(catch_idx);
    builder.static_method("run", "()I", body);
    vm.method_area().define("CatchMiss", builder.build());

    let result = vm.call("CatchMiss", "run", "()I", &[]);
    expect_uncaught(result, "java/lang/ArithmeticException");
    assert_eq!(*codes.lock(), vec![ShutdownCode::AppException]);
}

#[test]
fn callee_exception_is_caught_in_the_caller() {
    let (vm, _) = recording_vm();

    let mut callee = ClassBuilder::new();
    // iconst_1; iconst_0; idiv; ireturn
    callee.static_method("boom", "()I", code(&[0x04, 0x03, 0x6C, 0xAC], 2, 0));
    vm.method_area().define("Boom", callee.build());

    let mut caller = ClassBuilder::new();
    let class_idx = caller.pool().class("Boom");
    let nat_idx = caller.pool().name_and_type("boom", "()I");
    let method_idx = caller.pool().method_ref(class_idx, nat_idx);
    let [hi, lo] = method_idx.to_be_bytes();
    // invokestatic Boom.boom; ireturn | pop; bipush 31; ireturn
    let mut body = code(&[0xB8, hi, lo, 0xAC, 0x57, 0x10, 0x1F, 0xAC], 2, 0);
    body.exception_table = catch_class(0);
    caller.static_method("run", "()I", body);
    vm.method_area().define("CallerCatches", caller.build());

    let result = vm.call("CallerCatches", "run", "()I", &[]).unwrap().unwrap();
    assert_eq!(result.as_int().unwrap(), 31);
}

// ---- fatal interpreter errors ----

#[test]
fn unknown_opcode_is_a_fatal_interpreter_error() {
    let (vm, _) = recording_vm();
    // invokedynamic is not implemented
    let result = run_static(&vm, "BadOp", "()V", code(&[0xBA, 0x00, 0x00, 0x00, 0x00], 1, 0));
    match result {
        Err(VmError::Interpreter(crate::InterpreterError::InvalidBytecode {
            opcode, ..
        })) => assert_eq!(opcode, 0xBA),
        other => panic!("expected invalid bytecode, got {other:?}"),
    }
}

#[test]
fn truncated_method_body_is_detected() {
    let (vm, _) = recording_vm();
    // bipush with its operand cut off
    let result = run_static(&vm, "Truncated", "()V", code(&[0x10], 1, 0));
    assert!(matches!(
        result,
        Err(VmError::Interpreter(crate::InterpreterError::TruncatedMethod(_)))
    ));
}

#[test]
fn pop_from_an_empty_stack_is_fatal() {
    let (vm, _) = recording_vm();
    let result = run_static(&vm, "Underflow", "()V", code(&[0x57, 0xB1], 1, 0));
    assert!(matches!(
        result,
        Err(VmError::Interpreter(crate::InterpreterError::StackUnderflow))
    ));
}
