//! The `rook` launcher: wires a directory-backed class source and a small
//! set of console natives into the VM core, then runs a main class.

use rook_jvm::method_area::StaticEntry;
use rook_jvm::object::{self, FieldStorage, ObjectBody};
use rook_jvm::thread::Frame;
use rook_jvm::value::Value;
use rook_jvm::{ClassBytesSource, VirtualMachine};
use std::path::PathBuf;
use std::process::ExitCode;

/// Resolves binary class names against a classpath directory:
/// `java/lang/Object` -> `<root>/java/lang/Object.class`.
struct DirSource {
    root: PathBuf,
}

impl ClassBytesSource for DirSource {
    fn fetch(&self, binary_name: &str) -> Option<Vec<u8>> {
        let mut path = self.root.clone();
        for part in binary_name.split('/') {
            path.push(part);
        }
        path.set_extension("class");
        std::fs::read(&path).ok()
    }
}

fn println_string(_frame: &mut Frame, args: &[Value]) -> (Option<Value>, u8) {
    match args.get(1) {
        Some(Value::Ref(Some(obj))) => {
            println!("{}", object::string_text(obj).unwrap_or_default())
        }
        _ => println!("null"),
    }
    (None, 1)
}

fn println_int(_frame: &mut Frame, args: &[Value]) -> (Option<Value>, u8) {
    match args.get(1) {
        Some(Value::Int(v)) => println!("{v}"),
        _ => println!("null"),
    }
    (None, 1)
}

fn println_float(_frame: &mut Frame, args: &[Value]) -> (Option<Value>, u8) {
    match args.get(1) {
        Some(Value::Float(v)) => println!("{v}"),
        _ => println!("null"),
    }
    (None, 1)
}

fn println_empty(_frame: &mut Frame, _args: &[Value]) -> (Option<Value>, u8) {
    println!();
    (None, 1)
}

fn register_console_natives(vm: &VirtualMachine) {
    let natives = vm.natives();
    natives.register(
        "java/io/PrintStream.println(Ljava/lang/String;)V",
        println_string,
    );
    natives.register("java/io/PrintStream.println(I)V", println_int);
    natives.register("java/io/PrintStream.println(J)V", println_int);
    natives.register("java/io/PrintStream.println(Z)V", println_int);
    natives.register("java/io/PrintStream.println(D)V", println_float);
    natives.register("java/io/PrintStream.println(F)V", println_float);
    natives.register("java/io/PrintStream.println()V", println_empty);
    natives.register("java/lang/System.registerNatives()V", |_: &mut Frame, _: &[Value]| {
        (None, 1)
    });

    // a stand-in System.out so `getstatic System.out / invokevirtual
    // println` works without a class library on the classpath
    let stdout = object::allocate(
        "java/io/PrintStream",
        ObjectBody::Fields(FieldStorage::Indexed(Vec::new())),
    );
    vm.method_area().add_static(
        "java/lang/System.out",
        StaticEntry {
            desc: "Ljava/io/PrintStream;".to_string(),
            value: Value::Ref(Some(stdout)),
        },
    );
}

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let class_name = match args.next() {
        Some(name) => name.replace('.', "/"),
        None => {
            eprintln!("usage: rook <main-class> [classpath-dir]");
            return ExitCode::from(2);
        }
    };
    let classpath = args.next().unwrap_or_else(|| ".".to_string());

    let vm = VirtualMachine::new(Box::new(DirSource {
        root: PathBuf::from(classpath),
    }));
    register_console_natives(&vm);

    match vm.start(&class_name) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            eprintln!("rook: {err}");
            ExitCode::FAILURE
        }
    }
}
