//! Registration and dispatch for host-implemented methods. The core only
//! defines the table and the calling convention; the host decides what to
//! put in it.

use crate::thread::Frame;
use crate::value::Value;
use parking_lot::RwLock;
use std::collections::HashMap;

/// A native handler receives the calling frame and the already-unpacked
/// argument list (receiver first for instance methods) and returns an
/// optional result plus the slot count it occupies (1, or 2 for
/// long/double).
pub type NativeFn = fn(&mut Frame, &[Value]) -> (Option<Value>, u8);

pub struct NativeRegistry {
    table: RwLock<HashMap<String, NativeFn>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Keys have the shape `<class>.<method><descriptor>`, e.g.
    /// `java/io/PrintStream.println(Ljava/lang/String;)V`.
    pub fn register(&self, key: impl Into<String>, handler: NativeFn) {
        let key = key.into();
        log::trace!("registering native method {key}");
        self.table.write().insert(key, handler);
    }

    pub fn lookup(&self, class_name: &str, method_name: &str, descriptor: &str) -> Option<NativeFn> {
        let key = format!("{class_name}.{method_name}{descriptor}");
        self.table.read().get(&key).copied()
    }
}

impl Default for NativeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
