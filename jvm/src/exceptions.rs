//! Java-level exceptions the interpreter can raise on its own, and the
//! throwable record that travels up the frame stack while a handler is
//! searched for.

use crate::value::ObjRef;

/// The runtime exceptions opcodes raise directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JavaExceptionKind {
    NullPointer,
    ArrayIndexOutOfBounds,
    NegativeArraySize,
    Arithmetic,
    ArrayStore,
    InaccessibleObject,
}

impl JavaExceptionKind {
    pub fn class_name(self) -> &'static str {
        match self {
            JavaExceptionKind::NullPointer => "java/lang/NullPointerException",
            JavaExceptionKind::ArrayIndexOutOfBounds => {
                "java/lang/ArrayIndexOutOfBoundsException"
            }
            JavaExceptionKind::NegativeArraySize => "java/lang/NegativeArraySizeException",
            JavaExceptionKind::Arithmetic => "java/lang/ArithmeticException",
            JavaExceptionKind::ArrayStore => "java/lang/ArrayStoreException",
            JavaExceptionKind::InaccessibleObject => {
                "java/lang/reflect/InaccessibleObjectException"
            }
        }
    }
}

/// An in-flight exception: the class being thrown, the detail message, and
/// the throwable object itself (which `athrow` supplies and the built-in
/// raises allocate best-effort).
#[derive(Clone, Debug)]
pub struct JavaThrowable {
    pub class_name: String,
    pub message: String,
    pub object: ObjRef,
}

impl JavaThrowable {
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
            object: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_binary_class_names() {
        assert_eq!(
            JavaExceptionKind::Arithmetic.class_name(),
            "java/lang/ArithmeticException"
        );
        assert_eq!(
            JavaExceptionKind::ArrayIndexOutOfBounds.class_name(),
            "java/lang/ArrayIndexOutOfBoundsException"
        );
    }
}
