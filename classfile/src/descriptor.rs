use crate::ClassFormatError;

/// A parsed field descriptor (JVMS 4.3.2).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FieldType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
    Object(String),
    Array { elem: Box<FieldType>, dims: u8 },
}

impl FieldType {
    /// Parses one field type off the front of `s`, returning the type and
    /// how many characters it consumed.
    pub fn parse(s: &str) -> Result<(FieldType, usize), ClassFormatError> {
        let first = s
            .chars()
            .next()
            .ok_or_else(|| ClassFormatError::MalformedDescriptor(s.to_string()))?;
        Ok(match first {
            'B' => (FieldType::Byte, 1),
            'C' => (FieldType::Char, 1),
            'D' => (FieldType::Double, 1),
            'F' => (FieldType::Float, 1),
            'I' => (FieldType::Int, 1),
            'J' => (FieldType::Long, 1),
            'S' => (FieldType::Short, 1),
            'Z' => (FieldType::Boolean, 1),
            'L' => {
                let end = s
                    .find(';')
                    .ok_or_else(|| ClassFormatError::MalformedDescriptor(s.to_string()))?;
                (FieldType::Object(s[1..end].to_string()), end + 1)
            }
            '[' => {
                let dims = s.bytes().take_while(|&b| b == b'[').count();
                if dims > u8::MAX as usize || dims >= s.len() {
                    return Err(ClassFormatError::MalformedDescriptor(s.to_string()));
                }
                let (elem, used) = FieldType::parse(&s[dims..])?;
                (
                    FieldType::Array {
                        elem: Box::new(elem),
                        dims: dims as u8,
                    },
                    dims + used,
                )
            }
            _ => return Err(ClassFormatError::MalformedDescriptor(s.to_string())),
        })
    }

    /// Operand-stack slots the type occupies: two for long/double, one for
    /// everything else. Arrays are references and take one slot regardless
    /// of dimensions.
    pub fn slot_width(&self) -> u8 {
        match self {
            FieldType::Long | FieldType::Double => 2,
            _ => 1,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, FieldType::Object(_) | FieldType::Array { .. })
    }
}

/// A parsed method descriptor: parameter types plus return type
/// (`None` = void).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub params: Vec<FieldType>,
    pub ret: Option<FieldType>,
    pub text: String,
}

impl TryFrom<&str> for MethodDescriptor {
    type Error = ClassFormatError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let malformed = || ClassFormatError::MalformedDescriptor(value.to_string());
        if !value.starts_with('(') {
            return Err(malformed());
        }
        let params_end = value.find(')').ok_or_else(malformed)?;

        let mut params = Vec::new();
        let mut idx = 1;
        while idx < params_end {
            let (param, used) = FieldType::parse(&value[idx..params_end])
                .map_err(|_| malformed())?;
            params.push(param);
            idx += used;
        }

        let ret_str = &value[params_end + 1..];
        let ret = if ret_str == "V" {
            None
        } else {
            let (ret, used) = FieldType::parse(ret_str)?;
            if used != ret_str.len() {
                return Err(malformed());
            }
            Some(ret)
        };

        Ok(Self {
            params,
            ret,
            text: value.to_string(),
        })
    }
}
