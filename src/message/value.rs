//! Typed message values.
//!
//! Each basic type carries its one-character bus type tag; arrays are
//! `a` followed by the element tag. An empty array still records its element
//! type, so it is distinguishable from an absent field.

use core::fmt;

/// A single message body value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `y`
    Byte(u8),
    /// `b`
    Bool(bool),
    /// `n`
    Int16(i16),
    /// `q`
    UInt16(u16),
    /// `i`
    Int32(i32),
    /// `u`
    UInt32(u32),
    /// `x`
    Int64(i64),
    /// `t`
    UInt64(u64),
    /// `d`
    Double(f64),
    /// `s`
    String(String),
    /// `a` + element tag.
    Array {
        /// Tag of every element.
        element: char,
        /// The elements, all of type `element`.
        items: Vec<Value>,
    },
}

impl Value {
    /// The leading type tag of this value (`a` for arrays).
    #[must_use]
    pub const fn type_tag(&self) -> char {
        match self {
            Self::Byte(_) => u8::TAG,
            Self::Bool(_) => bool::TAG,
            Self::Int16(_) => i16::TAG,
            Self::UInt16(_) => u16::TAG,
            Self::Int32(_) => i32::TAG,
            Self::UInt32(_) => u32::TAG,
            Self::Int64(_) => i64::TAG,
            Self::UInt64(_) => u64::TAG,
            Self::Double(_) => f64::TAG,
            Self::String(_) => String::TAG,
            Self::Array { .. } => 'a',
        }
    }

    /// Full signature of this value, e.g. `i` or `ai`.
    #[must_use]
    pub fn signature(&self) -> String {
        match self {
            Self::Array { element, .. } => format!("a{element}"),
            other => other.type_tag().to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Byte(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::UInt16(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::UInt32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Array { items, .. } => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// A basic (non-container) type that can be appended to and read from a message.
pub trait BasicType: Sized {
    /// The one-character type tag.
    const TAG: char;

    /// Wraps the value.
    fn into_value(self) -> Value;

    /// Extracts the value if `value` has this type.
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! basic_type {
    ($ty:ty, $tag:literal, $variant:ident) => {
        impl BasicType for $ty {
            const TAG: char = $tag;

            fn into_value(self) -> Value {
                Value::$variant(self)
            }

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        }
    };
}

basic_type!(u8, 'y', Byte);
basic_type!(bool, 'b', Bool);
basic_type!(i16, 'n', Int16);
basic_type!(u16, 'q', UInt16);
basic_type!(i32, 'i', Int32);
basic_type!(u32, 'u', UInt32);
basic_type!(i64, 'x', Int64);
basic_type!(u64, 't', UInt64);
basic_type!(f64, 'd', Double);
basic_type!(String, 's', String);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

/// Builds a typed array value from a contiguous slice.
pub fn array_of<T: BasicType + Clone>(items: &[T]) -> Value {
    Value::Array {
        element: T::TAG,
        items: items.iter().cloned().map(BasicType::into_value).collect(),
    }
}
