//! Typed values of uv variables and header items.

use std::{borrow::Cow, fmt::Display};

use num_complex::Complex32;

use crate::io::{
    error::IOError,
    item::{Item, ItemType},
};

/// The element type of a uv variable, as recorded in the `vartable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarType {
    /// `a`: text
    Text,
    /// `j`: 16-bit integers
    Int16,
    /// `i`: 32-bit integers
    Int32,
    /// `l`: 64-bit integers
    Int64,
    /// `r`: 32-bit floats
    Float32,
    /// `d`: 64-bit floats
    Float64,
    /// `c`: complex pairs of 32-bit floats
    Complex64,
}

impl VarType {
    /// The single character type code used in the `vartable`.
    pub const fn code(self) -> char {
        match self {
            Self::Text => 'a',
            Self::Int16 => 'j',
            Self::Int32 => 'i',
            Self::Int64 => 'l',
            Self::Float32 => 'r',
            Self::Float64 => 'd',
            Self::Complex64 => 'c',
        }
    }

    /// Inverse of [`VarType::code`].
    pub const fn from_code(code: char) -> Option<Self> {
        match code {
            'a' => Some(Self::Text),
            'j' => Some(Self::Int16),
            'i' => Some(Self::Int32),
            'l' => Some(Self::Int64),
            'r' => Some(Self::Float32),
            'd' => Some(Self::Float64),
            'c' => Some(Self::Complex64),
            _ => None,
        }
    }

    /// Size in bytes of one element on disk.
    pub const fn element_size(self) -> usize {
        self.item_type().element_size()
    }

    /// The item type used to store a header array of this type.
    pub const fn item_type(self) -> ItemType {
        match self {
            Self::Text => ItemType::Character,
            Self::Int16 => ItemType::Int16,
            Self::Int32 => ItemType::Int32,
            Self::Int64 => ItemType::Int64,
            Self::Float32 => ItemType::Float32,
            Self::Float64 => ItemType::Float64,
            Self::Complex64 => ItemType::Complex64,
        }
    }

    /// The variable type corresponding to a header item type, if any.
    pub const fn from_item_type(item_type: ItemType) -> Option<Self> {
        match item_type {
            ItemType::Character | ItemType::Text => Some(Self::Text),
            ItemType::Int16 => Some(Self::Int16),
            ItemType::Int32 => Some(Self::Int32),
            ItemType::Int64 => Some(Self::Int64),
            ItemType::Float32 => Some(Self::Float32),
            ItemType::Float64 => Some(Self::Float64),
            ItemType::Complex64 => Some(Self::Complex64),
            ItemType::Binary => None,
        }
    }
}

impl Display for VarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The value of a uv variable or header array.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Text; one byte per element, kept undecoded
    Text(Vec<u8>),
    /// 16-bit integers
    I16(Vec<i16>),
    /// 32-bit integers
    I32(Vec<i32>),
    /// 64-bit integers
    I64(Vec<i64>),
    /// 32-bit floats
    F32(Vec<f32>),
    /// 64-bit floats
    F64(Vec<f64>),
    /// complex values
    C64(Vec<Complex32>),
}

impl Value {
    /// The type of this value.
    pub fn var_type(&self) -> VarType {
        match self {
            Self::Text(_) => VarType::Text,
            Self::I16(_) => VarType::Int16,
            Self::I32(_) => VarType::Int32,
            Self::I64(_) => VarType::Int64,
            Self::F32(_) => VarType::Float32,
            Self::F64(_) => VarType::Float64,
            Self::C64(_) => VarType::Complex64,
        }
    }

    /// Number of elements (bytes, for text).
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::I16(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
            Self::C64(v) => v.len(),
        }
    }

    /// Whether the value has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the value on disk, in bytes.
    pub fn byte_len(&self) -> usize {
        self.len() * self.var_type().element_size()
    }

    /// The first element as a float, for any numeric type. Complex values
    /// give their real part.
    pub fn first_f64(&self) -> Option<f64> {
        match self {
            Self::Text(_) => None,
            Self::I16(v) => v.first().map(|&x| f64::from(x)),
            Self::I32(v) => v.first().map(|&x| f64::from(x)),
            Self::I64(v) => v.first().map(|&x| x as f64),
            Self::F32(v) => v.first().map(|&x| f64::from(x)),
            Self::F64(v) => v.first().copied(),
            Self::C64(v) => v.first().map(|x| f64::from(x.re)),
        }
    }

    /// The first element as an integer, for integer types only.
    pub fn first_i64(&self) -> Option<i64> {
        match self {
            Self::I16(v) => v.first().map(|&x| i64::from(x)),
            Self::I32(v) => v.first().map(|&x| i64::from(x)),
            Self::I64(v) => v.first().copied(),
            _ => None,
        }
    }

    /// All elements converted to floats, for real numeric types.
    pub fn to_f64s(&self) -> Option<Vec<f64>> {
        match self {
            Self::I16(v) => Some(v.iter().map(|&x| f64::from(x)).collect()),
            Self::I32(v) => Some(v.iter().map(|&x| f64::from(x)).collect()),
            Self::I64(v) => Some(v.iter().map(|&x| x as f64).collect()),
            Self::F32(v) => Some(v.iter().map(|&x| f64::from(x)).collect()),
            Self::F64(v) => Some(v.clone()),
            Self::Text(_) | Self::C64(_) => None,
        }
    }

    /// All elements converted to integers, for integer types only.
    pub fn to_i64s(&self) -> Option<Vec<i64>> {
        match self {
            Self::I16(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            Self::I32(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            Self::I64(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Whether `other` holds exactly the same elements. Floats compare by
    /// bit pattern, so a NaN equals itself.
    pub fn same_bits(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::F32(a), Self::F32(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Self::F64(a), Self::F64(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Self::C64(a), Self::C64(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| {
                        x.re.to_bits() == y.re.to_bits() && x.im.to_bits() == y.im.to_bits()
                    })
            }
            _ => self == other,
        }
    }

    /// The raw bytes of a text value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Text(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// A text value decoded for display. Bytes that are not UTF-8 are
    /// replaced; use [`Value::as_bytes`] to copy text faithfully.
    pub fn to_text(&self) -> Option<Cow<'_, str>> {
        self.as_bytes().map(String::from_utf8_lossy)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s.into_bytes())
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Self::Text(bytes.to_vec())
    }
}

macro_rules! impl_value_from {
    ($variant:ident, $t:ty) => {
        impl From<$t> for Value {
            fn from(x: $t) -> Self {
                Self::$variant(vec![x])
            }
        }

        impl From<Vec<$t>> for Value {
            fn from(v: Vec<$t>) -> Self {
                Self::$variant(v)
            }
        }

        impl From<&[$t]> for Value {
            fn from(v: &[$t]) -> Self {
                Self::$variant(v.to_vec())
            }
        }
    };
}

impl_value_from!(I16, i16);
impl_value_from!(I32, i32);
impl_value_from!(I64, i64);
impl_value_from!(F32, f32);
impl_value_from!(F64, f64);
impl_value_from!(C64, Complex32);

/// Read `n_bytes` worth of `var_type` elements at `offset` in `item`.
pub fn read_value(
    item: &mut Item,
    offset: u64,
    var_type: VarType,
    n_bytes: usize,
) -> Result<Value, IOError> {
    let n = n_bytes / var_type.element_size();
    Ok(match var_type {
        VarType::Text => {
            let mut bytes = vec![0; n];
            item.read_bytes(offset, &mut bytes)?;
            Value::Text(bytes)
        }
        VarType::Int16 => {
            let mut v = vec![0; n];
            item.read_i16s(offset, &mut v)?;
            Value::I16(v)
        }
        VarType::Int32 => {
            let mut v = vec![0; n];
            item.read_i32s(offset, &mut v)?;
            Value::I32(v)
        }
        VarType::Int64 => {
            let mut v = vec![0; n];
            item.read_i64s(offset, &mut v)?;
            Value::I64(v)
        }
        VarType::Float32 => {
            let mut v = vec![0.0; n];
            item.read_f32s(offset, &mut v)?;
            Value::F32(v)
        }
        VarType::Float64 => {
            let mut v = vec![0.0; n];
            item.read_f64s(offset, &mut v)?;
            Value::F64(v)
        }
        VarType::Complex64 => {
            let mut v = vec![Complex32::default(); n];
            item.read_c64s(offset, &mut v)?;
            Value::C64(v)
        }
    })
}

/// Write `value` at `offset` in `item`.
pub fn write_value(item: &mut Item, offset: u64, value: &Value) -> Result<(), IOError> {
    match value {
        Value::Text(bytes) => item.write_bytes(offset, bytes),
        Value::I16(v) => item.write_i16s(offset, v),
        Value::I32(v) => item.write_i32s(offset, v),
        Value::I64(v) => item.write_i64s(offset, v),
        Value::F32(v) => item.write_f32s(offset, v),
        Value::F64(v) => item.write_f64s(offset, v),
        Value::C64(v) => item.write_c64s(offset, v),
    }
}

/// Book-keeping for one variable of a uv stream.
#[derive(Debug, Clone)]
pub(crate) struct Variable {
    pub(crate) name: String,
    pub(crate) var_type: VarType,
    pub(crate) value: Option<Value>,
    /// Byte length announced by the last size entry read or written.
    pub(crate) stream_len: Option<usize>,
    /// Generation of the record in which the value last changed.
    pub(crate) updated_gen: u64,
    /// Staged for the next record written.
    pub(crate) pending: bool,
}

impl Variable {
    pub(crate) fn new(name: &str, var_type: VarType) -> Self {
        Self {
            name: name.to_string(),
            var_type,
            value: None,
            stream_len: None,
            updated_gen: 0,
            pending: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::item::ItemMode;

    #[test]
    fn test_codes() {
        for code in ['a', 'j', 'i', 'l', 'r', 'd', 'c'] {
            assert_eq!(VarType::from_code(code).unwrap().code(), code);
        }
        assert_eq!(VarType::from_code('x'), None);
        assert_eq!(VarType::Int16.element_size(), 2);
        assert_eq!(VarType::Complex64.element_size(), 8);
    }

    #[test]
    fn test_value_conversions() {
        let v = Value::from(vec![3_i16, 4]);
        assert_eq!(v.byte_len(), 4);
        assert_eq!(v.first_i64(), Some(3));
        assert_eq!(v.to_f64s(), Some(vec![3.0, 4.0]));
        assert_eq!(Value::from(2.5_f32).first_i64(), None);
        assert_eq!(Value::from(2.5_f32).first_f64(), Some(2.5));
        assert_eq!(Value::from("abc").first_f64(), None);
        assert_eq!(Value::from("abc").byte_len(), 3);
    }

    #[test]
    fn test_int16_value_through_item() {
        let mut item = Item::in_memory("ds", "x", ItemMode::Write, vec![]);
        let value = Value::I16(vec![-7, 300, i16::MIN]);
        write_value(&mut item, 0, &value).unwrap();
        assert_eq!(item.size(), 6);
        assert_eq!(read_value(&mut item, 0, VarType::Int16, 6).unwrap(), value);
    }

    #[test]
    fn test_text_value_keeps_raw_bytes() {
        let mut item = Item::in_memory("ds", "x", ItemMode::Write, vec![]);
        let value = Value::from(&b"caf\xe9"[..]);
        write_value(&mut item, 0, &value).unwrap();
        let read = read_value(&mut item, 0, VarType::Text, 4).unwrap();
        assert_eq!(read.as_bytes(), Some(&b"caf\xe9"[..]));
        assert_eq!(read.to_text().unwrap(), "caf\u{fffd}");
        assert_eq!(Value::from("abc").to_text().unwrap(), "abc");
    }

    #[test]
    fn test_same_bits_treats_nan_as_unchanged() {
        let nan = Value::from(f64::NAN);
        assert_ne!(nan, nan.clone());
        assert!(nan.same_bits(&nan.clone()));
        assert!(Value::from(vec![1.0_f32, f32::NAN]).same_bits(&Value::from(vec![1.0_f32, f32::NAN])));
        assert!(!Value::from(0.0_f64).same_bits(&Value::from(-0.0_f64)));
        assert!(!Value::from(1_i32).same_bits(&Value::from(1_i64)));
        assert!(Value::from("x").same_bits(&Value::from("x")));
    }
}
