//! Typed entry values.
//!
//! A [`Value`] is an immutable, type-tagged payload. Once an entry is
//! created its value type is fixed; writes with a different type are
//! rejected without mutating the entry.

use bytes::Bytes;

/// Value type discriminant.
///
/// The numeric values double as wire type tags and as bits in a
/// [`TypeMask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryType {
    Boolean = 0x01,
    Double = 0x02,
    String = 0x04,
    Raw = 0x08,
    BooleanArray = 0x10,
    DoubleArray = 0x20,
    StringArray = 0x40,
    RpcDefinition = 0x80,
}

impl EntryType {
    /// Decode a wire type tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Boolean),
            0x02 => Some(Self::Double),
            0x04 => Some(Self::String),
            0x08 => Some(Self::Raw),
            0x10 => Some(Self::BooleanArray),
            0x20 => Some(Self::DoubleArray),
            0x40 => Some(Self::StringArray),
            0x80 => Some(Self::RpcDefinition),
            _ => None,
        }
    }

    /// The bit this type occupies in a [`TypeMask`].
    pub fn mask(self) -> TypeMask {
        TypeMask::from_bits_truncate(self as u8)
    }
}

bitflags::bitflags! {
    /// Bitmask of value types, used to filter key enumeration.
    ///
    /// An empty mask means "any type".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeMask: u8 {
        const BOOLEAN = 0x01;
        const DOUBLE = 0x02;
        const STRING = 0x04;
        const RAW = 0x08;
        const BOOLEAN_ARRAY = 0x10;
        const DOUBLE_ARRAY = 0x20;
        const STRING_ARRAY = 0x40;
        const RPC_DEFINITION = 0x80;
    }
}

impl TypeMask {
    /// Check whether a type passes this filter (empty = don't care).
    pub fn accepts(self, ty: EntryType) -> bool {
        self.is_empty() || self.intersects(ty.mask())
    }
}

impl Default for TypeMask {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags::bitflags! {
    /// Per-entry metadata flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntryFlags: u8 {
        /// Entry is included in durable save/restore.
        const PERSISTENT = 0x01;
    }
}

/// An immutable, type-tagged value.
///
/// Values are never mutated in place; a write replaces the entry's value
/// wholesale. Cloning is cheap for raw payloads (`Bytes`).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Double(f64),
    String(String),
    Raw(Bytes),
    BooleanArray(Vec<bool>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
    RpcDefinition(Bytes),
}

impl Value {
    /// The type discriminant of this value.
    pub fn entry_type(&self) -> EntryType {
        match self {
            Self::Boolean(_) => EntryType::Boolean,
            Self::Double(_) => EntryType::Double,
            Self::String(_) => EntryType::String,
            Self::Raw(_) => EntryType::Raw,
            Self::BooleanArray(_) => EntryType::BooleanArray,
            Self::DoubleArray(_) => EntryType::DoubleArray,
            Self::StringArray(_) => EntryType::StringArray,
            Self::RpcDefinition(_) => EntryType::RpcDefinition,
        }
    }

    /// Check whether this value has the given type.
    pub fn is_type(&self, ty: EntryType) -> bool {
        self.entry_type() == ty
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            Self::Raw(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_boolean_array(&self) -> Option<&[bool]> {
        match self {
            Self::BooleanArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_double_array(&self) -> Option<&[f64]> {
        match self {
            Self::DoubleArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_string_array(&self) -> Option<&[String]> {
        match self {
            Self::StringArray(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_type_tag_round_trip() {
        for ty in [
            EntryType::Boolean,
            EntryType::Double,
            EntryType::String,
            EntryType::Raw,
            EntryType::BooleanArray,
            EntryType::DoubleArray,
            EntryType::StringArray,
            EntryType::RpcDefinition,
        ] {
            assert_eq!(EntryType::from_tag(ty as u8), Some(ty));
        }
        assert_eq!(EntryType::from_tag(0x03), None);
        assert_eq!(EntryType::from_tag(0x00), None);
    }

    #[test]
    fn test_type_mask_accepts() {
        assert!(TypeMask::empty().accepts(EntryType::Double));
        assert!(TypeMask::DOUBLE.accepts(EntryType::Double));
        assert!(!TypeMask::DOUBLE.accepts(EntryType::String));
        let mask = TypeMask::DOUBLE | TypeMask::STRING;
        assert!(mask.accepts(EntryType::String));
        assert!(!mask.accepts(EntryType::Raw));
    }

    #[test]
    fn test_value_type_accessors() {
        let v = Value::Double(1.5);
        assert_eq!(v.entry_type(), EntryType::Double);
        assert_eq!(v.as_double(), Some(1.5));
        assert_eq!(v.as_boolean(), None);

        let v = Value::from("hello");
        assert!(v.is_type(EntryType::String));
        assert_eq!(v.as_string(), Some("hello"));
    }

    #[test]
    fn test_entry_flags() {
        let mut flags = EntryFlags::default();
        assert!(!flags.contains(EntryFlags::PERSISTENT));
        flags.insert(EntryFlags::PERSISTENT);
        assert!(flags.contains(EntryFlags::PERSISTENT));
        flags.remove(EntryFlags::PERSISTENT);
        assert!(flags.is_empty());
    }
}
