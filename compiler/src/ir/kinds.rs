//! Value kinds.
//!
//! A [`Kind`] is the storage shape of a value: void, an illegal marker, a
//! scalar of a fixed width, or a short vector of scalars. Targets map kinds
//! to their native types and register prefixes; operator selection is keyed
//! on kind equality.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    Pred,
    S8,
    U8,
    S16,
    U16,
    F16,
    S32,
    U32,
    F32,
    S64,
    U64,
    F64,
}

impl ScalarKind {
    /// Size in bytes. Predicates occupy one byte when stored.
    pub fn size(self) -> u32 {
        match self {
            ScalarKind::Pred | ScalarKind::S8 | ScalarKind::U8 => 1,
            ScalarKind::S16 | ScalarKind::U16 | ScalarKind::F16 => 2,
            ScalarKind::S32 | ScalarKind::U32 | ScalarKind::F32 => 4,
            ScalarKind::S64 | ScalarKind::U64 | ScalarKind::F64 => 8,
        }
    }

    pub fn bits(self) -> u32 {
        self.size() * 8
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarKind::F16 | ScalarKind::F32 | ScalarKind::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ScalarKind::S8 | ScalarKind::S16 | ScalarKind::S32 | ScalarKind::S64
        )
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            ScalarKind::U8 | ScalarKind::U16 | ScalarKind::U32 | ScalarKind::U64
        )
    }

    pub fn is_integer(self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    pub fn is_predicate(self) -> bool {
        self == ScalarKind::Pred
    }

    /// Lowercase short name (`s32`, `f64`, `pred`).
    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::Pred => "pred",
            ScalarKind::S8 => "s8",
            ScalarKind::U8 => "u8",
            ScalarKind::S16 => "s16",
            ScalarKind::U16 => "u16",
            ScalarKind::F16 => "f16",
            ScalarKind::S32 => "s32",
            ScalarKind::U32 => "u32",
            ScalarKind::F32 => "f32",
            ScalarKind::S64 => "s64",
            ScalarKind::U64 => "u64",
            ScalarKind::F64 => "f64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    Void,
    Illegal,
    Scalar(ScalarKind),
    Vector { element: ScalarKind, lanes: u8 },
}

impl Kind {
    pub const PRED: Kind = Kind::Scalar(ScalarKind::Pred);
    pub const S8: Kind = Kind::Scalar(ScalarKind::S8);
    pub const U8: Kind = Kind::Scalar(ScalarKind::U8);
    pub const S16: Kind = Kind::Scalar(ScalarKind::S16);
    pub const U16: Kind = Kind::Scalar(ScalarKind::U16);
    pub const F16: Kind = Kind::Scalar(ScalarKind::F16);
    pub const S32: Kind = Kind::Scalar(ScalarKind::S32);
    pub const U32: Kind = Kind::Scalar(ScalarKind::U32);
    pub const F32: Kind = Kind::Scalar(ScalarKind::F32);
    pub const S64: Kind = Kind::Scalar(ScalarKind::S64);
    pub const U64: Kind = Kind::Scalar(ScalarKind::U64);
    pub const F64: Kind = Kind::Scalar(ScalarKind::F64);

    pub fn vector(element: ScalarKind, lanes: u8) -> Kind {
        Kind::Vector { element, lanes }
    }

    /// Size in bytes; void and illegal have none.
    pub fn size(self) -> u32 {
        match self {
            Kind::Void | Kind::Illegal => 0,
            Kind::Scalar(s) => s.size(),
            Kind::Vector { element, lanes } => element.size() * lanes as u32,
        }
    }

    pub fn scalar(self) -> Option<ScalarKind> {
        match self {
            Kind::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// Element kind of a vector, or the scalar itself.
    pub fn element(self) -> Option<ScalarKind> {
        match self {
            Kind::Scalar(s) => Some(s),
            Kind::Vector { element, .. } => Some(element),
            _ => None,
        }
    }

    pub fn lanes(self) -> u8 {
        match self {
            Kind::Vector { lanes, .. } => lanes,
            _ => 1,
        }
    }

    pub fn is_vector(self) -> bool {
        matches!(self, Kind::Vector { .. })
    }

    pub fn is_void(self) -> bool {
        self == Kind::Void
    }

    pub fn is_float(self) -> bool {
        self.element().map_or(false, ScalarKind::is_float)
    }

    pub fn is_integer(self) -> bool {
        self.element().map_or(false, ScalarKind::is_integer)
    }

    pub fn is_unsigned(self) -> bool {
        self.element().map_or(false, ScalarKind::is_unsigned)
    }

    pub fn is_predicate(self) -> bool {
        self == Kind::PRED
    }

    /// Whether a value of this kind can live in a variable.
    pub fn is_value(self) -> bool {
        !matches!(self, Kind::Void | Kind::Illegal)
    }

    /// log2 of the size when the size is a power of two.
    pub fn size_shift(self) -> Option<u32> {
        let size = self.size();
        if size.is_power_of_two() {
            Some(size.trailing_zeros())
        } else {
            None
        }
    }
}

impl From<ScalarKind> for Kind {
    fn from(s: ScalarKind) -> Self {
        Kind::Scalar(s)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Void => write!(f, "void"),
            Kind::Illegal => write!(f, "illegal"),
            Kind::Scalar(s) => write!(f, "{}", s.name()),
            Kind::Vector { element, lanes } => write!(f, "v{}{}", lanes, element.name()),
        }
    }
}

/// Source-level element types of kernel arrays and scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Half,
    Float,
    Double,
}

impl ElementType {
    /// Kind used when the element sits in memory.
    pub fn storage_kind(self) -> Kind {
        match self {
            ElementType::Boolean => Kind::U8,
            ElementType::Byte => Kind::S8,
            ElementType::Char => Kind::U16,
            ElementType::Short => Kind::S16,
            ElementType::Int => Kind::S32,
            ElementType::Long => Kind::S64,
            ElementType::Half => Kind::F16,
            ElementType::Float => Kind::F32,
            ElementType::Double => Kind::F64,
        }
    }

    /// Kind used when the element is a value in a variable.
    pub fn value_kind(self) -> Kind {
        match self {
            ElementType::Boolean => Kind::PRED,
            other => other.storage_kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_sizes() {
        let v4 = Kind::vector(ScalarKind::F32, 4);
        assert_eq!(v4.size(), 16);
        assert_eq!(v4.lanes(), 4);
        assert_eq!(v4.element(), Some(ScalarKind::F32));
        assert_eq!(v4.size_shift(), Some(4));
        assert_eq!(Kind::vector(ScalarKind::F32, 3).size_shift(), None);
        assert!(v4.is_float());
        assert!(!v4.is_predicate());
    }

    #[test]
    fn test_display() {
        assert_eq!(Kind::S32.to_string(), "s32");
        assert_eq!(Kind::PRED.to_string(), "pred");
        assert_eq!(Kind::vector(ScalarKind::F64, 2).to_string(), "v2f64");
    }

    #[test]
    fn test_element_type_mapping() {
        assert_eq!(ElementType::Boolean.storage_kind(), Kind::U8);
        assert_eq!(ElementType::Boolean.value_kind(), Kind::PRED);
        assert_eq!(ElementType::Char.storage_kind(), Kind::U16);
        assert_eq!(ElementType::Double.value_kind(), Kind::F64);
    }
}
