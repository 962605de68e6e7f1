//! # Semantic Type System
//!
//! Every value flowing through a program has one of a small, closed set of
//! semantic types. Users rarely write them down: the [`inference`] engine
//! derives them from how values are used (a wait duration is a `TIME`, the
//! target of a state recording is a `STATE`, ...).
//!
//! ## Types
//!
//! ```text
//! NORMAL     freely usable integers
//! TIME       durations, given in seconds, stored in clock cycles
//! FREQUENCY  carrier frequencies, stored as NCO phase increments
//! PHASE      carrier phases, stored as NCO phase values
//! AMPLITUDE  pulse amplitude factors, stored as 16 bit fixed point
//! STATE      measured qubit states (0 or 1)
//! Array      fixed-size sequences of one of the above
//! ```
//!
//! `UNKNOWN` only exists while inference is running.

pub mod inference;

pub use inference::{TypeInference, TypeTable};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Semantic type of an expression or variable
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// Not inferred yet
    Unknown,
    /// Plain integer
    Normal,
    /// Duration in clock cycles
    Time,
    /// Carrier phase
    Phase,
    /// Carrier frequency
    Frequency,
    /// Amplitude factor
    Amplitude,
    /// Measured state
    State,
    /// Fixed-size array of scalar elements
    Array(Box<Type>, Shape),
}

/// Every scalar type a value can settle on
pub const SCALAR_TYPES: [Type; 6] = [
    Type::Normal,
    Type::Time,
    Type::Phase,
    Type::Frequency,
    Type::Amplitude,
    Type::State,
];

impl Type {
    /// Array type with the given element type and shape
    pub fn array(element: Type, shape: Shape) -> Self {
        Type::Array(Box::new(element), shape)
    }

    /// Whether the type is neither `Unknown` nor an array
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Type::Unknown | Type::Array(..))
    }

    /// Whether the type is fully inferred (arrays need a known element type)
    pub fn is_known(&self) -> bool {
        match self {
            Type::Unknown => false,
            Type::Array(element, _) => element.is_known(),
            _ => true,
        }
    }

    /// Element type of an array, `None` for scalars
    pub fn element(&self) -> Option<&Type> {
        match self {
            Type::Array(element, _) => Some(element),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Unknown => write!(f, "UNKNOWN"),
            Type::Normal => write!(f, "NORMAL"),
            Type::Time => write!(f, "TIME"),
            Type::Phase => write!(f, "PHASE"),
            Type::Frequency => write!(f, "FREQUENCY"),
            Type::Amplitude => write!(f, "AMPLITUDE"),
            Type::State => write!(f, "STATE"),
            Type::Array(element, shape) => write!(f, "Array[{}, {}]", element, shape),
        }
    }
}

/// Array shape; `None` dimensions are not known yet
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Shape(pub Option<Vec<Option<usize>>>);

impl Shape {
    /// Shape whose rank is not known
    pub fn unknown() -> Self {
        Shape(None)
    }

    /// One-dimensional shape
    pub fn vector(len: usize) -> Self {
        Shape(Some(vec![Some(len)]))
    }

    /// Shape from explicit dimensions
    pub fn dims(dims: &[Option<usize>]) -> Self {
        Shape(Some(dims.to_vec()))
    }

    /// Number of dimensions, if known
    pub fn rank(&self) -> Option<usize> {
        self.0.as_ref().map(Vec::len)
    }

    /// Total element count when every dimension is known
    pub fn len(&self) -> Option<usize> {
        let dims = self.0.as_ref()?;
        dims.iter().try_fold(1usize, |acc, d| d.map(|d| acc * d))
    }

    /// Whether the shape has zero elements
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            None => write!(f, "?"),
            Some(dims) => {
                for (i, dim) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, "x")?;
                    }
                    match dim {
                        Some(d) => write!(f, "{}", d)?,
                        None => write!(f, "?")?,
                    }
                }
                Ok(())
            }
        }
    }
}

/// A use of an expression that fixes its type on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeDefiningUse {
    VariableDefinition,
    ValueDefinition,
    ShiftExpression,
    PulseLength,
    RecordingLength,
    RecordingSaveTo,
    WaitCommand,
    RecordingOffsetExpression,
    PulseFrequency,
    PulsePhase,
    PulseAmplitude,
    ArrayIndex,
    ArrayAccess,
}

impl TypeDefiningUse {
    /// Explanation appended to "because it ..."
    pub fn message(&self) -> &'static str {
        match self {
            TypeDefiningUse::VariableDefinition | TypeDefiningUse::ValueDefinition => {
                "has been defined by the user as this type"
            }
            TypeDefiningUse::ShiftExpression => "is used as right hand side of shift expression",
            TypeDefiningUse::PulseLength => "is used as length of pulse",
            TypeDefiningUse::RecordingLength => "is used as length of recording",
            TypeDefiningUse::RecordingSaveTo => "is used as save_to of recording command",
            TypeDefiningUse::WaitCommand => "is used as length in wait command",
            TypeDefiningUse::RecordingOffsetExpression => "is used as an recording offset",
            TypeDefiningUse::PulseFrequency => "is used as pulse frequency.",
            TypeDefiningUse::PulsePhase => "is used as pulse phase",
            TypeDefiningUse::PulseAmplitude => "is used as pulse amplitude",
            TypeDefiningUse::ArrayIndex => "is used as array index",
            TypeDefiningUse::ArrayAccess => "is indexed like an array",
        }
    }
}

/// Why a node can never have a certain type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IllegalTypeReason {
    Assign,
    ForRange,
    InvalidStateConstant,
    InvalidNormalConstant,
}

impl IllegalTypeReason {
    pub fn message(&self) -> &'static str {
        match self {
            IllegalTypeReason::Assign => "assign commands can not assign STATE variables",
            IllegalTypeReason::ForRange => "ForRanges can only iterate over TIME or NORMAL values",
            IllegalTypeReason::InvalidStateConstant => {
                "constant values which are neither 0 or 1 can only have type TIME or NORMAL"
            }
            IllegalTypeReason::InvalidNormalConstant => {
                "constant float values can not be of type NORMAL"
            }
        }
    }
}

/// Types picked when nothing else determined a node's type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeFallback {
    Float,
    Int,
}

impl TypeFallback {
    pub fn message(&self) -> &'static str {
        match self {
            TypeFallback::Int => "had no type inferred and therefore fell back to type NORMAL.",
            TypeFallback::Float => "had no type inferred and therefore fell back to type TIME",
        }
    }

    /// The type this fallback assigns
    pub fn target(&self) -> Type {
        match self {
            TypeFallback::Int => Type::Normal,
            TypeFallback::Float => Type::Time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_display() {
        assert_eq!(
            Type::array(Type::Normal, Shape::unknown()).to_string(),
            "Array[NORMAL, ?]"
        );
        assert_eq!(
            Type::array(Type::Normal, Shape::vector(10)).to_string(),
            "Array[NORMAL, 10]"
        );
        assert_eq!(
            Type::array(Type::Normal, Shape::dims(&[Some(10), Some(20)])).to_string(),
            "Array[NORMAL, 10x20]"
        );
        assert_eq!(
            Type::array(Type::Normal, Shape::dims(&[Some(10), None])).to_string(),
            "Array[NORMAL, 10x?]"
        );
    }

    #[test]
    fn test_shape_len() {
        assert_eq!(Shape::vector(8).len(), Some(8));
        assert_eq!(Shape::dims(&[Some(2), Some(3)]).len(), Some(6));
        assert_eq!(Shape::dims(&[Some(2), None]).len(), None);
        assert_eq!(Shape::unknown().rank(), None);
    }

    #[test]
    fn test_known_types() {
        assert!(Type::Time.is_known());
        assert!(!Type::Unknown.is_known());
        assert!(!Type::array(Type::Unknown, Shape::vector(2)).is_known());
        assert!(Type::array(Type::Frequency, Shape::vector(2)).is_known());
        assert!(!Type::array(Type::Normal, Shape::vector(2)).is_scalar());
    }
}
