//! # Data Types
//!
//! Element types carried by lazy buffers and kernel AST nodes: plain
//! scalars, image dtypes (a scalar base plus a 2D texture shape), and
//! pointer types for kernel buffer arguments.

use std::fmt;

/// Scalar element types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Bool,
    UInt8,
    Int32,
    Int64,
    Float16,
    Float32,
    Float64,
}

impl ScalarType {
    /// Size of one element in bytes
    pub fn itemsize(self) -> i64 {
        match self {
            ScalarType::Bool | ScalarType::UInt8 => 1,
            ScalarType::Float16 => 2,
            ScalarType::Int32 | ScalarType::Float32 => 4,
            ScalarType::Int64 | ScalarType::Float64 => 8,
        }
    }

    /// True for floating point types
    pub fn is_float(self) -> bool {
        matches!(
            self,
            ScalarType::Float16 | ScalarType::Float32 | ScalarType::Float64
        )
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::Bool => "bool",
            ScalarType::UInt8 => "uint8",
            ScalarType::Int32 => "int32",
            ScalarType::Int64 => "int64",
            ScalarType::Float16 => "float16",
            ScalarType::Float32 => "float32",
            ScalarType::Float64 => "float64",
        };
        write!(f, "{name}")
    }
}

/// A buffer or AST node dtype.
///
/// `Image` carries the declared texture shape next to its scalar base; the
/// scheduler downgrades infeasible images to plain `float32` during output
/// group assembly. `Ptr` only appears on `DefineGlobal` kernel arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DType {
    Scalar(ScalarType),
    Image { base: ScalarType, shape: Vec<i64> },
    Ptr(ScalarType),
}

impl DType {
    pub const FLOAT32: DType = DType::Scalar(ScalarType::Float32);

    /// The scalar base: images decay to their base type, pointers to their
    /// pointee.
    pub fn base(&self) -> ScalarType {
        match self {
            DType::Scalar(s) | DType::Image { base: s, .. } | DType::Ptr(s) => *s,
        }
    }

    /// Element size in bytes
    pub fn itemsize(&self) -> i64 {
        self.base().itemsize()
    }

    pub fn is_image(&self) -> bool {
        matches!(self, DType::Image { .. })
    }

    /// The dtype a `DefineGlobal` argument gets: images stay images, plain
    /// scalars become pointers.
    pub fn as_buffer_arg(&self) -> DType {
        match self {
            DType::Image { .. } => self.clone(),
            other => DType::Ptr(other.base()),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Scalar(s) => write!(f, "{s}"),
            DType::Image { base, shape } => write!(f, "image<{base}, {shape:?}>"),
            DType::Ptr(s) => write!(f, "ptr<{s}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_itemsize() {
        assert_eq!(ScalarType::Bool.itemsize(), 1);
        assert_eq!(ScalarType::Float16.itemsize(), 2);
        assert_eq!(ScalarType::Float32.itemsize(), 4);
        assert_eq!(ScalarType::Int64.itemsize(), 8);
    }

    #[test]
    fn test_image_base_decays() {
        let img = DType::Image {
            base: ScalarType::Float32,
            shape: vec![8, 4, 4],
        };
        assert_eq!(img.base(), ScalarType::Float32);
        assert!(img.is_image());
        assert_eq!(img.itemsize(), 4);
    }

    #[test]
    fn test_buffer_arg_dtype() {
        assert_eq!(
            DType::FLOAT32.as_buffer_arg(),
            DType::Ptr(ScalarType::Float32)
        );
        let img = DType::Image {
            base: ScalarType::Float32,
            shape: vec![4, 4, 4],
        };
        assert_eq!(img.as_buffer_arg(), img);
    }
}
