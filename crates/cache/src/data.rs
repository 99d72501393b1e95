//! Cell data buffers
//!
//! A cell holds a fixed-shape buffer of one primitive element type. Before
//! it is loaded, the buffer is a shared read-only placeholder; afterwards it
//! owns the loaded elements and is valid for good.

use crate::placeholder::PlaceholderPool;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Primitive element type stored in cells
pub trait Element: Copy + Default + Debug + Send + Sync + 'static {
    /// Size of one element in bytes
    const BYTES: usize;

    /// Short type name, used in reports
    const NAME: &'static str;
}

macro_rules! impl_element {
    ($($ty:ty),*) => {
        $(
            impl Element for $ty {
                const BYTES: usize = std::mem::size_of::<$ty>();
                const NAME: &'static str = stringify!($ty);
            }
        )*
    };
}

impl_element!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Errors constructing cell data
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    /// Loaded buffer does not match the cell shape
    #[error("cell buffer holds {actual} elements, shape requires {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// `dims` and `min` disagree on dimensionality
    #[error("cell has {dims} dims but {min} min coordinates")]
    DimensionMismatch { dims: usize, min: usize },
}

/// Number of elements in a block of shape `dims`
pub fn num_elements(dims: &[usize]) -> usize {
    dims.iter().product()
}

/// Data of one cell
#[derive(Debug, Clone)]
pub struct CellData<T> {
    buffer: Arc<[T]>,
    len: usize,
    dims: Vec<usize>,
    min: Vec<i64>,
    valid: bool,
}

impl<T: Element> CellData<T> {
    /// Placeholder data backed by the pool's shared buffer
    pub fn placeholder(pool: &PlaceholderPool, dims: Vec<usize>, min: Vec<i64>) -> Self {
        let len = num_elements(&dims);
        Self {
            buffer: pool.buffer::<T>(len),
            len,
            dims,
            min,
            valid: false,
        }
    }

    /// Valid data from loaded elements
    pub fn loaded(elements: Vec<T>, dims: Vec<usize>, min: Vec<i64>) -> Result<Self, DataError> {
        if dims.len() != min.len() {
            return Err(DataError::DimensionMismatch {
                dims: dims.len(),
                min: min.len(),
            });
        }
        let expected = num_elements(&dims);
        if elements.len() != expected {
            return Err(DataError::ShapeMismatch {
                expected,
                actual: elements.len(),
            });
        }
        Ok(Self {
            buffer: elements.into(),
            len: expected,
            dims,
            min,
            valid: true,
        })
    }

    /// Elements of this cell
    ///
    /// Placeholder data reads as default values.
    pub fn as_slice(&self) -> &[T] {
        &self.buffer[..self.len]
    }

    /// Shape of the cell
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Offset of the cell in image coordinates
    pub fn min(&self) -> &[i64] {
        &self.min
    }

    /// Whether the data was loaded
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Number of elements
    pub fn num_elements(&self) -> usize {
        self.len
    }

    /// Memory owned by this cell; placeholders own nothing
    pub fn size_in_bytes(&self) -> usize {
        if self.valid {
            self.len * T::BYTES
        } else {
            0
        }
    }
}
