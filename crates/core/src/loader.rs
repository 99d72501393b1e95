//! Backend loader contract
//!
//! The storage backend turns a block of one resolution level of one image
//! into elements. It is called concurrently by the fetcher threads for
//! different cells and directly by foreground threads for blocking and
//! budgeted requests, so implementations must be thread safe.

use cellstream_cache::Element;
use cellstream_scheduler::BoxError;

/// Loads the elements of one block from the backing store
///
/// # Example
///
/// ```
/// use cellstream_core::CellLoader;
/// use cellstream_scheduler::BoxError;
///
/// struct Constant(u16);
///
/// impl CellLoader<u16> for Constant {
///     fn load(&self, _t: u32, _s: u32, _l: u32, dims: &[usize], _min: &[i64]) -> Result<Vec<u16>, BoxError> {
///         Ok(vec![self.0; dims.iter().product()])
///     }
/// }
///
/// assert_eq!(Constant(3).load(0, 0, 0, &[2, 2], &[0, 0]).unwrap(), vec![3; 4]);
/// ```
pub trait CellLoader<T: Element>: Send + Sync {
    /// Load the block of shape `dims` at offset `min`
    ///
    /// Blocks until the data is available. The result must hold exactly
    /// `dims.iter().product()` elements in row-major order with the first
    /// dimension varying fastest.
    fn load(
        &self,
        timepoint: u32,
        setup: u32,
        level: u32,
        dims: &[usize],
        min: &[i64],
    ) -> Result<Vec<T>, BoxError>;

    /// Bytes read from the backing store per loaded element
    ///
    /// Only used for IO throughput accounting.
    fn bytes_per_element(&self) -> f64 {
        T::BYTES as f64
    }
}
