//! Cell grid geometry
//!
//! Each resolution level of an image is cut into a grid of equally sized
//! cells. Cells on the upper border are truncated to the image extent. A
//! cell's linear index runs through the grid with the first dimension
//! varying fastest.

use thiserror::Error;

/// Errors building a cell grid
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    /// Image and cell dimensionality differ
    #[error("image has {image} dimensions but cells have {cell}")]
    DimensionMismatch { image: usize, cell: usize },

    /// A cell dimension is zero
    #[error("cell dimension {dim} is zero")]
    EmptyCell { dim: usize },

    /// No dimensions at all
    #[error("grid needs at least one dimension")]
    NoDimensions,

    /// A geometry without resolution levels
    #[error("geometry needs at least one resolution level")]
    NoLevels,
}

/// Shape and position of one cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellBlock {
    /// Cell shape, truncated at the image border
    pub dims: Vec<usize>,

    /// Offset of the cell in image coordinates
    pub min: Vec<i64>,
}

/// Grid of cells over one resolution level
///
/// # Example
///
/// ```
/// use cellstream_core::CellGrid;
///
/// let grid = CellGrid::new(vec![100, 50], vec![32, 32]).unwrap();
/// assert_eq!(grid.grid_dims(), &[4, 2]);
/// assert_eq!(grid.num_cells(), 8);
///
/// // Last cell of the first row is truncated to the image extent
/// let block = grid.cell(3).unwrap();
/// assert_eq!(block.dims, vec![4, 32]);
/// assert_eq!(block.min, vec![96, 0]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellGrid {
    image_dims: Vec<u64>,
    cell_dims: Vec<usize>,
    grid_dims: Vec<u64>,
}

impl CellGrid {
    /// Create a grid over an image of `image_dims` with cells of `cell_dims`
    pub fn new(image_dims: Vec<u64>, cell_dims: Vec<usize>) -> Result<Self, GridError> {
        if image_dims.is_empty() {
            return Err(GridError::NoDimensions);
        }
        if image_dims.len() != cell_dims.len() {
            return Err(GridError::DimensionMismatch {
                image: image_dims.len(),
                cell: cell_dims.len(),
            });
        }
        if let Some(dim) = cell_dims.iter().position(|&c| c == 0) {
            return Err(GridError::EmptyCell { dim });
        }
        let grid_dims = image_dims
            .iter()
            .zip(&cell_dims)
            .map(|(&image, &cell)| image.div_ceil(cell as u64))
            .collect();
        Ok(Self {
            image_dims,
            cell_dims,
            grid_dims,
        })
    }

    /// Image extent
    pub fn image_dims(&self) -> &[u64] {
        &self.image_dims
    }

    /// Shape of a full (non-border) cell
    pub fn cell_dims(&self) -> &[usize] {
        &self.cell_dims
    }

    /// Number of cells along each dimension
    pub fn grid_dims(&self) -> &[u64] {
        &self.grid_dims
    }

    /// Total number of cells
    pub fn num_cells(&self) -> u64 {
        self.grid_dims.iter().product()
    }

    /// Grid position of the cell with linear `index`
    pub fn grid_position(&self, index: u64) -> Option<Vec<u64>> {
        if index >= self.num_cells() {
            return None;
        }
        let mut rest = index;
        let position = self
            .grid_dims
            .iter()
            .map(|&n| {
                let p = rest % n;
                rest /= n;
                p
            })
            .collect();
        Some(position)
    }

    /// Linear index of the cell at grid `position`
    pub fn index_of(&self, position: &[u64]) -> Option<u64> {
        if position.len() != self.grid_dims.len() {
            return None;
        }
        let mut index = 0;
        for (&p, &n) in position.iter().zip(&self.grid_dims).rev() {
            if p >= n {
                return None;
            }
            index = index * n + p;
        }
        Some(index)
    }

    /// Shape and offset of the cell with linear `index`
    pub fn cell(&self, index: u64) -> Option<CellBlock> {
        let position = self.grid_position(index)?;
        let mut dims = Vec::with_capacity(position.len());
        let mut min = Vec::with_capacity(position.len());
        for ((&p, &cell), &image) in position.iter().zip(&self.cell_dims).zip(&self.image_dims) {
            let offset = p * cell as u64;
            dims.push((image - offset).min(cell as u64) as usize);
            min.push(offset as i64);
        }
        Some(CellBlock { dims, min })
    }
}

/// Cell grids of every (setup, level) of a dataset
pub trait CellGeometry: Send + Sync {
    /// Number of setups
    fn num_setups(&self) -> usize;

    /// Number of resolution levels of `setup`, 0 if there is no such setup
    fn num_levels(&self, setup: u32) -> usize;

    /// Grid of `level` of `setup`
    fn grid(&self, setup: u32, level: u32) -> Option<&CellGrid>;

    /// Largest number of levels over all setups
    fn max_levels(&self) -> usize {
        (0..self.num_setups())
            .map(|setup| self.num_levels(setup as u32))
            .max()
            .unwrap_or(0)
    }
}

/// Geometry where every setup shares one resolution pyramid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformGeometry {
    num_setups: usize,
    levels: Vec<CellGrid>,
}

impl UniformGeometry {
    /// Pyramid of `num_levels` levels, each half the size of the previous
    /// one (rounded up), with the same cell shape everywhere
    pub fn new(
        num_setups: usize,
        image_dims: Vec<u64>,
        cell_dims: Vec<usize>,
        num_levels: usize,
    ) -> Result<Self, GridError> {
        if num_levels == 0 {
            return Err(GridError::NoLevels);
        }
        let mut levels = Vec::with_capacity(num_levels);
        let mut dims = image_dims;
        for _ in 0..num_levels {
            levels.push(CellGrid::new(dims.clone(), cell_dims.clone())?);
            dims = dims.iter().map(|&d| d.div_ceil(2).max(1)).collect();
        }
        Ok(Self { num_setups, levels })
    }

    /// Geometry from explicit per-level grids
    pub fn from_grids(num_setups: usize, levels: Vec<CellGrid>) -> Result<Self, GridError> {
        if levels.is_empty() {
            return Err(GridError::NoLevels);
        }
        Ok(Self { num_setups, levels })
    }

    /// Grids from full resolution to coarsest
    pub fn levels(&self) -> &[CellGrid] {
        &self.levels
    }
}

impl CellGeometry for UniformGeometry {
    fn num_setups(&self) -> usize {
        self.num_setups
    }

    fn num_levels(&self, setup: u32) -> usize {
        if (setup as usize) < self.num_setups {
            self.levels.len()
        } else {
            0
        }
    }

    fn grid(&self, setup: u32, level: u32) -> Option<&CellGrid> {
        if (setup as usize) < self.num_setups {
            self.levels.get(level as usize)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_dims_round_up() {
        let grid = CellGrid::new(vec![64, 65, 1], vec![32, 32, 32]).unwrap();
        assert_eq!(grid.grid_dims(), &[2, 3, 1]);
        assert_eq!(grid.num_cells(), 6);
    }

    #[test]
    fn test_first_dimension_fastest() {
        let grid = CellGrid::new(vec![30, 20], vec![10, 10]).unwrap();
        assert_eq!(grid.grid_position(0), Some(vec![0, 0]));
        assert_eq!(grid.grid_position(1), Some(vec![1, 0]));
        assert_eq!(grid.grid_position(3), Some(vec![0, 1]));
        assert_eq!(grid.grid_position(6), None);

        for index in 0..grid.num_cells() {
            let position = grid.grid_position(index).unwrap();
            assert_eq!(grid.index_of(&position), Some(index));
        }
        assert_eq!(grid.index_of(&[3, 0]), None);
        assert_eq!(grid.index_of(&[0]), None);
    }

    #[test]
    fn test_border_cells_truncated() {
        let grid = CellGrid::new(vec![25, 10], vec![10, 8]).unwrap();
        let corner = grid.cell(grid.num_cells() - 1).unwrap();
        assert_eq!(corner.min, vec![20, 8]);
        assert_eq!(corner.dims, vec![5, 2]);

        let inner = grid.cell(0).unwrap();
        assert_eq!(inner.dims, vec![10, 8]);
        assert!(grid.cell(grid.num_cells()).is_none());
    }

    #[test]
    fn test_cells_cover_image() {
        let grid = CellGrid::new(vec![37, 11, 5], vec![8, 4, 2]).unwrap();
        let total: u64 = (0..grid.num_cells())
            .map(|i| grid.cell(i).unwrap().dims.iter().map(|&d| d as u64).product::<u64>())
            .sum();
        assert_eq!(total, 37 * 11 * 5);
    }

    #[test]
    fn test_invalid_grids() {
        assert_eq!(CellGrid::new(vec![], vec![]), Err(GridError::NoDimensions));
        assert_eq!(
            CellGrid::new(vec![10, 10], vec![4]),
            Err(GridError::DimensionMismatch { image: 2, cell: 1 })
        );
        assert_eq!(
            CellGrid::new(vec![10, 10], vec![4, 0]),
            Err(GridError::EmptyCell { dim: 1 })
        );
    }

    #[test]
    fn test_uniform_pyramid() {
        let geometry = UniformGeometry::new(2, vec![100, 60], vec![32, 32], 3).unwrap();
        assert_eq!(geometry.num_setups(), 2);
        assert_eq!(geometry.num_levels(1), 3);
        assert_eq!(geometry.num_levels(2), 0);
        assert_eq!(geometry.max_levels(), 3);

        assert_eq!(geometry.grid(0, 1).unwrap().image_dims(), &[50, 30]);
        assert_eq!(geometry.grid(0, 2).unwrap().image_dims(), &[25, 15]);
        assert_eq!(geometry.grid(0, 2).unwrap().num_cells(), 1);
        assert!(geometry.grid(0, 3).is_none());
        assert!(geometry.grid(2, 0).is_none());
    }

    #[test]
    fn test_no_levels() {
        assert_eq!(
            UniformGeometry::new(1, vec![10], vec![4], 0),
            Err(GridError::NoLevels)
        );
        assert_eq!(UniformGeometry::from_grids(1, vec![]), Err(GridError::NoLevels));
    }
}
