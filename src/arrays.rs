use aligned_vec::{AVec, ConstAlign};
use std::fmt::{Display, Formatter};
use std::ops::{Index, IndexMut};

const ALIGN: usize = 64;

#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    IndicesOutOfBounds(usize, usize, usize),
    IndexOutOfBounds(usize),
    DimensionMismatch,
}
impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IndicesOutOfBounds(x, y, z) => {
                write!(f, "indices ({x}, {y}, {z}) out of bounds")
            }
            Error::IndexOutOfBounds(index) => write!(f, "index {index} out of bounds"),
            Error::DimensionMismatch => write!(f, "dimension mismatch"),
        }
    }
}

/// Dense 3D array with linear layout `(z * height + y) * width + x`.
///
/// Backs the per-voxel label and distance grids. The layout matches
/// `GreyVolume`, so one linear index addresses a voxel in all three grids.
#[derive(Debug)]
pub struct Array3D<T> {
    pub data: AVec<T, ConstAlign<ALIGN>>,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl<T> Array3D<T> {
    pub fn from_slice(data: &[T], width: usize, height: usize, depth: usize) -> Result<Self, Error>
    where
        T: Clone,
    {
        if data.len() != width * height * depth {
            return Err(Error::DimensionMismatch);
        }
        Ok(Self {
            width,
            height,
            depth,
            data: AVec::from_slice(ALIGN, data),
        })
    }

    pub fn from_fill(value: T, width: usize, height: usize, depth: usize) -> Self
    where
        T: Clone + Copy,
    {
        let data: AVec<T, ConstAlign<ALIGN>> =
            AVec::from_iter(ALIGN, (0..width * height * depth).map(|_| value));
        Self {
            width,
            height,
            depth,
            data,
        }
    }

    pub fn fill(&mut self, value: T)
    where
        T: Clone,
    {
        self.data.fill(value)
    }

    #[inline(always)]
    pub fn plane_len(&self) -> usize {
        self.width * self.height
    }

    /// One full xy plane at depth `z`.
    #[inline(always)]
    pub fn get_plane(&self, z: usize) -> &[T] {
        debug_assert!(z < self.depth);
        let plane = self.plane_len();
        &self.data[(plane * z)..(plane * z + plane)]
    }

    #[inline(always)]
    pub fn get_plane_mut(&mut self, z: usize) -> &mut [T] {
        debug_assert!(z < self.depth);
        let plane = self.plane_len();
        &mut self.data[(plane * z)..(plane * z + plane)]
    }

    #[inline(always)]
    pub fn get_index(&self, x: usize, y: usize, z: usize) -> usize {
        debug_assert!(self.width > x);
        debug_assert!(self.height > y);
        debug_assert!(self.depth > z);
        (self.height * z + y) * self.width + x
    }
}
impl<T> Index<(usize, usize, usize)> for Array3D<T> {
    type Output = T;
    fn index(&self, (x, y, z): (usize, usize, usize)) -> &Self::Output {
        &self.data[self.get_index(x, y, z)]
    }
}
impl<T> IndexMut<(usize, usize, usize)> for Array3D<T> {
    fn index_mut(&mut self, (x, y, z): (usize, usize, usize)) -> &mut Self::Output {
        let idx = self.get_index(x, y, z);
        &mut self.data[idx]
    }
}

/// Greyscale voxel volume, one intensity byte per voxel.
///
/// Same linear layout as `Array3D`. The volume is read-shared by the
/// clustering passes and mutated only by the relabeling steps; slice-wise
/// ingestion and emission go through the plane accessors.
pub struct GreyVolume {
    pub data: AVec<u8, ConstAlign<ALIGN>>,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl GreyVolume {
    pub fn from_slice(data: &[u8], width: usize, height: usize, depth: usize) -> Self {
        assert!(width > 0);
        assert!(height > 0);
        assert!(depth > 0);
        assert_eq!(data.len(), width * height * depth);
        Self {
            width,
            height,
            depth,
            data: AVec::from_slice(ALIGN, data),
        }
    }

    pub fn from_fill(value: u8, width: usize, height: usize, depth: usize) -> Self {
        assert!(width > 0);
        assert!(height > 0);
        assert!(depth > 0);
        let data: AVec<u8, ConstAlign<ALIGN>> =
            AVec::from_iter(ALIGN, (0..width * height * depth).map(|_| value));
        Self {
            width,
            height,
            depth,
            data,
        }
    }

    pub fn from_iter<I>(grey_iter: I, width: usize, height: usize, depth: usize) -> Self
    where
        I: IntoIterator<Item = u8>,
    {
        assert!(width > 0);
        assert!(height > 0);
        assert!(depth > 0);
        let data = AVec::from_iter(ALIGN, grey_iter);
        assert_eq!(data.len(), width * height * depth);
        Self {
            width,
            height,
            depth,
            data,
        }
    }

    #[inline(always)]
    pub fn plane_len(&self) -> usize {
        self.width * self.height
    }

    #[inline(always)]
    pub fn get_index(&self, x: usize, y: usize, z: usize) -> usize {
        debug_assert!(self.width > x);
        debug_assert!(self.height > y);
        debug_assert!(self.depth > z);
        (self.height * z + y) * self.width + x
    }

    #[inline(always)]
    pub fn get_voxel(&self, x: usize, y: usize, z: usize) -> u8 {
        self.data[self.get_index(x, y, z)]
    }

    #[inline(always)]
    pub fn get_plane(&self, z: usize) -> &[u8] {
        debug_assert!(z < self.depth);
        let plane = self.plane_len();
        &self.data[(plane * z)..(plane * z + plane)]
    }

    #[inline(always)]
    pub fn get_plane_mut(&mut self, z: usize) -> &mut [u8] {
        debug_assert!(z < self.depth);
        let plane = self.plane_len();
        &mut self.data[(plane * z)..(plane * z + plane)]
    }
}
impl Index<(usize, usize, usize)> for GreyVolume {
    type Output = u8;
    fn index(&self, (x, y, z): (usize, usize, usize)) -> &Self::Output {
        &self.data[self.get_index(x, y, z)]
    }
}

#[cfg(test)]
mod tests {
    use super::{Array3D, Error, GreyVolume};

    #[test]
    fn array3d_layout_test() {
        let arr = Array3D::from_fill(0u32, 4, 3, 2);
        assert_eq!(arr.data.len(), 24);
        assert_eq!(arr.plane_len(), 12);
        assert_eq!(arr.get_index(0, 0, 0), 0);
        assert_eq!(arr.get_index(3, 0, 0), 3);
        assert_eq!(arr.get_index(0, 1, 0), 4);
        assert_eq!(arr.get_index(0, 0, 1), 12);
        assert_eq!(arr.get_index(3, 2, 1), 23);
    }

    #[test]
    fn array3d_from_slice_dimension_mismatch_test() {
        let data = vec![0f32; 10];
        let result = Array3D::from_slice(&data, 4, 3, 2);
        assert_eq!(result.unwrap_err(), Error::DimensionMismatch);
    }

    #[test]
    fn array3d_index_mut_test() {
        let mut arr = Array3D::from_fill(f32::INFINITY, 4, 3, 2);
        arr[(2, 1, 1)] = 0.5;
        assert_eq!(arr[(2, 1, 1)], 0.5);
        assert_eq!(arr.data[arr.get_index(2, 1, 1)], 0.5);
        arr.fill(1.0);
        assert!(arr.data.iter().all(|v| *v == 1.0));
    }

    #[test]
    fn volume_planes_test() {
        let volume = GreyVolume::from_iter((0..24).map(|i| i as u8), 4, 3, 2);
        assert_eq!(volume.get_plane(0).len(), 12);
        assert_eq!(volume.get_plane(1)[0], 12);
        assert_eq!(volume.get_voxel(3, 2, 1), 23);
        assert_eq!(volume[(1, 1, 0)], 5);
    }
}
