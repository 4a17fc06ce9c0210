//! 3D SLIC superpixel clustering with statistical region merging, in Rust.
//!
//! This crate segments a dense greyscale voxel volume (a stack of 2D slices)
//! in two stages. A 3D extension of SLIC first partitions the volume into
//! compact, roughly uniform-intensity superpixels; a statistical region
//! merging pass then treats each superpixel as a graph node and merges
//! adjacent nodes whose grey statistics are not reliably distinguishable,
//! leaving a coarser final segmentation.
//!
//! Reading slices into a volume and writing the segmented volume back out
//! are left to the caller; the crate only works on in-memory `GreyVolume`s.
//!
//! ```rust
//! use slic_srm3d::arrays::GreyVolume;
//! use slic_srm3d::common::Config;
//! use slic_srm3d::slic::{iterate, Clusters};
//! use slic_srm3d::srm::merge_superpixels;
//!
//! fn main() {
//!     // One intensity byte per voxel, x fastest, slices stacked along z.
//!     let voxels: Vec<u8> = (0..64 * 64 * 16).map(|i| (i % 256) as u8).collect();
//!     let mut volume = GreyVolume::from_slice(&voxels, 64, 64, 16);
//!     // Create config with defaults.
//!     let mut config = Config::default();
//!     // Aim for 64 superpixels (realized as a 4x4x4 lattice).
//!     config.num_of_clusters = 64;
//!     // Initialize cluster centers and run the clustering loop.
//!     let mut clusters = Clusters::initialize_clusters(&volume, &config);
//!     iterate(&volume, &config, &mut clusters);
//!     // Merge statistically indistinguishable neighbors and paint the
//!     // volume with each final region's representative grey.
//!     let num_regions = merge_superpixels(&mut volume, &mut clusters, &config);
//!     assert!(num_regions >= 1);
//! }
//! ```
//!
//! `slic::iterate()` is a bounded loop; callers that want their own stopping
//! policy can drive `slic::step()` directly and watch
//! `slic::total_distortion()`. The superpixel stage can also be used on its
//! own: `slic::relabel_superpixels()` paints the pre-merge superpixel volume.
//!
//! The assignment pass and the merge loop are deliberately single-threaded -
//! both resolve ties by scan order, and that order is part of the output.
//! The remaining passes (mean update, region counting, relabeling) are
//! parallelized with rayon and give identical results at any thread count.

pub mod arrays;
pub mod cluster;
pub mod common;
pub mod slic;
pub mod srm;
