use crate::arrays::{Array3D, GreyVolume};
use crate::common::{split_length_to_ranges, Config};
use crate::slic::Clusters;
use rayon::current_num_threads;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Number of representable grey levels (_g_ in the merge bound).
const GREY_LEVELS: f32 = 256.0;

/// One discovered adjacency between two distinct superpixel regions.
///
/// Always stored with `smaller < larger`; the weight is the integer absolute
/// difference of the two regions' average grey at discovery time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborEdge {
    pub smaller: u32,
    pub larger: u32,
    pub weight: u32,
}

/// Per-superpixel region statistics plus the merge index.
///
/// `region_index` doubles as a union-find parent array: a non-negative entry
/// is the region's own index (a root), a negative entry `v` encodes "my
/// parent is region `-1 - v`". Merging always folds the larger index into
/// the smaller one, so a parent index is strictly smaller than its child's;
/// `consolidate()` depends on that ordering.
pub struct Regions {
    average: Vec<f32>,
    count: Vec<u32>,
    region_index: Vec<i32>,
    factor: f32,
    log_delta: f32,
}

impl Regions {
    /// Builds one region per cluster: the average is seeded from the
    /// cluster's grey, the voxel count from a full scan of the assignment
    /// grid (stale labels are not counted). The merge bound constants are
    /// derived from the volume size and the complexity parameter:
    /// `factor = g^2 / 2Q` and `log_delta = 2 ln(6 X Y Z)` (the latter is
    /// `-2 ln delta` for `delta = 1 / 6XYZ`).
    pub fn initialize(clusters: &Clusters, volume: &GreyVolume, complexity: f32) -> Self {
        let num_regions = clusters.clusters.len();
        let average: Vec<f32> = clusters.clusters.iter().map(|c| c.grey as f32).collect();
        let region_index: Vec<i32> = (0..num_regions as i32).collect();
        let counts: Vec<AtomicU32> = Vec::from_iter((0..num_regions).map(|_| AtomicU32::new(0)));

        rayon::scope(|s| {
            let tags = &clusters.assignments;
            let counts = counts.as_slice();
            for planes in split_length_to_ranges(tags.depth, current_num_threads()) {
                s.spawn(move |_| {
                    let mut counts_local = vec![0u32; counts.len()];
                    for plane_z in planes {
                        for tag in tags.get_plane(plane_z) {
                            if (*tag as usize) < counts_local.len() {
                                counts_local[*tag as usize] += 1;
                            }
                        }
                    }
                    for (region, count) in counts_local
                        .into_iter()
                        .enumerate()
                        .filter(|(_, count)| *count != 0)
                    {
                        counts[region].fetch_add(count, Ordering::Relaxed);
                    }
                })
            }
        });

        let count: Vec<u32> = counts.into_iter().map(|c| c.into_inner()).collect();
        let num_voxels = (volume.width * volume.height * volume.depth) as f32;
        Self {
            average,
            count,
            region_index,
            factor: GREY_LEVELS * GREY_LEVELS / (2.0 * complexity),
            log_delta: 2.0 * (6.0 * num_voxels).ln(),
        }
    }

    /// Resolves a region index to its current root. Does not mutate, so
    /// resolving is idempotent; termination is guaranteed because parent
    /// indices strictly decrease along the chain.
    pub fn find(&self, index: usize) -> usize {
        let mut entry = self.region_index[index];
        while entry < 0 {
            entry = self.region_index[(-1 - entry) as usize];
        }
        entry as usize
    }

    /// The relaxed statistical merge bound: two regions merge when their
    /// observed average difference is small enough to be explained by
    /// sampling noise, at the confidence scale set by the complexity
    /// parameter. `b(c) = ln(1 + c) * min(g, c)`.
    fn predicate(&self, region_1: usize, region_2: usize) -> bool {
        let difference = self.average[region_1] - self.average[region_2];
        let count_1 = self.count[region_1] as f32;
        let count_2 = self.count[region_2] as f32;
        let bound_1 = (1.0 + count_1).ln() * GREY_LEVELS.min(count_1);
        let bound_2 = (1.0 + count_2).ln() * GREY_LEVELS.min(count_2);
        difference * difference
            < 0.1 * self.factor
                * ((bound_1 + self.log_delta) / count_1 + (bound_2 + self.log_delta) / count_2)
    }

    fn merge(&mut self, region_1: usize, region_2: usize) {
        debug_assert_ne!(region_1, region_2);
        let merged_count = self.count[region_1] + self.count[region_2];
        let merged_average = (self.average[region_1] * self.count[region_1] as f32
            + self.average[region_2] * self.count[region_2] as f32)
            / merged_count as f32;
        // Fold the larger index into the smaller one.
        let (parent, child) = if region_1 < region_2 {
            (region_1, region_2)
        } else {
            (region_2, region_1)
        };
        self.average[parent] = merged_average;
        self.count[parent] = merged_count;
        self.region_index[child] = -1 - parent as i32;
    }

    /// Greedy merge pass: takes the edges in the given order, re-resolves
    /// both endpoints to their current roots and merges when the bound
    /// accepts. Edges whose endpoints already share a root are skipped.
    pub fn merge_all(&mut self, edges: &[NeighborEdge]) {
        for edge in edges {
            let root_1 = self.find(edge.smaller as usize);
            let root_2 = self.find(edge.larger as usize);
            if root_1 != root_2 && self.predicate(root_1, root_2) {
                self.merge(root_1, root_2);
            }
        }
    }

    /// Compresses the merge index into dense final labels, one forward scan.
    ///
    /// A negative entry points at a smaller index whose slot was already
    /// rewritten earlier in the same scan, so it can be copied directly;
    /// roots take running numbers in first-seen order.
    pub fn consolidate(self) -> ConsolidatedRegions {
        let mut labels = vec![0u32; self.region_index.len()];
        let mut average = Vec::new();
        let mut next_label = 0u32;
        for (index, entry) in self.region_index.iter().enumerate() {
            if *entry < 0 {
                labels[index] = labels[(-1 - entry) as usize];
            } else {
                labels[index] = next_label;
                average.push(self.average[index]);
                next_label += 1;
            }
        }
        ConsolidatedRegions {
            labels,
            average,
            num_regions: next_label,
        }
    }
}

/// Dense relabeling produced by `Regions::consolidate`: a final label per
/// original superpixel plus each final region's representative grey.
pub struct ConsolidatedRegions {
    labels: Vec<u32>,
    average: Vec<f32>,
    pub num_regions: u32,
}

impl ConsolidatedRegions {
    /// Representative grey level of a final region (rounded merged average).
    pub fn representative(&self, label: u32) -> u8 {
        self.average[label as usize].round() as u8
    }

    /// Rewrites superpixel labels in the assignment grid with final region
    /// labels. Stale labels are left untouched.
    pub fn apply_to_tags(&self, tags: &mut Array3D<u32>) {
        let labels = self.labels.as_slice();
        let total = tags.data.len();
        rayon::scope(|s| {
            let mut tags_rest: &mut [u32] = &mut tags.data;
            for range in split_length_to_ranges(total, current_num_threads()) {
                let (chunk, rest) = tags_rest.split_at_mut(range.len());
                tags_rest = rest;
                s.spawn(move |_| {
                    for tag in chunk.iter_mut() {
                        if (*tag as usize) < labels.len() {
                            *tag = labels[*tag as usize];
                        }
                    }
                })
            }
        });
    }

    /// Paints every voxel with its final region's representative grey.
    /// Expects the assignment grid to hold consolidated labels already;
    /// stale labels leave the voxel untouched.
    pub fn paint(&self, volume: &mut GreyVolume, tags: &Array3D<u32>) {
        let greys: Vec<u8> =
            Vec::from_iter((0..self.num_regions).map(|label| self.representative(label)));
        let greys = greys.as_slice();
        let total = volume.data.len();
        rayon::scope(|s| {
            let mut voxels_rest: &mut [u8] = &mut volume.data;
            for range in split_length_to_ranges(total, current_num_threads()) {
                let (voxels, rest) = voxels_rest.split_at_mut(range.len());
                voxels_rest = rest;
                let chunk_tags = &tags.data[range];
                s.spawn(move |_| {
                    for (voxel, tag) in voxels.iter_mut().zip(chunk_tags) {
                        if (*tag as usize) < greys.len() {
                            *voxel = greys[*tag as usize];
                        }
                    }
                })
            }
        });
    }
}

/// Scans the assignment grid (excluding the last plane on each axis),
/// testing every voxel's +x, +y and +z neighbor. Each adjacent pair of
/// distinct regions yields one edge, keyed structurally by the ordered index
/// pair; the weight is recorded at first discovery and re-discoveries must
/// agree, since it is a pure function of the pair. The surviving edges are
/// sorted ascending by (weight, smaller, larger), so the merge order does
/// not depend on discovery order.
pub fn collect_neighbor_edges(clusters: &Clusters) -> Vec<NeighborEdge> {
    let tags = &clusters.assignments;
    let num_clusters = clusters.clusters.len();
    let mut edges: BTreeMap<(u32, u32), u32> = BTreeMap::new();
    let mut add_pair = |index_1: u32, index_2: u32| {
        if index_1 as usize >= num_clusters || index_2 as usize >= num_clusters {
            return;
        }
        let (smaller, larger) = if index_1 <= index_2 {
            (index_1, index_2)
        } else {
            (index_2, index_1)
        };
        let weight = clusters.clusters[smaller as usize]
            .grey
            .abs_diff(clusters.clusters[larger as usize].grey) as u32;
        let stored = *edges.entry((smaller, larger)).or_insert(weight);
        debug_assert_eq!(stored, weight);
    };
    for x in 0..tags.width.saturating_sub(1) {
        for y in 0..tags.height.saturating_sub(1) {
            for z in 0..tags.depth.saturating_sub(1) {
                let tag = tags[(x, y, z)];
                if tags[(x + 1, y, z)] != tag {
                    add_pair(tag, tags[(x + 1, y, z)]);
                }
                if tags[(x, y + 1, z)] != tag {
                    add_pair(tag, tags[(x, y + 1, z)]);
                }
                if tags[(x, y, z + 1)] != tag {
                    add_pair(tag, tags[(x, y, z + 1)]);
                }
            }
        }
    }
    let mut edges = Vec::from_iter(edges.into_iter().map(|((smaller, larger), weight)| {
        NeighborEdge {
            smaller,
            larger,
            weight,
        }
    }));
    edges.sort_unstable_by_key(|edge| (edge.weight, edge.smaller, edge.larger));
    edges
}

/// Full region-merging stage over a finished clustering: region statistics,
/// neighbor discovery, greedy statistical merging, consolidation, then the
/// consolidated labels are written back into the assignment grid and the
/// volume is painted with each region's representative grey.
///
/// Returns the final region count; the assignment grid afterwards holds
/// values in `[0, count)` for every voxel some search window reached.
pub fn merge_superpixels(volume: &mut GreyVolume, clusters: &mut Clusters, config: &Config) -> u32 {
    let mut regions = Regions::initialize(clusters, volume, config.merge_complexity);
    let edges = collect_neighbor_edges(clusters);
    regions.merge_all(&edges);
    let consolidated = regions.consolidate();
    consolidated.apply_to_tags(&mut clusters.assignments);
    consolidated.paint(volume, &clusters.assignments);
    consolidated.num_regions
}
