use std::ops::Range;

/// Main config for the processing.
///
/// The defaults reproduce the reference pipeline: 2048 target clusters,
/// compactness 50, 10 clustering iterations with no early stop, and merge
/// complexity 25.
#[derive(Clone)]
pub struct Config {
    /// Target number of clusters (_K_). The realized count is `K` rounded
    /// down to a cubic lattice of `S * S * S` centers, `S = floor(cbrt(K))`,
    /// further reduced by centers that would fall outside the volume. This
    /// directly influences the grid intervals (`Sxy = width / S`,
    /// `Sz = depth / S`), which are also the per-axis search window radii.
    pub num_of_clusters: u32,
    /// Upper bound on assignment + mean-update passes done by `slic::iterate()`.
    ///
    /// One pass only improves the per-voxel distances locally; there is no
    /// built-in convergence guarantee, so the loop is bounded.
    pub max_iterations: u16,
    /// Compactness control (_m_). Higher means the grey-level term weighs
    /// less against the spatial term -> more compact, more regular clusters.
    ///
    /// This setting does not affect performance.
    pub compactness: f32,
    /// Optional early stop for `slic::iterate()`: when the decrease of the
    /// total distortion (sum of the finite per-voxel best distances) between
    /// two consecutive passes is not larger than this value, the loop ends
    /// before `max_iterations`.
    pub distortion_threshold: Option<f64>,
    /// Region merging complexity (_Q_). Scales the statistical merge bound:
    /// larger values make the predicate stricter, keeping more regions;
    /// smaller values merge more aggressively.
    pub merge_complexity: f32,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            num_of_clusters: 2048,
            max_iterations: 10,
            compactness: 50f32,
            distortion_threshold: None,
            merge_complexity: 25f32,
        }
    }
}

pub(crate) fn split_length_to_ranges(length: usize, splits: usize) -> Vec<Range<usize>> {
    let chunk_size = length / splits;
    let rem = length % splits;
    (0..splits)
        .scan((rem, 0usize), |(r, acc), _split| {
            let mut size = chunk_size;
            if *r > 0 {
                *r -= 1;
                size += 1;
            }
            let out = (*acc, *acc + size);
            *acc += size;
            Some(out.0..out.1)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::split_length_to_ranges;

    #[test]
    fn split_length_to_ranges_test() {
        let ranges = split_length_to_ranges(10, 4);
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0], 0..3);
        assert_eq!(ranges[3], 8..10);
        assert_eq!(ranges.iter().map(|r| r.len()).sum::<usize>(), 10);
    }
}
