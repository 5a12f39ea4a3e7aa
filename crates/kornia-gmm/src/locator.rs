use kiddo::immutable::float::kdtree::ImmutableKdTree;
use kiddo::SquaredEuclidean;

/// Bucket size for the KD-tree.
///
/// Surface samples from meshes often share coordinates along one axis, which
/// needs larger leaves than the kiddo default.
const BUCKET_SIZE: usize = 256;

/// Radius search structure over a snapshot of point positions.
///
/// The tree indexes the positions it was built from. It must be rebuilt if
/// those positions change.
pub struct PointsLocator {
    kdtree: ImmutableKdTree<f64, u32, 3, BUCKET_SIZE>,
}

impl PointsLocator {
    /// Build the locator. The item of each entry is its index in `points`.
    pub fn new(points: &[[f64; 3]]) -> Self {
        Self {
            kdtree: ImmutableKdTree::new_from_slice(points),
        }
    }

    /// Find all points within `radius` of `query`.
    ///
    /// # Returns
    ///
    /// Pairs of (index, squared distance), in no particular order.
    pub fn within(&self, query: &[f64; 3], radius: f64) -> Vec<(usize, f64)> {
        self.kdtree
            .within_unsorted::<SquaredEuclidean>(query, radius * radius)
            .into_iter()
            .map(|nn| (nn.item as usize, nn.distance))
            .collect()
    }

    /// Get the number of indexed points.
    pub fn len(&self) -> usize {
        self.kdtree.size()
    }

    /// Check if the locator is empty.
    pub fn is_empty(&self) -> bool {
        self.kdtree.size() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_within() {
        let points = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 2.0, 0.0],
            [0.0, 0.0, 3.0],
        ];
        let locator = PointsLocator::new(&points);
        assert_eq!(locator.len(), 4);

        let mut found = locator.within(&[0.0, 0.0, 0.0], 1.5);
        found.sort_by_key(|(idx, _)| *idx);
        assert_eq!(found, vec![(0, 0.0), (1, 1.0)]);
    }

    #[test]
    fn test_within_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(7);
        let points = (0..500)
            .map(|_| {
                [
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-1.0..1.0),
                ]
            })
            .collect::<Vec<[f64; 3]>>();
        let locator = PointsLocator::new(&points);

        let query = [0.1, -0.2, 0.3];
        let radius = 0.4;
        let mut found = locator
            .within(&query, radius)
            .into_iter()
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();
        found.sort_unstable();

        let expected = points
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                (p[0] - query[0]).powi(2) + (p[1] - query[1]).powi(2) + (p[2] - query[2]).powi(2)
                    <= radius * radius
            })
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();

        assert_eq!(found, expected);
    }
}
