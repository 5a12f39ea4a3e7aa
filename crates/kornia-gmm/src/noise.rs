use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::{error::GmmError, pointset::PointSet, transform::Transform};

// Mixed into the seed of the noise generator so that it does not replay the
// stream used for the transform parameters.
const NOISE_STREAM: u64 = 0x9e37_79b9_7f4a_7c15;

/// Randomly transformed copy of a point set.
#[derive(Debug, Clone, PartialEq)]
pub struct NoisyPointSet {
    /// The transformed and perturbed points
    pub points: PointSet,
    /// The sampled transform parameters
    pub parameters: Vec<f64>,
}

/// Generates randomly transformed and noisy copies of a point set.
///
/// Every transform parameter is drawn uniformly from its bounds, then
/// isotropic Gaussian noise with standard deviation `std_dev` is added to
/// each coordinate. Two filters with the same configuration produce
/// bit-identical outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomTransformFilter {
    /// Lower bound of every transform parameter
    pub lower_bounds: Vec<f64>,
    /// Upper bound of every transform parameter
    pub upper_bounds: Vec<f64>,
    /// Standard deviation of the coordinate noise
    pub std_dev: f64,
    /// Seed of the random generators
    pub seed: u64,
}

impl RandomTransformFilter {
    /// Create a filter without noise.
    pub fn new(lower_bounds: Vec<f64>, upper_bounds: Vec<f64>, seed: u64) -> Self {
        Self {
            lower_bounds,
            upper_bounds,
            std_dev: 0.0,
            seed,
        }
    }

    /// Set the standard deviation of the coordinate noise.
    pub fn with_std_dev(mut self, std_dev: f64) -> Self {
        self.std_dev = std_dev;
        self
    }

    fn validate(&self, num_parameters: usize) -> Result<(), GmmError> {
        for bounds in [&self.lower_bounds, &self.upper_bounds] {
            if bounds.len() != num_parameters {
                return Err(GmmError::ParameterSizeMismatch {
                    expected: num_parameters,
                    actual: bounds.len(),
                });
            }
        }

        for (n, (lower, upper)) in self
            .lower_bounds
            .iter()
            .zip(&self.upper_bounds)
            .enumerate()
        {
            if !(lower.is_finite() && upper.is_finite() && lower <= upper) {
                return Err(GmmError::InvalidNoiseConfig(format!(
                    "invalid bounds [{lower}, {upper}] for parameter {n}"
                )));
            }
        }

        if !(self.std_dev >= 0.0 && self.std_dev.is_finite()) {
            return Err(GmmError::InvalidNoiseConfig(format!(
                "invalid standard deviation {}",
                self.std_dev
            )));
        }

        Ok(())
    }

    /// Apply a random transform to `point_set`.
    ///
    /// The sampled parameters are left in `transform`.
    ///
    /// # Errors
    ///
    /// Returns [`GmmError::ParameterSizeMismatch`] if the bounds do not match
    /// the transform and [`GmmError::InvalidNoiseConfig`] if a lower bound
    /// exceeds its upper bound or the standard deviation is negative.
    pub fn apply(
        &self,
        point_set: &PointSet,
        transform: &mut dyn Transform,
    ) -> Result<NoisyPointSet, GmmError> {
        self.validate(transform.num_parameters())?;

        let mut rng = StdRng::seed_from_u64(self.seed);
        let parameters = self
            .lower_bounds
            .iter()
            .zip(&self.upper_bounds)
            .map(|(&lower, &upper)| rng.random_range(lower..=upper))
            .collect::<Vec<f64>>();
        transform.set_parameters(&parameters)?;

        let mut points = point_set
            .points()
            .iter()
            .map(|p| transform.transform_point(p))
            .collect::<Vec<_>>();

        if self.std_dev > f64::EPSILON {
            let normal = Normal::new(0.0, self.std_dev)
                .map_err(|e| GmmError::InvalidNoiseConfig(e.to_string()))?;
            let mut rng = StdRng::seed_from_u64(self.seed ^ NOISE_STREAM);
            for point in points.iter_mut() {
                for coordinate in point.iter_mut() {
                    *coordinate += normal.sample(&mut rng);
                }
            }
        }

        log::debug!(
            "{} applied to {} points with parameters {:?}",
            transform.name(),
            points.len(),
            parameters
        );

        Ok(NoisyPointSet {
            points: PointSet::new(points),
            parameters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{Euler3dTransform, TranslationTransform};
    use approx::assert_relative_eq;

    fn cube() -> PointSet {
        let mut points = Vec::new();
        for x in [-1.0, 1.0] {
            for y in [-1.0, 1.0] {
                for z in [-1.0, 1.0] {
                    points.push([x, y, z]);
                }
            }
        }
        PointSet::new(points)
    }

    fn rigid_filter(seed: u64) -> RandomTransformFilter {
        RandomTransformFilter::new(
            vec![-0.2, -0.2, -0.2, -1.0, -1.0, -1.0],
            vec![0.2, 0.2, 0.2, 1.0, 1.0, 1.0],
            seed,
        )
    }

    #[test]
    fn test_same_seed_is_deterministic() -> Result<(), Box<dyn std::error::Error>> {
        let filter = rigid_filter(42).with_std_dev(0.05);

        let mut transform = Euler3dTransform::new([0.0; 3]);
        let first = filter.apply(&cube(), &mut transform)?;
        let mut transform = Euler3dTransform::new([0.0; 3]);
        let second = filter.apply(&cube(), &mut transform)?;
        assert_eq!(first, second);

        let mut transform = Euler3dTransform::new([0.0; 3]);
        let other = rigid_filter(43).with_std_dev(0.05).apply(&cube(), &mut transform)?;
        assert_ne!(first.parameters, other.parameters);
        Ok(())
    }

    #[test]
    fn test_parameters_within_bounds() -> Result<(), Box<dyn std::error::Error>> {
        for seed in 0..20 {
            let filter = rigid_filter(seed);
            let mut transform = Euler3dTransform::new([0.0; 3]);
            let result = filter.apply(&cube(), &mut transform)?;
            assert_eq!(transform.parameters(), result.parameters.as_slice());
            for ((p, lower), upper) in result
                .parameters
                .iter()
                .zip(&filter.lower_bounds)
                .zip(&filter.upper_bounds)
            {
                assert!(lower <= p && p <= upper);
            }
        }
        Ok(())
    }

    #[test]
    fn test_zero_noise_is_exact() -> Result<(), Box<dyn std::error::Error>> {
        let filter = rigid_filter(7);
        let mut transform = Euler3dTransform::new([0.0; 3]);
        let result = filter.apply(&cube(), &mut transform)?;

        let expected = cube().transformed(&transform);
        assert_eq!(result.points, expected);
        Ok(())
    }

    #[test]
    fn test_noise_level() -> Result<(), Box<dyn std::error::Error>> {
        let points = PointSet::new(vec![[0.0; 3]; 10_000]);
        let filter = RandomTransformFilter::new(vec![0.0; 3], vec![0.0; 3], 3).with_std_dev(0.5);
        let mut transform = TranslationTransform::new();
        let result = filter.apply(&points, &mut transform)?;

        let coordinates = result.points.points().iter().flatten().collect::<Vec<_>>();
        let n = coordinates.len() as f64;
        let mean = coordinates.iter().copied().sum::<f64>() / n;
        let variance = coordinates.iter().map(|c| (*c - mean).powi(2)).sum::<f64>() / n;
        assert_relative_eq!(mean, 0.0, epsilon = 0.02);
        assert_relative_eq!(variance.sqrt(), 0.5, epsilon = 0.02);
        Ok(())
    }

    #[test]
    fn test_invalid_configuration() {
        let mut transform = TranslationTransform::new();

        let filter = RandomTransformFilter::new(vec![0.0; 2], vec![1.0; 3], 0);
        assert_eq!(
            filter.apply(&cube(), &mut transform),
            Err(GmmError::ParameterSizeMismatch {
                expected: 3,
                actual: 2
            })
        );

        let filter = RandomTransformFilter::new(vec![0.0, 2.0, 0.0], vec![1.0; 3], 0);
        assert!(matches!(
            filter.apply(&cube(), &mut transform),
            Err(GmmError::InvalidNoiseConfig(_))
        ));

        let filter = RandomTransformFilter::new(vec![0.0; 3], vec![1.0; 3], 0).with_std_dev(-1.0);
        assert!(matches!(
            filter.apply(&cube(), &mut transform),
            Err(GmmError::InvalidNoiseConfig(_))
        ));
    }
}
