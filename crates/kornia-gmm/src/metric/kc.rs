use rayon::prelude::*;

use super::{l2::l2_contribution, squared_distance, GaussianKernel, KernelSum, LocalEvaluation};
use crate::locator::PointsLocator;

fn fixed_neighbors_sum(
    kernel: &GaussianKernel,
    x: &[f64; 3],
    fixed: &[[f64; 3]],
    locator: &PointsLocator,
    radius: f64,
) -> KernelSum {
    let mut sum = KernelSum::default();
    for (idx, d2) in locator.within(x, radius) {
        sum.accumulate(kernel, x, &fixed[idx], d2);
    }
    sum
}

/// Truncated L2 distance. Pairs further apart than `radius` are dropped.
///
/// The fixed neighbours come from the KD-tree, the moving neighbours are
/// found by a linear scan since the moving positions change on every call.
pub(super) fn kc(
    fixed: &[[f64; 3]],
    transformed: &[[f64; 3]],
    locator: &PointsLocator,
    radius: f64,
    kernel: &GaussianKernel,
) -> LocalEvaluation {
    let radius_sq = radius * radius;

    let contributions = transformed
        .par_iter()
        .map(|x| {
            let fixed_sum = fixed_neighbors_sum(kernel, x, fixed, locator, radius);

            let mut moving_sum = KernelSum::default();
            for y in transformed {
                let d2 = squared_distance(x, y);
                if d2 <= radius_sq {
                    moving_sum.accumulate(kernel, x, y, d2);
                }
            }

            l2_contribution(kernel, &fixed_sum, &moving_sum, fixed.len(), transformed.len())
        })
        .collect();

    LocalEvaluation::from_contributions(contributions)
}

/// Truncated fixed/fixed term `(1/Nf²) ΣΣ w(f, f')`.
pub(super) fn fixed_self_term(
    fixed: &[[f64; 3]],
    locator: &PointsLocator,
    radius: f64,
    kernel: &GaussianKernel,
) -> f64 {
    let norm = 1.0 / (fixed.len() as f64 * fixed.len() as f64);
    fixed
        .par_iter()
        .map(|f| norm * fixed_neighbors_sum(kernel, f, fixed, locator, radius).weight)
        .collect::<Vec<_>>()
        .into_iter()
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::l2;
    use approx::assert_relative_eq;

    #[test]
    fn test_kc_drops_far_pairs() {
        let kernel = GaussianKernel::new(1.0);
        let fixed = [[0.0, 0.0, 0.0], [10.0, 0.0, 0.0]];
        let transformed = [[0.5, 0.0, 0.0]];
        let locator = PointsLocator::new(&fixed);

        let local = kc(&fixed, &transformed, &locator, 3.0, &kernel);

        // only the first fixed point is within reach
        let w = (-0.125f64).exp();
        assert_relative_eq!(local.value, 1.0 - w, epsilon = 1e-12);
        assert_relative_eq!(local.gradients[0][0], 0.5 * w, epsilon = 1e-12);

        let self_term = fixed_self_term(&fixed, &locator, 3.0, &kernel);
        assert_relative_eq!(self_term, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_kc_large_radius_matches_l2() {
        let kernel = GaussianKernel::new(0.8);
        let fixed = [[0.0, 0.0, 0.0], [1.0, 0.5, 0.0], [0.2, -0.4, 0.9]];
        let transformed = [[0.1, 0.1, 0.0], [0.9, 0.4, 0.2]];
        let locator = PointsLocator::new(&fixed);

        let truncated = kc(&fixed, &transformed, &locator, 100.0, &kernel);
        let exact = l2::l2(&fixed, &transformed, &kernel);

        assert_relative_eq!(truncated.value, exact.value, epsilon = 1e-12);
        for (a, b) in truncated.gradients.iter().zip(exact.gradients.iter()) {
            for k in 0..3 {
                assert_relative_eq!(a[k], b[k], epsilon = 1e-12);
            }
        }
        assert_relative_eq!(
            fixed_self_term(&fixed, &locator, 100.0, &kernel),
            l2::fixed_self_term(&fixed, &kernel),
            epsilon = 1e-12
        );
    }
}
