use rayon::prelude::*;

use super::{squared_distance, GaussianKernel, LocalEvaluation};

/// Floor added to every mixture density so the logarithm stays finite.
const EPSILON: f64 = 1e-5;

/// Negative log-likelihood `-Σ_i log(ε + Σ_j w(f_i, x_j))` of the fixed
/// points under the mixture centred at the transformed moving points.
pub(super) fn mle(
    fixed: &[[f64; 3]],
    transformed: &[[f64; 3]],
    kernel: &GaussianKernel,
) -> LocalEvaluation {
    let densities = fixed
        .par_iter()
        .map(|f| {
            EPSILON
                + transformed
                    .iter()
                    .map(|x| kernel.weight(squared_distance(f, x)))
                    .sum::<f64>()
        })
        .collect::<Vec<_>>();

    let value = -densities.iter().map(|s| s.ln()).sum::<f64>();

    let factor = kernel.gradient_factor();
    let gradients = transformed
        .par_iter()
        .map(|x| {
            let mut gradient = [0.0; 3];
            for (f, s) in fixed.iter().zip(densities.iter()) {
                let w = kernel.weight(squared_distance(x, f)) / s;
                gradient[0] -= factor * w * (x[0] - f[0]);
                gradient[1] -= factor * w * (x[1] - f[1]);
                gradient[2] -= factor * w * (x[2] - f[2]);
            }
            gradient
        })
        .collect();

    LocalEvaluation { value, gradients }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mle_single_pair() {
        let kernel = GaussianKernel::new(1.0);
        let fixed = [[0.0, 0.0, 0.0]];
        let transformed = [[0.0, 0.0, 2.0]];

        let local = mle(&fixed, &transformed, &kernel);
        let s = EPSILON + (-2.0f64).exp();
        assert_relative_eq!(local.value, -s.ln(), epsilon = 1e-12);

        // moving towards the fixed point lowers the value
        assert!(local.gradients[0][2] > 0.0);
        assert_relative_eq!(
            local.gradients[0][2],
            2.0 * (-2.0f64).exp() / s,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_mle_far_points_are_finite() {
        let kernel = GaussianKernel::new(0.1);
        let fixed = [[0.0, 0.0, 0.0]];
        let transformed = [[100.0, 0.0, 0.0]];

        let local = mle(&fixed, &transformed, &kernel);
        assert_relative_eq!(local.value, -EPSILON.ln(), epsilon = 1e-12);
        assert!(local.gradients[0][0].is_finite());
    }
}
