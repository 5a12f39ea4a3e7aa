use rayon::prelude::*;

use super::{squared_distance, GaussianKernel, KernelSum, LocalEvaluation};

fn kernel_sum(kernel: &GaussianKernel, x: &[f64; 3], others: &[[f64; 3]]) -> KernelSum {
    let mut sum = KernelSum::default();
    for y in others {
        sum.accumulate(kernel, x, y, squared_distance(x, y));
    }
    sum
}

/// Contribution of one transformed point `x` to the L2 distance
/// `(1/Nm²) ΣΣ w(x, x') - (2/(Nf Nm)) ΣΣ w(f, x)` and its gradient.
pub(super) fn l2_contribution(
    kernel: &GaussianKernel,
    fixed_sum: &KernelSum,
    moving_sum: &KernelSum,
    num_fixed: usize,
    num_moving: usize,
) -> (f64, [f64; 3]) {
    let cross_norm = 2.0 / (num_fixed as f64 * num_moving as f64);
    let self_norm = 1.0 / (num_moving as f64 * num_moving as f64);
    let factor = kernel.gradient_factor();

    let value = self_norm * moving_sum.weight - cross_norm * fixed_sum.weight;

    // x appears on both sides of the moving/moving double sum
    let mut gradient = [0.0; 3];
    for (k, g) in gradient.iter_mut().enumerate() {
        *g = factor
            * (2.0 * self_norm * moving_sum.weighted_offset[k]
                - cross_norm * fixed_sum.weighted_offset[k]);
    }

    (value, gradient)
}

/// Negated cross correlation `-(1/(Nf Nm)) ΣΣ w(f, x)`.
pub(super) fn l2_rigid(
    fixed: &[[f64; 3]],
    transformed: &[[f64; 3]],
    kernel: &GaussianKernel,
) -> LocalEvaluation {
    let norm = 1.0 / (fixed.len() as f64 * transformed.len() as f64);
    let factor = kernel.gradient_factor();

    let contributions = transformed
        .par_iter()
        .map(|x| {
            let sum = kernel_sum(kernel, x, fixed);
            let gradient = sum.weighted_offset.map(|o| -norm * factor * o);
            (-norm * sum.weight, gradient)
        })
        .collect();

    LocalEvaluation::from_contributions(contributions)
}

/// Moving dependent part of the exact L2 distance, all pairs.
pub(super) fn l2(
    fixed: &[[f64; 3]],
    transformed: &[[f64; 3]],
    kernel: &GaussianKernel,
) -> LocalEvaluation {
    let contributions = transformed
        .par_iter()
        .map(|x| {
            let fixed_sum = kernel_sum(kernel, x, fixed);
            let moving_sum = kernel_sum(kernel, x, transformed);
            l2_contribution(kernel, &fixed_sum, &moving_sum, fixed.len(), transformed.len())
        })
        .collect();

    LocalEvaluation::from_contributions(contributions)
}

/// Constant fixed/fixed term `(1/Nf²) ΣΣ w(f, f')`.
pub(super) fn fixed_self_term(fixed: &[[f64; 3]], kernel: &GaussianKernel) -> f64 {
    let norm = 1.0 / (fixed.len() as f64 * fixed.len() as f64);
    fixed
        .par_iter()
        .map(|f| norm * kernel_sum(kernel, f, fixed).weight)
        .collect::<Vec<_>>()
        .into_iter()
        .sum()
}
