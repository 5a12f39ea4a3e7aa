//! Gradient based minimization of scalar objectives.
//!
//! [`Lbfgs`] implements the limited memory BFGS method with a backtracking
//! line search. It only calls [`Objective::value_and_derivative`], so every
//! metric variant can be minimized with it.

use std::collections::VecDeque;

use thiserror::Error;

use crate::error::GmmError;

/// A differentiable scalar function of a parameter vector.
pub trait Objective {
    /// Number of parameters the objective expects.
    fn num_parameters(&self) -> usize;

    /// Evaluate the objective.
    fn value(&mut self, parameters: &[f64]) -> Result<f64, GmmError>;

    /// Evaluate the gradient of the objective.
    fn derivative(&mut self, parameters: &[f64]) -> Result<Vec<f64>, GmmError>;

    /// Evaluate the objective and its gradient in one pass.
    fn value_and_derivative(&mut self, parameters: &[f64]) -> Result<(f64, Vec<f64>), GmmError>;
}

/// Errors that can occur during minimization.
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// The objective failed to evaluate
    #[error("Objective evaluation failed: {0}")]
    Objective(#[from] GmmError),

    /// Numerical instability detected
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    /// The parameter scales do not match the parameter count
    #[error("Invalid parameter scales: expected {expected} positive values, got {actual}")]
    InvalidScales {
        /// Number of parameters of the objective.
        expected: usize,
        /// Number of scales provided.
        actual: usize,
    },
}

/// Reason why the minimizer terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Converged: gradient norm below tolerance
    GradientConverged,
    /// Converged: relative cost change below tolerance
    CostConverged,
    /// Converged: step length below tolerance
    StepConverged,
    /// Maximum iterations reached
    MaxIterations,
    /// Maximum objective evaluations reached
    MaxEvaluations,
    /// No step along the search direction decreased the cost
    LineSearchFailed,
}

/// Result of a minimization run.
#[derive(Debug, Clone)]
pub struct OptimizerResult {
    /// Best parameters found
    pub parameters: Vec<f64>,
    /// Objective value at `parameters`
    pub value: f64,
    /// Number of iterations performed
    pub iterations: usize,
    /// Number of objective evaluations
    pub evaluations: usize,
    /// Reason for termination
    pub termination_reason: TerminationReason,
}

/// A black-box minimizer.
pub trait Minimizer {
    /// Minimize `objective` starting from `initial`.
    fn minimize(
        &self,
        objective: &mut dyn Objective,
        initial: &[f64],
    ) -> Result<OptimizerResult, OptimizerError>;
}

/// L-BFGS minimizer configuration.
///
/// The search runs in scaled coordinates `parameters[i] * scales[i]`, which
/// lets parameters of different units (angles and translations) share one
/// step length.
#[derive(Debug, Clone)]
pub struct Lbfgs {
    /// Number of correction pairs kept
    pub memory: usize,
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Maximum number of objective evaluations
    pub max_evaluations: usize,
    /// Convergence threshold for the scaled gradient norm
    pub gradient_tolerance: f64,
    /// Convergence threshold for the relative cost change
    pub cost_tolerance: f64,
    /// Optional per-parameter scales, all ones if `None`
    pub scales: Option<Vec<f64>>,
    /// Log every iteration at info level
    pub trace: bool,
}

impl Default for Lbfgs {
    fn default() -> Self {
        Self {
            memory: 10,
            max_iterations: 1000,
            max_evaluations: 2500,
            gradient_tolerance: 1e-8,
            cost_tolerance: 1e-12,
            scales: None,
            trace: false,
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

struct Correction {
    s: Vec<f64>,
    y: Vec<f64>,
    rho: f64,
}

// objective wrapper working in scaled coordinates
struct ScaledObjective<'o> {
    objective: &'o mut dyn Objective,
    scales: Vec<f64>,
    evaluations: usize,
}

impl ScaledObjective<'_> {
    fn unscale(&self, scaled: &[f64]) -> Vec<f64> {
        scaled.iter().zip(&self.scales).map(|(y, s)| y / s).collect()
    }

    fn evaluate(&mut self, scaled: &[f64]) -> Result<(f64, Vec<f64>), OptimizerError> {
        let parameters = self.unscale(scaled);
        let (value, gradient) = self.objective.value_and_derivative(&parameters)?;
        self.evaluations += 1;

        if !value.is_finite() {
            return Err(OptimizerError::NumericalInstability(format!(
                "non-finite objective value {value}"
            )));
        }
        if gradient.iter().any(|g| !g.is_finite()) {
            return Err(OptimizerError::NumericalInstability(
                "non-finite gradient".to_string(),
            ));
        }

        let gradient = gradient
            .iter()
            .zip(&self.scales)
            .map(|(g, s)| g / s)
            .collect();
        Ok((value, gradient))
    }
}

impl Lbfgs {
    /// Minimum step norm threshold. Steps smaller than this are considered zero.
    const STEP_SIZE_TOLERANCE: f64 = 1e-12;

    /// Sufficient decrease constant of the Armijo condition.
    const ARMIJO: f64 = 1e-4;

    fn search_direction(gradient: &[f64], history: &VecDeque<Correction>) -> Vec<f64> {
        let mut q = gradient.to_vec();
        let mut alphas = vec![0.0; history.len()];

        for (correction, alpha) in history.iter().zip(alphas.iter_mut()).rev() {
            *alpha = correction.rho * dot(&correction.s, &q);
            for (qi, yi) in q.iter_mut().zip(&correction.y) {
                *qi -= *alpha * yi;
            }
        }

        if let Some(last) = history.back() {
            let gamma = dot(&last.s, &last.y) / dot(&last.y, &last.y);
            q.iter_mut().for_each(|qi| *qi *= gamma);
        }

        for (correction, alpha) in history.iter().zip(alphas.iter()) {
            let beta = correction.rho * dot(&correction.y, &q);
            for (qi, si) in q.iter_mut().zip(&correction.s) {
                *qi += si * (alpha - beta);
            }
        }

        q.iter_mut().for_each(|qi| *qi = -*qi);
        q
    }
}

impl Minimizer for Lbfgs {
    fn minimize(
        &self,
        objective: &mut dyn Objective,
        initial: &[f64],
    ) -> Result<OptimizerResult, OptimizerError> {
        let n = objective.num_parameters();
        if initial.len() != n {
            return Err(GmmError::ParameterSizeMismatch {
                expected: n,
                actual: initial.len(),
            }
            .into());
        }

        let scales = match &self.scales {
            Some(scales) => {
                if scales.len() != n || scales.iter().any(|s| !(*s > 0.0 && s.is_finite())) {
                    return Err(OptimizerError::InvalidScales {
                        expected: n,
                        actual: scales.len(),
                    });
                }
                scales.clone()
            }
            None => vec![1.0; n],
        };

        let mut scaled = ScaledObjective {
            objective,
            scales,
            evaluations: 0,
        };

        let mut x = initial
            .iter()
            .zip(&scaled.scales)
            .map(|(p, s)| p * s)
            .collect::<Vec<_>>();
        let (mut value, mut gradient) = scaled.evaluate(&x)?;

        let mut history: VecDeque<Correction> = VecDeque::with_capacity(self.memory);
        let mut iterations = 0;

        let termination_reason = loop {
            let gradient_norm = norm(&gradient);
            if gradient_norm <= self.gradient_tolerance {
                break TerminationReason::GradientConverged;
            }

            if iterations >= self.max_iterations {
                break TerminationReason::MaxIterations;
            }

            let mut direction = Self::search_direction(&gradient, &history);
            let mut slope = dot(&direction, &gradient);
            if !(slope < 0.0) {
                // not a descent direction, restart from steepest descent
                history.clear();
                direction = gradient.iter().map(|g| -g).collect();
                slope = -gradient_norm * gradient_norm;
            }

            let direction_norm = norm(&direction);
            let mut step = if history.is_empty() {
                (1.0 / direction_norm).min(1.0)
            } else {
                1.0
            };

            let accepted = loop {
                if scaled.evaluations >= self.max_evaluations {
                    break None;
                }

                let candidate = x
                    .iter()
                    .zip(&direction)
                    .map(|(xi, di)| xi + step * di)
                    .collect::<Vec<_>>();
                let (candidate_value, candidate_gradient) = scaled.evaluate(&candidate)?;

                if candidate_value <= value + Self::ARMIJO * step * slope {
                    break Some((candidate, candidate_value, candidate_gradient));
                }

                step *= 0.5;
                if step * direction_norm < Self::STEP_SIZE_TOLERANCE {
                    break None;
                }
            };

            let Some((candidate, candidate_value, candidate_gradient)) = accepted else {
                if scaled.evaluations >= self.max_evaluations {
                    break TerminationReason::MaxEvaluations;
                }
                break TerminationReason::LineSearchFailed;
            };

            iterations += 1;

            let s = candidate
                .iter()
                .zip(&x)
                .map(|(a, b)| a - b)
                .collect::<Vec<_>>();
            let y = candidate_gradient
                .iter()
                .zip(&gradient)
                .map(|(a, b)| a - b)
                .collect::<Vec<_>>();
            let sy = dot(&s, &y);
            if sy > f64::EPSILON * norm(&s) * norm(&y) && sy > 0.0 {
                if history.len() == self.memory {
                    history.pop_front();
                }
                if self.memory > 0 {
                    history.push_back(Correction { s: s.clone(), y, rho: 1.0 / sy });
                }
            }

            let previous_value = value;
            x = candidate;
            value = candidate_value;
            gradient = candidate_gradient;

            if self.trace {
                log::info!(
                    "lbfgs iteration {iterations}: value {value:.6e}, gradient norm {:.3e}, step {step:.3e}",
                    norm(&gradient)
                );
            } else {
                log::trace!("lbfgs iteration {iterations}: value {value:.6e}");
            }

            let cost_change = (previous_value - value).abs();
            let cost_scale = previous_value.abs().max(value.abs()).max(1.0);
            if cost_change <= self.cost_tolerance * cost_scale {
                break TerminationReason::CostConverged;
            }

            if norm(&s) <= Self::STEP_SIZE_TOLERANCE * norm(&x).max(1.0) {
                break TerminationReason::StepConverged;
            }

            if scaled.evaluations >= self.max_evaluations {
                break TerminationReason::MaxEvaluations;
            }
        };

        log::debug!(
            "lbfgs finished after {iterations} iterations and {} evaluations: {termination_reason:?}",
            scaled.evaluations
        );

        Ok(OptimizerResult {
            parameters: scaled.unscale(&x),
            value,
            iterations,
            evaluations: scaled.evaluations,
            termination_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // f(x) = Σ a_i (x_i - c_i)²
    struct Quadratic {
        weights: Vec<f64>,
        center: Vec<f64>,
    }

    impl Objective for Quadratic {
        fn num_parameters(&self) -> usize {
            self.center.len()
        }

        fn value(&mut self, parameters: &[f64]) -> Result<f64, GmmError> {
            Ok(self.value_and_derivative(parameters)?.0)
        }

        fn derivative(&mut self, parameters: &[f64]) -> Result<Vec<f64>, GmmError> {
            Ok(self.value_and_derivative(parameters)?.1)
        }

        fn value_and_derivative(
            &mut self,
            parameters: &[f64],
        ) -> Result<(f64, Vec<f64>), GmmError> {
            let mut value = 0.0;
            let mut gradient = Vec::with_capacity(parameters.len());
            for ((p, c), a) in parameters.iter().zip(&self.center).zip(&self.weights) {
                value += a * (p - c) * (p - c);
                gradient.push(2.0 * a * (p - c));
            }
            Ok((value, gradient))
        }
    }

    struct Rosenbrock;

    impl Objective for Rosenbrock {
        fn num_parameters(&self) -> usize {
            2
        }

        fn value(&mut self, parameters: &[f64]) -> Result<f64, GmmError> {
            Ok(self.value_and_derivative(parameters)?.0)
        }

        fn derivative(&mut self, parameters: &[f64]) -> Result<Vec<f64>, GmmError> {
            Ok(self.value_and_derivative(parameters)?.1)
        }

        fn value_and_derivative(
            &mut self,
            parameters: &[f64],
        ) -> Result<(f64, Vec<f64>), GmmError> {
            let (x, y) = (parameters[0], parameters[1]);
            let value = (1.0 - x).powi(2) + 100.0 * (y - x * x).powi(2);
            let gradient = vec![
                -2.0 * (1.0 - x) - 400.0 * x * (y - x * x),
                200.0 * (y - x * x),
            ];
            Ok((value, gradient))
        }
    }

    struct Failing(Result<(f64, Vec<f64>), GmmError>);

    impl Objective for Failing {
        fn num_parameters(&self) -> usize {
            1
        }

        fn value(&mut self, _parameters: &[f64]) -> Result<f64, GmmError> {
            Err(GmmError::NotSupported("value"))
        }

        fn derivative(&mut self, _parameters: &[f64]) -> Result<Vec<f64>, GmmError> {
            Err(GmmError::NotSupported("derivative"))
        }

        fn value_and_derivative(
            &mut self,
            _parameters: &[f64],
        ) -> Result<(f64, Vec<f64>), GmmError> {
            self.0.clone()
        }
    }

    #[test]
    fn test_quadratic_converges() -> Result<(), Box<dyn std::error::Error>> {
        let mut objective = Quadratic {
            weights: vec![1.0, 10.0, 100.0],
            center: vec![0.5, -2.0, 3.0],
        };

        let result = Lbfgs::default().minimize(&mut objective, &[0.0, 0.0, 0.0])?;

        assert!(matches!(
            result.termination_reason,
            TerminationReason::GradientConverged
                | TerminationReason::CostConverged
                | TerminationReason::StepConverged
        ));
        assert_relative_eq!(result.parameters[0], 0.5, epsilon = 1e-4);
        assert_relative_eq!(result.parameters[1], -2.0, epsilon = 1e-4);
        assert_relative_eq!(result.parameters[2], 3.0, epsilon = 1e-4);
        assert!(result.value < 1e-9);
        Ok(())
    }

    #[test]
    fn test_scaled_quadratic_converges() -> Result<(), Box<dyn std::error::Error>> {
        // well conditioned only in scaled coordinates
        let mut objective = Quadratic {
            weights: vec![1e-4, 1e4],
            center: vec![100.0, 0.01],
        };

        let optimizer = Lbfgs {
            scales: Some(vec![0.01, 100.0]),
            ..Default::default()
        };
        let result = optimizer.minimize(&mut objective, &[0.0, 0.0])?;

        assert_relative_eq!(result.parameters[0], 100.0, epsilon = 1e-4);
        assert_relative_eq!(result.parameters[1], 0.01, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn test_already_optimal() -> Result<(), Box<dyn std::error::Error>> {
        let mut objective = Quadratic {
            weights: vec![1.0],
            center: vec![2.0],
        };

        let result = Lbfgs::default().minimize(&mut objective, &[2.0])?;
        assert_eq!(result.termination_reason, TerminationReason::GradientConverged);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.evaluations, 1);
        assert_eq!(result.parameters, vec![2.0]);
        Ok(())
    }

    #[test]
    fn test_rosenbrock() -> Result<(), Box<dyn std::error::Error>> {
        let result = Lbfgs::default().minimize(&mut Rosenbrock, &[-1.2, 1.0])?;
        assert_relative_eq!(result.parameters[0], 1.0, epsilon = 1e-3);
        assert_relative_eq!(result.parameters[1], 1.0, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn test_budget_exhaustion() -> Result<(), Box<dyn std::error::Error>> {
        let initial = [-1.2, 1.0];
        let initial_value = Rosenbrock.value(&initial)?;

        let optimizer = Lbfgs {
            max_iterations: 2,
            ..Default::default()
        };
        let result = optimizer.minimize(&mut Rosenbrock, &initial)?;
        assert_eq!(result.termination_reason, TerminationReason::MaxIterations);
        assert_eq!(result.iterations, 2);
        assert!(result.value < initial_value);

        let optimizer = Lbfgs {
            max_evaluations: 5,
            ..Default::default()
        };
        let result = optimizer.minimize(&mut Rosenbrock, &initial)?;
        assert_eq!(result.termination_reason, TerminationReason::MaxEvaluations);
        assert!(result.evaluations <= 5);
        assert!(result.value <= initial_value);
        Ok(())
    }

    #[test]
    fn test_non_finite_objective() {
        let mut objective = Failing(Ok((f64::NAN, vec![0.0])));
        let result = Lbfgs::default().minimize(&mut objective, &[0.0]);
        assert!(matches!(
            result,
            Err(OptimizerError::NumericalInstability(_))
        ));

        let mut objective = Failing(Ok((1.0, vec![f64::INFINITY])));
        let result = Lbfgs::default().minimize(&mut objective, &[0.0]);
        assert!(matches!(
            result,
            Err(OptimizerError::NumericalInstability(_))
        ));
    }

    #[test]
    fn test_objective_error_is_propagated() {
        let mut objective = Failing(Err(GmmError::NotInitialized));
        let result = Lbfgs::default().minimize(&mut objective, &[0.0]);
        assert!(matches!(
            result,
            Err(OptimizerError::Objective(GmmError::NotInitialized))
        ));
    }

    #[test]
    fn test_invalid_scales() {
        let mut objective = Quadratic {
            weights: vec![1.0, 1.0],
            center: vec![0.0, 0.0],
        };

        let optimizer = Lbfgs {
            scales: Some(vec![1.0]),
            ..Default::default()
        };
        let result = optimizer.minimize(&mut objective, &[1.0, 1.0]);
        assert!(matches!(
            result,
            Err(OptimizerError::InvalidScales {
                expected: 2,
                actual: 1
            })
        ));

        let optimizer = Lbfgs {
            scales: Some(vec![1.0, 0.0]),
            ..Default::default()
        };
        assert!(optimizer.minimize(&mut objective, &[1.0, 1.0]).is_err());

        let result = Lbfgs::default().minimize(&mut objective, &[1.0]);
        assert!(matches!(
            result,
            Err(OptimizerError::Objective(GmmError::ParameterSizeMismatch { .. }))
        ));
    }
}
