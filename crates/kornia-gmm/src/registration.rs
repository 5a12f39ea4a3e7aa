//! Coarse-to-fine registration over a schedule of kernel bandwidths.

use thiserror::Error;

use crate::{
    error::GmmError,
    metric::{GmmMetric, MetricType},
    optimizer::{Minimizer, Objective, OptimizerError, TerminationReason},
    pointset::compute_properties,
};

/// Errors that can occur during a multi-scale registration run.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The schedule has no levels
    #[error("The scale schedule is empty")]
    EmptySchedule,

    /// A schedule multiplier is not positive and finite
    #[error("Invalid scale multiplier {multiplier} at level {level}")]
    InvalidSchedule {
        /// Index of the offending level.
        level: usize,
        /// The offending multiplier.
        multiplier: f64,
    },

    /// The metric inputs are incomplete or invalid
    #[error("Registration setup failed: {0}")]
    Setup(#[source] GmmError),

    /// The metric could not be prepared for a level
    #[error("Failed to initialize the {metric} metric at level {level}: {source}")]
    Initialization {
        /// Index of the failing level.
        level: usize,
        /// The metric being minimized.
        metric: MetricType,
        /// The underlying error.
        source: GmmError,
    },

    /// The minimizer failed at a level
    #[error("Optimizer failed on the {metric} metric at level {level}: {source}")]
    OptimizerFailure {
        /// Index of the failing level.
        level: usize,
        /// The metric being minimized.
        metric: MetricType,
        /// The underlying error.
        source: OptimizerError,
    },
}

/// State of a [`MultiScaleRegistration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// No run has been started
    Idle,
    /// The run is minimizing the given level
    Running(usize),
    /// The last run completed every level
    Converged,
    /// The last run was aborted by an error
    Failed,
}

/// Diagnostics of one level of a run.
#[derive(Debug, Clone)]
pub struct LevelSummary {
    /// Index of the level in the schedule
    pub level: usize,
    /// Schedule multiplier of the level
    pub multiplier: f64,
    /// Kernel bandwidth, the multiplier times the moving point set scale
    pub bandwidth: f64,
    /// Metric value before minimization
    pub initial_value: f64,
    /// Metric value after minimization
    pub final_value: f64,
    /// Minimizer iterations
    pub iterations: usize,
    /// Metric evaluations used by the minimizer
    pub evaluations: usize,
    /// Why the minimizer stopped
    pub termination_reason: TerminationReason,
    /// Transform parameters at the end of the level
    pub parameters: Vec<f64>,
}

/// Result of a multi-scale registration run.
#[derive(Debug, Clone)]
pub struct RegistrationResult {
    /// Transform parameters before the first level
    pub initial_parameters: Vec<f64>,
    /// Transform parameters after the last level
    pub final_parameters: Vec<f64>,
    /// Metric value at the last level
    pub final_value: f64,
    /// One summary per level, coarse to fine
    pub levels: Vec<LevelSummary>,
}

/// Multi-scale registration driver.
///
/// Each level sets the metric bandwidth to `schedule[level]` times the RMS
/// radius of the moving point set, re-initializes the metric and minimizes it
/// starting from the parameters left by the previous level. The schedule is
/// usually decreasing so that wide kernels first pull the sets together and
/// narrow kernels refine the alignment.
///
/// Example:
///
/// ```no_run
/// use kornia_gmm::{
///     GmmMetric, Lbfgs, MetricType, MultiScaleRegistration, PointSet, TranslationTransform,
/// };
///
/// let fixed = PointSet::new(vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
/// let moving = PointSet::new(vec![[0.1, 0.0, 0.0], [1.1, 0.0, 0.0], [0.1, 1.0, 0.0]]);
/// let mut transform = TranslationTransform::new();
///
/// let mut metric = GmmMetric::new(MetricType::L2);
/// metric.set_fixed_point_set(&fixed);
/// metric.set_moving_point_set(&moving);
/// metric.set_transform(&mut transform);
///
/// let mut registration = MultiScaleRegistration::new(vec![2.0, 1.0, 0.5]);
/// let result = registration.run(&mut metric, &Lbfgs::default()).unwrap();
/// println!("{:?}", result.final_parameters);
/// ```
#[derive(Debug, Clone)]
pub struct MultiScaleRegistration {
    schedule: Vec<f64>,
    state: RegistrationState,
}

impl MultiScaleRegistration {
    /// Create a driver with the given bandwidth multipliers, coarse to fine.
    pub fn new(schedule: Vec<f64>) -> Self {
        Self {
            schedule,
            state: RegistrationState::Idle,
        }
    }

    /// The bandwidth multipliers.
    pub fn schedule(&self) -> &[f64] {
        &self.schedule
    }

    /// The state of the driver.
    pub fn state(&self) -> RegistrationState {
        self.state
    }

    /// Run every level of the schedule.
    ///
    /// The transform attached to `metric` holds the starting parameters and
    /// receives the parameters of each level as it completes.
    ///
    /// # Errors
    ///
    /// Any failure aborts the run and leaves the driver in
    /// [`RegistrationState::Failed`]. The transform keeps the parameters of
    /// the last completed level, or the starting parameters if none completed.
    ///
    /// A moving point set whose points all coincide, a single point included,
    /// has a zero RMS radius and fails the first level with
    /// [`RegistrationError::Initialization`] carrying [`GmmError::InvalidScale`].
    pub fn run(
        &mut self,
        metric: &mut GmmMetric<'_>,
        optimizer: &dyn Minimizer,
    ) -> Result<RegistrationResult, RegistrationError> {
        let result = self.run_levels(metric, optimizer);
        self.state = match result {
            Ok(_) => RegistrationState::Converged,
            Err(_) => RegistrationState::Failed,
        };
        result
    }

    fn run_levels(
        &mut self,
        metric: &mut GmmMetric<'_>,
        optimizer: &dyn Minimizer,
    ) -> Result<RegistrationResult, RegistrationError> {
        if self.schedule.is_empty() {
            return Err(RegistrationError::EmptySchedule);
        }
        if let Some((level, &multiplier)) = self
            .schedule
            .iter()
            .enumerate()
            .find(|(_, m)| !(**m > 0.0 && m.is_finite()))
        {
            return Err(RegistrationError::InvalidSchedule { level, multiplier });
        }

        let moving = metric
            .moving_point_set()
            .ok_or(RegistrationError::Setup(GmmError::MissingInput(
                "moving point set",
            )))?;
        let moving_scale = compute_properties(moving)
            .map_err(RegistrationError::Setup)?
            .scale;
        let initial_parameters = metric
            .transform_parameters()
            .map_err(RegistrationError::Setup)?;

        let mut parameters = initial_parameters.clone();
        let mut levels = Vec::with_capacity(self.schedule.len());

        for (level, &multiplier) in self.schedule.iter().enumerate() {
            self.state = RegistrationState::Running(level);

            let bandwidth = multiplier * moving_scale;
            let summary = match Self::run_level(
                metric,
                optimizer,
                level,
                multiplier,
                bandwidth,
                &parameters,
            ) {
                Ok(summary) => summary,
                Err(err) => {
                    // the minimizer leaves its last trial point in the transform
                    if let Err(restore) = metric.set_transform_parameters(&parameters) {
                        log::warn!("level {level}: failed to restore parameters: {restore}");
                    }
                    return Err(err);
                }
            };

            parameters = summary.parameters.clone();
            levels.push(summary);
        }

        let final_value = levels.last().map_or(f64::NAN, |summary| summary.final_value);

        Ok(RegistrationResult {
            initial_parameters,
            final_parameters: parameters,
            final_value,
            levels,
        })
    }

    fn run_level(
        metric: &mut GmmMetric<'_>,
        optimizer: &dyn Minimizer,
        level: usize,
        multiplier: f64,
        bandwidth: f64,
        parameters: &[f64],
    ) -> Result<LevelSummary, RegistrationError> {
        let metric_type = metric.metric_type();
        let init_error = |source| RegistrationError::Initialization {
            level,
            metric: metric_type,
            source,
        };

        metric.set_scale(bandwidth).map_err(init_error)?;
        metric.initialize().map_err(init_error)?;

        let (initial_value, _) = metric
            .value_and_derivative(parameters)
            .map_err(init_error)?;

        log::debug!(
            "level {level}: {metric_type} with bandwidth {bandwidth:.6}, initial value {initial_value:.6e}"
        );

        let optimizer_error = |source| RegistrationError::OptimizerFailure {
            level,
            metric: metric_type,
            source,
        };

        let result = optimizer
            .minimize(metric, parameters)
            .map_err(optimizer_error)?;
        metric
            .set_transform_parameters(&result.parameters)
            .map_err(|e| optimizer_error(e.into()))?;

        log::debug!(
            "level {level}: final value {:.6e} after {} iterations ({:?}), parameters {:?}",
            result.value,
            result.iterations,
            result.termination_reason,
            result.parameters
        );

        Ok(LevelSummary {
            level,
            multiplier,
            bandwidth,
            initial_value,
            final_value: result.value,
            iterations: result.iterations,
            evaluations: result.evaluations,
            termination_reason: result.termination_reason,
            parameters: result.parameters,
        })
    }
}
