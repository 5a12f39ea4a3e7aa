//! Gaussian mixture model point set to point set metrics.
//!
//! Every metric treats the fixed and the transformed moving point sets as
//! sums of isotropic Gaussian kernels with bandwidth `scale` and compares
//! them through the kernel weight `w = exp(-|x - y|² / (2 scale²))`. The
//! variants differ in how the weight sums are turned into a value:
//!
//! * [`MetricType::L2Rigid`] - negated cross correlation of the two densities.
//! * [`MetricType::L2`] - squared L2 distance between the two densities.
//! * [`MetricType::KC`] - the L2 distance with the kernel sums truncated to a
//!   search radius using a KD-tree over the fixed points.
//! * [`MetricType::MLE`] - negative log-likelihood of the fixed points under
//!   the mixture defined by the transformed moving points.

use std::fmt;

use rayon::prelude::*;

use crate::{
    error::GmmError, locator::PointsLocator, optimizer::Objective, pointset::PointSet,
    transform::Transform,
};

mod kc;
mod l2;
mod mle;

/// Default search radius of the KC metric, in units of the bandwidth.
pub const DEFAULT_RADIUS: f64 = 3.0;

/// The available metric variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    /// Cross correlation only, for rigid transforms.
    L2Rigid,
    /// Exact all-pairs L2 distance.
    L2,
    /// KD-tree truncated L2 distance.
    KC,
    /// Maximum likelihood. The mixture variance is the square of the metric
    /// scale, so [`GmmMetric::set_scale`] controls its bandwidth.
    MLE,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricType::L2Rigid => "GMML2Rigid",
            MetricType::L2 => "GMML2",
            MetricType::KC => "GMMKC",
            MetricType::MLE => "GMMMLE",
        };
        write!(f, "{name}")
    }
}

/// Selects a metric variant from its numeric selector.
///
/// The selectors are `0` for [`MetricType::L2Rigid`], `1` for
/// [`MetricType::L2`] and `2` for [`MetricType::KC`].
pub struct MetricFactory;

impl MetricFactory {
    /// Create a metric from a numeric selector.
    ///
    /// The returned metric must be configured and initialized before the
    /// first evaluation.
    ///
    /// # Errors
    ///
    /// Returns [`GmmError::UnknownMetricType`] for any other selector.
    pub fn create<'a>(selector: usize) -> Result<GmmMetric<'a>, GmmError> {
        let metric_type = match selector {
            0 => MetricType::L2Rigid,
            1 => MetricType::L2,
            2 => MetricType::KC,
            _ => return Err(GmmError::UnknownMetricType(selector)),
        };
        Ok(GmmMetric::new(metric_type))
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct GaussianKernel {
    inv_two_sigma_sq: f64,
}

impl GaussianKernel {
    pub(crate) fn new(scale: f64) -> Self {
        Self {
            inv_two_sigma_sq: 1.0 / (2.0 * scale * scale),
        }
    }

    #[inline]
    pub(crate) fn weight(&self, squared_distance: f64) -> f64 {
        (-squared_distance * self.inv_two_sigma_sq).exp()
    }

    // d w(|x - y|²) / dx = gradient_factor * w * (x - y)
    #[inline]
    pub(crate) fn gradient_factor(&self) -> f64 {
        -2.0 * self.inv_two_sigma_sq
    }
}

#[inline]
pub(crate) fn squared_distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)
}

/// Running sums of kernel weights `Σ w` and weighted offsets `Σ w (x - y)`
/// for one query point `x`.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct KernelSum {
    pub(crate) weight: f64,
    pub(crate) weighted_offset: [f64; 3],
}

impl KernelSum {
    #[inline]
    pub(crate) fn accumulate(
        &mut self,
        kernel: &GaussianKernel,
        x: &[f64; 3],
        y: &[f64; 3],
        squared_distance: f64,
    ) {
        let w = kernel.weight(squared_distance);
        self.weight += w;
        self.weighted_offset[0] += w * (x[0] - y[0]);
        self.weighted_offset[1] += w * (x[1] - y[1]);
        self.weighted_offset[2] += w * (x[2] - y[2]);
    }
}

/// Value and per-point gradients with respect to the transformed moving points.
pub(crate) struct LocalEvaluation {
    pub(crate) value: f64,
    pub(crate) gradients: Vec<[f64; 3]>,
}

impl LocalEvaluation {
    // sums in index order so the result does not depend on the thread count
    pub(crate) fn from_contributions(contributions: Vec<(f64, [f64; 3])>) -> Self {
        let value = contributions.iter().map(|(v, _)| v).sum();
        let gradients = contributions.into_iter().map(|(_, g)| g).collect();
        Self { value, gradients }
    }
}

struct MetricState {
    num_parameters: usize,
    fixed_self_term: f64,
    locator: Option<PointsLocator>,
}

/// A GMM metric between a fixed and a transformed moving point set.
///
/// The metric borrows the point sets and the transform for the duration of
/// a registration run. Changing the inputs, the scale or the radius
/// invalidates the metric until [`GmmMetric::initialize`] is called again.
///
/// Example:
///
/// ```no_run
/// use kornia_gmm::{GmmMetric, MetricType, Objective, PointSet, TranslationTransform};
///
/// let fixed = PointSet::new(vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
/// let moving = fixed.clone();
/// let mut transform = TranslationTransform::new();
///
/// let mut metric = GmmMetric::new(MetricType::L2);
/// metric.set_fixed_point_set(&fixed);
/// metric.set_moving_point_set(&moving);
/// metric.set_transform(&mut transform);
/// metric.set_scale(0.5).unwrap();
/// metric.initialize().unwrap();
///
/// let (value, derivative) = metric.value_and_derivative(&[0.0, 0.0, 0.0]).unwrap();
/// ```
pub struct GmmMetric<'a> {
    metric_type: MetricType,
    fixed: Option<&'a PointSet>,
    moving: Option<&'a PointSet>,
    transform: Option<&'a mut dyn Transform>,
    scale: f64,
    radius: f64,
    state: Option<MetricState>,
}

impl<'a> GmmMetric<'a> {
    /// Create an unconfigured metric of the given type with unit scale.
    pub fn new(metric_type: MetricType) -> Self {
        Self {
            metric_type,
            fixed: None,
            moving: None,
            transform: None,
            scale: 1.0,
            radius: DEFAULT_RADIUS,
            state: None,
        }
    }

    /// The metric variant.
    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    /// Set the fixed point set.
    pub fn set_fixed_point_set(&mut self, point_set: &'a PointSet) {
        self.fixed = Some(point_set);
        self.state = None;
    }

    /// Set the moving point set.
    pub fn set_moving_point_set(&mut self, point_set: &'a PointSet) {
        self.moving = Some(point_set);
        self.state = None;
    }

    /// Set the transform applied to the moving point set.
    pub fn set_transform(&mut self, transform: &'a mut dyn Transform) {
        self.transform = Some(transform);
        self.state = None;
    }

    /// Get the fixed point set, if set.
    pub fn fixed_point_set(&self) -> Option<&'a PointSet> {
        self.fixed
    }

    /// Get the moving point set, if set.
    pub fn moving_point_set(&self) -> Option<&'a PointSet> {
        self.moving
    }

    /// Get the transform, if set.
    pub fn transform(&self) -> Option<&dyn Transform> {
        self.transform.as_deref()
    }

    /// Set the kernel bandwidth.
    ///
    /// # Errors
    ///
    /// Returns [`GmmError::InvalidScale`] if `scale` is not positive and finite.
    pub fn set_scale(&mut self, scale: f64) -> Result<(), GmmError> {
        if !(scale > 0.0 && scale.is_finite()) {
            return Err(GmmError::InvalidScale(scale));
        }
        self.scale = scale;
        self.state = None;
        Ok(())
    }

    /// Get the kernel bandwidth.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Set the KC search radius, in units of the bandwidth.
    ///
    /// Only the KC metric uses the radius. Values of 3 or more keep the
    /// truncation error small.
    pub fn set_radius(&mut self, radius: f64) {
        self.radius = radius;
        self.state = None;
    }

    /// Get the KC search radius, in units of the bandwidth.
    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Check whether the metric is ready for evaluation.
    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Get the current transform parameters.
    pub fn transform_parameters(&self) -> Result<Vec<f64>, GmmError> {
        let transform = self
            .transform
            .as_deref()
            .ok_or(GmmError::MissingInput("transform"))?;
        Ok(transform.parameters().to_vec())
    }

    /// Write parameters into the transform.
    pub fn set_transform_parameters(&mut self, parameters: &[f64]) -> Result<(), GmmError> {
        let transform = self
            .transform
            .as_deref_mut()
            .ok_or(GmmError::MissingInput("transform"))?;
        transform.set_parameters(parameters)
    }

    /// Check the inputs and build the per-level structures.
    ///
    /// This computes the constant fixed/fixed term of the L2 distances and,
    /// for the KC metric, builds the KD-tree over the fixed points. It must
    /// be called after any change of inputs, scale or radius.
    pub fn initialize(&mut self) -> Result<(), GmmError> {
        self.state = None;

        let fixed = self.fixed.ok_or(GmmError::MissingInput("fixed point set"))?;
        let moving = self
            .moving
            .ok_or(GmmError::MissingInput("moving point set"))?;
        let transform = self
            .transform
            .as_deref()
            .ok_or(GmmError::MissingInput("transform"))?;

        if fixed.is_empty() || moving.is_empty() {
            return Err(GmmError::EmptyPointSet);
        }
        if !(self.scale > 0.0 && self.scale.is_finite()) {
            return Err(GmmError::InvalidScale(self.scale));
        }

        let kernel = GaussianKernel::new(self.scale);

        let (locator, fixed_self_term) = match self.metric_type {
            MetricType::L2 => (None, l2::fixed_self_term(fixed.points(), &kernel)),
            MetricType::KC => {
                if !(self.radius > 0.0) {
                    return Err(GmmError::InvalidRadius(self.radius));
                }
                let locator = PointsLocator::new(fixed.points());
                let fixed_self_term = kc::fixed_self_term(
                    fixed.points(),
                    &locator,
                    self.radius * self.scale,
                    &kernel,
                );
                (Some(locator), fixed_self_term)
            }
            MetricType::L2Rigid | MetricType::MLE => (None, 0.0),
        };

        log::debug!(
            "initialized {} metric: {} fixed points, {} moving points, scale {}",
            self.metric_type,
            fixed.len(),
            moving.len(),
            self.scale
        );

        self.state = Some(MetricState {
            num_parameters: transform.num_parameters(),
            fixed_self_term,
            locator,
        });

        Ok(())
    }

    fn evaluate(
        &mut self,
        parameters: &[f64],
        with_derivative: bool,
    ) -> Result<(f64, Vec<f64>), GmmError> {
        let state = self.state.as_ref().ok_or(GmmError::NotInitialized)?;
        if parameters.len() != state.num_parameters {
            return Err(GmmError::ParameterSizeMismatch {
                expected: state.num_parameters,
                actual: parameters.len(),
            });
        }

        let fixed = self.fixed.ok_or(GmmError::MissingInput("fixed point set"))?;
        let moving = self
            .moving
            .ok_or(GmmError::MissingInput("moving point set"))?;
        let transform = self
            .transform
            .as_deref_mut()
            .ok_or(GmmError::MissingInput("transform"))?;

        transform.set_parameters(parameters)?;
        let transform: &dyn Transform = transform;

        let transformed = moving
            .points()
            .par_iter()
            .map(|p| transform.transform_point(p))
            .collect::<Vec<_>>();

        let kernel = GaussianKernel::new(self.scale);

        let local = match (self.metric_type, state.locator.as_ref()) {
            (MetricType::L2Rigid, _) => l2::l2_rigid(fixed.points(), &transformed, &kernel),
            (MetricType::L2, _) => l2::l2(fixed.points(), &transformed, &kernel),
            (MetricType::KC, Some(locator)) => kc::kc(
                fixed.points(),
                &transformed,
                locator,
                self.radius * self.scale,
                &kernel,
            ),
            (MetricType::KC, None) => return Err(GmmError::NotInitialized),
            (MetricType::MLE, _) => mle::mle(fixed.points(), &transformed, &kernel),
        };

        let value = state.fixed_self_term + local.value;

        let derivative = if with_derivative {
            chain_rule(
                moving.points(),
                transform,
                &local.gradients,
                state.num_parameters,
            )
        } else {
            Vec::new()
        };

        Ok((value, derivative))
    }
}

// ∂value/∂p_i = Σ_j (∂value/∂x_j) · (∂x_j/∂p_i)
fn chain_rule(
    points: &[[f64; 3]],
    transform: &dyn Transform,
    point_gradients: &[[f64; 3]],
    num_parameters: usize,
) -> Vec<f64> {
    let contributions = points
        .par_iter()
        .zip(point_gradients.par_iter())
        .map_init(
            || vec![[0.0; 3]; num_parameters],
            |jacobian, (p, g)| {
                transform.jacobian(p, jacobian);
                jacobian
                    .iter()
                    .map(|col| col[0] * g[0] + col[1] * g[1] + col[2] * g[2])
                    .collect::<Vec<_>>()
            },
        )
        .collect::<Vec<_>>();

    let mut derivative = vec![0.0; num_parameters];
    for contribution in contributions {
        for (d, c) in derivative.iter_mut().zip(contribution) {
            *d += c;
        }
    }
    derivative
}

impl Objective for GmmMetric<'_> {
    fn num_parameters(&self) -> usize {
        self.transform
            .as_deref()
            .map_or(0, |transform| transform.num_parameters())
    }

    fn value(&mut self, parameters: &[f64]) -> Result<f64, GmmError> {
        if self.metric_type == MetricType::MLE {
            return Err(GmmError::NotSupported(
                "the MLE metric only implements value_and_derivative",
            ));
        }
        Ok(self.evaluate(parameters, false)?.0)
    }

    fn derivative(&mut self, parameters: &[f64]) -> Result<Vec<f64>, GmmError> {
        if self.metric_type == MetricType::MLE {
            return Err(GmmError::NotSupported(
                "the MLE metric only implements value_and_derivative",
            ));
        }
        Ok(self.evaluate(parameters, true)?.1)
    }

    fn value_and_derivative(&mut self, parameters: &[f64]) -> Result<(f64, Vec<f64>), GmmError> {
        self.evaluate(parameters, true)
    }
}
