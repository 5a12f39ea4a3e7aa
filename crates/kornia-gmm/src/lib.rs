#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

mod error;
pub use error::GmmError;

mod locator;
pub use locator::PointsLocator;

pub mod metric;
pub use metric::{GmmMetric, MetricFactory, MetricType};

pub mod optimizer;
pub use optimizer::{
    Lbfgs, Minimizer, Objective, OptimizerError, OptimizerResult, TerminationReason,
};

mod noise;
pub use noise::{NoisyPointSet, RandomTransformFilter};

mod pointset;
pub use pointset::{compute_properties, PointSet, PointSetProperties};

pub mod registration;
pub use registration::{
    LevelSummary, MultiScaleRegistration, RegistrationError, RegistrationResult, RegistrationState,
};

mod transform;
pub use transform::{
    initialize_transform, Euler3dTransform, SimilarityTransform, Transform, TransformInitialization,
    TransformType, TranslationTransform,
};
