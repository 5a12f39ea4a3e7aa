use glam::{DMat3, DVec3};

use crate::{error::GmmError, pointset::PointSetProperties};

/// A parametric point-to-point mapping with an analytic Jacobian.
///
/// The parameter vector has a fixed length. The Jacobian is returned as one
/// column per parameter, each column being the derivative of the mapped
/// point with respect to that parameter.
pub trait Transform: Send + Sync {
    /// Human readable name of the transform.
    fn name(&self) -> &'static str;

    /// Number of parameters of the transform.
    fn num_parameters(&self) -> usize;

    /// Current parameter vector.
    fn parameters(&self) -> &[f64];

    /// Replace the parameter vector.
    ///
    /// # Errors
    ///
    /// Returns [`GmmError::ParameterSizeMismatch`] if `parameters` does not
    /// have [`Transform::num_parameters`] elements.
    fn set_parameters(&mut self, parameters: &[f64]) -> Result<(), GmmError>;

    /// Reset the parameters to the identity mapping.
    fn set_identity(&mut self);

    /// Map a point.
    fn transform_point(&self, point: &[f64; 3]) -> [f64; 3];

    /// Derivative of the mapped point with respect to the parameters.
    ///
    /// PRECONDITION: `jacobian` has [`Transform::num_parameters`] columns.
    fn jacobian(&self, point: &[f64; 3], jacobian: &mut [[f64; 3]]);
}

fn check_parameter_size(expected: usize, actual: usize) -> Result<(), GmmError> {
    if expected != actual {
        return Err(GmmError::ParameterSizeMismatch { expected, actual });
    }
    Ok(())
}

/// Pure translation, parameters `[tx, ty, tz]`.
#[derive(Debug, Clone, Default)]
pub struct TranslationTransform {
    parameters: [f64; 3],
}

impl TranslationTransform {
    /// Create an identity translation.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transform for TranslationTransform {
    fn name(&self) -> &'static str {
        "TranslationTransform"
    }

    fn num_parameters(&self) -> usize {
        3
    }

    fn parameters(&self) -> &[f64] {
        &self.parameters
    }

    fn set_parameters(&mut self, parameters: &[f64]) -> Result<(), GmmError> {
        check_parameter_size(3, parameters.len())?;
        self.parameters.copy_from_slice(parameters);
        Ok(())
    }

    fn set_identity(&mut self) {
        self.parameters = [0.0; 3];
    }

    fn transform_point(&self, point: &[f64; 3]) -> [f64; 3] {
        [
            point[0] + self.parameters[0],
            point[1] + self.parameters[1],
            point[2] + self.parameters[2],
        ]
    }

    fn jacobian(&self, _point: &[f64; 3], jacobian: &mut [[f64; 3]]) {
        jacobian[0] = [1.0, 0.0, 0.0];
        jacobian[1] = [0.0, 1.0, 0.0];
        jacobian[2] = [0.0, 0.0, 1.0];
    }
}

// Rotation R = Rz * Ry * Rx built from three Euler angles.
#[derive(Debug, Clone)]
struct EulerRotation {
    rx: DMat3,
    ry: DMat3,
    rz: DMat3,
}

impl EulerRotation {
    fn new(angle_x: f64, angle_y: f64, angle_z: f64) -> Self {
        Self {
            rx: DMat3::from_rotation_x(angle_x),
            ry: DMat3::from_rotation_y(angle_y),
            rz: DMat3::from_rotation_z(angle_z),
        }
    }

    fn matrix(&self) -> DMat3 {
        self.rz * self.ry * self.rx
    }

    // d(R q)/d(angle) for each angle, using dR(a)/da = R(a) [axis]x
    fn derivatives(&self, q: DVec3) -> [DVec3; 3] {
        let rx_q = self.rx * q;
        let ry_rx_q = self.ry * rx_q;
        [
            self.rz * self.ry * self.rx * DVec3::X.cross(q),
            self.rz * self.ry * DVec3::Y.cross(rx_q),
            self.rz * DVec3::Z.cross(ry_rx_q),
        ]
    }
}

/// Rigid transform parameterized by Euler angles and a translation.
///
/// Parameters are `[angle_x, angle_y, angle_z, tx, ty, tz]`. Points are
/// mapped as `R (p - c) + c + t` with `R = Rz * Ry * Rx` and `c` a fixed
/// center of rotation.
#[derive(Debug, Clone)]
pub struct Euler3dTransform {
    parameters: [f64; 6],
    center: DVec3,
    rotation: EulerRotation,
}

impl Euler3dTransform {
    /// Create an identity transform rotating about `center`.
    pub fn new(center: [f64; 3]) -> Self {
        Self {
            parameters: [0.0; 6],
            center: DVec3::from_array(center),
            rotation: EulerRotation::new(0.0, 0.0, 0.0),
        }
    }

    /// Center of rotation.
    pub fn center(&self) -> [f64; 3] {
        self.center.to_array()
    }
}

impl Transform for Euler3dTransform {
    fn name(&self) -> &'static str {
        "Euler3dTransform"
    }

    fn num_parameters(&self) -> usize {
        6
    }

    fn parameters(&self) -> &[f64] {
        &self.parameters
    }

    fn set_parameters(&mut self, parameters: &[f64]) -> Result<(), GmmError> {
        check_parameter_size(6, parameters.len())?;
        self.parameters.copy_from_slice(parameters);
        self.rotation = EulerRotation::new(parameters[0], parameters[1], parameters[2]);
        Ok(())
    }

    fn set_identity(&mut self) {
        self.parameters = [0.0; 6];
        self.rotation = EulerRotation::new(0.0, 0.0, 0.0);
    }

    fn transform_point(&self, point: &[f64; 3]) -> [f64; 3] {
        let q = DVec3::from_array(*point) - self.center;
        let t = DVec3::new(self.parameters[3], self.parameters[4], self.parameters[5]);
        (self.rotation.matrix() * q + self.center + t).to_array()
    }

    fn jacobian(&self, point: &[f64; 3], jacobian: &mut [[f64; 3]]) {
        let q = DVec3::from_array(*point) - self.center;
        for (col, d) in jacobian.iter_mut().zip(self.rotation.derivatives(q)) {
            *col = d.to_array();
        }
        jacobian[3] = [1.0, 0.0, 0.0];
        jacobian[4] = [0.0, 1.0, 0.0];
        jacobian[5] = [0.0, 0.0, 1.0];
    }
}

/// Similarity transform: Euler rotation, translation and isotropic scaling.
///
/// Parameters are `[angle_x, angle_y, angle_z, tx, ty, tz, scale]` and points
/// are mapped as `s R (p - c) + c + t`.
#[derive(Debug, Clone)]
pub struct SimilarityTransform {
    parameters: [f64; 7],
    center: DVec3,
    rotation: EulerRotation,
}

impl SimilarityTransform {
    /// Create an identity similarity transform about `center`.
    pub fn new(center: [f64; 3]) -> Self {
        let mut parameters = [0.0; 7];
        parameters[6] = 1.0;
        Self {
            parameters,
            center: DVec3::from_array(center),
            rotation: EulerRotation::new(0.0, 0.0, 0.0),
        }
    }

    /// Center of rotation and scaling.
    pub fn center(&self) -> [f64; 3] {
        self.center.to_array()
    }
}

impl Transform for SimilarityTransform {
    fn name(&self) -> &'static str {
        "SimilarityTransform"
    }

    fn num_parameters(&self) -> usize {
        7
    }

    fn parameters(&self) -> &[f64] {
        &self.parameters
    }

    fn set_parameters(&mut self, parameters: &[f64]) -> Result<(), GmmError> {
        check_parameter_size(7, parameters.len())?;
        self.parameters.copy_from_slice(parameters);
        self.rotation = EulerRotation::new(parameters[0], parameters[1], parameters[2]);
        Ok(())
    }

    fn set_identity(&mut self) {
        self.parameters = [0.0; 7];
        self.parameters[6] = 1.0;
        self.rotation = EulerRotation::new(0.0, 0.0, 0.0);
    }

    fn transform_point(&self, point: &[f64; 3]) -> [f64; 3] {
        let q = DVec3::from_array(*point) - self.center;
        let t = DVec3::new(self.parameters[3], self.parameters[4], self.parameters[5]);
        let s = self.parameters[6];
        (s * (self.rotation.matrix() * q) + self.center + t).to_array()
    }

    fn jacobian(&self, point: &[f64; 3], jacobian: &mut [[f64; 3]]) {
        let q = DVec3::from_array(*point) - self.center;
        let s = self.parameters[6];
        for (col, d) in jacobian.iter_mut().zip(self.rotation.derivatives(q)) {
            *col = (s * d).to_array();
        }
        jacobian[3] = [1.0, 0.0, 0.0];
        jacobian[4] = [0.0, 1.0, 0.0];
        jacobian[5] = [0.0, 0.0, 1.0];
        jacobian[6] = (self.rotation.matrix() * q).to_array();
    }
}

/// The available transform types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformType {
    /// [`TranslationTransform`].
    Translation,
    /// [`Euler3dTransform`].
    Euler3D,
    /// [`SimilarityTransform`].
    Similarity,
}

impl TryFrom<usize> for TransformType {
    type Error = GmmError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TransformType::Translation),
            1 => Ok(TransformType::Euler3D),
            2 => Ok(TransformType::Similarity),
            _ => Err(GmmError::UnknownTransformType(value)),
        }
    }
}

/// A transform ready for registration together with its optimizer scales.
pub struct TransformInitialization {
    /// The initialized transform.
    pub transform: Box<dyn Transform>,
    /// Per-parameter scales bringing angles, translations and scale factors
    /// to comparable magnitudes for the optimizer.
    pub scales: Vec<f64>,
}

/// Build a transform of the given type mapping the moving centroid onto the fixed centroid.
///
/// The transform rotates (and scales) about the moving centroid and its
/// translation is initialized to `fixed.centroid - moving.centroid`.
///
/// # Arguments
///
/// * `transform_type` - The type of transform to create.
/// * `fixed` - Properties of the fixed point set.
/// * `moving` - Properties of the moving point set.
pub fn initialize_transform(
    transform_type: TransformType,
    fixed: &PointSetProperties,
    moving: &PointSetProperties,
) -> Result<TransformInitialization, GmmError> {
    let offset = [
        fixed.centroid[0] - moving.centroid[0],
        fixed.centroid[1] - moving.centroid[1],
        fixed.centroid[2] - moving.centroid[2],
    ];
    let translation_scale = if moving.scale > 0.0 {
        1.0 / moving.scale
    } else {
        1.0
    };

    let (transform, scales): (Box<dyn Transform>, Vec<f64>) = match transform_type {
        TransformType::Translation => {
            let mut transform = TranslationTransform::new();
            transform.set_parameters(&offset)?;
            (Box::new(transform), vec![translation_scale; 3])
        }
        TransformType::Euler3D => {
            let mut transform = Euler3dTransform::new(moving.centroid);
            transform.set_parameters(&[0.0, 0.0, 0.0, offset[0], offset[1], offset[2]])?;
            let mut scales = vec![1.0; 6];
            scales[3..6].fill(translation_scale);
            (Box::new(transform), scales)
        }
        TransformType::Similarity => {
            let mut transform = SimilarityTransform::new(moving.centroid);
            transform.set_parameters(&[0.0, 0.0, 0.0, offset[0], offset[1], offset[2], 1.0])?;
            let mut scales = vec![1.0; 7];
            scales[3..6].fill(translation_scale);
            (Box::new(transform), scales)
        }
    };

    log::debug!(
        "initialized {} with parameters {:?}",
        transform.name(),
        transform.parameters()
    );

    Ok(TransformInitialization { transform, scales })
}
