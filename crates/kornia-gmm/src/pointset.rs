use crate::{error::GmmError, transform::Transform};

/// An ordered set of 3D points.
///
/// The point set is immutable once created. Components such as metrics and
/// filters only borrow it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointSet {
    points: Vec<[f64; 3]>,
}

impl PointSet {
    /// Create a new point set from a vector of points.
    pub fn new(points: Vec<[f64; 3]>) -> Self {
        Self { points }
    }

    /// Get the number of points in the point set.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the point set is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Get as reference the points in the point set.
    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    /// Apply a transform to every point and return the result as a new point set.
    pub fn transformed(&self, transform: &dyn Transform) -> PointSet {
        PointSet::new(
            self.points
                .iter()
                .map(|p| transform.transform_point(p))
                .collect(),
        )
    }
}

impl From<Vec<[f64; 3]>> for PointSet {
    fn from(points: Vec<[f64; 3]>) -> Self {
        Self::new(points)
    }
}

/// Centroid and characteristic spread of a point set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointSetProperties {
    /// Arithmetic mean of the points.
    pub centroid: [f64; 3],
    /// Root-mean-square distance of the points from the centroid.
    pub scale: f64,
    /// Minimum corner of the axis-aligned bounding box.
    pub min_bound: [f64; 3],
    /// Maximum corner of the axis-aligned bounding box.
    pub max_bound: [f64; 3],
}

impl PointSetProperties {
    /// Center of the axis-aligned bounding box.
    pub fn bounding_box_center(&self) -> [f64; 3] {
        [
            0.5 * (self.min_bound[0] + self.max_bound[0]),
            0.5 * (self.min_bound[1] + self.max_bound[1]),
            0.5 * (self.min_bound[2] + self.max_bound[2]),
        ]
    }
}

/// Compute the centroid, scale and bounding box of a point set.
///
/// The scale is the root-mean-square distance from the centroid, so scaling
/// all coordinates by `k > 0` scales both the centroid and the scale by `k`.
///
/// # Arguments
///
/// * `point_set` - The point set to analyze.
///
/// # Errors
///
/// Returns [`GmmError::EmptyPointSet`] if the point set has no points.
pub fn compute_properties(point_set: &PointSet) -> Result<PointSetProperties, GmmError> {
    let points = point_set.points();
    let first = points.first().ok_or(GmmError::EmptyPointSet)?;

    let num_points = points.len() as f64;
    let mut centroid = [0.0; 3];
    let mut min_bound = *first;
    let mut max_bound = *first;

    for p in points {
        for i in 0..3 {
            centroid[i] += p[i];
            min_bound[i] = min_bound[i].min(p[i]);
            max_bound[i] = max_bound[i].max(p[i]);
        }
    }
    centroid.iter_mut().for_each(|c| *c /= num_points);

    let mean_squared_distance = points
        .iter()
        .map(|p| {
            (p[0] - centroid[0]).powi(2)
                + (p[1] - centroid[1]).powi(2)
                + (p[2] - centroid[2]).powi(2)
        })
        .sum::<f64>()
        / num_points;

    Ok(PointSetProperties {
        centroid,
        scale: mean_squared_distance.sqrt(),
        min_bound,
        max_bound,
    })
}
