use argh::FromArgs;
use rand::{rngs::StdRng, Rng, SeedableRng};

use kornia_gmm::{
    compute_properties, initialize_transform, Euler3dTransform, Lbfgs, MetricFactory,
    MultiScaleRegistration, PointSet, RandomTransformFilter, TransformType,
};

#[derive(FromArgs)]
/// Monte Carlo statistics of GMM point set registration on synthetic ellipsoids
struct Args {
    /// number of points of the synthetic point set
    #[argh(option, default = "500")]
    num_points: usize,

    /// number of random trials
    #[argh(option, default = "10")]
    evaluations: usize,

    /// number of scale levels, each halving the bandwidth
    #[argh(option, default = "3")]
    levels: usize,

    /// maximum optimizer iterations per level
    #[argh(option, default = "1000")]
    iterations: usize,

    /// type of metric (0: L2Rigid, 1: L2, 2: KC)
    #[argh(option, default = "0")]
    metric: usize,

    /// type of transform (0: Translation, 1: Euler3D, 2: Similarity)
    #[argh(option, default = "1")]
    transform: usize,

    /// standard deviation of the noise added to the moving points
    #[argh(option, default = "0.01")]
    noise: f64,

    /// seed of the first trial
    #[argh(option, default = "0")]
    seed: u64,

    /// trace the optimizer iterations
    #[argh(switch)]
    trace: bool,
}

// points on the surface of an ellipsoid with semi-axes 3, 2 and 1
fn ellipsoid(num_points: usize, seed: u64) -> PointSet {
    let mut rng = StdRng::seed_from_u64(seed);
    let points = (0..num_points)
        .map(|_| {
            let z: f64 = rng.random_range(-1.0..1.0);
            let phi: f64 = rng.random_range(0.0..std::f64::consts::TAU);
            let r = (1.0 - z * z).sqrt();
            [3.0 * r * phi.cos(), 2.0 * r * phi.sin(), z]
        })
        .collect();
    PointSet::new(points)
}

fn rms_distance(a: &PointSet, b: &PointSet) -> f64 {
    let sum = a
        .points()
        .iter()
        .zip(b.points())
        .map(|(p, q)| (p[0] - q[0]).powi(2) + (p[1] - q[1]).powi(2) + (p[2] - q[2]).powi(2))
        .sum::<f64>();
    (sum / a.len() as f64).sqrt()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    let transform_type = TransformType::try_from(args.transform)?;
    let schedule = (0..args.levels)
        .map(|level| 0.5f64.powi(level as i32))
        .collect::<Vec<_>>();

    println!("number of points     {}", args.num_points);
    println!("number of iterations {}", args.iterations);
    println!("scale schedule       {:?}", schedule);
    println!("transform            {:?}", transform_type);
    println!();

    let fixed = ellipsoid(args.num_points, args.seed);
    let fixed_properties = compute_properties(&fixed)?;

    let angle = std::f64::consts::FRAC_PI_8;
    let filter_bounds = (
        vec![-angle, -angle, -angle, -0.5, -0.5, -0.5],
        vec![angle, angle, angle, 0.5, 0.5, 0.5],
    );

    let mut initial_errors = Vec::with_capacity(args.evaluations);
    let mut final_errors = Vec::with_capacity(args.evaluations);

    for count in 0..args.evaluations {
        let seed = args.seed.wrapping_add(count as u64);

        let filter =
            RandomTransformFilter::new(filter_bounds.0.clone(), filter_bounds.1.clone(), seed)
                .with_std_dev(args.noise);
        let mut ground_truth = Euler3dTransform::new(fixed_properties.bounding_box_center());
        let moving = filter.apply(&fixed, &mut ground_truth)?.points;

        let mut init = initialize_transform(
            transform_type,
            &fixed_properties,
            &compute_properties(&moving)?,
        )?;

        let mut metric = MetricFactory::create(args.metric)?;
        metric.set_fixed_point_set(&fixed);
        metric.set_moving_point_set(&moving);
        metric.set_transform(init.transform.as_mut());

        let optimizer = Lbfgs {
            max_iterations: args.iterations,
            scales: Some(init.scales.clone()),
            trace: args.trace,
            ..Default::default()
        };

        let mut registration = MultiScaleRegistration::new(schedule.clone());
        let result = registration.run(&mut metric, &optimizer)?;
        drop(metric);

        for level in &result.levels {
            log::info!(
                "trial {count} level {}: bandwidth {:.4}, value {:.6e} -> {:.6e}, {} iterations ({:?})",
                level.level,
                level.bandwidth,
                level.initial_value,
                level.final_value,
                level.iterations,
                level.termination_reason
            );
        }

        let initial_error = rms_distance(&moving, &fixed);
        let final_error = rms_distance(&moving.transformed(init.transform.as_ref()), &fixed);
        println!(
            "trial {count:4}: rms distance {initial_error:.6} -> {final_error:.6}, parameters {:?}",
            result.final_parameters
        );

        initial_errors.push(initial_error);
        final_errors.push(final_error);
    }

    if args.evaluations > 0 {
        let mean = |values: &[f64]| values.iter().sum::<f64>() / values.len() as f64;
        let max = |values: &[f64]| values.iter().copied().fold(0.0, f64::max);

        println!();
        println!(
            "initial rms distance: mean {:.6}, max {:.6}",
            mean(&initial_errors),
            max(&initial_errors)
        );
        println!(
            "final rms distance:   mean {:.6}, max {:.6}",
            mean(&final_errors),
            max(&final_errors)
        );
    }

    Ok(())
}
