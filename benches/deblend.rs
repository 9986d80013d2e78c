use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::{Array2, Array3};
use nmf_deblend::{
    deblend, delta_data, flatten_bands, prox_cone, translate_psfs, Constraints, DeblendOptions,
    DiagnosticLog, Factor, GridOperators, MonotonicNeighbors, Observation, OperatorFactory, Peak,
    TieBreak, Weights,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

fn gaussian(shape: (usize, usize), cx: f64, cy: f64, sigma: f64) -> Array2<f64> {
    Array2::from_shape_fn(shape, |(y, x)| {
        let dx = x as f64 - cx;
        let dy = y as f64 - cy;
        (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
    })
}

fn blend(bands: usize, size: usize) -> (Array3<f64>, Vec<Option<Peak>>) {
    let c = (size / 2) as f64;
    let peaks = vec![
        Some(Peak::new(c - 3.0, c)),
        Some(Peak::new(c + 3.0, c - 1.0)),
        Some(Peak::new(c, c + 4.0)),
    ];
    let profiles: Vec<Array2<f64>> = peaks
        .iter()
        .flatten()
        .map(|p| gaussian((size, size), p.x, p.y, 1.5) * 10.0)
        .collect();
    let images = Array3::from_shape_fn((bands, size, size), |(b, y, x)| {
        profiles
            .iter()
            .enumerate()
            .map(|(k, p)| (1.0 + ((b + k) % bands) as f64) * p[[y, x]])
            .sum()
    });
    (images, peaks)
}

fn options(verbose: bool) -> DeblendOptions {
    DeblendOptions {
        max_iter: 100,
        seed: Some(3),
        verbose,
        ..DeblendOptions::default()
    }
}

fn bench_cone_projection(c: &mut Criterion) {
    let shape = (15, 15);
    let g = GridOperators
        .radial_monotonic(shape, MonotonicNeighbors::Nearest)
        .unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let x = Array2::from_shape_fn((3, shape.0 * shape.1), |_| rng.gen_range(0.0..1.0));
    c.bench_function("cone_projection", |b| {
        b.iter(|| black_box(prox_cone(x.clone(), &g, TieBreak::LargestCrossing)));
    });
}

fn bench_delta_data(c: &mut Criterion) {
    let (images, peaks) = blend(5, 41);
    let data = flatten_bands(&images);
    let ops = translate_psfs((41, 41), &peaks, 5, None, 1e-8, &GridOperators).unwrap();
    let a = Array2::from_elem((5, 3), 1.0 / 5.0);
    let s = Array2::from_elem((3, 41 * 41), 0.5);
    c.bench_function("delta_data_morphology", |b| {
        b.iter(|| {
            let grad = delta_data(&a, &s, &data, &ops.gamma, Factor::Morphology, &Weights::Uniform).unwrap();
            black_box(grad);
        });
    });
}

fn bench_deblend(c: &mut Criterion) {
    let (images, peaks) = blend(3, 31);
    let constraints = Constraints::Uniform("M".to_string());
    let opts_verbose = options(true);
    let opts_quiet = options(false);
    let mut first = true;
    c.bench_function("deblend_three_sources", |b| {
        b.iter(|| {
            let opts = if first {
                first = false;
                &opts_verbose
            } else {
                &opts_quiet
            };
            let mut log = DiagnosticLog::new();
            let result = deblend(
                Observation::new(images.clone()),
                Some(&peaks[..]),
                Some(&constraints),
                opts,
                &mut log,
            )
            .unwrap();
            black_box(result);
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .sample_size(10)
        .warm_up_time(Duration::from_millis(500))
        .measurement_time(Duration::from_millis(1000));
    targets =
        bench_cone_projection,
        bench_delta_data,
        bench_deblend
}
criterion_main!(benches);
