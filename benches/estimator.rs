// ========================================================================================
//
//                       FEATURE-PATTERN ESTIMATOR BENCHMARK
//
// ========================================================================================
//
// Measures one marginal-likelihood fit plus posterior mean for each design width,
// on simulated data of the size of a typical region (all chords, several runs).
//
// ========================================================================================

use chordfit::chords::{Chord, all_chords};
use chordfit::estimate::{FeatureEstimator, RemlConfig};
use chordfit::predict::ModelKind;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Runs per simulated participant.
const RUNS: usize = 8;
/// Measurement channels per region.
const CHANNELS: usize = 300;

fn bench_estimator(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(42);
    let chords: Vec<Chord> = (0..RUNS).flat_map(|_| all_chords().iter().copied()).collect();
    let y = Array2::from_shape_fn((chords.len(), CHANNELS), |_| rng.gen_range(-1.0..1.0));
    let prior = Array2::<f64>::eye(31);
    let reml = RemlConfig::default();

    let mut group = c.benchmark_group("feature_estimator");
    for model in [
        ModelKind::OneFinger,
        ModelKind::TwoFinger,
        ModelKind::FourFinger,
        ModelKind::NoiseCeiling,
    ] {
        let Some(design) = model.design() else { continue };
        let estimator = FeatureEstimator::new(design, prior.view()).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(model), &estimator, |b, est| {
            b.iter(|| black_box(est.fit(y.view(), &chords, &reml).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_estimator);
criterion_main!(benches);
