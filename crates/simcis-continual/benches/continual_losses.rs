//! Benchmarks for pseudo-labelling and the set-criterion losses.

use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;

use simcis_continual::{
    dice_loss, point_sample, sample_uncertain_points, sigmoid_focal_loss, PseudoLabelConfig,
    PseudoLabelGenerator,
};
use simcis_core::{BoxCxcywh, CategoryRange, Prediction, Target};

const CANVAS: usize = 128;

fn band_target(labels: &[u32], device: &Device) -> Target {
    let n = labels.len();
    let band = CANVAS / n;
    let mut data = vec![0u8; n * CANVAS * CANVAS];
    for i in 0..n {
        for y in i * band..(i + 1) * band {
            for x in 0..CANVAS / 2 {
                data[i * CANVAS * CANVAS + y * CANVAS + x] = 1;
            }
        }
    }
    let boxes = vec![
        BoxCxcywh {
            cx: 0.25,
            cy: 0.5,
            w: 0.5,
            h: 1.0 / n as f32,
        };
        n
    ];
    let masks = Tensor::from_vec(data, (n, CANVAS, CANVAS), device).unwrap();
    Target::new(labels.to_vec(), masks, boxes).unwrap()
}

fn random_prediction(n: usize, device: &Device) -> Prediction {
    let masks = Tensor::rand(0f32, 1.0, (n, CANVAS, CANVAS), device).unwrap();
    let labels = (0..n as u32).map(|i| i % 100).collect();
    let scores = (0..n).map(|i| 1.0 - i as f32 / n as f32).collect();
    let boxes = vec![
        BoxCxcywh {
            cx: 0.5,
            cy: 0.5,
            w: 1.0,
            h: 1.0,
        };
        n
    ];
    Prediction::new(labels, scores, masks, boxes).unwrap()
}

fn benchmark_pseudo_labels(c: &mut Criterion) {
    let device = Device::Cpu;
    let generator =
        PseudoLabelGenerator::new(&PseudoLabelConfig::default(), CategoryRange::new(100, 110));
    let targets = vec![band_target(&[100, 101, 102, 103], &device)];
    let sizes = [(CANVAS, CANVAS)];

    for n in [10, 50] {
        let predictions = vec![random_prediction(n, &device)];
        c.bench_function(&format!("pseudo_labels_{n}_predictions"), |b| {
            b.iter(|| {
                generator
                    .generate(black_box(&targets), black_box(&predictions), &sizes)
                    .unwrap()
            })
        });
    }
}

fn benchmark_focal_loss(c: &mut Criterion) {
    let device = Device::Cpu;
    let logits = Tensor::randn(0f32, 1.0, (2, 110, 150), &device).unwrap();
    let targets = Tensor::zeros((2, 110, 150), DType::F32, &device).unwrap();

    c.bench_function("sigmoid_focal_loss_2x110x150", |b| {
        b.iter(|| sigmoid_focal_loss(black_box(&logits), black_box(&targets), 8.0, 0.25, 2.0).unwrap())
    });
}

fn benchmark_point_losses(c: &mut Criterion) {
    let device = Device::Cpu;
    let logits = Tensor::randn(0f32, 1.0, (16, 64, 64), &device).unwrap();
    let labels = Tensor::zeros((16, 256, 256), DType::F32, &device).unwrap();
    let mut rng = StdRng::seed_from_u64(0);

    c.bench_function("uncertain_points_16_masks", |b| {
        b.iter(|| sample_uncertain_points(black_box(&logits), 12544, 3.0, 0.75, &mut rng).unwrap())
    });

    let coords = sample_uncertain_points(&logits, 12544, 3.0, 0.75, &mut rng).unwrap();
    c.bench_function("point_sample_dice_16_masks", |b| {
        b.iter(|| {
            let point_logits = point_sample(black_box(&logits), &coords).unwrap();
            let point_labels = point_sample(black_box(&labels), &coords).unwrap();
            dice_loss(&point_logits, &point_labels, 16.0).unwrap()
        })
    });
}

criterion_group!(
    benches,
    benchmark_pseudo_labels,
    benchmark_focal_loss,
    benchmark_point_losses
);
criterion_main!(benches);
