//! 集成测试共用的合成数据.

#![allow(dead_code)]

use ndarray::{Array1, Array3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tissue_berry::prelude::*;

/// 只打印警告以上级别的日志. 多次调用无副作用.
pub fn init_logger() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .init();
}

/// 合成体数据及其真值.
pub struct Phantom {
    pub grid: VoxelGrid,
    pub labels: Vec<u8>,
    pub truth: GroundTruth,
}

impl Phantom {
    pub fn intensities(&self) -> Array1<f64> {
        self.grid.masked_intensities()
    }

    pub fn neighbourhood(&self) -> Neighbourhood {
        Neighbourhood::build(&self.grid)
    }
}

/// 沿 x 轴等分为 `means.len()` 个厚片的全掩膜立方体, 第 `k` 片为第 `k` 类.
///
/// 每个体素的强度为 `bias(x, y, z) * (means[k] + N(0, std²))`, 截断到 `0..=250`.
pub fn slabs(
    n: usize,
    means: &[f64],
    std: f64,
    seed: u64,
    bias: impl Fn(usize, usize, usize) -> f64,
) -> Phantom {
    let shape = (n, n, n);
    let k = means.len();
    let class_of = |x: usize| (x * k / n) as u8;
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, std).unwrap();

    let data = Array3::from_shape_fn(shape, |(x, y, z)| {
        let v = bias(x, y, z) * (means[class_of(x) as usize] + noise.sample(&mut rng));
        v.clamp(0.0, 250.0) as f32
    });
    let grid = VoxelGrid::load(data, Array3::from_elem(shape, true)).unwrap();
    let labels: Vec<u8> = (0..grid.len()).map(|i| class_of(grid.position(i).0)).collect();
    let truth = GroundTruth::from_labels(&labels, k).unwrap();
    Phantom {
        grid,
        labels,
        truth,
    }
}

/// 不含空间结构的混合样本, 按类依次排列.
pub fn mixture_sample(counts: &[usize], means: &[f64], std: f64, seed: u64) -> Array1<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, std).unwrap();
    counts
        .iter()
        .zip(means)
        .flat_map(|(&c, &m)| (0..c).map(move |_| m).collect::<Vec<_>>())
        .map(|m| m + noise.sample(&mut rng))
        .collect()
}

/// 硬标签与真值不同的体素比例.
pub fn label_error(pred: &LabelField, truth: &[u8]) -> f64 {
    let wrong = pred
        .as_slice()
        .iter()
        .zip(truth)
        .filter(|(a, b)| a != b)
        .count();
    wrong as f64 / truth.len() as f64
}
