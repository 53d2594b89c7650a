//! 合成脑部体模.
//!
//! 三层同心球壳: 最内层为白质, 中间为灰质, 最外层为脑脊液, 球外为掩膜外背景.
//! 每个体素的真值比例由 `SUPERSAMPLE³` 个子采样点统计得到, 因此边界上的体素
//! 带有部分容积. 强度为各类均值按比例混合后乘以偏置场, 再叠加高斯噪声,
//! 最后取整并截断到 `0..=250`.

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tissue_berry::consts::{INTENSITY_MAX, NUM_TISSUES};
use tissue_berry::{GroundTruth, SegResult, VoxelGrid};

/// 每个轴向上的子采样个数.
const SUPERSAMPLE: usize = 3;

/// 各层外半径, 相对于体模半径. 顺序为 WM, GM, CSF.
const SHELLS: [f64; NUM_TISSUES] = [0.45, 0.75, 1.0];

/// 体模参数.
#[derive(Debug, Clone, Copy)]
pub struct PhantomConfig {
    /// 立方体边长 (体素).
    pub size: usize,

    /// CSF, GM, WM 的均值.
    pub means: [f64; NUM_TISSUES],

    /// 高斯噪声标准差.
    pub noise: f64,

    /// 乘性偏置强度. `ln B` 在体模内大约位于 `[-strength, strength]`.
    pub bias: f64,

    /// 随机数种子.
    pub seed: u64,
}

impl Default for PhantomConfig {
    fn default() -> Self {
        Self {
            size: 40,
            means: [40.0, 110.0, 170.0],
            noise: 18.0,
            bias: 0.0,
            seed: 0x5eed,
        }
    }
}

/// 合成体模.
pub struct Phantom {
    /// 强度与掩膜.
    pub grid: VoxelGrid,

    /// 掩膜内每个体素的真实组织比例.
    pub truth: GroundTruth,

    /// 真实的乘性偏置场.
    pub bias: Array3<f32>,
}

impl Phantom {
    /// 按 `config` 生成体模.
    pub fn generate(config: &PhantomConfig) -> SegResult<Self> {
        let n = config.size;
        let shape = (n, n, n);
        let centre = (n as f64 - 1.0) / 2.0;
        let radius = 0.45 * n as f64;

        // 比例体数据, 按 CSF, GM, WM 顺序.
        let mut props: Vec<Array3<f32>> = (0..NUM_TISSUES).map(|_| Array3::zeros(shape)).collect();
        let step = 1.0 / SUPERSAMPLE as f64;
        let weight = 1.0 / SUPERSAMPLE.pow(3) as f32;
        for (x, y, z) in ndarray::indices(shape) {
            for (a, b, c) in sub_samples(SUPERSAMPLE) {
                let p = [
                    x as f64 - 0.5 + (a as f64 + 0.5) * step,
                    y as f64 - 0.5 + (b as f64 + 0.5) * step,
                    z as f64 - 0.5 + (c as f64 + 0.5) * step,
                ];
                let r = p.iter().map(|v| (v - centre).powi(2)).sum::<f64>().sqrt() / radius;
                if let Some(shell) = SHELLS.iter().position(|&s| r < s) {
                    // SHELLS 由内到外为 WM, GM, CSF.
                    let class = NUM_TISSUES - 1 - shell;
                    props[class][(x, y, z)] += weight;
                }
            }
        }

        let mask = Array3::from_shape_fn(shape, |pos| {
            props.iter().map(|v| v[pos]).sum::<f32>() >= 0.5
        });
        let bias = Array3::from_shape_fn(shape, |(x, y, _)| {
            let u = x as f64 / (n - 1).max(1) as f64 - 0.5;
            let v = y as f64 / (n - 1).max(1) as f64 - 0.5;
            (config.bias * (1.2 * u + 0.8 * v)).exp() as f32
        });

        let mut rng = StdRng::seed_from_u64(config.seed);
        // 标准差非法时不加噪声.
        let noise = Normal::new(0.0, config.noise).ok();
        let data = Array3::from_shape_fn(shape, |pos| {
            let clean: f64 = (0..NUM_TISSUES)
                .map(|k| props[k][pos] as f64 * config.means[k])
                .sum();
            let v = bias[pos] as f64 * clean + noise.map_or(0.0, |d| d.sample(&mut rng));
            v.round().clamp(0.0, INTENSITY_MAX) as f32
        });

        let grid = VoxelGrid::load(data, mask)?;
        let truth = GroundTruth::from_volumes(&grid, &props)?;
        Ok(Self { grid, truth, bias })
    }
}

/// `0..n` 的三重笛卡尔积.
fn sub_samples(n: usize) -> impl Iterator<Item = (usize, usize, usize)> {
    (0..n).flat_map(move |a| (0..n).flat_map(move |b| (0..n).map(move |c| (a, b, c))))
}
