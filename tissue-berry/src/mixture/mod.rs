//! 高斯混合模型参数, 后验场, 标签场, 以及 EM 与 HMRF 共用的 E/M 步公式.

use std::ops::Index;

use itertools::izip;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayViewMut1, Axis, Zip};

use crate::config::VarianceFloor;
use crate::consts::LABEL_BACKGROUND;
use crate::data::{argmax, VoxelGrid};
use crate::error::{check_len, SegError, SegResult};

mod em;

pub use em::{fit_finite_mixture, MixtureFit};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 权重低于该值的类视为空类.
const EMPTY_CLASS_WEIGHT: f64 = 1e-10;

/// `0.5 * ln(2π)`.
const HALF_LN_2PI: f64 = 0.918_938_533_204_672_8;

/// 单个组织类的高斯参数和混合先验.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClassParams {
    /// 混合先验.
    pub prior: f64,

    /// 均值.
    pub mean: f64,

    /// 方差.
    pub variance: f64,
}

impl ClassParams {
    /// 标准差.
    #[inline]
    pub fn std(&self) -> f64 {
        self.variance.sqrt()
    }

    /// 数据项代价 `(y - μ)² / (2σ²) + ln σ`, 即去掉常数的负对数似然.
    #[inline]
    pub fn data_cost(&self, y: f64) -> f64 {
        (y - self.mean).powi(2) / (2.0 * self.variance) + 0.5 * self.variance.ln()
    }

    /// 先验, 均值, 方差是否均为有限值.
    #[inline]
    pub fn is_finite(&self) -> bool {
        self.prior.is_finite() && self.mean.is_finite() && self.variance.is_finite()
    }

    /// 对数密度 `ln N(y; μ, σ²)`.
    #[inline]
    pub fn log_density(&self, y: f64) -> f64 {
        -self.data_cost(y) - HALF_LN_2PI
    }
}

/// 高斯混合模型的全部自由参数. 各类按均值升序排列.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MixtureParams {
    classes: Vec<ClassParams>,
}

impl MixtureParams {
    /// 构建混合参数. 先验会被重新归一化 (全为 0 时取均匀先验).
    ///
    /// 类别数小于 2 或超过 `u8::MAX` 时返回 `SegError::InvalidClassCount`.
    pub fn new(mut classes: Vec<ClassParams>) -> SegResult<Self> {
        let k = classes.len();
        if !(2..=u8::MAX as usize).contains(&k) {
            return Err(SegError::InvalidClassCount(k));
        }
        let total: f64 = classes.iter().map(|c| c.prior.max(0.0)).sum();
        for c in classes.iter_mut() {
            c.prior = if total > 0.0 {
                c.prior.max(0.0) / total
            } else {
                1.0 / k as f64
            };
        }
        Ok(Self { classes })
    }

    /// 由先验, 均值, 方差三个数组构建.
    pub fn from_parts(priors: &[f64], means: &[f64], variances: &[f64]) -> SegResult<Self> {
        check_len("means", priors.len(), means.len())?;
        check_len("variances", priors.len(), variances.len())?;
        Self::new(
            izip!(priors, means, variances)
                .map(|(&prior, &mean, &variance)| ClassParams {
                    prior,
                    mean,
                    variance,
                })
                .collect(),
        )
    }

    /// 类别数.
    #[inline]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// 是否没有类. 由构建时的检查保证恒为 `false`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// 所有类的参数.
    #[inline]
    pub fn classes(&self) -> &[ClassParams] {
        &self.classes
    }

    /// 先验.
    pub fn priors(&self) -> Vec<f64> {
        self.classes.iter().map(|c| c.prior).collect()
    }

    /// 均值.
    pub fn means(&self) -> Vec<f64> {
        self.classes.iter().map(|c| c.mean).collect()
    }

    /// 方差.
    pub fn variances(&self) -> Vec<f64> {
        self.classes.iter().map(|c| c.variance).collect()
    }

    /// 与 `other` 之间的参数变化量: 各类 `|Δ均值|`, `|Δ标准差|`, `|Δ先验|` 的最大值.
    ///
    /// 任一差值为 NaN 时返回 NaN, 因此不会满足任何收敛阈值.
    pub fn max_change(&self, other: &MixtureParams) -> f64 {
        debug_assert_eq!(self.len(), other.len());
        self.classes
            .iter()
            .zip(other.classes.iter())
            .flat_map(|(a, b)| {
                [
                    (a.mean - b.mean).abs(),
                    (a.std() - b.std()).abs(),
                    (a.prior - b.prior).abs(),
                ]
            })
            .fold(0.0, |acc: f64, d| {
                if acc.is_nan() || d.is_nan() {
                    f64::NAN
                } else {
                    acc.max(d)
                }
            })
    }

    /// 所有参数是否均为有限值.
    pub fn is_finite(&self) -> bool {
        self.classes.iter().all(ClassParams::is_finite)
    }

    /// 在 `y` 上的总对数似然 `Σ_i ln Σ_s π_s N(y_i; μ_s, σ_s²)`.
    pub fn log_likelihood(&self, y: ArrayView1<f64>) -> f64 {
        let mut buf = vec![0.0; self.len()];
        y.iter()
            .map(|&v| {
                for (b, c) in buf.iter_mut().zip(self.classes.iter()) {
                    *b = c.prior.ln() + c.log_density(v);
                }
                normalise_log(&mut buf)
            })
            .sum()
    }

    /// 对所有方差应用下限策略. `iteration` 用于错误报告.
    ///
    /// `last_valid` 为出错时报告的最后一组合法参数.
    pub(crate) fn apply_floor(
        mut self,
        floor: VarianceFloor,
        iteration: usize,
        last_valid: &MixtureParams,
    ) -> SegResult<Self> {
        let min_var = floor.min_variance();
        for (k, c) in self.classes.iter_mut().enumerate() {
            if c.variance >= min_var {
                continue;
            }
            match floor {
                VarianceFloor::Floor(_) => {
                    log::warn!(
                        "iteration {iteration}: variance of class {k} ({:e}) floored to {min_var:e}",
                        c.variance
                    );
                    c.variance = min_var;
                }
                VarianceFloor::Fatal(_) => {
                    return Err(SegError::DegenerateClass {
                        iteration,
                        class: k,
                        variance: c.variance,
                        last_params: Box::new(last_valid.clone()),
                    });
                }
            }
        }
        Ok(self)
    }
}

impl Index<usize> for MixtureParams {
    type Output = ClassParams;

    #[inline]
    fn index(&self, k: usize) -> &ClassParams {
        &self.classes[k]
    }
}

/// 后验场: 每个掩膜体素在各组织类上的概率分布 (每行之和为 1).
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorField {
    data: Array2<f64>,
}

impl PosteriorField {
    /// 由 `(体素个数, 类别数)` 形状的矩阵构建. 不做归一化检查.
    #[inline]
    pub fn from_matrix(data: Array2<f64>) -> Self {
        Self { data }
    }

    /// 由硬标签构建 one-hot 后验.
    pub fn one_hot(labels: &LabelField, num_classes: usize) -> Self {
        let mut data = Array2::zeros((labels.len(), num_classes));
        for (i, &l) in labels.as_slice().iter().enumerate() {
            data[(i, l as usize)] = 1.0;
        }
        Self { data }
    }

    /// 体素个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    /// 是否不含体素.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    /// 类别数.
    #[inline]
    pub fn num_classes(&self) -> usize {
        self.data.ncols()
    }

    /// 第 `i` 个体素的后验.
    #[inline]
    pub fn row(&self, i: usize) -> ArrayView1<'_, f64> {
        self.data.row(i)
    }

    /// 矩阵的一份不可变 shallow copy.
    #[inline]
    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// 取后验最大的类作为硬标签 (相同时取下标小者).
    pub fn argmax(&self) -> LabelField {
        LabelField::from_vec(
            self.data
                .axis_iter(Axis(0))
                .map(|row| argmax(row) as u8)
                .collect(),
        )
    }

    /// 第 `k` 类的后验权重之和.
    pub fn class_weight(&self, k: usize) -> f64 {
        self.data.column(k).sum()
    }
}

/// 标签场: 每个掩膜体素当前的硬组织标签 (类下标).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LabelField {
    data: Vec<u8>,
}

impl LabelField {
    /// 由类下标数组构建.
    #[inline]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// 体素个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 是否不含体素.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 底层数据.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// 各类的体素个数.
    pub fn counts(&self, num_classes: usize) -> Vec<usize> {
        let mut ans = vec![0; num_classes];
        for &l in self.data.iter() {
            ans[l as usize] += 1;
        }
        ans
    }

    /// 与 `other` 不同的体素个数.
    pub fn diff_count(&self, other: &LabelField) -> usize {
        self.data
            .iter()
            .zip(other.data.iter())
            .filter(|(a, b)| a != b)
            .count()
    }

    /// 写回为标签体数据. 掩膜外为 `LABEL_BACKGROUND`, 第 `k` 类为 `k + 1`.
    pub fn to_volume(&self, grid: &VoxelGrid) -> SegResult<Array3<u8>> {
        let shifted: Vec<u8> = self.data.iter().map(|&l| l + 1).collect();
        grid.scatter(&shifted, LABEL_BACKGROUND)
    }
}

impl Index<usize> for LabelField {
    type Output = u8;

    #[inline]
    fn index(&self, i: usize) -> &u8 {
        &self.data[i]
    }
}

/// 就地把对数权重 `a_k` 归一化为概率, 返回 `ln Σ_k exp(a_k)`.
///
/// 全部权重为 `-inf` 时输出均匀分布.
pub(crate) fn normalise_log(buf: &mut [f64]) -> f64 {
    let max = buf.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        let u = 1.0 / buf.len() as f64;
        buf.iter_mut().for_each(|v| *v = u);
        return max;
    }
    let mut sum = 0.0;
    for v in buf.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    buf.iter_mut().for_each(|v| *v /= sum);
    max + sum.ln()
}

/// 非空间 E 步: `p(s | y_i) ∝ π_s N(y_i; μ_s, σ_s²)`.
///
/// 返回后验场和总对数似然.
pub(crate) fn e_step(y: ArrayView1<f64>, params: &MixtureParams) -> (PosteriorField, f64) {
    let k = params.len();
    let log_priors: Vec<f64> = params.classes().iter().map(|c| c.prior.ln()).collect();
    let mut post = Array2::zeros((y.len(), k));
    let mut norm = Array1::zeros(y.len());

    let zip = Zip::from(post.rows_mut()).and(&mut norm).and(y);
    let op = |mut row: ArrayViewMut1<f64>, n: &mut f64, &v: &f64| {
        for (s, c) in params.classes().iter().enumerate() {
            row[s] = log_priors[s] + c.log_density(v);
        }
        // 行是标准布局, 一定连续.
        if let Some(buf) = row.as_slice_mut() {
            *n = normalise_log(buf);
        }
    };
    #[cfg(feature = "rayon")]
    zip.par_for_each(op);
    #[cfg(not(feature = "rayon"))]
    zip.for_each(op);

    // 串行求和, 保证结果与线程数无关.
    (PosteriorField { data: post }, norm.sum())
}

/// M 步: 以后验为权重重新估计均值, 方差和先验.
///
/// 权重为 0 的空类保留 `prev` 中的均值和方差. 方差按 `floor` 处理.
pub(crate) fn m_step(
    y: ArrayView1<f64>,
    post: &PosteriorField,
    prev: &MixtureParams,
    floor: VarianceFloor,
    iteration: usize,
) -> SegResult<MixtureParams> {
    debug_assert_eq!(y.len(), post.len());
    let n = y.len() as f64;

    let classes = (0..prev.len())
        .map(|k| {
            let w = post.data.column(k);
            let weight: f64 = w.sum();
            if weight <= EMPTY_CLASS_WEIGHT {
                return ClassParams {
                    prior: weight / n,
                    ..prev[k]
                };
            }
            let mean = izip!(w.iter(), y.iter()).map(|(p, v)| p * v).sum::<f64>() / weight;
            let variance = izip!(w.iter(), y.iter())
                .map(|(p, v)| p * (v - mean).powi(2))
                .sum::<f64>()
                / weight;
            ClassParams {
                prior: weight / n,
                mean,
                variance,
            }
        })
        .collect::<Vec<_>>();

    if let Some(class) = classes.iter().position(|c| !c.is_finite()) {
        return Err(SegError::NonFiniteParams {
            iteration,
            class,
            last_params: Box::new(prev.clone()),
        });
    }
    MixtureParams { classes }.apply_floor(floor, iteration, prev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::f64::consts::PI;

    fn two_class() -> MixtureParams {
        MixtureParams::from_parts(&[0.5, 0.5], &[10.0, 200.0], &[4.0, 4.0]).unwrap()
    }

    #[test]
    fn test_invalid_class_count() {
        assert!(matches!(
            MixtureParams::from_parts(&[1.0], &[1.0], &[1.0]),
            Err(SegError::InvalidClassCount(1))
        ));
        assert!(MixtureParams::from_parts(&[1.0, 1.0], &[1.0], &[1.0, 1.0]).is_err());
    }

    #[test]
    fn test_priors_renormalised() {
        let p = MixtureParams::from_parts(&[2.0, 6.0], &[0.0, 1.0], &[1.0, 1.0]).unwrap();
        assert_eq!(p.priors(), vec![0.25, 0.75]);
        let p = MixtureParams::from_parts(&[0.0, 0.0], &[0.0, 1.0], &[1.0, 1.0]).unwrap();
        assert_eq!(p.priors(), vec![0.5, 0.5]);
    }

    #[test]
    fn test_log_density_matches_closed_form() {
        let c = ClassParams {
            prior: 1.0,
            mean: 3.0,
            variance: 4.0,
        };
        let expect = (-(5.0f64 - 3.0).powi(2) / 8.0).exp() / (2.0 * PI * 4.0).sqrt();
        assert!((c.log_density(5.0) - expect.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_normalise_log() {
        let mut buf = [0.0f64, 2.0f64.ln()];
        let z = normalise_log(&mut buf);
        assert!((z - 3.0f64.ln()).abs() < 1e-12);
        assert!((buf[0] - 1.0 / 3.0).abs() < 1e-12);

        let mut buf = [f64::NEG_INFINITY; 4];
        normalise_log(&mut buf);
        assert_eq!(buf, [0.25; 4]);

        // 数值稳定: 大幅负值不下溢.
        let mut buf = [-1e4, -1e4 - 1.0];
        normalise_log(&mut buf);
        assert!(buf[0] > buf[1] && (buf[0] + buf[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_e_step_separated() {
        let y = array![10.0, 11.0, 199.0, 200.0];
        let (post, ll) = e_step(y.view(), &two_class());
        assert!(ll.is_finite());
        assert_eq!(post.argmax().as_slice(), &[0, 0, 1, 1]);
        for i in 0..post.len() {
            assert!((post.row(i).sum() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_m_step_weighted_statistics() {
        let y = array![1.0, 3.0, 10.0];
        let post = PosteriorField::from_matrix(array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0]]);
        let p = m_step(y.view(), &post, &two_class(), VarianceFloor::Floor(0.5), 0).unwrap();
        assert_eq!(p[0].mean, 2.0);
        assert_eq!(p[0].variance, 1.0);
        assert!((p[0].prior - 2.0 / 3.0).abs() < 1e-12);
        // 单点类方差为 0, 被截断.
        assert_eq!(p[1].mean, 10.0);
        assert_eq!(p[1].variance, 0.5);
    }

    #[test]
    fn test_m_step_fatal_floor() {
        let y = array![1.0, 3.0, 10.0];
        let post = PosteriorField::from_matrix(array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0]]);
        let e = m_step(y.view(), &post, &two_class(), VarianceFloor::Fatal(0.5), 7).unwrap_err();
        match e {
            SegError::DegenerateClass {
                iteration,
                class,
                last_params,
                ..
            } => {
                assert_eq!((iteration, class), (7, 1));
                assert_eq!(*last_params, two_class());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_m_step_empty_class_keeps_params() {
        let y = array![1.0, 3.0];
        let post = PosteriorField::from_matrix(array![[1.0, 0.0], [1.0, 0.0]]);
        let p = m_step(y.view(), &post, &two_class(), VarianceFloor::default(), 0).unwrap();
        assert_eq!(p[1].mean, 200.0);
        assert_eq!(p[1].variance, 4.0);
        assert_eq!(p[1].prior, 0.0);
    }

    #[test]
    fn test_max_change_keeps_nan() {
        let good = two_class();
        let mut bad = good.clone();
        bad.classes[0].mean = f64::NAN;
        assert!(good.max_change(&bad).is_nan());
        assert!(bad.max_change(&good).is_nan());
        assert!(!bad.is_finite());
        assert!(good.is_finite());
        assert_eq!(good.max_change(&good), 0.0);
    }

    #[test]
    fn test_m_step_rejects_non_finite_posteriors() {
        let y = array![1.0, 3.0, 10.0];
        let post = PosteriorField::from_matrix(array![[f64::NAN, f64::NAN], [1.0, 0.0], [0.0, 1.0]]);
        let e = m_step(y.view(), &post, &two_class(), VarianceFloor::default(), 4).unwrap_err();
        assert!(matches!(
            e,
            SegError::NonFiniteParams {
                iteration: 4,
                class: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_label_field_helpers() {
        let a = LabelField::from_vec(vec![0, 1, 1, 2]);
        let b = LabelField::from_vec(vec![0, 2, 1, 2]);
        assert_eq!(a.counts(3), vec![1, 2, 1]);
        assert_eq!(a.diff_count(&b), 1);
        let post = PosteriorField::one_hot(&a, 3);
        assert_eq!(post.argmax(), a);
        assert_eq!(post.class_weight(1), 2.0);
    }
}
