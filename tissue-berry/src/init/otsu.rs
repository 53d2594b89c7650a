//! Otsu 多门限初始化.

use ndarray::ArrayView1;

use crate::consts::{DEFAULT_VARIANCE_FLOOR, HISTOGRAM_BINS, INTENSITY_MAX};
use crate::error::{SegError, SegResult};
use crate::mixture::{ClassParams, MixtureParams};

/// 再优化的最大轮数. 实际数据通常一两轮即稳定.
const MAX_REFINE_ROUNDS: usize = 100;

/// 等宽 bin 合并了不同强度值时, 加密 bin 的上限.
const MAX_BINS: usize = 1 << 20;

/// 观测强度范围 `[min, max]` 上的等宽直方图. 非有限值不计入.
#[derive(Debug, Clone)]
pub struct Histogram {
    min: f64,
    width: f64,
    counts: Vec<u64>,

    // 以 bin 中心为代表值的前缀和: 个数, 一阶矩, 二阶矩, 非空 bin 个数.
    c0: Vec<f64>,
    c1: Vec<f64>,
    c2: Vec<f64>,
    nonempty: Vec<usize>,
}

impl Histogram {
    /// 构建 `bins` 个 bin 的直方图. 所有值相同时全部落在第 0 个 bin.
    pub fn new(y: ArrayView1<f64>, bins: usize) -> Self {
        debug_assert!(bins > 0);
        let (min, max) = finite_range(y);
        let width = if max > min {
            (max - min) / bins as f64
        } else {
            1.0
        };
        Self::with_layout(y, min, width, bins)
    }

    /// 按强度数据选择 bin 划分.
    ///
    /// 全为整数且跨度不超过强度值域时, 每个整数值独占一个宽为 1 的 bin,
    /// 保证不同的强度值不会被合并. 否则在 `[min, max]` 上等分为 `bins` 个 bin.
    pub fn for_intensities(y: ArrayView1<f64>, bins: usize) -> Self {
        let (min, max) = finite_range(y);
        let integral = y.iter().filter(|v| v.is_finite()).all(|v| v.fract() == 0.0);
        if integral && min <= max && max - min <= INTENSITY_MAX {
            let n = (max - min) as usize + 1;
            return Self::with_layout(y, min - 0.5, 1.0, n);
        }
        Self::new(y, bins)
    }

    fn with_layout(y: ArrayView1<f64>, min: f64, width: f64, bins: usize) -> Self {
        let mut hist = Self {
            min,
            width,
            counts: vec![0; bins],
            c0: Vec::with_capacity(bins + 1),
            c1: Vec::with_capacity(bins + 1),
            c2: Vec::with_capacity(bins + 1),
            nonempty: Vec::with_capacity(bins + 1),
        };
        for &v in y.iter().filter(|v| v.is_finite()) {
            let b = hist.bin_of(v);
            hist.counts[b] += 1;
        }

        let (mut s0, mut s1, mut s2, mut ne) = (0.0, 0.0, 0.0, 0);
        hist.c0.push(s0);
        hist.c1.push(s1);
        hist.c2.push(s2);
        hist.nonempty.push(ne);
        for (b, &c) in hist.counts.iter().enumerate() {
            let n = c as f64;
            let v = hist.min + (b as f64 + 0.5) * hist.width;
            s0 += n;
            s1 += n * v;
            s2 += n * v * v;
            ne += usize::from(c > 0);
            hist.c0.push(s0);
            hist.c1.push(s1);
            hist.c2.push(s2);
            hist.nonempty.push(ne);
        }
        hist
    }

    /// bin 个数.
    #[inline]
    pub fn bins(&self) -> usize {
        self.counts.len()
    }

    /// 每个 bin 的计数.
    #[inline]
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// 归一化后的频率. 直方图为空时全为 0.
    pub fn frequencies(&self) -> Vec<f64> {
        let total = self.total() as f64;
        self.counts
            .iter()
            .map(|&c| if total > 0.0 { c as f64 / total } else { 0.0 })
            .collect()
    }

    /// 计入的样本总数.
    #[inline]
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// 非空 bin 的个数.
    #[inline]
    pub fn nonempty_bins(&self) -> usize {
        self.nonempty[self.bins()]
    }

    /// bin 宽度.
    #[inline]
    pub fn bin_width(&self) -> f64 {
        self.width
    }

    /// 强度 `v` 所在的 bin. 超出范围的值被截断到两端.
    #[inline]
    pub fn bin_of(&self, v: f64) -> usize {
        let b = ((v - self.min) / self.width).floor();
        if b <= 0.0 {
            0
        } else {
            (b as usize).min(self.bins() - 1)
        }
    }

    /// 第 `b` 个 bin 的上边界.
    #[inline]
    pub fn upper_edge(&self, b: usize) -> f64 {
        self.min + (b + 1) as f64 * self.width
    }

    /// bin 区间 `a..=b` 内的平方误差和 `Σ n (v - mean)²`.
    #[inline]
    fn sse(&self, a: usize, b: usize) -> f64 {
        let n = self.c0[b + 1] - self.c0[a];
        if n <= 0.0 {
            return 0.0;
        }
        let s = self.c1[b + 1] - self.c1[a];
        (self.c2[b + 1] - self.c2[a] - s * s / n).max(0.0)
    }

    /// bin 区间 `a..=b` 内的非空 bin 个数.
    #[inline]
    fn nonempty_in(&self, a: usize, b: usize) -> usize {
        self.nonempty[b + 1] - self.nonempty[a]
    }

    /// 在 `a..=b` 内选择最优二分点 `t`: 下半 `a..=t`, 上半 `t + 1..=b`.
    ///
    /// 下半至少含 1 个非空 bin, 上半至少含 `upper_need` 个. 类内平方误差和相同时取
    /// 较小的 `t`. 无合法分点时返回 `None`.
    fn best_split(&self, a: usize, b: usize, upper_need: usize) -> Option<usize> {
        let mut best = None;
        let mut best_cost = f64::INFINITY;
        for t in a..b {
            if self.nonempty_in(a, t) < 1 || self.nonempty_in(t + 1, b) < upper_need {
                continue;
            }
            let cost = self.sse(a, t) + self.sse(t + 1, b);
            if cost < best_cost {
                best = Some(t);
                best_cost = cost;
            }
        }
        best
    }
}

/// 有限值的 `(min, max)`. 不含有限值时为 `(inf, -inf)`.
fn finite_range(y: ArrayView1<f64>) -> (f64, f64) {
    y.iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// 不同有限强度值的个数.
fn distinct_values(y: ArrayView1<f64>) -> usize {
    let mut v: Vec<f64> = y.iter().copied().filter(|v| v.is_finite()).collect();
    v.sort_unstable_by(f64::total_cmp);
    v.dedup();
    v.len()
}

/// 为 `num_classes` 类构建直方图.
///
/// 不同强度值少于类别数时返回 `SegError::DegenerateHistogram`.
/// 等宽划分把不同强度值合并到过少的 bin 中时, 成倍加密 bin 直到足够.
fn class_histogram(y: ArrayView1<f64>, num_classes: usize) -> SegResult<Histogram> {
    let distinct = distinct_values(y);
    if distinct < num_classes {
        return Err(SegError::DegenerateHistogram(distinct, num_classes));
    }
    let mut hist = Histogram::for_intensities(y, HISTOGRAM_BINS);
    while hist.nonempty_bins() < num_classes {
        let bins = hist.bins() * 2;
        if bins > MAX_BINS {
            return Err(SegError::DegenerateHistogram(hist.nonempty_bins(), num_classes));
        }
        log::debug!("Otsu histogram refined to {bins} bins");
        hist = Histogram::new(y, bins);
    }
    Ok(hist)
}

/// 计算 `num_classes - 1` 个分割点 (bin 下标, 严格递增).
///
/// 先在上半部分递归二分, 再轮流在相邻两个分割点之间重新优化每个分割点,
/// 直到没有分割点移动.
fn split_points(hist: &Histogram, num_classes: usize) -> SegResult<Vec<usize>> {
    let last = hist.bins() - 1;
    let nonempty = hist.nonempty_bins();
    if nonempty < num_classes {
        return Err(SegError::DegenerateHistogram(nonempty, num_classes));
    }

    let mut splits = Vec::with_capacity(num_classes - 1);
    let mut start = 0;
    for k in 1..num_classes {
        // 非空 bin 足够时分点必然存在.
        let t = hist
            .best_split(start, last, num_classes - k)
            .ok_or(SegError::DegenerateHistogram(nonempty, num_classes))?;
        splits.push(t);
        start = t + 1;
    }
    log::debug!("Otsu recursive split points: {splits:?}");

    for round in 0..MAX_REFINE_ROUNDS {
        let mut moved = false;
        for j in 0..splits.len() {
            let a = if j == 0 { 0 } else { splits[j - 1] + 1 };
            let b = if j + 1 == splits.len() { last } else { splits[j + 1] };
            if let Some(t) = hist.best_split(a, b, 1) {
                if t != splits[j] {
                    splits[j] = t;
                    moved = true;
                }
            }
        }
        if !moved {
            log::debug!("Otsu refinement stable after {round} rounds: {splits:?}");
            break;
        }
    }
    Ok(splits)
}

fn check_class_count(num_classes: usize) -> SegResult<()> {
    if (2..=HISTOGRAM_BINS.min(u8::MAX as usize)).contains(&num_classes) {
        Ok(())
    } else {
        Err(SegError::InvalidClassCount(num_classes))
    }
}

/// Otsu 多门限: 返回 `num_classes - 1` 个升序门限 (强度值).
///
/// 强度不超过第 `j` 个门限且超过第 `j - 1` 个门限的体素属于第 `j` 类.
pub fn otsu_thresholds(y: ArrayView1<f64>, num_classes: usize) -> SegResult<Vec<f64>> {
    check_class_count(num_classes)?;
    if y.is_empty() {
        return Err(SegError::EmptyMask);
    }
    let hist = class_histogram(y, num_classes)?;
    let splits = split_points(&hist, num_classes)?;
    Ok(splits.into_iter().map(|t| hist.upper_edge(t)).collect())
}

/// 由 Otsu 门限得到初始混合参数.
///
/// 每个强度带的经验均值, 总体方差 (不低于 `DEFAULT_VARIANCE_FLOOR`) 和体素占比,
/// 各类按均值升序排列.
pub fn otsu_init(y: ArrayView1<f64>, num_classes: usize) -> SegResult<MixtureParams> {
    check_class_count(num_classes)?;
    if y.is_empty() {
        return Err(SegError::EmptyMask);
    }
    let hist = class_histogram(y, num_classes)?;
    let splits = split_points(&hist, num_classes)?;

    // 每个 bin 所属的类.
    let mut band_of_bin = vec![0; hist.bins()];
    let mut band = 0;
    for (b, slot) in band_of_bin.iter_mut().enumerate() {
        *slot = band;
        if band < splits.len() && b == splits[band] {
            band += 1;
        }
    }

    let mut count = vec![0usize; num_classes];
    let mut sum = vec![0.0; num_classes];
    let finite = || y.iter().copied().filter(|v| v.is_finite());
    for v in finite() {
        let k = band_of_bin[hist.bin_of(v)];
        count[k] += 1;
        sum[k] += v;
    }
    let means: Vec<f64> = sum
        .iter()
        .zip(count.iter())
        .map(|(&s, &n)| s / n.max(1) as f64)
        .collect();
    let mut sq = vec![0.0; num_classes];
    for v in finite() {
        let k = band_of_bin[hist.bin_of(v)];
        sq[k] += (v - means[k]).powi(2);
    }

    let total = count.iter().sum::<usize>() as f64;
    let classes = (0..num_classes)
        .map(|k| ClassParams {
            prior: count[k] as f64 / total,
            mean: means[k],
            variance: (sq[k] / count[k].max(1) as f64).max(DEFAULT_VARIANCE_FLOOR),
        })
        .collect();
    let params = MixtureParams::new(classes)?;
    debug_assert!(params.means().windows(2).all(|w| w[0] < w[1]));

    log::info!(
        "Otsu init: means {:?}, variances {:?}, priors {:?}",
        params.means(),
        params.variances(),
        params.priors()
    );
    Ok(params)
}
