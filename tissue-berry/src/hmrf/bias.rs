//! 乘性偏置场估计.
//!
//! 观测模型为 `y_i = B_i * t_i`, 其中 `t_i` 服从其所属类的高斯分布.
//! 给定当前标签和参数, `ln B` 的估计量为残差 `ln y_i - ln μ_{x_i}` 的加权局部平均:
//! 分子 (残差) 和分母 (权重) 分别做同一平滑, 再相除. 平滑核为多次盒式滤波近似的
//! 高斯核, 因此 `B` 只能缓慢变化, 不会吸收逐体素噪声.
//!
//! 最后将 `ln B` 在掩膜内中心化为零均值, 以消除与类均值之间的尺度歧义.

use ndarray::{Array1, Array3, ArrayView1, ArrayViewMut1, Axis, Zip};

use crate::config::BiasConfig;
use crate::data::Neighbourhood;
use crate::error::{check_len, SegResult};
use crate::mixture::{LabelField, MixtureParams};

/// 分母低于该值的位置没有可用残差, 取 `ln B = 0`.
const MIN_WEIGHT: f64 = 1e-12;

/// 每个掩膜体素上的乘性偏置.
#[derive(Debug, Clone, PartialEq)]
pub struct BiasField {
    data: Array1<f64>,
}

impl BiasField {
    /// 恒为 1 的偏置场.
    pub fn identity(len: usize) -> Self {
        Self {
            data: Array1::ones(len),
        }
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

    /// 偏置值, 按体素下标排列.
    #[inline]
    pub fn values(&self) -> ArrayView1<'_, f64> {
        self.data.view()
    }

    /// 校正后的强度 `y_i / B_i`.
    pub fn correct(&self, y: ArrayView1<f64>) -> Array1<f64> {
        debug_assert_eq!(y.len(), self.len());
        &y / &self.data
    }

    /// 与 `other` 之间的最大逐体素差 `max |ΔB|`.
    pub fn max_change(&self, other: &BiasField) -> f64 {
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

/// 由原始强度 `y`, 当前标签和参数估计偏置场.
///
/// 强度非正, 或所属类均值非正的体素不参与估计.
pub(crate) fn estimate(
    y: ArrayView1<f64>,
    labels: &LabelField,
    params: &MixtureParams,
    nbh: &Neighbourhood,
    config: &BiasConfig,
) -> SegResult<BiasField> {
    check_len("labels", y.len(), labels.len())?;
    check_len("neighbourhood", y.len(), nbh.len())?;

    let shape = nbh.shape();
    let mut num = Array3::<f64>::zeros(shape);
    let mut den = Array3::<f64>::zeros(shape);
    let mut used = 0;
    for (i, (&v, &l)) in y.iter().zip(labels.as_slice()).enumerate() {
        let mean = params[l as usize].mean;
        if v > 0.0 && mean > 0.0 {
            let pos = nbh.position(i);
            num[pos] = v.ln() - mean.ln();
            den[pos] = 1.0;
            used += 1;
        }
    }
    if used == 0 {
        log::warn!("no positive intensities available for bias estimation");
        return Ok(BiasField::identity(y.len()));
    }

    let radii = box_radii(config.sigma, config.passes);
    smooth(&mut num, &radii);
    smooth(&mut den, &radii);

    let mut log_b: Array1<f64> = nbh
        .positions()
        .iter()
        .map(|&pos| {
            if den[pos] > MIN_WEIGHT {
                num[pos] / den[pos]
            } else {
                0.0
            }
        })
        .collect();
    let centre = log_b.mean().unwrap_or(0.0);
    log_b -= centre;

    Ok(BiasField {
        data: log_b.mapv_into(f64::exp),
    })
}

/// 近似标准差为 `sigma` 的高斯核所需的各次盒式滤波半径.
///
/// 前 `m` 次使用宽度 `wl`, 其余使用 `wl + 2`, 使总方差最接近 `sigma²`.
fn box_radii(sigma: f64, passes: usize) -> Vec<usize> {
    if sigma <= 0.0 || passes == 0 {
        return vec![];
    }
    let n = passes as f64;
    let ideal = (12.0 * sigma * sigma / n + 1.0).sqrt();
    let mut wl = ideal.floor() as usize;
    if wl % 2 == 0 {
        wl = wl.saturating_sub(1).max(1);
    }
    let wl_f = wl as f64;
    let m = ((12.0 * sigma * sigma - n * wl_f * wl_f - 4.0 * n * wl_f - 3.0 * n)
        / (-4.0 * wl_f - 4.0))
        .round()
        .clamp(0.0, n) as usize;
    (0..passes)
        .map(|k| if k < m { wl / 2 } else { wl / 2 + 1 })
        .collect()
}

/// 依次沿三个坐标轴做盒式滤波.
fn smooth(arr: &mut Array3<f64>, radii: &[usize]) {
    for &r in radii {
        for axis in 0..3 {
            let zip = Zip::from(arr.lanes_mut(Axis(axis)));
            let op = |lane: ArrayViewMut1<f64>| box_filter_lane(lane, r);
            #[cfg(feature = "rayon")]
            zip.par_for_each(op);
            #[cfg(not(feature = "rayon"))]
            zip.for_each(op);
        }
    }
}

/// 一维盒式滤波 (窗口宽 `2r + 1`). 窗口超出边界的部分按 0 处理.
fn box_filter_lane(mut lane: ArrayViewMut1<f64>, r: usize) {
    let n = lane.len();
    if r == 0 || n < 2 {
        return;
    }
    let mut prefix = Vec::with_capacity(n + 1);
    prefix.push(0.0);
    let mut acc = 0.0;
    for &v in lane.iter() {
        acc += v;
        prefix.push(acc);
    }
    let width = (2 * r + 1) as f64;
    for (i, v) in lane.iter_mut().enumerate() {
        let lo = i.saturating_sub(r);
        let hi = (i + r + 1).min(n);
        *v = (prefix[hi] - prefix[lo]) / width;
    }
}
