//! ICM 标签更新和全局能量.
//!
//! 全局能量
//!
//! ```text
//! E(x) = Σ_i [(y_i - μ_{x_i})² / (2σ²_{x_i}) + ln σ_{x_i}] + Σ_{(i, j)} Ψ(x_i, x_j)
//! ```
//!
//! 其中第二项对每条无向边只计一次. 由于 `Ψ` 对称, 单个体素改变标签时
//! 局部代价的变化量恰好等于全局能量的变化量, 因此每次 (严格改进的) 更新都不会
//! 增加能量.

use ndarray::ArrayView1;

use super::potential::CliquePotential;
use crate::config::SweepOrder;
use crate::data::Neighbourhood;
use crate::mixture::{LabelField, MixtureParams};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
    }
}

/// 体素 `i` 取标签 `s` 时与邻居之间的团势之和 `Σ_{j ∈ N_i} Ψ(s, x_j)`.
///
/// 势函数恒为 0 时直接返回 0, 不访问邻居.
#[inline]
pub(crate) fn neighbour_cost<P: CliquePotential + ?Sized>(
    i: usize,
    s: u8,
    labels: &[u8],
    y: ArrayView1<f64>,
    nbh: &Neighbourhood,
    potential: &P,
) -> f64 {
    if potential.is_trivial() {
        return 0.0;
    }
    let yi = y[i];
    nbh.neighbours(i)
        .iter()
        .map(|&j| {
            let j = j as usize;
            potential.potential(s, labels[j], yi, y[j])
        })
        .sum()
}

/// 固定其它体素标签时, 体素 `i` 取标签 `s` 的局部代价.
#[inline]
pub fn local_cost<P: CliquePotential + ?Sized>(
    i: usize,
    s: u8,
    labels: &[u8],
    y: ArrayView1<f64>,
    nbh: &Neighbourhood,
    params: &MixtureParams,
    potential: &P,
) -> f64 {
    params[s as usize].data_cost(y[i]) + neighbour_cost(i, s, labels, y, nbh, potential)
}

/// 体素 `i` 的最优标签.
///
/// 只有严格更优时才离开当前标签; 多个同样更优的候选中取下标最小者.
#[inline]
fn best_label<P: CliquePotential + ?Sized>(
    i: usize,
    labels: &[u8],
    y: ArrayView1<f64>,
    nbh: &Neighbourhood,
    params: &MixtureParams,
    potential: &P,
) -> u8 {
    let current = labels[i];
    let mut best = current;
    let mut best_cost = local_cost(i, current, labels, y, nbh, params, potential);
    for s in 0..params.len() as u8 {
        if s == current {
            continue;
        }
        let cost = local_cost(i, s, labels, y, nbh, params, potential);
        if cost < best_cost {
            best = s;
            best_cost = cost;
        }
    }
    best
}

/// 初始标签: 每个体素取数据代价最小的类 (即类条件密度最大, 不含先验).
pub fn initial_labels(y: ArrayView1<f64>, params: &MixtureParams) -> LabelField {
    let labels = y
        .iter()
        .map(|&v| {
            let mut best = 0;
            let mut best_cost = params[0].data_cost(v);
            for (s, c) in params.classes().iter().enumerate().skip(1) {
                let cost = c.data_cost(v);
                if cost < best_cost {
                    best = s;
                    best_cost = cost;
                }
            }
            best as u8
        })
        .collect();
    LabelField::from_vec(labels)
}

/// 计算标签场 `labels` 的全局能量.
pub fn energy<P: CliquePotential + ?Sized>(
    y: ArrayView1<f64>,
    labels: &LabelField,
    nbh: &Neighbourhood,
    params: &MixtureParams,
    potential: &P,
) -> f64 {
    let x = labels.as_slice();
    let data: f64 = x
        .iter()
        .zip(y.iter())
        .map(|(&l, &v)| params[l as usize].data_cost(v))
        .sum();
    if potential.is_trivial() {
        return data;
    }
    let pair: f64 = nbh
        .edges()
        .map(|(i, j)| potential.potential(x[i], x[j], y[i], y[j]))
        .sum();
    data + pair
}

/// 执行一次完整的 ICM 扫描 (原地更新), 返回改变标签的体素个数.
///
/// 扫描顺序由 `order` 决定. 给定相同输入, 结果与线程数无关.
pub fn sweep<P: CliquePotential + ?Sized>(
    y: ArrayView1<f64>,
    labels: &mut LabelField,
    nbh: &Neighbourhood,
    params: &MixtureParams,
    potential: &P,
    order: SweepOrder,
) -> usize {
    debug_assert_eq!(y.len(), labels.len());
    debug_assert_eq!(y.len(), nbh.len());
    let x = labels.as_mut_slice();

    match order {
        SweepOrder::Raster => {
            let mut changed = 0;
            for i in 0..x.len() {
                let s = best_label(i, x, y, nbh, params, potential);
                if s != x[i] {
                    x[i] = s;
                    changed += 1;
                }
            }
            changed
        }
        SweepOrder::Checkerboard => (0..2)
            .map(|c| update_colour(nbh.colour(c), x, y, nbh, params, potential))
            .sum(),
    }
}

/// 更新一个颜色类中的所有体素.
///
/// 同色体素互不相邻, 故先以当前标签为快照计算全部新标签, 再统一写回,
/// 与按体素下标逐个原地更新的结果相同.
fn update_colour<P: CliquePotential + ?Sized>(
    members: &[u32],
    x: &mut [u8],
    y: ArrayView1<f64>,
    nbh: &Neighbourhood,
    params: &MixtureParams,
    potential: &P,
) -> usize {
    let snapshot: &[u8] = x;
    let op = |&i: &u32| best_label(i as usize, snapshot, y, nbh, params, potential);

    #[cfg(feature = "rayon")]
    let updates: Vec<u8> = members.par_iter().map(op).collect();
    #[cfg(not(feature = "rayon"))]
    let updates: Vec<u8> = members.iter().map(op).collect();

    let mut changed = 0;
    for (&i, s) in members.iter().zip(updates) {
        let slot = &mut x[i as usize];
        if *slot != s {
            *slot = s;
            changed += 1;
        }
    }
    changed
}
