//! HMRF-ICM 分割引擎.
//!
//! 每次外层迭代依次执行:
//!
//! 1. (可选) 由当前标签和参数估计偏置场, 得到校正后的强度;
//! 2. 至多 `sweeps_per_iter` 次 ICM 扫描, 标签不再变化时提前结束;
//! 3. E 步: 以邻域条件先验 `p(s | x_N) ∝ π_s exp(-Σ_j Ψ(s, x_j))` 计算后验;
//! 4. M 步: 以后验为权重重新估计参数, 并检查方差退化.
//!
//! 参数变化量, 标签变化个数, (开启时) 偏置场变化量同时低于阈值时收敛.
//! 达到迭代上限或被取消时返回最后一次完整迭代后的状态.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::{Array2, ArrayView1, ArrayViewMut1, Zip};

use crate::config::{HmrfConfig, VarianceFloor};
use crate::data::Neighbourhood;
use crate::error::{check_finite, check_len, SegError, SegResult};
use crate::mixture::{m_step, normalise_log, LabelField, MixtureParams, PosteriorField};

mod bias;
pub mod icm;
pub mod potential;

pub use bias::BiasField;
pub use potential::{CliquePotential, Potential};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 外层迭代之间检查的取消标志. 克隆后共享同一标志.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// 新建未取消的标志.
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求取消. 正在进行的外层迭代会先完成.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// 是否已请求取消.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 外层循环结束的原因.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StopReason {
    /// 满足收敛条件.
    Converged,

    /// 达到迭代上限.
    IterationCap,

    /// 调用者取消.
    Cancelled,
}

/// HMRF 拟合结果.
#[derive(Debug, Clone)]
pub struct HmrfResult {
    /// 最终标签.
    pub labels: LabelField,

    /// 与最终标签和参数对应的后验.
    pub posteriors: PosteriorField,

    /// 最终参数.
    pub params: MixtureParams,

    /// 完成的外层迭代次数.
    pub iterations: usize,

    /// 是否收敛. 等价于 `stop == StopReason::Converged`.
    pub converged: bool,

    /// 结束原因.
    pub stop: StopReason,

    /// 偏置场. 未开启校正时为 `None`.
    pub bias: Option<BiasField>,

    /// 每次 ICM 扫描后的全局能量 (按扫描时的参数计算).
    pub energy_trace: Vec<f64>,
}

/// HMRF-ICM 引擎.
#[derive(Debug, Clone, Default)]
pub struct HmrfEngine {
    config: HmrfConfig,
    cancel: Option<CancelToken>,
}

impl HmrfEngine {
    /// 以给定参数新建引擎.
    pub fn new(config: HmrfConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }

    /// 附加取消标志.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// 引擎参数.
    #[inline]
    pub fn config(&self) -> &HmrfConfig {
        &self.config
    }

    /// 使用 `config.potential` 拟合.
    ///
    /// 团势参数不合法 (β 为负或非有限, σ 非正或非有限) 时返回
    /// `SegError::InvalidParameter`.
    pub fn fit(
        &self,
        y: ArrayView1<f64>,
        nbh: &Neighbourhood,
        init: &MixtureParams,
    ) -> SegResult<HmrfResult> {
        self.config.potential.validate()?;
        self.fit_with(y, nbh, init, &self.config.potential)
    }

    /// 使用自定义团势 `potential` 拟合. `config.potential` 被忽略.
    ///
    /// `y` 为按体素下标排列的掩膜强度, 长度必须与 `nbh` 一致.
    /// `y` 含非有限值或其余参数不合法时返回 `SegError::InvalidParameter`.
    /// 团势返回 NaN 等导致参数非有限时返回 `SegError::NonFiniteParams`.
    pub fn fit_with<P: CliquePotential + ?Sized>(
        &self,
        y: ArrayView1<f64>,
        nbh: &Neighbourhood,
        init: &MixtureParams,
        potential: &P,
    ) -> SegResult<HmrfResult> {
        if y.is_empty() {
            return Err(SegError::EmptyMask);
        }
        check_len("neighbourhood", y.len(), nbh.len())?;
        self.config.validate_iteration()?;
        check_finite("intensities", y)?;

        let cfg = &self.config;
        let floor = cfg.variance_floor;
        let mut params = init.clone().apply_floor(floor, 0, init)?;
        let mut labels = icm::initial_labels(y, &params);
        let mut corrected = y.to_owned();
        let mut bias: Option<BiasField> = None;
        let mut energy_trace = Vec::new();
        let mut iterations = 0;
        let mut stop = StopReason::IterationCap;

        log::info!(
            "HMRF fit: {} voxels, {} classes, potential {:?}, order {:?}",
            y.len(),
            params.len(),
            cfg.potential,
            cfg.sweep_order
        );

        while iterations < cfg.max_iters {
            if self.is_cancelled() {
                stop = StopReason::Cancelled;
                break;
            }

            let mut bias_change = 0.0;
            if let Some(bc) = cfg.bias.as_ref() {
                let field = bias::estimate(y, &labels, &params, nbh, bc)?;
                bias_change = bias
                    .as_ref()
                    .map_or(f64::INFINITY, |old| old.max_change(&field));
                corrected = field.correct(y);
                bias = Some(field);
            }

            let before = labels.clone();
            for _ in 0..cfg.sweeps_per_iter.max(1) {
                let changed = icm::sweep(
                    corrected.view(),
                    &mut labels,
                    nbh,
                    &params,
                    potential,
                    cfg.sweep_order,
                );
                energy_trace.push(icm::energy(corrected.view(), &labels, nbh, &params, potential));
                if changed == 0 {
                    break;
                }
            }
            let label_changes = labels.diff_count(&before);

            let next = update_params(
                corrected.view(),
                &labels,
                nbh,
                &params,
                potential,
                floor,
                iterations,
            )?;
            let param_change = next.max_change(&params);
            params = next;
            iterations += 1;

            log::debug!(
                "HMRF iteration {iterations}: {label_changes} labels changed, \
                 parameter change {param_change:.3e}, bias change {bias_change:.3e}"
            );

            let bias_ok = cfg.bias.map_or(true, |bc| bias_change < bc.tol);
            if param_change < cfg.tol && label_changes <= cfg.label_tol && bias_ok {
                stop = StopReason::Converged;
                break;
            }
        }

        match stop {
            StopReason::Converged => log::info!("HMRF converged after {iterations} iterations"),
            StopReason::IterationCap => log::warn!(
                "HMRF reached the iteration cap ({}) without converging",
                cfg.max_iters
            ),
            StopReason::Cancelled => log::warn!("HMRF cancelled after {iterations} iterations"),
        }

        let posteriors = local_posteriors(corrected.view(), &labels, nbh, &params, potential);
        Ok(HmrfResult {
            labels,
            posteriors,
            params,
            iterations,
            converged: stop == StopReason::Converged,
            stop,
            bias,
            energy_trace,
        })
    }

    #[inline]
    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, CancelToken::is_cancelled)
    }
}

/// 以 `config` 拟合 HMRF. 等价于 `HmrfEngine::new(*config).fit(y, nbh, init)`.
pub fn fit_hmrf(
    y: ArrayView1<f64>,
    nbh: &Neighbourhood,
    init: &MixtureParams,
    config: &HmrfConfig,
) -> SegResult<HmrfResult> {
    HmrfEngine::new(*config).fit(y, nbh, init)
}

/// 一次参数更新: 以当前标签计算空间后验 (E 步), 再重新估计参数 (M 步).
///
/// `iteration` 仅用于方差退化时的错误报告.
pub fn update_params<P: CliquePotential + ?Sized>(
    y: ArrayView1<f64>,
    labels: &LabelField,
    nbh: &Neighbourhood,
    params: &MixtureParams,
    potential: &P,
    floor: VarianceFloor,
    iteration: usize,
) -> SegResult<MixtureParams> {
    check_len("labels", y.len(), labels.len())?;
    check_len("neighbourhood", y.len(), nbh.len())?;
    let post = local_posteriors(y, labels, nbh, params, potential);
    m_step(y, &post, params, floor, iteration)
}

/// 空间 E 步: `p(s | y_i, x_N) ∝ π_s exp(-Σ_j Ψ(s, x_j)) N(y_i; μ_s, σ_s²)`.
///
/// β = 0 时与非空间 E 步完全相同.
pub(crate) fn local_posteriors<P: CliquePotential + ?Sized>(
    y: ArrayView1<f64>,
    labels: &LabelField,
    nbh: &Neighbourhood,
    params: &MixtureParams,
    potential: &P,
) -> PosteriorField {
    let log_priors: Vec<f64> = params.classes().iter().map(|c| c.prior.ln()).collect();
    let x = labels.as_slice();
    let mut post = Array2::zeros((y.len(), params.len()));

    let zip = Zip::indexed(post.rows_mut());
    let op = |i: usize, mut row: ArrayViewMut1<f64>| {
        for (s, c) in params.classes().iter().enumerate() {
            let prior = log_priors[s] - icm::neighbour_cost(i, s as u8, x, y, nbh, potential);
            row[s] = prior + c.log_density(y[i]);
        }
        if let Some(buf) = row.as_slice_mut() {
            normalise_log(buf);
        }
    };
    #[cfg(feature = "rayon")]
    zip.par_for_each(op);
    #[cfg(not(feature = "rayon"))]
    zip.for_each(op);

    PosteriorField::from_matrix(post)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmConfig, SweepOrder};
    use crate::mixture::{e_step, fit_finite_mixture};
    use crate::VoxelGrid;
    use ndarray::{Array1, Array3};

    /// `x ∈ {0, 1}` 为 10, `x == 2` 为 200 的全掩膜立方体.
    fn two_bands() -> (VoxelGrid, Neighbourhood) {
        let data = Array3::from_shape_fn((3, 3, 3), |(x, _, _)| if x < 2 { 10.0 } else { 200.0 });
        let grid = VoxelGrid::load(data, Array3::from_elem((3, 3, 3), true)).unwrap();
        let nbh = Neighbourhood::build(&grid);
        (grid, nbh)
    }

    /// 每个平面内带确定性扰动的两带数据.
    fn noisy_bands() -> (VoxelGrid, Neighbourhood) {
        let shape = (6, 5, 5);
        let data = Array3::from_shape_fn(shape, |(x, y, z)| {
            let wobble = ((x * 11 + y * 7 + z * 3) % 9) as f32 - 4.0;
            if x < 3 {
                60.0 + 3.0 * wobble
            } else {
                140.0 + 2.0 * wobble
            }
        });
        let grid = VoxelGrid::load(data, Array3::from_elem(shape, true)).unwrap();
        let nbh = Neighbourhood::build(&grid);
        (grid, nbh)
    }

    fn rough_init() -> MixtureParams {
        MixtureParams::from_parts(&[0.5, 0.5], &[50.0, 150.0], &[900.0, 900.0]).unwrap()
    }

    #[test]
    fn test_two_bands_converge_quickly() {
        let (grid, nbh) = two_bands();
        let y = grid.masked_intensities();
        for beta in [0.0, 1.0] {
            let res = fit_hmrf(y.view(), &nbh, &rough_init(), &HmrfConfig::with_beta(beta)).unwrap();
            assert!(res.converged);
            assert_eq!(res.stop, StopReason::Converged);
            assert!(res.iterations <= 3);
            for i in 0..grid.len() {
                let expect = u8::from(grid.position(i).0 == 2);
                assert_eq!(res.labels[i], expect);
            }
            assert!((res.params[0].mean - 10.0).abs() < 1e-9);
            assert!((res.params[1].mean - 200.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_zero_beta_matches_plain_posteriors() {
        let (grid, nbh) = noisy_bands();
        let y = grid.masked_intensities();
        let params = rough_init();
        let labels = icm::initial_labels(y.view(), &params);
        let pot = Potential::Potts { beta: 0.0 };
        let post = local_posteriors(y.view(), &labels, &nbh, &params, &pot);
        let (plain, _) = e_step(y.view(), &params);
        assert_eq!(post, plain);
    }

    #[test]
    fn test_zero_beta_matches_em_baseline() {
        let (grid, nbh) = noisy_bands();
        let y = grid.masked_intensities();
        let em = fit_finite_mixture(
            y.view(),
            &rough_init(),
            &EmConfig {
                tol: 1e-10,
                ..EmConfig::default()
            },
        )
        .unwrap();
        let config = HmrfConfig {
            tol: 1e-9,
            max_iters: 100,
            ..HmrfConfig::with_beta(0.0)
        };
        let hmrf = fit_hmrf(y.view(), &nbh, &rough_init(), &config).unwrap();
        assert!(em.converged && hmrf.converged);
        assert!(em.params.max_change(&hmrf.params) < 1e-6);
    }

    #[test]
    fn test_custom_potential() {
        struct Free;
        impl CliquePotential for Free {
            fn potential(&self, _: u8, _: u8, _: f64, _: f64) -> f64 {
                0.0
            }
            fn is_trivial(&self) -> bool {
                true
            }
        }

        let (grid, nbh) = noisy_bands();
        let y = grid.masked_intensities();
        let engine = HmrfEngine::new(HmrfConfig::with_beta(0.0));
        let a = engine.fit(y.view(), &nbh, &rough_init()).unwrap();
        let b = engine.fit_with(y.view(), &nbh, &rough_init(), &Free).unwrap();
        assert_eq!(a.params, b.params);
        assert_eq!(a.labels, b.labels);
    }

    #[test]
    fn test_energy_trace_monotone_within_iteration() {
        let (grid, nbh) = noisy_bands();
        let y = grid.masked_intensities();
        let config = HmrfConfig {
            max_iters: 1,
            sweeps_per_iter: 10,
            sweep_order: SweepOrder::Raster,
            ..HmrfConfig::with_beta(2.0)
        };
        let res = fit_hmrf(y.view(), &nbh, &rough_init(), &config).unwrap();
        assert!(!res.energy_trace.is_empty());
        for w in res.energy_trace.windows(2) {
            assert!(w[1] <= w[0] + 1e-9 * w[0].abs());
        }
    }

    #[test]
    fn test_cancelled_before_first_iteration() {
        let (grid, nbh) = noisy_bands();
        let y = grid.masked_intensities();
        let token = CancelToken::new();
        token.cancel();
        let res = HmrfEngine::new(HmrfConfig::default())
            .with_cancel_token(token.clone())
            .fit(y.view(), &nbh, &rough_init())
            .unwrap();
        assert_eq!(res.stop, StopReason::Cancelled);
        assert_eq!(res.iterations, 0);
        assert!(!res.converged);
        assert_eq!(res.labels, icm::initial_labels(y.view(), &rough_init()));
        assert_eq!(res.posteriors.len(), y.len());
    }

    #[test]
    fn test_iteration_cap_is_not_an_error() {
        let (grid, nbh) = noisy_bands();
        let y = grid.masked_intensities();
        let config = HmrfConfig {
            max_iters: 1,
            tol: 0.0,
            ..HmrfConfig::default()
        };
        let res = fit_hmrf(y.view(), &nbh, &rough_init(), &config).unwrap();
        assert_eq!(res.stop, StopReason::IterationCap);
        assert_eq!(res.iterations, 1);
    }

    #[test]
    fn test_fatal_variance_floor() {
        let (grid, nbh) = two_bands();
        let y = grid.masked_intensities();
        let config = HmrfConfig {
            variance_floor: VarianceFloor::Fatal(1.0),
            ..HmrfConfig::default()
        };
        let e = fit_hmrf(y.view(), &nbh, &rough_init(), &config).unwrap_err();
        assert!(matches!(
            e,
            SegError::DegenerateClass {
                iteration: 0,
                class: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_potential_is_rejected() {
        let (grid, nbh) = two_bands();
        let y = grid.masked_intensities();
        for potential in [
            Potential::ContrastSensitive {
                beta: 1.0,
                sigma: 0.0,
            },
            Potential::Potts { beta: f64::NAN },
            Potential::Potts { beta: -1.0 },
        ] {
            let config = HmrfConfig {
                potential,
                ..HmrfConfig::default()
            };
            let e = fit_hmrf(y.view(), &nbh, &rough_init(), &config).unwrap_err();
            assert!(matches!(e, SegError::InvalidParameter { .. }), "{potential:?}");
        }

        let config = HmrfConfig {
            tol: f64::NAN,
            ..HmrfConfig::default()
        };
        let e = fit_hmrf(y.view(), &nbh, &rough_init(), &config).unwrap_err();
        assert!(matches!(e, SegError::InvalidParameter { name: "tol", .. }));
    }

    #[test]
    fn test_non_finite_state_never_converges() {
        struct Broken;
        impl CliquePotential for Broken {
            fn potential(&self, a: u8, b: u8, _: f64, _: f64) -> f64 {
                if a == b {
                    0.0
                } else {
                    f64::NAN
                }
            }
            fn is_trivial(&self) -> bool {
                false
            }
        }

        let (grid, nbh) = two_bands();
        let y = grid.masked_intensities();
        let engine = HmrfEngine::new(HmrfConfig::default());
        let e = engine
            .fit_with(y.view(), &nbh, &rough_init(), &Broken)
            .unwrap_err();
        assert!(matches!(e, SegError::NonFiniteParams { iteration: 0, .. }));

        let mut bad = y.clone();
        bad[3] = f64::INFINITY;
        let e = engine.fit(bad.view(), &nbh, &rough_init()).unwrap_err();
        assert!(matches!(e, SegError::InvalidParameter { name: "intensities", .. }));
    }

    #[test]
    fn test_length_mismatch() {
        let (_, nbh) = two_bands();
        let y = Array1::from(vec![10.0; 5]);
        let e = fit_hmrf(y.view(), &nbh, &rough_init(), &HmrfConfig::default()).unwrap_err();
        assert!(matches!(e, SegError::LengthMismatch { .. }));
    }
}
