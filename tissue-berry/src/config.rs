//! 分割参数.
//!
//! 所有参数均为只读的普通结构体, 按值传入各入口函数. 本 crate 不持有任何
//! 进程级的模型状态.

use crate::consts::{DEFAULT_VARIANCE_FLOOR, NUM_TISSUES};
use crate::error::{check_param, SegResult};

pub use crate::hmrf::potential::Potential;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 方差退化时的处理方式.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum VarianceFloor {
    /// 低于给定值的方差被截断为该值, 并记录警告.
    Floor(f64),

    /// 低于给定值的方差视为致命错误 `SegError::DegenerateClass`.
    Fatal(f64),
}

impl VarianceFloor {
    /// 方差下限.
    #[inline]
    pub fn min_variance(&self) -> f64 {
        match *self {
            Self::Floor(v) | Self::Fatal(v) => v,
        }
    }

    /// 下限必须为正有限值.
    pub fn validate(&self) -> SegResult<()> {
        check_param("variance_floor", self.min_variance(), 0.0, true)
    }
}

impl Default for VarianceFloor {
    fn default() -> Self {
        Self::Floor(DEFAULT_VARIANCE_FLOOR)
    }
}

/// 非空间有限混合 EM 的参数.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EmConfig {
    /// 最大迭代次数.
    pub max_iters: usize,

    /// 相邻两次迭代总对数似然之差的收敛阈值.
    pub tol: f64,

    /// 方差退化处理.
    pub variance_floor: VarianceFloor,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            max_iters: 100,
            tol: 1e-6,
            variance_floor: VarianceFloor::default(),
        }
    }
}

/// ICM 单次扫描内的体素访问顺序. 两种顺序都是原地更新:
/// 后访问的体素能看到同一次扫描中先访问体素的新标签.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SweepOrder {
    /// 按体素编号 (行优先) 逐个更新. 只能串行.
    Raster,

    /// 先更新 `x + y + z` 为偶数的所有体素, 再更新奇数的.
    ///
    /// 6-邻域下同色体素互不相邻, 因此每一半可以并行,
    /// 且结果与按该顺序串行更新完全一致.
    #[default]
    Checkerboard,
}

/// 偏置场估计参数.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BiasConfig {
    /// 平滑核的高斯标准差 (单位: 体素).
    pub sigma: f64,

    /// 近似高斯所用的盒式滤波次数.
    pub passes: usize,

    /// 相邻两次估计间 `max |ΔB|` 的收敛阈值.
    pub tol: f64,
}

impl EmConfig {
    /// 检查收敛阈值和方差下限.
    pub fn validate(&self) -> SegResult<()> {
        check_param("tol", self.tol, 0.0, false)?;
        self.variance_floor.validate()
    }
}

impl BiasConfig {
    /// 检查平滑尺度和收敛阈值. `sigma == 0` 表示不平滑.
    pub fn validate(&self) -> SegResult<()> {
        check_param("bias.sigma", self.sigma, 0.0, false)?;
        check_param("bias.tol", self.tol, 0.0, false)
    }
}

impl Default for BiasConfig {
    fn default() -> Self {
        Self {
            sigma: 12.0,
            passes: 3,
            tol: 1e-3,
        }
    }
}

/// HMRF-ICM 引擎参数.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HmrfConfig {
    /// 团势函数. 其中的 β 为唯一的空间正则化超参数.
    pub potential: Potential,

    /// 外层迭代上限.
    pub max_iters: usize,

    /// 参数变化量的收敛阈值.
    pub tol: f64,

    /// 单次外层迭代中标签变化个数的收敛阈值.
    pub label_tol: usize,

    /// 每次外层迭代中 ICM 扫描次数的上限. 标签不再变化时提前结束.
    pub sweeps_per_iter: usize,

    /// ICM 扫描顺序.
    pub sweep_order: SweepOrder,

    /// 方差退化处理.
    pub variance_floor: VarianceFloor,

    /// 偏置场校正. `None` 表示关闭 (默认).
    pub bias: Option<BiasConfig>,
}

impl Default for HmrfConfig {
    fn default() -> Self {
        Self {
            potential: Potential::Potts { beta: 1.0 },
            max_iters: 50,
            tol: 1e-4,
            label_tol: 0,
            sweeps_per_iter: 1,
            sweep_order: SweepOrder::default(),
            variance_floor: VarianceFloor::default(),
            bias: None,
        }
    }
}

impl HmrfConfig {
    /// 检查全部参数, 包括团势函数.
    pub fn validate(&self) -> SegResult<()> {
        self.potential.validate()?;
        self.validate_iteration()
    }

    /// 检查除团势函数以外的参数.
    pub(crate) fn validate_iteration(&self) -> SegResult<()> {
        check_param("tol", self.tol, 0.0, false)?;
        self.variance_floor.validate()?;
        match self.bias.as_ref() {
            Some(bias) => bias.validate(),
            None => Ok(()),
        }
    }

    /// 使用 Potts 势和给定 β 的默认参数.
    pub fn with_beta(beta: f64) -> Self {
        Self {
            potential: Potential::Potts { beta },
            ..Self::default()
        }
    }
}

/// 完整分割流程的参数.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SegConfig {
    /// 类别数.
    pub num_classes: usize,

    /// 是否同时运行非空间 EM 基线.
    pub run_baseline: bool,

    /// EM 基线参数.
    pub em: EmConfig,

    /// HMRF 参数.
    pub hmrf: HmrfConfig,
}

impl Default for SegConfig {
    fn default() -> Self {
        Self {
            num_classes: NUM_TISSUES,
            run_baseline: false,
            em: EmConfig::default(),
            hmrf: HmrfConfig::default(),
        }
    }
}
