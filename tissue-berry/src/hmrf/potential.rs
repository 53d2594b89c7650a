//! 成对团势函数.

use crate::error::{check_param, SegResult};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 相邻体素之间的成对团势 `Ψ(a, b)`.
///
/// 实现者必须满足:
///
/// 1. 对称: `potential(a, b, ya, yb) == potential(b, a, yb, ya)`;
/// 2. 同标签时为 0, 异标签时非负.
///
/// ICM 的能量单调性依赖于第 1 条.
pub trait CliquePotential: Sync {
    /// 标签为 `a`, `b`, (校正后) 强度为 `ya`, `yb` 的一对相邻体素的势.
    fn potential(&self, a: u8, b: u8, ya: f64, yb: f64) -> f64;

    /// 势函数是否恒为 0. 此时 HMRF 退化为非空间混合模型.
    fn is_trivial(&self) -> bool;
}

/// 内置的团势函数.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Potential {
    /// Potts 模型: 同标签为 0, 异标签为 `beta`.
    Potts {
        /// 平滑强度.
        beta: f64,
    },

    /// 强度差加权的 Potts 模型: 异标签代价为 `beta * exp(-(ya - yb)² / (2 sigma²))`.
    ///
    /// 强度差越大, 对标签边界的惩罚越小, 因而更能保留真实的组织边界.
    ContrastSensitive {
        /// 平滑强度.
        beta: f64,

        /// 强度差的尺度.
        sigma: f64,
    },
}

impl Potential {
    /// 平滑强度 β.
    #[inline]
    pub fn beta(&self) -> f64 {
        match *self {
            Self::Potts { beta } | Self::ContrastSensitive { beta, .. } => beta,
        }
    }

    /// 检查参数: β 为非负有限值, σ 为正有限值.
    pub fn validate(&self) -> SegResult<()> {
        match *self {
            Self::Potts { beta } => check_param("beta", beta, 0.0, false),
            Self::ContrastSensitive { beta, sigma } => {
                check_param("beta", beta, 0.0, false)?;
                check_param("sigma", sigma, 0.0, true)
            }
        }
    }
}

impl Default for Potential {
    fn default() -> Self {
        Self::Potts { beta: 1.0 }
    }
}

impl CliquePotential for Potential {
    #[inline]
    fn potential(&self, a: u8, b: u8, ya: f64, yb: f64) -> f64 {
        if a == b {
            return 0.0;
        }
        match *self {
            Self::Potts { beta } => beta,
            Self::ContrastSensitive { beta, sigma } => {
                beta * (-(ya - yb).powi(2) / (2.0 * sigma * sigma)).exp()
            }
        }
    }

    #[inline]
    fn is_trivial(&self) -> bool {
        self.beta() == 0.0
    }
}
