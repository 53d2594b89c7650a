//! 运行时错误.

use crate::mixture::MixtureParams;
use crate::Idx3d;
use ndarray::ArrayView1;
use thiserror::Error;

/// 分割流程中的错误.
///
/// 输入校验类错误在任何迭代开始前返回; 数值退化类错误在每次外层迭代的
/// M 步检查, 并携带当时的迭代状态.
#[derive(Error, Debug, Clone)]
pub enum SegError {
    /// 体数据形状不一致 (强度与掩膜, 或真值与网格).
    #[error("体数据形状不一致: 期望 {expected:?}, 实际 {found:?}")]
    ShapeMismatch {
        /// 期望形状 (强度数组或网格).
        expected: Idx3d,
        /// 实际形状 (掩膜或真值).
        found: Idx3d,
    },

    /// 掩膜中不存在任何体素.
    #[error("掩膜为空")]
    EmptyMask,

    /// 逐体素数据的长度不匹配 (强度, 后验, 真值, 邻域系统之间).
    #[error("{what}: 期望长度 {expected}, 实际长度 {found}")]
    LengthMismatch {
        /// 出错的数据项.
        what: &'static str,
        /// 期望长度.
        expected: usize,
        /// 实际长度.
        found: usize,
    },

    /// 类别数不合法.
    #[error("类别数 {0} 不合法")]
    InvalidClassCount(usize),

    /// Otsu 无法找到所需数量的门限.
    ///
    /// 第一个参数是不同强度值的个数 (加密 bin 仍无法区分时为非空 bin 的个数),
    /// 第二个参数是所需类别数.
    #[error("仅有 {0} 个可区分的强度值, 不足以划分 {1} 类")]
    DegenerateHistogram(usize, usize),

    /// 掩膜内存在非有限 (NaN 或无穷) 的强度.
    #[error("体素 {position:?} 的强度 {value} 不是有限值")]
    NonFiniteIntensity {
        /// 体素坐标.
        position: Idx3d,
        /// 强度值.
        value: f32,
    },

    /// 掩膜体素个数超出体素下标的表示范围.
    #[error("掩膜体素过多: {0}")]
    TooManyVoxels(usize),

    /// 参数取值不合法.
    #[error("参数 {name} = {value} 不合法")]
    InvalidParameter {
        /// 参数名.
        name: &'static str,
        /// 参数值.
        value: f64,
    },

    /// 参数更新得到非有限值 (例如团势函数返回 NaN).
    #[error("第 {iteration} 次迭代中, 第 {class} 类参数不是有限值")]
    NonFiniteParams {
        /// 外层迭代下标 (从 0 开始).
        iteration: usize,
        /// 类下标.
        class: usize,
        /// 最后一组合法参数.
        last_params: Box<MixtureParams>,
    },

    /// 某类方差塌缩 (且未开启下限截断).
    #[error("第 {iteration} 次迭代中, 第 {class} 类方差 {variance:e} 低于下限")]
    DegenerateClass {
        /// 外层迭代下标 (从 0 开始).
        iteration: usize,
        /// 类下标.
        class: usize,
        /// 塌缩的方差.
        variance: f64,
        /// 最后一组合法参数.
        last_params: Box<MixtureParams>,
    },

    /// 掩膜内某体素在所有真值类别上的比例之和为 0.
    #[error("第 {0} 个体素的真值比例之和为 0")]
    EmptyTruthRow(usize),
}

/// 分割运行时结果.
pub type SegResult<T> = Result<T, SegError>;

/// 检查逐体素数据长度.
#[inline]
pub(crate) fn check_len(what: &'static str, expected: usize, found: usize) -> SegResult<()> {
    if expected == found {
        Ok(())
    } else {
        Err(SegError::LengthMismatch {
            what,
            expected,
            found,
        })
    }
}

/// 检查参数是否为有限值且不小于 `min` (`strict` 时必须大于 `min`).
#[inline]
pub(crate) fn check_param(
    name: &'static str,
    value: f64,
    min: f64,
    strict: bool,
) -> SegResult<()> {
    let ok = value.is_finite() && if strict { value > min } else { value >= min };
    if ok {
        Ok(())
    } else {
        Err(SegError::InvalidParameter { name, value })
    }
}

/// 检查逐体素强度均为有限值.
pub(crate) fn check_finite(what: &'static str, y: ArrayView1<f64>) -> SegResult<()> {
    match y.iter().find(|v| !v.is_finite()) {
        Some(&value) => Err(SegError::InvalidParameter { name: what, value }),
        None => Ok(()),
    }
}
