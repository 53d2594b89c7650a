#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 对 3D 脑部 MR 扫描的掩膜区域进行组织分类
//! (脑脊液 CSF, 灰质 GM, 白质 WM), 并评估分割结果.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 文件读写 (nii 等体数据格式) 不在本 crate 范围内. 调用者负责提供稠密的
//!   3D 强度数组和同形状的二值掩膜.
//! 2. 本 crate 只建模纯体素 (每个体素恰好一个组织标签), 不建模部分容积混合类.
//! 3. 输入校验失败时返回 `Err`. 内部不变量使用 `debug_assert!` 检查.
//!
//! # 开发计划
//!
//! ### 体素网格与 6-邻域系统 ✅
//!
//! 掩膜内体素的稳定编号, 以及按 "前后上下左右" 六个方向构建的邻接表.
//! 邻接关系天然对称.
//!
//! 实现位于 `tissue-berry/src/data`.
//!
//! ### Otsu 初始化 ✅
//!
//! 250-bin 直方图上递归二分, 随后对每个门限做一次相邻带内的再优化,
//! 得到按均值升序排列的初始高斯混合参数.
//!
//! 实现位于 `tissue-berry/src/init`.
//!
//! ### 有限高斯混合 EM (非空间基线) ✅
//!
//! 实现位于 `tissue-berry/src/mixture`.
//!
//! ### HMRF-ICM 引擎 ✅
//!
//! 1. 标签更新 (ICM) 使用原地更新. 扫描顺序由 `SweepOrder` 固定:
//!   光栅序, 或棋盘序 (先偶后奇, 同色体素互不相邻, 可并行). ✅
//! 2. 团势函数可插拔: Potts 失配指示, 或强度差加权. ✅
//! 3. 参数更新使用邻域条件先验 `p(s | x_N)` 加权的后验. ✅
//! 4. 方差退化: 下限截断或报错, 由 `VarianceFloor` 决定. ✅
//! 5. 外层迭代之间可以通过 `CancelToken` 取消. ✅
//!
//! 实现位于 `tissue-berry/src/hmrf`.
//!
//! ### 偏置场校正 ✅
//!
//! 乘性偏置场, 对数域加权局部平均 (多次盒式滤波近似高斯).
//! 默认关闭.
//!
//! 实现位于 `tissue-berry/src/hmrf/bias.rs`.
//!
//! ### 评估 ✅
//!
//! 软混淆矩阵和误分类率. 真值类别为空时该行为 NaN.
//!
//! 实现位于 `tissue-berry/src/eval.rs`.
//!
//! ### 部分容积类 ⌛️
//!
//! 复合类参数由组成类推导, 不引入新的自由参数. 暂不实现.

/// 三维索引 `(x, y, z)`, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

pub mod consts;
pub mod error;

pub mod config;

/// 体素网格, 邻域系统和真值矩阵.
pub mod data;

pub mod init;

pub mod mixture;

pub mod hmrf;

pub mod eval;

pub mod pipeline;
pub mod prelude;

pub use config::{
    BiasConfig, EmConfig, HmrfConfig, Potential, SegConfig, SweepOrder, VarianceFloor,
};
pub use consts::TissueClass;
pub use data::{GroundTruth, Neighbourhood, VoxelGrid};
pub use error::{SegError, SegResult};
pub use eval::{evaluate, Evaluation};
pub use hmrf::{
    fit_hmrf, BiasField, CancelToken, CliquePotential, HmrfEngine, HmrfResult, StopReason,
};
pub use init::{otsu_init, otsu_thresholds};
pub use mixture::{
    fit_finite_mixture, ClassParams, LabelField, MixtureFit, MixtureParams, PosteriorField,
};
pub use pipeline::{Segmentation, Segmenter};
