//! 完整分割流程: Otsu 初始化 -> (EM 基线) -> HMRF.

use ndarray::Array3;

use crate::config::SegConfig;
use crate::data::{GroundTruth, Neighbourhood, VoxelGrid};
use crate::error::SegResult;
use crate::eval::{evaluate, Evaluation};
use crate::hmrf::{CancelToken, HmrfEngine, HmrfResult};
use crate::init::otsu_init;
use crate::mixture::{fit_finite_mixture, MixtureFit, MixtureParams};

/// 一次完整分割的结果.
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// Otsu 初始参数.
    pub init: MixtureParams,

    /// 非空间 EM 基线. 仅在 `SegConfig::run_baseline` 为 `true` 时存在.
    pub baseline: Option<MixtureFit>,

    /// HMRF 结果.
    pub hmrf: HmrfResult,

    /// 与输入网格同形状的标签体数据. 掩膜外为 0, 第 `k` 类为 `k + 1`.
    pub labels: Array3<u8>,
}

impl Segmentation {
    /// 以 HMRF 后验评估.
    pub fn evaluate(&self, truth: &GroundTruth) -> SegResult<Evaluation> {
        evaluate(truth, &self.hmrf.posteriors)
    }

    /// 以 EM 基线后验评估. 未运行基线时返回 `None`.
    pub fn evaluate_baseline(&self, truth: &GroundTruth) -> Option<SegResult<Evaluation>> {
        self.baseline
            .as_ref()
            .map(|fit| evaluate(truth, &fit.posteriors))
    }
}

/// 分割器. 只持有参数, 可以在多个网格上重复使用.
#[derive(Debug, Clone, Default)]
pub struct Segmenter {
    config: SegConfig,
    cancel: Option<CancelToken>,
}

impl Segmenter {
    /// 以给定参数新建分割器.
    pub fn new(config: SegConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }

    /// 附加取消标志, 传递给 HMRF 引擎.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// 参数.
    #[inline]
    pub fn config(&self) -> &SegConfig {
        &self.config
    }

    /// 分割 `grid` 的掩膜区域.
    pub fn segment(&self, grid: &VoxelGrid) -> SegResult<Segmentation> {
        let y = grid.masked_intensities();
        let nbh = Neighbourhood::build(grid);
        let init = otsu_init(y.view(), self.config.num_classes)?;

        let baseline = if self.config.run_baseline {
            Some(fit_finite_mixture(y.view(), &init, &self.config.em)?)
        } else {
            None
        };

        let mut engine = HmrfEngine::new(self.config.hmrf);
        if let Some(token) = self.cancel.as_ref() {
            engine = engine.with_cancel_token(token.clone());
        }
        let hmrf = engine.fit(y.view(), &nbh, &init)?;
        let labels = hmrf.labels.to_volume(grid)?;

        Ok(Segmentation {
            init,
            baseline,
            hmrf,
            labels,
        })
    }
}
