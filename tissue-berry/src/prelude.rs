//! 🧠欢迎光临🫐
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::Idx3d;

pub use crate::config::{
    BiasConfig, EmConfig, HmrfConfig, Potential, SegConfig, SweepOrder, VarianceFloor,
};
pub use crate::consts::{TissueClass, DEFAULT_VARIANCE_FLOOR, HISTOGRAM_BINS, NUM_TISSUES};
pub use crate::data::{GroundTruth, Neighbourhood, VoxelGrid};
pub use crate::error::{SegError, SegResult};

pub use crate::init::{otsu_init, otsu_thresholds};
pub use crate::mixture::{
    fit_finite_mixture, ClassParams, LabelField, MixtureFit, MixtureParams, PosteriorField,
};

pub use crate::hmrf::icm;
pub use crate::hmrf::{
    fit_hmrf, update_params, BiasField, CancelToken, CliquePotential, HmrfEngine, HmrfResult,
    StopReason,
};

pub use crate::eval::{evaluate, Evaluation};
pub use crate::pipeline::{Segmentation, Segmenter};
