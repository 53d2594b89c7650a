//! 无空间信息的初始化.
//!
//! 目前只有 Otsu 多门限初始化. 它的质量直接决定 ICM 最终落入的局部最优,
//! 因此在完整流程中总是先于 EM 和 HMRF 运行.

mod otsu;

pub use otsu::{otsu_init, otsu_thresholds, Histogram};
