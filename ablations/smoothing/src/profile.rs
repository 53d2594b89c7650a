//! 实验统计.

use std::time::{Duration, Instant};
use tissue_berry::Evaluation;

/// 可暂停的累计计时器.
#[derive(Clone, Debug)]
pub struct AccTimer {
    consumed: Duration,
    since: Instant,
}

impl AccTimer {
    /// 初始化时即视为已经开始计时.
    #[inline]
    pub fn new() -> Self {
        Self {
            consumed: Duration::ZERO,
            since: Instant::now(),
        }
    }

    #[inline]
    pub fn start(&mut self) {
        self.since = Instant::now();
    }

    /// 结束计时并累加本轮时长. 上一次调用必须是 `self.start()`.
    #[inline]
    pub fn elapsed(&mut self) -> Duration {
        let d = self.since.elapsed();
        self.consumed += d;
        d
    }

    #[inline]
    pub fn get_total_us(&self) -> u64 {
        self.consumed.as_micros() as u64
    }
}

impl Default for AccTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个配置在全部体模上的统计.
#[derive(Clone, Debug, Default)]
pub struct Profile {
    /// 成功运行的体模个数.
    runs: u64,

    /// 返回错误的体模个数.
    failed: u64,

    /// 在迭代上限之前收敛的个数.
    converged: u64,

    /// 外层迭代次数之和.
    iterations: u64,

    /// 软误分类率之和.
    soft_error: f64,

    /// 硬误分类率之和.
    hard_error: f64,

    /// 最差的硬误分类率.
    worst_hard_error: Option<f64>,

    /// 拟合耗时 (不含体模生成和评估).
    timer: AccTimer,

    /// 单次拟合最长耗时.
    longest: Option<Duration>,
}

impl Profile {
    /// 开始一次拟合计时.
    pub fn start(&mut self) {
        self.timer.start();
    }

    /// 结束计时, 记录一次成功的拟合.
    pub fn record(&mut self, e: &Evaluation, iterations: usize, converged: bool) {
        let d = self.timer.elapsed();
        self.longest = Some(self.longest.map_or(d, |l| l.max(d)));

        self.runs += 1;
        self.converged += u64::from(converged);
        self.iterations += iterations as u64;
        self.soft_error += e.misclassification_rate;
        self.hard_error += e.hard_error_rate;
        self.worst_hard_error = Some(
            self.worst_hard_error
                .map_or(e.hard_error_rate, |w| w.max(e.hard_error_rate)),
        );
    }

    /// 结束计时, 记录一次失败.
    pub fn fail(&mut self) {
        self.timer.elapsed();
        self.failed += 1;
    }

    pub fn get_runs(&self) -> u64 {
        self.runs
    }

    pub fn get_failed(&self) -> u64 {
        self.failed
    }

    pub fn get_converged(&self) -> u64 {
        self.converged
    }

    pub fn get_total_time_us(&self) -> u64 {
        self.timer.get_total_us()
    }

    pub fn get_longest(&self) -> Option<Duration> {
        self.longest
    }

    pub fn get_worst_hard_error(&self) -> Option<f64> {
        self.worst_hard_error
    }

    fn avg(&self, sum: f64) -> Option<f64> {
        (self.runs > 0).then(|| sum / self.runs as f64)
    }

    pub fn get_avg_iterations(&self) -> Option<f64> {
        self.avg(self.iterations as f64)
    }

    pub fn get_avg_soft_error(&self) -> Option<f64> {
        self.avg(self.soft_error)
    }

    pub fn get_avg_hard_error(&self) -> Option<f64> {
        self.avg(self.hard_error)
    }
}
