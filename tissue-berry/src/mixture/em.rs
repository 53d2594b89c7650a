//! 非空间有限高斯混合 EM. 仅作为 HMRF 引擎的对照基线.

use ndarray::ArrayView1;

use super::{e_step, m_step, MixtureParams, PosteriorField};
use crate::config::EmConfig;
use crate::error::{check_finite, SegError, SegResult};

/// 有限混合 EM 的拟合结果.
#[derive(Debug, Clone)]
pub struct MixtureFit {
    /// 最终参数.
    pub params: MixtureParams,

    /// 与最终参数对应的后验.
    pub posteriors: PosteriorField,

    /// 实际迭代次数.
    pub iterations: usize,

    /// 最终总对数似然.
    pub log_likelihood: f64,

    /// 是否在迭代上限之前收敛.
    pub converged: bool,
}

/// 对强度 `y` 拟合高斯混合模型, 不含任何邻域项.
///
/// 每次迭代依次执行 E 步和 M 步; 当相邻两次迭代的总对数似然之差小于
/// `config.tol` 时视为收敛. 达到 `config.max_iters` 不是错误,
/// 结果中 `converged` 为 `false`.
///
/// # 注意
///
/// `init` 中低于下限的方差同样按 `config.variance_floor` 处理.
/// `y` 含非有限值或 `config` 不合法时返回 `SegError::InvalidParameter`.
pub fn fit_finite_mixture(
    y: ArrayView1<f64>,
    init: &MixtureParams,
    config: &EmConfig,
) -> SegResult<MixtureFit> {
    if y.is_empty() {
        return Err(SegError::EmptyMask);
    }
    config.validate()?;
    check_finite("intensities", y)?;
    let mut params = init
        .clone()
        .apply_floor(config.variance_floor, 0, init)?;

    let (mut posteriors, mut ll) = e_step(y, &params);
    let mut iterations = 0;
    let mut converged = false;

    while iterations < config.max_iters {
        iterations += 1;
        params = m_step(y, &posteriors, &params, config.variance_floor, iterations)?;
        let (post, new_ll) = e_step(y, &params);
        posteriors = post;

        let delta = (new_ll - ll).abs();
        log::debug!("EM iteration {iterations}: log-likelihood {new_ll:.6} (Δ {delta:.3e})");
        ll = new_ll;
        if delta < config.tol {
            converged = true;
            break;
        }
    }

    if converged {
        log::info!("EM converged after {iterations} iterations, log-likelihood {ll:.6}");
    } else {
        log::warn!(
            "EM reached the iteration cap ({}) without converging",
            config.max_iters
        );
    }

    Ok(MixtureFit {
        params,
        posteriors,
        iterations,
        log_likelihood: ll,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::fit_finite_mixture;
    use crate::config::EmConfig;
    use crate::error::SegError;
    use crate::mixture::MixtureParams;
    use ndarray::Array1;

    /// 两个高斯成分的确定性样本: 均值 ± 等间隔偏移.
    fn two_bands() -> Array1<f64> {
        let offsets = [-3.0, -2.0, -1.0, 0.0, 1.0, 2.0, 3.0];
        let mut v = Vec::new();
        for _ in 0..10 {
            v.extend(offsets.iter().map(|d| 40.0 + d));
        }
        for _ in 0..5 {
            v.extend(offsets.iter().map(|d| 160.0 + 2.0 * d));
        }
        Array1::from(v)
    }

    #[test]
    fn test_em_recovers_separated_components() {
        let y = two_bands();
        let init = MixtureParams::from_parts(&[0.5, 0.5], &[60.0, 140.0], &[400.0, 400.0]).unwrap();
        let fit = fit_finite_mixture(y.view(), &init, &EmConfig::default()).unwrap();

        assert!(fit.converged);
        assert!((fit.params[0].mean - 40.0).abs() < 1e-6);
        assert!((fit.params[1].mean - 160.0).abs() < 1e-6);
        assert!((fit.params[0].variance - 4.0).abs() < 1e-6);
        assert!((fit.params[1].variance - 16.0).abs() < 1e-6);
        assert!((fit.params[0].prior - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(fit.posteriors.len(), y.len());
    }

    #[test]
    fn test_em_log_likelihood_non_decreasing() {
        let y = two_bands();
        let init = MixtureParams::from_parts(&[0.5, 0.5], &[60.0, 140.0], &[400.0, 400.0]).unwrap();
        let mut last = f64::NEG_INFINITY;
        for iters in 1..8 {
            let config = EmConfig {
                max_iters: iters,
                tol: 0.0,
                ..EmConfig::default()
            };
            let fit = fit_finite_mixture(y.view(), &init, &config).unwrap();
            assert!(fit.log_likelihood >= last - 1e-9);
            last = fit.log_likelihood;
        }
    }

    #[test]
    fn test_em_rejects_invalid_input() {
        let init = MixtureParams::from_parts(&[0.5, 0.5], &[60.0, 140.0], &[400.0, 400.0]).unwrap();
        let mut y = two_bands();
        y[0] = f64::NAN;
        let e = fit_finite_mixture(y.view(), &init, &EmConfig::default()).unwrap_err();
        assert!(matches!(e, SegError::InvalidParameter { name: "intensities", .. }));

        let config = EmConfig {
            tol: -1.0,
            ..EmConfig::default()
        };
        let e = fit_finite_mixture(two_bands().view(), &init, &config).unwrap_err();
        assert!(matches!(e, SegError::InvalidParameter { name: "tol", .. }));
    }

    #[test]
    fn test_em_iteration_cap() {
        let y = two_bands();
        let init = MixtureParams::from_parts(&[0.5, 0.5], &[60.0, 140.0], &[400.0, 400.0]).unwrap();
        let config = EmConfig {
            max_iters: 1,
            tol: 0.0,
            ..EmConfig::default()
        };
        let fit = fit_finite_mixture(y.view(), &init, &config).unwrap();
        assert!(!fit.converged);
        assert_eq!(fit.iterations, 1);
    }
}
