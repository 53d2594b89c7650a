//! 程序运行函数.

use crate::profile::Profile;
use crate::result::AblationResult;
use std::thread;
use tissue_berry::prelude::*;
use utils::phantom::{Phantom, PhantomConfig};

/// 每组实验使用的体模个数.
const PHANTOMS: u64 = 4;

/// 偏置组体模的偏置强度.
const BIAS_STRENGTH: f64 = 0.25;

/// 拟合方法.
#[derive(Clone, Copy)]
enum Method {
    /// 非空间有限混合 EM.
    Em,
    Hmrf(HmrfConfig),
}

/// 一组实验: 方法, 以及是否在带偏置的体模上运行.
#[derive(Clone, Copy)]
struct Trial {
    name: &'static str,
    method: Method,
    biased: bool,
}

fn trials() -> Vec<Trial> {
    let hmrf = |name, config, biased| Trial {
        name,
        method: Method::Hmrf(config),
        biased,
    };
    let corrected = HmrfConfig {
        bias: Some(BiasConfig::default()),
        ..HmrfConfig::default()
    };
    let contrast = HmrfConfig {
        potential: Potential::ContrastSensitive {
            beta: 1.0,
            sigma: 30.0,
        },
        ..HmrfConfig::default()
    };

    vec![
        Trial {
            name: "em",
            method: Method::Em,
            biased: false,
        },
        hmrf("potts-0.0", HmrfConfig::with_beta(0.0), false),
        hmrf("potts-0.5", HmrfConfig::with_beta(0.5), false),
        hmrf("potts-1.0", HmrfConfig::with_beta(1.0), false),
        hmrf("potts-2.0", HmrfConfig::with_beta(2.0), false),
        hmrf("contrast-1.0", contrast, false),
        Trial {
            name: "em-biased",
            method: Method::Em,
            biased: true,
        },
        hmrf("potts-1.0-biased", HmrfConfig::default(), true),
        hmrf("potts-1.0-corrected", corrected, true),
    ]
}

/// 在 `phantoms` 上依次运行 `method`.
fn profile(method: Method, phantoms: &[Phantom]) -> Profile {
    let mut p = Profile::default();
    for phantom in phantoms {
        let y = phantom.grid.masked_intensities();
        let init = match otsu_init(y.view(), NUM_TISSUES) {
            Ok(init) => init,
            Err(e) => {
                log::warn!("Otsu initialisation failed: {e}");
                p.start();
                p.fail();
                continue;
            }
        };

        p.start();
        let fitted = match method {
            Method::Em => fit_finite_mixture(y.view(), &init, &EmConfig::default())
                .map(|f| (f.posteriors, f.iterations, f.converged)),
            Method::Hmrf(config) => {
                let nbh = Neighbourhood::build(&phantom.grid);
                fit_hmrf(y.view(), &nbh, &init, &config)
                    .map(|r| (r.posteriors, r.iterations, r.converged))
            }
        };
        match fitted.and_then(|(post, it, conv)| {
            evaluate(&phantom.truth, &post).map(|e| (e, it, conv))
        }) {
            Ok((e, it, conv)) => p.record(&e, it, conv),
            Err(e) => {
                log::warn!("Fitting failed: {e}");
                p.fail();
            }
        }
    }
    p
}

/// 实际运行.
pub fn run() -> AblationResult {
    log::info!("Using {} cpus", utils::cpus());
    let build = |bias: f64| -> Vec<Phantom> {
        (0..PHANTOMS)
            .map(|seed| {
                let config = PhantomConfig {
                    bias,
                    seed,
                    ..PhantomConfig::default()
                };
                Phantom::generate(&config).expect("Phantom generation error")
            })
            .collect()
    };
    let plain = build(0.0);
    let biased = build(BIAS_STRENGTH);

    println!("Running ablation studies...");
    thread::scope(|s| {
        let trials = trials();
        let handles: Vec<_> = trials
            .iter()
            .map(|t| {
                let set = if t.biased { &biased } else { &plain };
                let method = t.method;
                s.spawn(move || profile(method, set))
            })
            .collect();

        AblationResult::from_iter(
            trials.iter().map(|t| t.name).zip(
                handles
                    .into_iter()
                    .map(|th| th.join().expect("Thread joining error")),
            ),
        )
    })
}
