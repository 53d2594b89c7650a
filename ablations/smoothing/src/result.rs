//! 实验结果.

use crate::profile::Profile;
use std::io::{self, Write};

/// 将 `p` 的结果写进 `w` 中.
fn describe_into<W: Write>(name: &str, p: &Profile, w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    #[inline]
    fn f64_to_display(f: Option<f64>) -> String {
        match f {
            Some(f) => format!("{f:.6}"),
            None => "/".to_string(),
        }
    }

    writeln!(w, "Profile `{name}`:")?;
    writeln!(w, "{S4}Successful runs: {}", p.get_runs())?;
    writeln!(w, "{S4}Failed runs: {}", p.get_failed())?;
    writeln!(w, "{S4}Converged runs: {}", p.get_converged())?;
    writeln!(
        w,
        "{S4}Average iterations: {}",
        f64_to_display(p.get_avg_iterations())
    )?;
    writeln!(
        w,
        "{S4}Average soft misclassification: {}",
        f64_to_display(p.get_avg_soft_error())
    )?;
    writeln!(
        w,
        "{S4}Average hard error: {}",
        f64_to_display(p.get_avg_hard_error())
    )?;
    writeln!(
        w,
        "{S4}Worst hard error: {}",
        f64_to_display(p.get_worst_hard_error())
    )?;
    writeln!(w, "{S4}Total fitting time: {} us", p.get_total_time_us())?;
    let t = p.get_longest().map(|d| d.as_micros() as f64);
    write!(w, "{S4}Longest fit costs {} us", f64_to_display(t))?;
    Ok(())
}

/// 消融实验最终结果.
pub struct AblationResult {
    data: Vec<(&'static str, Profile)>,
}

impl AblationResult {
    pub fn from_iter<I: IntoIterator<Item = (&'static str, Profile)>>(it: I) -> Self {
        Self {
            data: it.into_iter().collect(),
        }
    }

    /// 分析运行结果.
    pub fn analyze(&self) {
        utils::sep();
        let mut buf = Vec::with_capacity(512);

        for (key, profile) in self.data.iter() {
            describe_into(key, profile, &mut buf).unwrap();
            println!("{}", String::from_utf8_lossy(&buf));
            buf.clear();

            utils::sep();
        }

        if let Some((key, p)) = self
            .data
            .iter()
            .filter_map(|(k, p)| p.get_avg_soft_error().map(|e| (k, e)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
        {
            println!("Lowest average soft misclassification: `{key}` ({p:.6})");
            utils::sep();
        }
    }
}
