//! 分割结果评估.
//!
//! 真值本身是比例值 (部分容积), 因此混淆矩阵是 "软" 的: 统计的是预测后验质量,
//! 而不是硬标签计数.

use std::fmt;

use ndarray::{Array2, Axis};

use crate::consts::TissueClass;
use crate::data::GroundTruth;
use crate::error::{check_len, SegError, SegResult};
use crate::mixture::PosteriorField;

/// 评估结果.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// `confusion[(a, b)]`: 主导真值类为 `a` 的体素上, 预测给 `b` 的平均后验质量.
    /// 没有任何体素以 `a` 为主导类时, 该行全为 NaN.
    pub confusion: Array2<f64>,

    /// `soft_counts[(a, b)] = Σ_i truth(i, a) * post(i, b)`.
    /// 第 `a` 行之和等于真值中 `a` 类的总质量.
    pub soft_counts: Array2<f64>,

    /// 以各类为主导真值类的体素个数.
    pub support: Vec<usize>,

    /// 期望误分类率 `1 - mean_i post(i, dominant_i)`, 位于 `[0, 1]`.
    pub misclassification_rate: f64,

    /// 硬误分类率: 后验 argmax 与主导真值类不同的体素比例.
    pub hard_error_rate: f64,

    /// `confusion` 中无定义 (NaN) 的行.
    pub undefined_rows: Vec<usize>,
}

impl Evaluation {
    /// 类别数.
    #[inline]
    pub fn num_classes(&self) -> usize {
        self.support.len()
    }

    /// 第 `a` 行是否有定义.
    #[inline]
    pub fn is_defined(&self, a: usize) -> bool {
        self.support[a] > 0
    }
}

/// 将预测后验 `post` 与真值 `truth` 比较.
///
/// 两者体素个数或类别数不一致时返回 `SegError::LengthMismatch`.
pub fn evaluate(truth: &GroundTruth, post: &PosteriorField) -> SegResult<Evaluation> {
    check_len("posteriors", truth.len(), post.len())?;
    check_len("classes", truth.num_classes(), post.num_classes())?;
    if truth.is_empty() {
        return Err(SegError::EmptyMask);
    }

    let n = truth.len();
    let k = truth.num_classes();
    let hard = post.argmax();

    let mut sums = Array2::<f64>::zeros((k, k));
    let mut support = vec![0usize; k];
    let mut agreement = 0.0;
    let mut hard_errors = 0usize;
    for i in 0..n {
        let a = truth.dominant(i);
        let p = post.row(i);
        support[a] += 1;
        sums.row_mut(a).scaled_add(1.0, &p);
        agreement += p[a];
        hard_errors += usize::from(hard[i] as usize != a);
    }

    let soft_counts = truth.view().t().dot(&post.view());

    let mut confusion = sums;
    let mut undefined_rows = Vec::new();
    for (a, mut row) in confusion.axis_iter_mut(Axis(0)).enumerate() {
        if support[a] == 0 {
            row.fill(f64::NAN);
            undefined_rows.push(a);
        } else {
            row /= support[a] as f64;
        }
    }
    if !undefined_rows.is_empty() {
        log::warn!("ground truth classes {undefined_rows:?} have no dominant voxels");
    }

    let misclassification_rate = (1.0 - agreement / n as f64).clamp(0.0, 1.0);
    let hard_error_rate = hard_errors as f64 / n as f64;
    log::info!(
        "evaluation: misclassification rate {misclassification_rate:.4}, \
         hard error rate {hard_error_rate:.4}"
    );

    Ok(Evaluation {
        confusion,
        soft_counts,
        support,
        misclassification_rate,
        hard_error_rate,
        undefined_rows,
    })
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let k = self.num_classes();
        let name = |a: usize| {
            if k == TissueClass::ALL.len() {
                TissueClass::ALL[a].name().to_string()
            } else {
                format!("#{a}")
            }
        };

        write!(f, "{:>6}", "")?;
        for b in 0..k {
            write!(f, "{:>8}", name(b))?;
        }
        writeln!(f, "{:>10}", "support")?;
        for a in 0..k {
            write!(f, "{:>6}", name(a))?;
            for b in 0..k {
                write!(f, "{:>8.4}", self.confusion[(a, b)])?;
            }
            writeln!(f, "{:>10}", self.support[a])?;
        }
        write!(
            f,
            "misclassification rate = {:.4}, hard error rate = {:.4}",
            self.misclassification_rate, self.hard_error_rate
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixture::LabelField;
    use ndarray::array;

    #[test]
    fn test_perfect_prediction_is_identity() {
        let labels = LabelField::from_vec(vec![0, 1, 2, 2, 1, 0, 0]);
        let post = PosteriorField::one_hot(&labels, 3);
        let truth = GroundTruth::from_labels(labels.as_slice(), 3).unwrap();
        let e = evaluate(&truth, &post).unwrap();
        assert_eq!(e.confusion, Array2::eye(3));
        assert_eq!(e.misclassification_rate, 0.0);
        assert_eq!(e.hard_error_rate, 0.0);
        assert_eq!(e.support, vec![3, 2, 2]);
        assert!(e.undefined_rows.is_empty());
    }

    #[test]
    fn test_soft_rows_and_rates() {
        let truth = GroundTruth::from_matrix(array![
            [0.7, 0.3, 0.0],
            [0.1, 0.8, 0.1],
            [0.0, 0.4, 0.6],
            [0.5, 0.5, 0.0],
        ])
        .unwrap();
        let post = PosteriorField::from_matrix(array![
            [0.6, 0.4, 0.0],
            [0.2, 0.5, 0.3],
            [0.1, 0.1, 0.8],
            [0.1, 0.9, 0.0],
        ]);
        let e = evaluate(&truth, &post).unwrap();

        // 真值质量守恒.
        for a in 0..3 {
            let mass = truth.view().column(a).sum();
            assert!((e.soft_counts.row(a).sum() - mass).abs() < 1e-12);
            assert!((e.confusion.row(a).sum() - 1.0).abs() < 1e-12);
        }
        // 主导类: 0, 1, 2, 0 (相同时取下标小者).
        assert_eq!(e.support, vec![2, 1, 1]);
        assert!((e.confusion[(0, 1)] - 0.65).abs() < 1e-12);

        let expect = 1.0 - (0.6 + 0.5 + 0.8 + 0.1) / 4.0;
        assert!((e.misclassification_rate - expect).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&e.misclassification_rate));
        assert_eq!(e.hard_error_rate, 0.25);
    }

    #[test]
    fn test_empty_class_gives_nan_row() {
        let truth = GroundTruth::from_labels(&[0, 0, 2], 3).unwrap();
        let post = PosteriorField::from_matrix(array![
            [1.0, 0.0, 0.0],
            [0.5, 0.5, 0.0],
            [0.0, 0.0, 1.0],
        ]);
        let e = evaluate(&truth, &post).unwrap();
        assert_eq!(e.undefined_rows, vec![1]);
        assert!(!e.is_defined(1));
        assert!(e.confusion.row(1).iter().all(|v| v.is_nan()));
        assert_eq!(e.confusion[(0, 0)], 0.75);
        // 显示时不会 panic.
        assert!(e.to_string().contains("NaN"));
    }

    #[test]
    fn test_mismatched_inputs() {
        let truth = GroundTruth::from_labels(&[0, 1], 2).unwrap();
        let post = PosteriorField::from_matrix(array![[1.0, 0.0]]);
        assert!(matches!(
            evaluate(&truth, &post),
            Err(SegError::LengthMismatch { what: "posteriors", .. })
        ));
        let post = PosteriorField::from_matrix(array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        assert!(matches!(
            evaluate(&truth, &post),
            Err(SegError::LengthMismatch { what: "classes", .. })
        ));
    }
}
