//! 评估用的真值比例矩阵.

use ndarray::{Array2, Array3, ArrayView1, ArrayView2, Axis};

use super::VoxelGrid;
use crate::error::{SegError, SegResult};

/// 真值矩阵. 行对应掩膜体素 (按体素下标), 列对应组织类,
/// 值为该体素中该组织的真实比例. 每行之和为 1. 只读.
#[derive(Debug, Clone)]
pub struct GroundTruth {
    data: Array2<f64>,
}

impl GroundTruth {
    /// 由每类一个的比例体数据构建真值矩阵. 每个体数据必须与 `grid` 同形状.
    ///
    /// 掩膜内每个体素的比例会被重新归一化. 若某体素在所有类别上的比例之和为 0,
    /// 返回 `SegError::EmptyTruthRow`.
    pub fn from_volumes(grid: &VoxelGrid, volumes: &[Array3<f32>]) -> SegResult<Self> {
        if volumes.len() < 2 {
            return Err(SegError::InvalidClassCount(volumes.len()));
        }
        if let Some(v) = volumes.iter().find(|v| v.dim() != grid.shape()) {
            return Err(SegError::ShapeMismatch {
                expected: grid.shape(),
                found: v.dim(),
            });
        }

        let data = Array2::from_shape_fn((grid.len(), volumes.len()), |(i, k)| {
            volumes[k][grid.position(i)].max(0.0) as f64
        });
        Self::from_matrix(data)
    }

    /// 由 `(体素个数, 类别数)` 形状的比例矩阵构建. 每行会被重新归一化.
    pub fn from_matrix(mut data: Array2<f64>) -> SegResult<Self> {
        if data.ncols() < 2 {
            return Err(SegError::InvalidClassCount(data.ncols()));
        }
        for (i, mut row) in data.axis_iter_mut(Axis(0)).enumerate() {
            let sum: f64 = row.sum();
            if sum <= 0.0 || !sum.is_finite() {
                return Err(SegError::EmptyTruthRow(i));
            }
            row /= sum;
        }
        Ok(Self { data })
    }

    /// 由硬标签构建 one-hot 真值矩阵.
    pub fn from_labels(labels: &[u8], num_classes: usize) -> SegResult<Self> {
        let mut data = Array2::zeros((labels.len(), num_classes));
        for (i, &l) in labels.iter().enumerate() {
            if l as usize >= num_classes {
                return Err(SegError::InvalidClassCount(l as usize + 1));
            }
            data[(i, l as usize)] = 1.0;
        }
        Self::from_matrix(data)
    }

    /// 体素个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    /// 是否不含体素.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    /// 类别数.
    #[inline]
    pub fn num_classes(&self) -> usize {
        self.data.ncols()
    }

    /// 第 `i` 个体素的比例.
    #[inline]
    pub fn row(&self, i: usize) -> ArrayView1<'_, f64> {
        self.data.row(i)
    }

    /// 矩阵的一份不可变 shallow copy.
    #[inline]
    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// 第 `i` 个体素的主导真值类 (比例最大者, 相同时取下标小者).
    pub fn dominant(&self, i: usize) -> usize {
        argmax(self.data.row(i))
    }
}

/// 最大值下标, 相同时取下标小者.
pub(crate) fn argmax(row: ArrayView1<f64>) -> usize {
    let mut best = 0;
    for (k, &v) in row.iter().enumerate().skip(1) {
        if v > row[best] {
            best = k;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::GroundTruth;
    use crate::error::SegError;
    use crate::VoxelGrid;
    use ndarray::{array, Array3};

    #[test]
    fn test_rows_are_renormalised() {
        let t = GroundTruth::from_matrix(array![[2.0, 2.0, 0.0], [0.0, 0.5, 1.5]]).unwrap();
        assert_eq!(t.row(0).to_vec(), vec![0.5, 0.5, 0.0]);
        assert_eq!(t.row(1).to_vec(), vec![0.0, 0.25, 0.75]);
        // 相同比例时取下标小者.
        assert_eq!(t.dominant(0), 0);
        assert_eq!(t.dominant(1), 2);
    }

    #[test]
    fn test_empty_row_rejected() {
        let e = GroundTruth::from_matrix(array![[1.0, 0.0], [0.0, 0.0]]).unwrap_err();
        assert!(matches!(e, SegError::EmptyTruthRow(1)));
    }

    #[test]
    fn test_from_volumes() {
        let shape = (2, 1, 1);
        let mut mask = Array3::from_elem(shape, true);
        mask[(1, 0, 0)] = false;
        let grid = VoxelGrid::load(Array3::zeros(shape), mask).unwrap();

        let csf = Array3::from_elem(shape, 0.2f32);
        let gm = Array3::from_elem(shape, 0.6f32);
        let wm = Array3::from_elem(shape, 0.2f32);
        let t = GroundTruth::from_volumes(&grid, &[csf, gm, wm]).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t.num_classes(), 3);
        assert_eq!(t.dominant(0), 1);

        let bad = Array3::zeros((1, 1, 1));
        assert!(matches!(
            GroundTruth::from_volumes(&grid, &[bad.clone(), bad]),
            Err(SegError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_from_labels_one_hot() {
        let t = GroundTruth::from_labels(&[0, 2, 1], 3).unwrap();
        assert_eq!(t.row(1).to_vec(), vec![0.0, 0.0, 1.0]);
        assert!(GroundTruth::from_labels(&[3], 3).is_err());
    }
}
