use ndarray::{Array1, Array3, ArrayView3};

use crate::consts::INTENSITY_MAX;
use crate::error::{check_len, SegError, SegResult};
use crate::Idx3d;

mod neighbour;
mod truth;

pub use neighbour::Neighbourhood;
pub use truth::GroundTruth;

pub(crate) use truth::argmax;

/// 3D 脑部扫描的体素网格, 包括强度和同形状的二值掩膜.
///
/// 数据按 `(x, y, z)` 行优先存储. 掩膜内的体素按行优先顺序依次编号为
/// `0..self.len()`, 该编号即全 crate 通用的 "体素下标". 构建后只读.
#[derive(Debug, Clone)]
pub struct VoxelGrid {
    data: Array3<f32>,
    mask: Array3<bool>,

    /// 第 `i` 个掩膜体素在整个网格中的行优先线性下标. 严格递增.
    voxels: Vec<usize>,
}

impl VoxelGrid {
    /// 由强度数组和掩膜构建体素网格.
    ///
    /// 两者形状不同时返回 `SegError::ShapeMismatch`,
    /// 掩膜为空时返回 `SegError::EmptyMask`,
    /// 掩膜内存在 NaN 或无穷强度时返回 `SegError::NonFiniteIntensity`.
    /// 超出值域 `0..=250` 的有限强度只记录警告.
    pub fn load(intensities: Array3<f32>, mask: Array3<bool>) -> SegResult<Self> {
        if intensities.dim() != mask.dim() {
            return Err(SegError::ShapeMismatch {
                expected: intensities.dim(),
                found: mask.dim(),
            });
        }
        let data = if intensities.is_standard_layout() {
            intensities
        } else {
            intensities.as_standard_layout().to_owned()
        };
        let mask = if mask.is_standard_layout() {
            mask
        } else {
            mask.as_standard_layout().to_owned()
        };
        debug_assert!(data.is_standard_layout() && mask.is_standard_layout());

        let voxels: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(flat, m)| m.then_some(flat))
            .collect();
        if voxels.is_empty() {
            return Err(SegError::EmptyMask);
        }

        check_voxel_count(voxels.len())?;

        let (_, ny, nz) = data.dim();
        let mut out_of_range = 0;
        for (flat, (&v, &m)) in data.iter().zip(mask.iter()).enumerate() {
            if !m {
                continue;
            }
            if !v.is_finite() {
                return Err(SegError::NonFiniteIntensity {
                    position: (flat / (ny * nz), (flat / nz) % ny, flat % nz),
                    value: v,
                });
            }
            out_of_range += usize::from(!(0.0..=INTENSITY_MAX).contains(&(v as f64)));
        }
        if out_of_range != 0 {
            log::warn!(
                "{out_of_range} masked voxels lie outside the intensity range 0..={INTENSITY_MAX}"
            );
        }
        log::debug!(
            "loaded voxel grid {:?} with {} masked voxels",
            data.dim(),
            voxels.len()
        );

        Ok(Self { data, mask, voxels })
    }

    /// 由外部加载器提供的行优先扁平缓冲区构建体素网格.
    ///
    /// 缓冲区长度与 `shape` 不一致时返回 `SegError::LengthMismatch`.
    pub fn from_raw(shape: Idx3d, intensities: Vec<f32>, mask: Vec<bool>) -> SegResult<Self> {
        let size = shape.0 * shape.1 * shape.2;
        check_len("intensities", size, intensities.len())?;
        check_len("mask", size, mask.len())?;
        // 长度已检查, 不会失败.
        let data = Array3::from_shape_vec(shape, intensities).map_err(|_| {
            SegError::ShapeMismatch {
                expected: shape,
                found: (size, 1, 1),
            }
        })?;
        let mask = Array3::from_shape_vec(shape, mask).map_err(|_| SegError::ShapeMismatch {
            expected: shape,
            found: (size, 1, 1),
        })?;
        Self::load(data, mask)
    }

    /// 网格形状 `(nx, ny, nz)`.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.data.dim()
    }

    /// 网格体素总数 (包括掩膜外).
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// 掩膜内体素个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    /// 掩膜内是否没有体素. 由构建时的检查保证恒为 `false`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    /// 获得强度数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// 获得掩膜的一份不可变 shallow copy.
    #[inline]
    pub fn mask(&self) -> ArrayView3<'_, bool> {
        self.mask.view()
    }

    /// 检查索引是否合法.
    #[inline]
    pub fn check(&self, (x0, y0, z0): &Idx3d) -> bool {
        let (x, y, z) = self.shape();
        *x0 < x && *y0 < y && *z0 < z
    }

    /// 坐标 -> 行优先线性下标. 不检查越界.
    #[inline]
    pub fn flat_index(&self, (x, y, z): Idx3d) -> usize {
        let (_, ny, nz) = self.shape();
        (x * ny + y) * nz + z
    }

    /// 行优先线性下标 -> 坐标. 不检查越界.
    #[inline]
    pub fn unflatten(&self, flat: usize) -> Idx3d {
        let (_, ny, nz) = self.shape();
        (flat / (ny * nz), (flat / nz) % ny, flat % nz)
    }

    /// 第 `i` 个掩膜体素的坐标. 越界时 panic.
    #[inline]
    pub fn position(&self, i: usize) -> Idx3d {
        self.unflatten(self.voxels[i])
    }

    /// 坐标对应的体素下标. 坐标越界或不在掩膜内时返回 `None`.
    pub fn voxel_index(&self, pos: Idx3d) -> Option<usize> {
        if !self.check(&pos) {
            return None;
        }
        self.voxels.binary_search(&self.flat_index(pos)).ok()
    }

    /// 所有掩膜体素的行优先线性下标, 按体素下标排列.
    #[inline]
    pub fn voxels(&self) -> &[usize] {
        &self.voxels
    }

    /// 收集所有掩膜体素的强度, 按体素下标排列.
    pub fn masked_intensities(&self) -> Array1<f64> {
        self.voxels
            .iter()
            .map(|&flat| self.data[self.unflatten(flat)] as f64)
            .collect()
    }

    /// 将逐体素的值写回整个网格. 掩膜外的位置填充为 `fill`.
    ///
    /// `values` 长度与掩膜体素个数不一致时返回 `SegError::LengthMismatch`.
    pub fn scatter<T: Copy>(&self, values: &[T], fill: T) -> SegResult<Array3<T>> {
        check_len("scatter values", self.len(), values.len())?;
        let mut ans = Array3::from_elem(self.shape(), fill);
        for (&flat, &v) in self.voxels.iter().zip(values) {
            ans[self.unflatten(flat)] = v;
        }
        Ok(ans)
    }

    /// 获取 `pos` 前后上下左右六个点的坐标, 顺序为 `-x, +x, -y, +y, -z, +z`.
    ///
    /// 在数据范围外的坐标会被过滤掉.
    #[inline]
    pub(crate) fn diamond_neighbours(
        &self,
        (x, y, z): Idx3d,
    ) -> impl Iterator<Item = Idx3d> + '_ {
        [
            (x.wrapping_sub(1), y, z),
            (x.saturating_add(1), y, z),
            (x, y.wrapping_sub(1), z),
            (x, y.saturating_add(1), z),
            (x, y, z.wrapping_sub(1)),
            (x, y, z.saturating_add(1)),
        ]
        .into_iter()
        .filter(move |p| *p != (x, y, z) && self.check(p))
    }
}

/// 邻域系统以 `u32` 存储体素下标, 并保留 `u32::MAX` 作为 "不在掩膜内".
#[inline]
fn check_voxel_count(n: usize) -> SegResult<()> {
    if n < u32::MAX as usize {
        Ok(())
    } else {
        Err(SegError::TooManyVoxels(n))
    }
}
