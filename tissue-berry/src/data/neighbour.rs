//! 掩膜体素的 6-邻域系统.

use super::VoxelGrid;
use crate::Idx3d;

/// 标记 "不在掩膜内" 的体素下标.
const NOT_MASKED: u32 = u32::MAX;

/// 掩膜体素的 6-邻域系统. 仅包含同样位于掩膜内的邻居.
///
/// 邻接表以 CSR 形式压缩存储: 第 `i` 个体素的邻居为
/// `neighbours[offsets[i]..offsets[i + 1]]`, 顺序为 `-x, +x, -y, +y, -z, +z`
/// 中存在的那些. 由于邻接关系由坐标差定义, 因此天然对称.
///
/// 同时记录按 `x + y + z` 奇偶性划分的两个 "颜色" 类. 同色体素互不相邻.
#[derive(Debug, Clone)]
pub struct Neighbourhood {
    shape: Idx3d,
    positions: Vec<Idx3d>,
    offsets: Vec<usize>,
    neighbours: Vec<u32>,
    colours: [Vec<u32>; 2],
}

impl Neighbourhood {
    /// 从体素网格构建邻域系统. 时间复杂度与网格体素总数成线性.
    pub fn build(grid: &VoxelGrid) -> Self {
        let n = grid.len();
        // `VoxelGrid::load` 保证体素下标可以用 `u32` 表示.
        debug_assert!(n < NOT_MASKED as usize);

        // 网格线性下标 -> 体素下标
        let mut lookup = vec![NOT_MASKED; grid.size()];
        for (i, &flat) in grid.voxels().iter().enumerate() {
            lookup[flat] = i as u32;
        }

        let mut positions = Vec::with_capacity(n);
        let mut offsets = Vec::with_capacity(n + 1);
        let mut neighbours = Vec::with_capacity(n * 6);
        let mut colours = [Vec::with_capacity(n / 2 + 1), Vec::with_capacity(n / 2 + 1)];

        offsets.push(0);
        for i in 0..n {
            let pos = grid.position(i);
            for neigh in grid.diamond_neighbours(pos) {
                let j = lookup[grid.flat_index(neigh)];
                if j != NOT_MASKED {
                    neighbours.push(j);
                }
            }
            offsets.push(neighbours.len());
            colours[parity(pos)].push(i as u32);
            positions.push(pos);
        }
        neighbours.shrink_to_fit();
        log::debug!(
            "built 6-neighbourhood: {n} voxels, {} directed edges",
            neighbours.len()
        );

        Self {
            shape: grid.shape(),
            positions,
            offsets,
            neighbours,
            colours,
        }
    }

    /// 体素个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// 是否不包含任何体素.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// 所在网格的形状.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.shape
    }

    /// 第 `i` 个体素的坐标.
    #[inline]
    pub fn position(&self, i: usize) -> Idx3d {
        self.positions[i]
    }

    /// 所有体素的坐标, 按体素下标排列.
    #[inline]
    pub fn positions(&self) -> &[Idx3d] {
        &self.positions
    }

    /// 第 `i` 个体素的 (掩膜内) 邻居.
    #[inline]
    pub fn neighbours(&self, i: usize) -> &[u32] {
        &self.neighbours[self.offsets[i]..self.offsets[i + 1]]
    }

    /// 第 `i` 个体素的邻居个数.
    #[inline]
    pub fn degree(&self, i: usize) -> usize {
        self.offsets[i + 1] - self.offsets[i]
    }

    /// 颜色类 `c` (0 或 1) 中的所有体素, 按体素下标升序.
    #[inline]
    pub fn colour(&self, c: usize) -> &[u32] {
        &self.colours[c]
    }

    /// 迭代所有无向边 `(i, j)`, 其中 `i < j`. 每条边恰好出现一次.
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.len()).flat_map(move |i| {
            self.neighbours(i)
                .iter()
                .map(|&j| j as usize)
                .filter(move |&j| i < j)
                .map(move |j| (i, j))
        })
    }

    /// 检查邻接关系是否对称: `j ∈ N(i) ⇔ i ∈ N(j)`.
    pub fn is_symmetric(&self) -> bool {
        (0..self.len()).all(|i| {
            self.neighbours(i)
                .iter()
                .all(|&j| self.neighbours(j as usize).contains(&(i as u32)))
        })
    }
}

/// 坐标的颜色类.
#[inline]
fn parity((x, y, z): Idx3d) -> usize {
    (x + y + z) & 1
}
