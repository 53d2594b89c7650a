//! 通用常量.

/// 输入强度的上界. 合法强度位于 `0..=INTENSITY_MAX`.
pub const INTENSITY_MAX: f64 = 250.0;

/// Otsu 初始化时直方图的 bin 个数.
pub const HISTOGRAM_BINS: usize = 250;

/// 默认方差下限. 即整数量化噪声的方差 `1 / 12`.
pub const DEFAULT_VARIANCE_FLOOR: f64 = 1.0 / 12.0;

/// 默认组织类数量: CSF, GM, WM.
pub const NUM_TISSUES: usize = 3;

/// 标签体数据中, 掩膜外体素的值. 掩膜内第 `k` 类体素的值为 `k + 1`.
pub const LABEL_BACKGROUND: u8 = 0;

/// 组织类型. 下标顺序与强度 (均值) 升序一致.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TissueClass {
    /// 脑脊液 (cerebrospinal fluid), T1 像中最暗.
    Csf,

    /// 灰质 (gray matter).
    Gm,

    /// 白质 (white matter), T1 像中最亮.
    Wm,
}

impl TissueClass {
    /// 全部组织类型, 按下标升序.
    pub const ALL: [TissueClass; NUM_TISSUES] = [Self::Csf, Self::Gm, Self::Wm];

    /// 类下标.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// 由类下标构建. 越界时返回 `None`.
    #[inline]
    pub const fn from_index(k: usize) -> Option<Self> {
        match k {
            0 => Some(Self::Csf),
            1 => Some(Self::Gm),
            2 => Some(Self::Wm),
            _ => None,
        }
    }

    /// 简称.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Csf => "CSF",
            Self::Gm => "GM",
            Self::Wm => "WM",
        }
    }

    /// 在标签体数据中的值.
    #[inline]
    pub const fn label_value(self) -> u8 {
        self as u8 + 1
    }
}

impl std::fmt::Display for TissueClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::TissueClass;

    #[test]
    fn test_tissue_index_round_trip() {
        for t in TissueClass::ALL {
            assert_eq!(TissueClass::from_index(t.index()), Some(t));
        }
        assert_eq!(TissueClass::from_index(3), None);
    }

    #[test]
    fn test_tissue_ordering() {
        // 强度升序.
        assert!(TissueClass::Csf < TissueClass::Gm);
        assert!(TissueClass::Gm < TissueClass::Wm);
        assert_eq!(TissueClass::Wm.label_value(), 3);
        assert_eq!(TissueClass::Gm.to_string(), "GM");
    }
}
