//! HEVC 常量表.

/// 默认帧内 8x8 缩放列表 (对角扫描顺序)
pub const DEFAULT_SCALING_LIST_INTRA: [u8; 64] = [
    16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 17, 16, 17, 16, 17, 18, 17, 18, 18, 17, 18, 21, 19, 20,
    21, 20, 19, 21, 24, 22, 22, 24, 24, 22, 22, 24, 25, 25, 27, 30, 27, 25, 25, 29, 31, 35, 35, 31,
    29, 36, 41, 44, 41, 36, 47, 54, 54, 47, 65, 70, 65, 88, 88, 115,
];

/// 默认帧间 8x8 缩放列表 (对角扫描顺序)
pub const DEFAULT_SCALING_LIST_INTER: [u8; 64] = [
    16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 17, 17, 17, 17, 17, 18, 18, 18, 18, 18, 18, 20, 20, 20,
    20, 20, 20, 20, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 28, 28, 28, 28, 28,
    28, 33, 33, 33, 33, 33, 41, 41, 41, 41, 54, 54, 54, 71, 71, 91,
];

/// 反量化 levelScale
pub const LEVEL_SCALE: [i32; 6] = [40, 45, 51, 57, 64, 72];

/// 4:2:0 色度 QP 映射 (qPi 30..=43)
const QP_C_420: [i32; 14] = [29, 30, 31, 32, 33, 33, 34, 34, 35, 35, 36, 36, 37, 37];

/// 由 qPi 求色度 QP
pub fn chroma_qp(qpi: i32, chroma_format_idc: u32) -> i32 {
    if chroma_format_idc != 1 {
        return qpi.min(51);
    }
    match qpi {
        i32::MIN..=29 => qpi,
        30..=43 => QP_C_420[(qpi - 30) as usize],
        _ => qpi - 6,
    }
}

/// 帧内色度模式表 (intra_chroma_pred_mode 0..3)
pub const INTRA_CHROMA_TABLE: [u8; 4] = [0, 26, 10, 1];

/// 4:2:2 色度模式映射
pub const TAB_MODE_IDX: [u8; 35] = [
    0, 1, 2, 2, 2, 2, 3, 5, 7, 8, 10, 12, 13, 15, 17, 18, 19, 20, 21, 22, 23, 23, 24, 24, 25, 25,
    26, 27, 27, 28, 28, 29, 29, 30, 31,
];

/// intraPredAngle, 下标为模式 2..=34
pub const INTRA_PRED_ANGLE: [i32; 33] = [
    32, 26, 21, 17, 13, 9, 5, 2, 0, -2, -5, -9, -13, -17, -21, -26, -32, -26, -21, -17, -13, -9,
    -5, -2, 0, 2, 5, 9, 13, 17, 21, 26, 32,
];

/// invAngle, 下标为模式 11..=25
pub const INV_ANGLE: [i32; 15] = [
    -4096, -1638, -910, -630, -482, -390, -315, -256, -315, -390, -482, -630, -910, -1638, -4096,
];

/// 亮度 1/4 像素插值滤波器 (相位 1..3)
pub const QPEL_FILTERS: [[i32; 8]; 3] = [
    [-1, 4, -10, 58, 17, -5, 1, 0],
    [-1, 4, -11, 40, 40, -11, 4, -1],
    [0, 1, -5, 17, 58, -10, 4, -1],
];

/// 色度 1/8 像素插值滤波器 (相位 1..7)
pub const EPEL_FILTERS: [[i32; 4]; 7] = [
    [-2, 58, 10, -2],
    [-4, 54, 16, -2],
    [-6, 46, 28, -4],
    [-4, 36, 36, -4],
    [-4, 28, 46, -6],
    [-2, 16, 54, -4],
    [-2, 10, 58, -2],
];

/// 去块滤波 β' 表 (Q = 0..51)
pub const BETA_TABLE: [i32; 52] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17,
    18, 20, 22, 24, 26, 28, 30, 32, 34, 36, 38, 40, 42, 44, 46, 48, 50, 52, 54, 56, 58, 60, 62, 64,
];

/// 去块滤波 tC' 表 (Q = 0..53)
pub const TC_TABLE: [i32; 54] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2,
    3, 3, 3, 3, 4, 4, 4, 5, 5, 6, 6, 7, 8, 9, 10, 11, 13, 14, 16, 18, 20, 22, 24,
];

/// 4x4 DST 矩阵
pub const DST_MATRIX: [[i32; 4]; 4] = [
    [29, 55, 74, 84],
    [74, 74, 0, -74],
    [84, -29, -74, 55],
    [55, -84, 74, -29],
];

/// 32x32 DCT 矩阵中出现的系数, 按行号奇偶层次排列
const DCT_ODD_16: [i32; 16] = [90, 90, 88, 85, 82, 78, 73, 67, 61, 54, 46, 38, 31, 22, 13, 4];
const DCT_ODD_8: [i32; 8] = [90, 87, 80, 70, 57, 43, 25, 9];
const DCT_ODD_4: [i32; 4] = [89, 75, 50, 18];
const DCT_ODD_2: [i32; 2] = [83, 36];

/// 64·√2·cos(mπ/64) 的整数近似, m 取 1..=31
fn dct_cos(m: usize) -> i32 {
    let level = m.trailing_zeros();
    let idx = ((m >> level) - 1) / 2;
    match level {
        0 => DCT_ODD_16[idx],
        1 => DCT_ODD_8[idx],
        2 => DCT_ODD_4[idx],
        3 => DCT_ODD_2[idx],
        _ => 64,
    }
}

/// 生成 32x32 DCT 变换矩阵 transMatrix[行][列]
///
/// 第 j 行第 n 列对应相位 j·(2n+1) (周期 128), 折叠到第一象限后查表.
pub fn dct_matrix() -> [[i32; 32]; 32] {
    let mut m = [[64i32; 32]; 32];
    for (j, row) in m.iter_mut().enumerate().skip(1) {
        for (n, coef) in row.iter_mut().enumerate() {
            let phase = (j * (2 * n + 1)) % 128;
            *coef = match phase {
                p if p < 32 => dct_cos(p),
                p if p < 64 => -dct_cos(64 - p),
                p if p < 96 => -dct_cos(p - 64),
                p => dct_cos(128 - p),
            };
        }
    }
    m
}

/// 上右对角扫描 (6.5.3), 返回 (x, y) 序列
pub fn diag_scan(size: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::with_capacity(size * size);
    let mut x: isize = 0;
    let mut y: isize = 0;
    while out.len() < size * size {
        while y >= 0 {
            if (x as usize) < size && (y as usize) < size {
                out.push((x as usize, y as usize));
            }
            y -= 1;
            x += 1;
        }
        y = x;
        x = 0;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dct_matrix_已知行() {
        let m = dct_matrix();
        assert_eq!(m[0][0], 64);
        assert_eq!(m[0][31], 64);
        // 4 点 DCT 嵌在第 0/8/16/24 行
        assert_eq!(&m[8][..4], &[83, 36, -36, -83]);
        assert_eq!(&m[16][..4], &[64, -64, -64, 64]);
        assert_eq!(&m[24][..4], &[36, -83, 83, -36]);
        assert_eq!(m[1][0], 90);
        assert_eq!(m[1][31], -90);
        assert_eq!(m[2][0], 90);
        assert_eq!(m[4][0], 89);
        assert_eq!(m[1][15], 4);
    }

    #[test]
    fn test_diag_scan_4x4() {
        let scan = diag_scan(4);
        assert_eq!(scan[0], (0, 0));
        assert_eq!(scan[1], (0, 1));
        assert_eq!(scan[2], (1, 0));
        assert_eq!(scan[3], (0, 2));
        assert_eq!(scan[15], (3, 3));
        assert_eq!(scan.len(), 16);
    }

    #[test]
    fn test_chroma_qp_420() {
        assert_eq!(chroma_qp(29, 1), 29);
        assert_eq!(chroma_qp(35, 1), 33);
        assert_eq!(chroma_qp(43, 1), 37);
        assert_eq!(chroma_qp(51, 1), 45);
        assert_eq!(chroma_qp(57, 3), 51);
    }
}
