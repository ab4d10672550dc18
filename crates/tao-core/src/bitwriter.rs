//! 比特流写入器.
//!
//! 用于在测试与基准中构造 VPS/SPS/PPS 与分片 RBSP, 位序与 [`BitReader`] 一致.
//!
//! [`BitReader`]: crate::bitreader::BitReader

/// 比特流写入器
///
/// # 示例
/// ```
/// use tao_core::bitwriter::BitWriter;
///
/// let mut bw = BitWriter::new();
/// bw.write_bits(0b1011, 4);
/// bw.write_ue(1);
/// bw.write_trailing_bits();
/// assert_eq!(bw.finish(), vec![0b1011_0101]);
/// ```
#[derive(Debug, Default)]
pub struct BitWriter {
    data: Vec<u8>,
    /// 未满一个字节的位, 靠低位存放
    pending: u8,
    pending_bits: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已写入的总位数
    pub fn bits_written(&self) -> usize {
        self.data.len() * 8 + self.pending_bits as usize
    }

    /// 写入 1 位, 只取 `bit` 的最低位
    pub fn write_bit(&mut self, bit: u32) {
        self.pending = (self.pending << 1) | (bit & 1) as u8;
        self.pending_bits += 1;
        if self.pending_bits == 8 {
            self.data.push(self.pending);
            self.pending = 0;
            self.pending_bits = 0;
        }
    }

    /// 写入 `value` 的低 N 位 (N <= 32), 高位在前
    pub fn write_bits(&mut self, value: u32, n: u32) {
        debug_assert!(n <= 32, "write_bits: n={} 超过 32 位", n);
        for i in (0..n).rev() {
            self.write_bit(value >> i);
        }
    }

    /// 无符号 Exp-Golomb ue(v)
    pub fn write_ue(&mut self, value: u32) {
        let code = u64::from(value) + 1;
        let len = 64 - code.leading_zeros();
        self.write_bits(0, len - 1);
        for i in (0..len).rev() {
            self.write_bit((code >> i) as u32);
        }
    }

    /// 有符号 Exp-Golomb se(v): 正数 k -> 2k-1, 非正数 k -> -2k
    pub fn write_se(&mut self, value: i32) {
        let mapped = if value > 0 {
            (value as u32) * 2 - 1
        } else {
            value.unsigned_abs() * 2
        };
        self.write_ue(mapped);
    }

    /// rbsp_trailing_bits: 一个 1, 随后补 0 到字节边界
    pub fn write_trailing_bits(&mut self) {
        self.write_bit(1);
        self.align_to_byte();
    }

    /// 用 0 补齐到字节边界
    pub fn align_to_byte(&mut self) {
        while self.pending_bits != 0 {
            self.write_bit(0);
        }
    }

    /// 写入整字节 (未对齐时逐位写入)
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.pending_bits == 0 {
            self.data.extend_from_slice(bytes);
        } else {
            for &b in bytes {
                self.write_bits(u32::from(b), 8);
            }
        }
    }

    /// 补齐到字节边界并返回数据
    pub fn finish(mut self) -> Vec<u8> {
        self.align_to_byte();
        self.data
    }
}

/// 为 RBSP 插入防竞争字节: 两个 0x00 之后若出现 0x00..=0x03, 先插入 0x03
pub fn escape_rbsp(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 64);
    let mut zeros = 0;
    for &b in rbsp {
        if zeros >= 2 && b <= 3 {
            out.push(3);
            zeros = 0;
        }
        out.push(b);
        zeros = if b == 0 { zeros + 1 } else { 0 };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitreader::BitReader;

    #[test]
    fn test_write_bits_跨字节() {
        let mut bw = BitWriter::new();
        bw.write_bits(0b101, 3);
        bw.write_bits(0b1_0001_0101, 9);
        bw.write_bits(0, 0);
        assert_eq!(bw.bits_written(), 12);
        bw.write_bits(0b0101, 4);
        assert_eq!(bw.finish(), vec![0b1011_0001, 0b0101_0101]);
    }

    #[test]
    fn test_exp_golomb_与读取器一致() {
        let ue = [0u32, 1, 2, 7, 255, 65_535, u32::MAX - 1];
        let se = [0i32, 1, -1, 26, -27, i32::MAX];
        let mut bw = BitWriter::new();
        for &v in &ue {
            bw.write_ue(v);
        }
        for &v in &se {
            bw.write_se(v);
        }
        bw.write_trailing_bits();
        let data = bw.finish();

        let mut br = BitReader::new(&data);
        for &v in &ue {
            assert_eq!(br.read_ue().unwrap(), v);
        }
        for &v in &se {
            assert_eq!(br.read_se().unwrap(), v);
        }
        assert!(br.read_flag().unwrap(), "应读到 rbsp_stop_one_bit");
    }

    #[test]
    fn test_未对齐时写入字节() {
        let mut bw = BitWriter::new();
        bw.write_bit(1);
        bw.write_bytes(&[0xFF]);
        bw.align_to_byte();
        bw.write_bytes(&[0x12, 0x34]);
        assert_eq!(bw.finish(), vec![0xFF, 0x80, 0x12, 0x34]);
    }

    #[test]
    fn test_escape_rbsp() {
        assert_eq!(escape_rbsp(&[0, 0, 1, 0, 0, 0]), vec![0, 0, 3, 1, 0, 0, 3, 0]);
        assert_eq!(escape_rbsp(&[0, 0, 4, 0, 0]), vec![0, 0, 4, 0, 0]);
        assert_eq!(escape_rbsp(&[0, 0, 0, 0]), vec![0, 0, 3, 0, 0]);
    }
}
