//! 比特流读取器.
//!
//! 参数集与分片头都是 MSB first 的定长字段与 Exp-Golomb 编码混排,
//! 读取位置以绝对位下标保存, 便于记录语法结构占用的位数 (如分片头中
//! 短期 RPS 的长度) 以及从任意位置恢复读取.

use crate::{TaoError, TaoResult};

/// ue(v) 允许的最大前导零个数
const MAX_EXP_GOLOMB_PREFIX: u32 = 31;

/// 比特流读取器
///
/// # 示例
/// ```
/// use tao_core::bitreader::BitReader;
///
/// // 0b1 -> ue 0, 0b010 -> ue 1, 0b011 -> se -1
/// let data = [0b1010_0110];
/// let mut br = BitReader::new(&data);
/// assert_eq!(br.read_ue().unwrap(), 0);
/// assert_eq!(br.read_ue().unwrap(), 1);
/// assert_eq!(br.read_se().unwrap(), -1);
/// ```
pub struct BitReader<'a> {
    data: &'a [u8],
    /// 下一个待读位的绝对下标
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// 已读取的总位数
    pub fn bits_read(&self) -> usize {
        self.pos
    }

    /// 剩余可读位数
    pub fn bits_left(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.pos)
    }

    /// 当前所在字节 (未对齐时为部分读取的那个字节)
    pub fn byte_position(&self) -> usize {
        self.pos / 8
    }

    pub fn read_flag(&mut self) -> TaoResult<bool> {
        let byte = *self.data.get(self.pos / 8).ok_or(TaoError::Eof)?;
        let bit = (byte >> (7 - (self.pos & 7))) & 1;
        self.pos += 1;
        Ok(bit == 1)
    }

    /// 读取 N 位 (N <= 32), 返回值低 N 位有效
    pub fn read_bits(&mut self, n: u32) -> TaoResult<u32> {
        if n > 32 {
            return Err(TaoError::InvalidArgument(format!("read_bits: n={} 超过 32 位", n)));
        }
        if n as usize > self.bits_left() {
            return Err(TaoError::Eof);
        }
        let mut value = 0u64;
        let mut remaining = n;
        while remaining > 0 {
            let offset = (self.pos & 7) as u32;
            let take = remaining.min(8 - offset);
            let byte = u32::from(self.data[self.pos / 8]);
            let bits = (byte >> (8 - offset - take)) & ((1 << take) - 1);
            value = (value << take) | u64::from(bits);
            self.pos += take as usize;
            remaining -= take;
        }
        Ok(value as u32)
    }

    /// 无符号 Exp-Golomb ue(v), 前导零超过 31 个视为损坏码流
    pub fn read_ue(&mut self) -> TaoResult<u32> {
        let mut leading_zeros = 0u32;
        while !self.read_flag()? {
            leading_zeros += 1;
            if leading_zeros > MAX_EXP_GOLOMB_PREFIX {
                return Err(TaoError::InvalidData("Exp-Golomb 前导零过长".into()));
            }
        }
        let suffix = self.read_bits(leading_zeros)?;
        Ok(((1u64 << leading_zeros) - 1 + u64::from(suffix)) as u32)
    }

    /// 有符号 Exp-Golomb se(v): 1 -> 1, 2 -> -1, 3 -> 2, ...
    pub fn read_se(&mut self) -> TaoResult<i32> {
        let code = i64::from(self.read_ue()?);
        let magnitude = (code + 1) / 2;
        Ok(if code & 1 == 1 { magnitude } else { -magnitude } as i32)
    }

    pub fn skip_bits(&mut self, n: u32) -> TaoResult<()> {
        if n as usize > self.bits_left() {
            return Err(TaoError::Eof);
        }
        self.pos += n as usize;
        Ok(())
    }

    /// 定位到绝对位下标
    pub fn seek_bits(&mut self, pos: usize) -> TaoResult<()> {
        if pos > self.data.len() * 8 {
            return Err(TaoError::Eof);
        }
        self.pos = pos;
        Ok(())
    }

    /// 对齐到下一个字节边界, 已对齐时不动
    pub fn align_to_byte(&mut self) {
        self.pos = self.pos.next_multiple_of(8);
    }
}
