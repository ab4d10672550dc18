//! 统一错误类型定义.
//!
//! 所有 Tao crate 共用的错误类型, 支持跨模块传播.
//!
//! 解码核心只区分三类语义错误:
//! - `InvalidData`: 语法元素越界, 参数集引用错误, 结构不一致
//! - `OutOfMemory`: 图像侧表或分片表分配失败
//! - `Unsupported`: 扩展负载等可跳过的特性 (记录日志后继续)

use thiserror::Error;

/// Tao 框架统一错误类型
#[derive(Debug, Error)]
pub enum TaoError {
    /// 无效参数
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 不支持的操作
    #[error("不支持的操作: {0}")]
    Unsupported(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 数据不足, 需要更多输入
    #[error("数据不足, 需要更多输入")]
    NeedMoreData,

    /// 已到达流末尾
    #[error("已到达流末尾")]
    Eof,

    /// 内存分配失败
    #[error("内存分配失败: {0}")]
    OutOfMemory(String),

    /// 无效数据 (损坏的码流等)
    #[error("无效数据: {0}")]
    InvalidData(String),

    /// 内部错误 (不应发生)
    #[error("内部错误: {0}")]
    Internal(String),
}

impl TaoError {
    /// 是否为可降级为警告的错误 (宽松模式下继续解码)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TaoError::Unsupported(_))
    }
}

impl From<std::collections::TryReserveError> for TaoError {
    fn from(err: std::collections::TryReserveError) -> Self {
        TaoError::OutOfMemory(err.to_string())
    }
}

/// Tao 框架统一 Result 类型
pub type TaoResult<T> = Result<T, TaoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_可恢复() {
        assert!(TaoError::Unsupported("slice header extension".into()).is_recoverable());
        assert!(!TaoError::InvalidData("pps_id".into()).is_recoverable());
    }

    #[test]
    fn test_try_reserve_映射为_out_of_memory() {
        let mut v: Vec<u8> = Vec::new();
        let err: TaoError = v.try_reserve_exact(usize::MAX).unwrap_err().into();
        assert!(matches!(err, TaoError::OutOfMemory(_)));
    }
}
