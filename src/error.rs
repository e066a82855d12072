//! 错误类型
//!
//! 导入流水线、题目生成和持久化各自有独立的错误枚举，
//! 由调用方决定哪些错误需要向上暴露。

use std::path::PathBuf;

/// 存储层错误（段落 / 题目 / 书籍记录）
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("数据库错误: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("存储锁已损坏")]
    Poisoned,

    #[error("数据格式错误: {0}")]
    Invalid(String),
}

/// 导入流水线错误
///
/// 这些错误都会中止整次导入并触发补偿清理
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// 不支持的文件格式
    #[error("不支持的文件格式: {0}")]
    UnsupportedFormat(String),

    /// 文件损坏或结构无法解析
    #[error("文件解析失败: {0}")]
    CorruptDocument(String),

    /// 所有候选编码都无法解码
    #[error("无法识别文件编码（已尝试: {tried}）")]
    EncodingUndetected { tried: String },

    /// 文件读写错误
    #[error("读写文件失败 {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// 持久化失败
    #[error("持久化失败: {0}")]
    Persistence(#[from] StoreError),
}

impl IngestError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptDocument(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// 题目生成错误
///
/// 只在生成器内部流转，重试和默认题目兜底之后不会暴露给读者
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// 网络、HTTP 状态码或空响应
    #[error("生成后端调用失败: {0}")]
    Transport(String),

    /// 返回内容不符合题目结构
    #[error("返回格式不正确: {0}")]
    Schema(String),
}

/// 配置加载错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("读取配置失败 {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("配置格式错误: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("配置无效: {0}")]
    Invalid(String),
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IngestError::UnsupportedFormat("rtf".to_string());
        assert_eq!(err.to_string(), "不支持的文件格式: rtf");

        let err = IngestError::EncodingUndetected {
            tried: "UTF-8, GBK".to_string(),
        };
        assert!(err.to_string().contains("UTF-8, GBK"));
    }

    #[test]
    fn test_store_error_converts_into_ingest_error() {
        let err: IngestError = StoreError::Poisoned.into();
        assert!(matches!(err, IngestError::Persistence(StoreError::Poisoned)));
    }
}
