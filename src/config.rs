//! 应用配置
//!
//! 配置文件为 TOML 格式，所有字段都有默认值，文件不存在时使用默认配置。
//! API Key 本身不写入配置，只记录保存它的环境变量名。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 顶层配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub segment: SegmentConfig,

    #[serde(default)]
    pub text: TextConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub generation: GenerationConfig,
}

/// `[segment]` 分段阈值（按去标签后的字符数计）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// 低水位：累计长度达到该值即结束当前段落
    #[serde(default = "default_low_water")]
    pub low_water: usize,

    /// 高水位：单个段落允许的最大长度
    #[serde(default = "default_high_water")]
    pub high_water: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            low_water: default_low_water(),
            high_water: default_high_water(),
        }
    }
}

fn default_low_water() -> usize {
    1000
}
fn default_high_water() -> usize {
    4000
}

/// `[text]` 纯文本解码
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextConfig {
    /// 候选编码（按顺序尝试，使用 WHATWG 编码标签）
    #[serde(default = "default_encodings")]
    pub encodings: Vec<String>,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            encodings: default_encodings(),
        }
    }
}

fn default_encodings() -> Vec<String> {
    vec![
        "utf-8".into(),
        "gbk".into(),
        "gb18030".into(),
        "utf-16le".into(),
    ]
}

/// `[storage]` 文件与数据库位置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// 数据库文件名（相对 data_dir）
    #[serde(default = "default_database")]
    pub database: String,

    /// 图片目录名（相对 data_dir）
    #[serde(default = "default_images_dir")]
    pub images_dir: String,

    /// 封面目录名（相对 data_dir）
    #[serde(default = "default_covers_dir")]
    pub covers_dir: String,

    /// 对外访问 data_dir 的 URL 前缀
    #[serde(default = "default_public_prefix")]
    pub public_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: default_database(),
            images_dir: default_images_dir(),
            covers_dir: default_covers_dir(),
            public_prefix: default_public_prefix(),
        }
    }
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database)
    }

    pub fn images_root(&self) -> PathBuf {
        self.data_dir.join(&self.images_dir)
    }

    pub fn covers_root(&self) -> PathBuf {
        self.data_dir.join(&self.covers_dir)
    }

    /// 图片的公开 URL 前缀，例如 `/uploads/images`
    pub fn images_url_prefix(&self) -> String {
        format!(
            "{}/{}",
            self.public_prefix.trim_end_matches('/'),
            self.images_dir.trim_matches('/')
        )
    }

    pub fn covers_url_prefix(&self) -> String {
        format!(
            "{}/{}",
            self.public_prefix.trim_end_matches('/'),
            self.covers_dir.trim_matches('/')
        )
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("uploads")
}
fn default_database() -> String {
    "library.db".into()
}
fn default_images_dir() -> String {
    "images".into()
}
fn default_covers_dir() -> String {
    "covers".into()
}
fn default_public_prefix() -> String {
    "/uploads".into()
}

/// `[generation]` 题目生成后端
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// OpenAI 兼容接口地址
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// 保存 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// 首次请求之外的重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// 后台生成 worker 数量
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// 等待队列容量
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl GenerationConfig {
    /// 从环境变量读取 API Key
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-3.5-turbo".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    2
}
fn default_workers() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    64
}

impl AppConfig {
    /// 加载配置文件，文件不存在时返回默认配置
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "配置文件不存在，使用默认配置");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// 从 TOML 字符串解析并校验
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let seg = &self.segment;
        if seg.low_water == 0 || seg.low_water >= seg.high_water {
            return Err(ConfigError::Invalid(format!(
                "分段阈值必须满足 0 < low_water < high_water（当前 {} / {}）",
                seg.low_water, seg.high_water
            )));
        }
        if self.text.encodings.is_empty() {
            return Err(ConfigError::Invalid("候选编码列表不能为空".into()));
        }
        if let Some(label) = self
            .text
            .encodings
            .iter()
            .find(|label| encoding_rs::Encoding::for_label(label.as_bytes()).is_none())
        {
            return Err(ConfigError::Invalid(format!("未知编码: {}", label)));
        }
        if self.generation.workers == 0 || self.generation.queue_capacity == 0 {
            return Err(ConfigError::Invalid("workers 和 queue_capacity 必须大于 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.segment.low_water, 1000);
        assert_eq!(config.segment.high_water, 4000);
        assert_eq!(config.generation.max_retries, 2);
        assert_eq!(config.text.encodings[0], "utf-8");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [segment]
            low_water = 500

            [generation]
            model = "gpt-4o-mini"
            "#,
        )
        .unwrap();

        assert_eq!(config.segment.low_water, 500);
        assert_eq!(config.segment.high_water, 4000);
        assert_eq!(config.generation.model, "gpt-4o-mini");
        assert_eq!(config.generation.workers, 4);
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let result = AppConfig::from_toml("[segment]\nlow_water = 4000\nhigh_water = 1000\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_encoding_rejected() {
        let result = AppConfig::from_toml("[text]\nencodings = [\"klingon\"]\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.segment.high_water, 4000);
    }

    #[test]
    fn test_url_prefixes() {
        let storage = StorageConfig::default();
        assert_eq!(storage.images_url_prefix(), "/uploads/images");
        assert_eq!(storage.covers_url_prefix(), "/uploads/covers");
        assert_eq!(storage.database_path(), PathBuf::from("uploads/library.db"));
    }
}
