use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{IngestError, IngestResult};

/// 已知的图片扩展名
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "svg"];

/// 图片资产
///
/// 以 `(book_id, hash)` 为键，同一本书中相同内容的图片只保存一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    pub book_id: i64,
    pub content_hash: String,
    pub url: String,
    pub file_path: PathBuf,
}

/// 图片重定位器
///
/// 负责把文档内嵌的图片写入按内容寻址的公开目录，并返回相对 URL。
/// 每次导入创建一个实例，hash → URL 缓存只在本次导入内有效。
pub struct ImageRelocator {
    book_id: i64,
    /// `{images_root}/{book_id}`
    book_dir: PathBuf,
    /// `{url_prefix}/{book_id}`
    url_base: String,
    /// hash → 资产
    cache: HashMap<String, ImageAsset>,
    /// 本次导入新写入的文件（用于回滚）
    written: Vec<PathBuf>,
}

impl ImageRelocator {
    pub fn new(book_id: i64, images_root: &Path, url_prefix: &str) -> Self {
        Self {
            book_id,
            book_dir: images_root.join(book_id.to_string()),
            url_base: format!("{}/{}", url_prefix.trim_end_matches('/'), book_id),
            cache: HashMap::new(),
            written: Vec::new(),
        }
    }

    /// 已经是重定位结果的 URL 前缀
    pub fn url_base(&self) -> &str {
        &self.url_base
    }

    /// 保存图片并返回公开 URL
    ///
    /// # 参数
    /// - `data`: 图片二进制数据
    /// - `source_name`: 原始路径（用于提取扩展名）
    ///
    /// # 返回
    /// 相对 URL（格式：{prefix}/{book_id}/{hash}.{ext}）
    pub fn relocate_bytes(&mut self, data: &[u8], source_name: &str) -> IngestResult<String> {
        let hash = content_hash(data);

        if let Some(asset) = self.cache.get(&hash) {
            return Ok(asset.url.clone());
        }

        let ext = image_extension(source_name, data);
        let filename = format!("{}.{}", hash, ext);
        let file_path = self.book_dir.join(&filename);

        if write_if_absent(&self.book_dir, &file_path, data)? {
            debug!(book_id = self.book_id, file = %filename, "写入图片");
            self.written.push(file_path.clone());
        }

        let url = format!("{}/{}", self.url_base, filename);
        self.cache.insert(
            hash.clone(),
            ImageAsset {
                book_id: self.book_id,
                content_hash: hash,
                url: url.clone(),
                file_path,
            },
        );
        Ok(url)
    }

    /// 从解压目录中读取图片并重定位
    ///
    /// 引用路径必须停留在解压根目录之内，否则视为损坏文档
    pub fn relocate_file(&mut self, root: &Path, reference: &str) -> IngestResult<String> {
        let path = resolve_within(root, reference).ok_or_else(|| {
            IngestError::corrupt(format!("图片路径越界: {}", reference))
        })?;
        let data = fs::read(&path).map_err(|e| IngestError::io(&path, e))?;
        self.relocate_bytes(&data, reference)
    }

    /// 本次导入涉及的全部图片资产
    pub fn assets(&self) -> Vec<ImageAsset> {
        let mut assets: Vec<ImageAsset> = self.cache.values().cloned().collect();
        assets.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));
        assets
    }

    /// 本次导入新写入的文件
    pub fn written_files(&self) -> &[PathBuf] {
        &self.written
    }

    /// 删除本次导入写入的文件
    ///
    /// 单个文件删除失败只记录日志，继续清理其余文件
    pub fn rollback(&mut self) -> usize {
        let mut removed = 0;
        for path in self.written.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %path.display(), error = %e, "回滚图片失败"),
            }
        }
        self.cache.clear();
        removed
    }
}

/// 计算内容哈希（SHA256 十六进制）
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// 确定图片扩展名
///
/// 优先使用源文件名中的已知扩展名，否则按文件头识别，识别不出时默认 jpg
pub fn image_extension(source_name: &str, data: &[u8]) -> String {
    let from_name = Path::new(strip_query(source_name))
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
        .filter(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()));

    match from_name {
        Some(ext) => ext,
        None => sniff_image_extension(data).unwrap_or("jpg").to_string(),
    }
}

/// 按文件头识别图片格式
pub fn sniff_image_extension(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("png")
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("jpg")
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        Some("gif")
    } else if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        Some("webp")
    } else if data.starts_with(b"BM") {
        Some("bmp")
    } else {
        None
    }
}

/// 去掉引用中的查询串和锚点
pub fn strip_query(reference: &str) -> &str {
    let end = reference.find(['?', '#']).unwrap_or(reference.len());
    &reference[..end]
}

/// 判断图片引用是否需要重定位
///
/// 绝对路径、外部链接、data URI 和已重定位的引用都保持原样
pub fn is_relocatable(reference: &str, url_base: &str) -> bool {
    let reference = reference.trim();
    if reference.is_empty() || reference.starts_with(url_base) {
        return false;
    }
    let lower = reference.to_ascii_lowercase();
    !(lower.starts_with('/')
        || lower.starts_with("//")
        || lower.starts_with("data:")
        || lower.contains("://"))
}

/// 按词法规则把相对引用拼接到基准目录上
///
/// 结果必须仍在基准根之内（不允许 `..` 越过根），否则返回 None
pub fn normalize_reference(base_dir: &Path, reference: &str) -> Option<PathBuf> {
    let mut parts: Vec<String> = Vec::new();
    let joined = base_dir.join(strip_query(reference));

    for component in joined.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    Some(parts.iter().collect())
}

/// 在解压根目录内解析引用，拒绝路径穿越
pub fn resolve_within(root: &Path, reference: &str) -> Option<PathBuf> {
    let relative = normalize_reference(Path::new(""), reference)?;
    let candidate = root.join(relative);

    // 符号链接也不允许指向根目录之外
    if let (Ok(real_root), Ok(real_path)) = (root.canonicalize(), candidate.canonicalize()) {
        if !real_path.starts_with(&real_root) {
            return None;
        }
    }
    Some(candidate)
}

/// 文件不存在时原子写入
///
/// 先写入同目录的临时文件再以不覆盖方式落盘，并发写入同一内容时只会保留一份
///
/// # 返回
/// 本次调用是否真正创建了文件
pub fn write_if_absent(dir: &Path, target: &Path, data: &[u8]) -> IngestResult<bool> {
    if target.exists() {
        return Ok(false);
    }
    fs::create_dir_all(dir).map_err(|e| IngestError::io(dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| IngestError::io(dir, e))?;
    tmp.write_all(data).map_err(|e| IngestError::io(tmp.path(), e))?;

    match tmp.persist_noclobber(target) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(IngestError::io(target, e.error)),
    }
}
