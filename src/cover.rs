use chrono::Utc;
use epub::doc::EpubDoc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::asset_manager::{sniff_image_extension, write_if_absent};
use crate::error::{IngestError, IngestResult};
use crate::parser::FormatTag;

/// 手动上传封面时允许保留的扩展名
const COVER_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// 用户手动上传的封面
#[derive(Debug, Clone)]
pub struct ManualCover {
    pub data: Vec<u8>,
    pub filename: Option<String>,
}

/// 已保存的封面
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverImage {
    pub file_path: PathBuf,
    pub url: String,
}

/// 封面提取器
///
/// 手动上传优先，其次从 EPUB / MOBI 中自动提取，其他格式没有封面
pub struct CoverExtractor {
    covers_dir: PathBuf,
    url_prefix: String,
}

impl CoverExtractor {
    pub fn new(covers_dir: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            covers_dir: covers_dir.into(),
            url_prefix: url_prefix.into(),
        }
    }

    /// 提取或保存封面
    ///
    /// 封面处理失败不影响书籍导入，只记录日志并返回 None
    pub fn extract(
        &self,
        book_id: i64,
        file_path: &Path,
        format: FormatTag,
        manual: Option<&ManualCover>,
    ) -> Option<CoverImage> {
        let result = match manual {
            Some(cover) if !cover.data.is_empty() => {
                let ext = manual_extension(cover.filename.as_deref());
                self.save(book_id, &cover.data, &ext).map(Some)
            }
            _ => self.extract_embedded(book_id, file_path, format),
        };

        match result {
            Ok(cover) => cover,
            Err(e) => {
                warn!(book_id, error = %e, "封面处理失败");
                None
            }
        }
    }

    fn extract_embedded(
        &self,
        book_id: i64,
        file_path: &Path,
        format: FormatTag,
    ) -> IngestResult<Option<CoverImage>> {
        let data = match format {
            FormatTag::Epub => epub_cover(file_path)?,
            FormatTag::Mobi => crate::parser::mobi_parser::first_image(file_path)?,
            _ => None,
        };

        match data {
            Some(data) => {
                let ext = sniff_image_extension(&data).unwrap_or("jpg");
                self.save(book_id, &data, ext).map(Some)
            }
            None => {
                debug!(book_id, "文件中没有可用的封面");
                Ok(None)
            }
        }
    }

    fn save(&self, book_id: i64, data: &[u8], ext: &str) -> IngestResult<CoverImage> {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let filename = format!("cover_{}_{}.{}", book_id, timestamp, ext);
        let file_path = self.covers_dir.join(&filename);

        // 同一秒内重复导入同一本书时覆盖旧封面
        if !write_if_absent(&self.covers_dir, &file_path, data)? {
            fs::write(&file_path, data).map_err(|e| IngestError::io(&file_path, e))?;
        }

        Ok(CoverImage {
            url: format!("{}/{}", self.url_prefix.trim_end_matches('/'), filename),
            file_path,
        })
    }

    /// 删除封面图片
    pub fn delete(&self, cover: &CoverImage) {
        if let Err(e) = fs::remove_file(&cover.file_path) {
            warn!(file = %cover.file_path.display(), error = %e, "删除封面失败");
        }
    }
}

/// 从 EPUB 中读取封面
///
/// 优先使用包内声明的封面，没有声明时取第一张图片资源
fn epub_cover(file_path: &Path) -> IngestResult<Option<Vec<u8>>> {
    let mut doc = EpubDoc::new(file_path)
        .map_err(|e| IngestError::corrupt(format!("EPUB 解析错误: {}", e)))?;

    if let Some((data, _mime)) = doc.get_cover() {
        return Ok(Some(data));
    }

    let mut image_ids: Vec<String> = doc
        .resources
        .iter()
        .filter(|(_, item)| item.mime.starts_with("image/"))
        .map(|(id, _)| id.clone())
        .collect();
    image_ids.sort();

    Ok(image_ids
        .iter()
        .find_map(|id| doc.get_resource(id).map(|(data, _mime)| data)))
}

fn manual_extension(filename: Option<&str>) -> String {
    filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .filter(|ext| COVER_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or_else(|| "jpg".to_string())
}
