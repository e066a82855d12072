use super::*;
use mobi::Mobi;
use regex::Regex;
use std::fs;
use std::sync::OnceLock;

use super::html_utils::{body_inner, rewrite_images, strip_scripts, tolerate_missing};
use crate::asset_manager::{is_relocatable, sniff_image_extension};

fn recindex_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\srecindex\s*=\s*["']?0*(\d+)["']?"#).expect("recindex regex")
    })
}

fn open(file_path: &Path) -> IngestResult<Mobi> {
    if !file_path.exists() {
        return Err(IngestError::io(
            file_path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "文件不存在"),
        ));
    }
    // 截断的文件可能让解析库 panic
    match std::panic::catch_unwind(|| Mobi::from_path(file_path)) {
        Ok(Ok(book)) => Ok(book),
        Ok(Err(e)) => Err(IngestError::corrupt(format!("MOBI 解析错误: {}", e))),
        Err(_) => Err(IngestError::corrupt("MOBI 解析时发生异常")),
    }
}

/// 读取第一张图片记录（作为封面）
pub fn first_image(file_path: &Path) -> IngestResult<Option<Vec<u8>>> {
    let book = open(file_path)?;
    let image = book
        .image_records()
        .into_iter()
        .map(|record| record.content[..].to_vec())
        .find(|data| sniff_image_extension(data).is_some());
    Ok(image)
}

/// 图片记录导出后的相对路径（相对于解压根目录）
fn record_name(index: usize, data: &[u8]) -> String {
    format!("images/{:05}.{}", index, sniff_image_extension(data).unwrap_or("jpg"))
}

/// 把 `recindex="N"` 改写为指向导出文件的 src
///
/// recindex 从 1 开始编号
fn link_record_images(html: &str, names: &[String]) -> String {
    recindex_regex()
        .replace_all(html, |caps: &regex::Captures<'_>| {
            let index = caps[1].parse::<usize>().unwrap_or(0);
            match index.checked_sub(1).and_then(|i| names.get(i)) {
                Some(name) => format!(r#" src="{}""#, name),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// MOBI / AZW 解析器
///
/// 图片记录先导出到临时目录，再从该目录重定位到公开目录
#[derive(Clone, Default)]
pub struct MobiParser;

impl MobiParser {
    pub fn new() -> Self {
        Self
    }

    /// 导出所有图片记录，返回按记录顺序排列的相对路径
    fn export_images(&self, book: &Mobi, root: &Path) -> IngestResult<Vec<String>> {
        let images_dir = root.join("images");
        fs::create_dir_all(&images_dir).map_err(|e| IngestError::io(&images_dir, e))?;

        let mut names = Vec::new();
        for (i, record) in book.image_records().into_iter().enumerate() {
            let data = &record.content[..];
            let name = record_name(i + 1, data);
            let target = root.join(&name);
            fs::write(&target, data).map_err(|e| IngestError::io(&target, e))?;
            names.push(name);
        }
        Ok(names)
    }
}

impl Parser for MobiParser {
    fn name(&self) -> &'static str {
        "mobi"
    }

    fn parse(&self, file_path: &Path, ctx: &mut ParseContext<'_>) -> IngestResult<String> {
        let book = open(file_path)?;
        let html = book.content_as_string_lossy();

        // 临时目录在函数返回时自动删除
        let extract_dir = tempfile::tempdir().map_err(|e| IngestError::io(std::env::temp_dir(), e))?;
        let root = extract_dir.path();
        let names = self.export_images(&book, root)?;
        debug!(images = names.len(), "MOBI 图片记录已导出");

        let linked = link_record_images(&strip_scripts(&html), &names);
        let rewritten = rewrite_images(&linked, |reference| {
            if !is_relocatable(reference, ctx.relocator.url_base()) {
                return Ok(None);
            }
            let result = ctx.relocator.relocate_file(root, reference);
            tolerate_missing(reference, result)
        })?;

        Ok(body_inner(&rewritten))
    }
}
