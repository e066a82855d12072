//! Speed Reader 命令行
//!
//! 导入文档并切分段落，或为段落生成阅读理解题目。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use speed_reader_lib::question::{ChatCompletionsBackend, QuestionGenerator, QuestionStatus};
use speed_reader_lib::{
    AppConfig, BookStore, FormatTag, IngestionPipeline, ParagraphStore, SqliteStore,
    TaskCoordinator,
};

#[derive(Debug, Parser)]
#[command(name = "speed-reader", version, about = "文档导入与段落题目生成")]
struct Cli {
    /// 配置文件路径
    #[arg(long, short, global = true, default_value = "speed-reader.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 导入文档并保存段落
    Ingest {
        file: PathBuf,

        /// 格式（txt / md / docx / epub / mobi / pdf），默认按扩展名判断
        #[arg(long)]
        format: Option<FormatTag>,

        /// 导入到已存在的书籍，默认新建
        #[arg(long)]
        book_id: Option<i64>,
    },

    /// 查询段落题目，必要时等待生成完成
    Questions {
        paragraph_id: i64,

        /// 轮询间隔（毫秒）
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn open_store(config: &AppConfig) -> Result<Arc<SqliteStore>> {
    let data_dir = &config.storage.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("创建数据目录失败: {}", data_dir.display()))?;
    let store = SqliteStore::open(config.storage.database_path())?;
    Ok(Arc::new(store))
}

fn ingest(
    config: &AppConfig,
    file: PathBuf,
    format: Option<FormatTag>,
    book_id: Option<i64>,
) -> Result<()> {
    let format = match format {
        Some(format) => format,
        None => FormatTag::from_path(&file)?,
    };
    let store = open_store(config)?;

    let (book_id, created) = match book_id {
        Some(id) => {
            if store.get_book(id)?.is_none() {
                bail!("书籍不存在: {}", id);
            }
            (id, false)
        }
        None => {
            let title = file
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("未知书籍");
            let id = store.create_book(title, &file.to_string_lossy(), format.as_str())?;
            (id, true)
        }
    };

    let pipeline = IngestionPipeline::new(config, store.clone());
    let report = match pipeline.ingest_book(book_id, &file, format, None) {
        Ok(report) => report,
        Err(e) => {
            if created {
                if let Err(cleanup) = store.delete_book(book_id) {
                    tracing::warn!(book_id, error = %cleanup, "删除书籍记录失败");
                }
            }
            return Err(e).with_context(|| format!("导入失败: {}", file.display()));
        }
    };

    if let Some(url) = report.cover_url.as_deref() {
        store.set_cover_url(book_id, Some(url))?;
    }

    for paragraph in store.list_paragraphs(book_id)? {
        println!(
            "{}",
            serde_json::json!({
                "id": paragraph.id,
                "sequence": paragraph.sequence,
                "word_count": paragraph.word_count,
            })
        );
    }
    info!(
        book_id,
        paragraphs = report.paragraph_count,
        images = report.images,
        "导入完成"
    );
    Ok(())
}

async fn questions(config: &AppConfig, paragraph_id: i64, interval_ms: u64) -> Result<()> {
    let store = open_store(config)?;
    let paragraph = store
        .get_paragraph(paragraph_id)?
        .with_context(|| format!("段落不存在: {}", paragraph_id))?;

    let backend = ChatCompletionsBackend::new(&config.generation)?;
    let generator = QuestionGenerator::new(backend, config.generation.max_retries as usize);
    let coordinator = TaskCoordinator::new(store, generator, &config.generation);

    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(50)));
    loop {
        interval.tick().await;
        let status = coordinator.get_question_status(paragraph_id, &paragraph.content)?;
        if status.status == QuestionStatus::Ready {
            println!("{}", serde_json::to_string_pretty(&status.questions)?);
            coordinator.clear(paragraph_id);
            return Ok(());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("加载配置失败: {}", cli.config.display()))?;

    match cli.command {
        Command::Ingest {
            file,
            format,
            book_id,
        } => ingest(&config, file, format, book_id),
        Command::Questions {
            paragraph_id,
            interval_ms,
        } => questions(&config, paragraph_id, interval_ms).await,
    }
}
