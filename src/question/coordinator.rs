//! 题目生成任务协调
//!
//! 按段落记录后台生成状态，保证同一段落同时只有一个生成任务，
//! 失败的任务在下一次查询或预生成时重新排队。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::generator::{GenerationBackend, QuestionGenerator};
use super::StatusResponse;
use crate::config::GenerationConfig;
use crate::error::StoreResult;
use crate::store::QuestionStore;

/// 生成任务状态
///
/// 只保存在内存中，不持久化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// 后台正在生成
    Generating,
    /// 题目已保存
    Completed,
    /// 生成或保存失败，下一次查询时重新排队
    Failed,
}

/// 任务记录
#[derive(Debug, Clone)]
struct TaskEntry {
    state: TaskState,
    updated_at: DateTime<Utc>,
}

impl TaskEntry {
    fn new(state: TaskState) -> Self {
        Self {
            state,
            updated_at: Utc::now(),
        }
    }
}

/// 生成请求
#[derive(Debug)]
struct Job {
    paragraph_id: i64,
    text: String,
}

type TaskMap = Arc<DashMap<i64, TaskEntry>>;

/// 更新已存在的任务状态
///
/// 任务已被清除（段落阅读完成）时不再重新创建
fn set_state(tasks: &TaskMap, paragraph_id: i64, state: TaskState) {
    if let Some(mut entry) = tasks.get_mut(&paragraph_id) {
        *entry = TaskEntry::new(state);
    }
}

/// 题目生成协调器
///
/// 以段落 ID 为键记录生成任务。同一段落同时最多只有一个后台生成任务：
/// 检查与创建任务在 DashMap 分片锁内完成，不同段落之间互不阻塞。
/// 生成任务由固定数量的 worker 从有界队列中消费。
pub struct TaskCoordinator<B> {
    store: Arc<dyn QuestionStore>,
    tasks: TaskMap,
    sender: mpsc::Sender<Job>,
    /// 已提交的后台任务数
    launched: Arc<AtomicUsize>,
    _backend: std::marker::PhantomData<fn() -> B>,
}

impl<B: GenerationBackend> TaskCoordinator<B> {
    /// 创建协调器并启动 worker
    ///
    /// 必须在 tokio 运行时内调用
    pub fn new(
        store: Arc<dyn QuestionStore>,
        generator: QuestionGenerator<B>,
        config: &GenerationConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let tasks: TaskMap = Arc::new(DashMap::new());
        let generator = Arc::new(generator);

        for worker_id in 0..config.workers.max(1) {
            let worker = Worker {
                id: worker_id,
                store: store.clone(),
                tasks: tasks.clone(),
                generator: generator.clone(),
            };
            let receiver = receiver.clone();

            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut receiver = receiver.lock().await;
                        receiver.recv().await
                    };
                    match job {
                        Some(job) => worker.run(job).await,
                        None => break,
                    }
                }
                debug!(worker = worker.id, "生成 worker 退出");
            });
        }

        Self {
            store,
            tasks,
            sender,
            launched: Arc::new(AtomicUsize::new(0)),
            _backend: std::marker::PhantomData,
        }
    }

    /// 查询题目状态
    ///
    /// 1. 题目已保存：直接返回 ready，不修改任务状态
    /// 2. 没有任务：创建 generating 任务并提交一次后台生成
    /// 3. generating：返回 generating，不提交新任务
    /// 4. completed 但仍查不到题目：清除任务，返回 generating
    /// 5. failed：清除后重新提交
    pub fn get_question_status(
        &self,
        paragraph_id: i64,
        paragraph_text: &str,
    ) -> StoreResult<StatusResponse> {
        if self.store.has_questions(paragraph_id)? {
            return Ok(StatusResponse::ready(self.store.list_questions(paragraph_id)?));
        }

        match self.tasks.entry(paragraph_id) {
            Entry::Vacant(vacant) => {
                // 锁内再确认一次，关闭"检查已保存"与"标记生成中"之间的窗口
                if self.store.has_questions(paragraph_id)? {
                    drop(vacant);
                    return Ok(StatusResponse::ready(self.store.list_questions(paragraph_id)?));
                }
                let state = self.enqueue(paragraph_id, paragraph_text);
                vacant.insert(TaskEntry::new(state));
            }
            Entry::Occupied(mut occupied) => match occupied.get().state {
                TaskState::Generating => {}
                TaskState::Completed => {
                    debug!(paragraph_id, "任务已完成但题目不可见，清除任务");
                    occupied.remove();
                }
                TaskState::Failed => {
                    info!(paragraph_id, "上次生成失败，重新排队");
                    let state = self.enqueue(paragraph_id, paragraph_text);
                    occupied.insert(TaskEntry::new(state));
                }
            },
        }

        Ok(StatusResponse::generating())
    }

    /// 预生成下一段的题目
    ///
    /// 没有已保存的题目时提交生成：没有任务或上次失败时排队，不返回状态
    pub fn prefetch(&self, paragraph_id: i64, paragraph_text: &str) -> StoreResult<()> {
        if self.store.has_questions(paragraph_id)? {
            return Ok(());
        }
        match self.tasks.entry(paragraph_id) {
            Entry::Vacant(vacant) => {
                let state = self.enqueue(paragraph_id, paragraph_text);
                vacant.insert(TaskEntry::new(state));
            }
            Entry::Occupied(mut occupied) if occupied.get().state == TaskState::Failed => {
                debug!(paragraph_id, "预生成：上次失败，重新排队");
                let state = self.enqueue(paragraph_id, paragraph_text);
                occupied.insert(TaskEntry::new(state));
            }
            Entry::Occupied(_) => {}
        }
        Ok(())
    }

    pub fn is_generating(&self, paragraph_id: i64) -> bool {
        self.task_state(paragraph_id) == Some(TaskState::Generating)
    }

    pub fn task_state(&self, paragraph_id: i64) -> Option<TaskState> {
        self.tasks.get(&paragraph_id).map(|entry| entry.state)
    }

    /// 段落阅读完成后清除任务记录
    pub fn clear(&self, paragraph_id: i64) {
        self.tasks.remove(&paragraph_id);
    }

    /// 清除超过 `max_age` 未更新的已结束任务，返回清除数量
    pub fn prune(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let before = self.tasks.len();
        self.tasks
            .retain(|_, entry| entry.state == TaskState::Generating || entry.updated_at > cutoff);
        before.saturating_sub(self.tasks.len())
    }

    /// 已提交的后台任务数
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    /// 提交后台任务，返回任务的初始状态
    ///
    /// 队列已满时返回 Failed，下一次查询会重新排队
    fn enqueue(&self, paragraph_id: i64, paragraph_text: &str) -> TaskState {
        let job = Job {
            paragraph_id,
            text: paragraph_text.to_string(),
        };

        match self.sender.try_send(job) {
            Ok(()) => {
                self.launched.fetch_add(1, Ordering::SeqCst);
                debug!(paragraph_id, "提交题目生成任务");
                TaskState::Generating
            }
            Err(e) => {
                warn!(paragraph_id, error = %e, "生成队列已满或已关闭");
                TaskState::Failed
            }
        }
    }
}

/// 后台 worker
struct Worker<B> {
    id: usize,
    store: Arc<dyn QuestionStore>,
    tasks: TaskMap,
    generator: Arc<QuestionGenerator<B>>,
}

impl<B: GenerationBackend> Worker<B> {
    async fn run(&self, job: Job) {
        let Job { paragraph_id, text } = job;

        // 题目可能已由其他任务保存
        match self.store.has_questions(paragraph_id) {
            Ok(true) => {
                set_state(&self.tasks, paragraph_id, TaskState::Completed);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!(paragraph_id, error = %e, "查询题目失败");
                set_state(&self.tasks, paragraph_id, TaskState::Failed);
                return;
            }
        }

        // 单独的任务中生成，后端 panic 时只影响本次生成
        let generator = self.generator.clone();
        let handle = tokio::spawn(async move { generator.generate(&text).await });
        let questions = match handle.await {
            Ok(questions) => questions,
            Err(e) => {
                error!(paragraph_id, error = %e, "题目生成任务异常退出");
                set_state(&self.tasks, paragraph_id, TaskState::Failed);
                return;
            }
        };

        match self.store.save_questions(paragraph_id, &questions) {
            Ok(saved) => {
                info!(paragraph_id, worker = self.id, saved, "题目已保存");
                set_state(&self.tasks, paragraph_id, TaskState::Completed);
            }
            Err(e) => {
                error!(paragraph_id, error = %e, "保存题目失败");
                set_state(&self.tasks, paragraph_id, TaskState::Failed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GenerationError, StoreError};
    use crate::question::generator::tests::payload;
    use crate::question::{default_questions, Question, QuestionStatus};
    use crate::store::MemoryStore;
    use serde_json::Value;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    /// 可控制的后端：记录调用次数，可选择阻塞直到放行
    struct MockBackend {
        calls: Arc<AtomicUsize>,
        gate: Option<Arc<Notify>>,
        items: usize,
    }

    impl GenerationBackend for MockBackend {
        async fn complete(&self, _prompt: &str) -> Result<Value, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            } else {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            Ok(payload(self.items))
        }
    }

    /// 第一次保存失败的存储
    struct FlakyStore {
        inner: MemoryStore,
        fail_next_save: AtomicBool,
    }

    impl QuestionStore for FlakyStore {
        fn has_questions(&self, paragraph_id: i64) -> StoreResult<bool> {
            self.inner.has_questions(paragraph_id)
        }

        fn list_questions(&self, paragraph_id: i64) -> StoreResult<Vec<Question>> {
            self.inner.list_questions(paragraph_id)
        }

        fn save_questions(&self, paragraph_id: i64, questions: &[Question]) -> StoreResult<bool> {
            if self.fail_next_save.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Invalid("磁盘已满".to_string()));
            }
            self.inner.save_questions(paragraph_id, questions)
        }
    }

    fn config(workers: usize, queue_capacity: usize) -> GenerationConfig {
        GenerationConfig {
            workers,
            queue_capacity,
            ..GenerationConfig::default()
        }
    }

    fn coordinator(
        store: Arc<dyn QuestionStore>,
        items: usize,
        gate: Option<Arc<Notify>>,
        config: &GenerationConfig,
    ) -> (TaskCoordinator<MockBackend>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = MockBackend {
            calls: calls.clone(),
            gate,
            items,
        };
        let generator = QuestionGenerator::new(backend, 2);
        (TaskCoordinator::new(store, generator, config), calls)
    }

    /// 轮询直到 ready
    async fn wait_ready<B: GenerationBackend>(
        coordinator: &TaskCoordinator<B>,
        paragraph_id: i64,
    ) -> StatusResponse {
        for _ in 0..200 {
            let status = coordinator.get_question_status(paragraph_id, "文本").unwrap();
            if status.status == QuestionStatus::Ready {
                return status;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("段落 {} 的题目一直没有生成", paragraph_id);
    }

    #[tokio::test]
    async fn test_existing_questions_ready_immediately() {
        let store = Arc::new(MemoryStore::new());
        store.save_questions(1, &default_questions()).unwrap();
        let (coordinator, calls) = coordinator(store, 5, None, &config(2, 8));

        let status = coordinator.get_question_status(1, "文本").unwrap();
        assert_eq!(status.status, QuestionStatus::Ready);
        assert_eq!(status.questions.len(), 5);
        assert_eq!(coordinator.task_state(1), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_spawn_one_generation() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, calls) = coordinator(store.clone(), 5, None, &config(4, 16));
        let coordinator = Arc::new(coordinator);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.get_question_status(7, "文本").unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let status = wait_ready(&coordinator, 7).await;
        assert_eq!(status.questions.len(), 5);
        assert_eq!(coordinator.launched(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.list_questions(7).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_second_read_sees_generating() {
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(Notify::new());
        let (coordinator, calls) = coordinator(store, 5, Some(gate.clone()), &config(2, 8));

        let first = coordinator.get_question_status(3, "文本").unwrap();
        let second = coordinator.get_question_status(3, "文本").unwrap();
        assert_eq!(first.status, QuestionStatus::Generating);
        assert_eq!(second.status, QuestionStatus::Generating);
        assert!(coordinator.is_generating(3));
        assert_eq!(coordinator.launched(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        gate.notify_one();
        wait_ready(&coordinator, 3).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_schema_violations_fall_back_to_defaults() {
        let store = Arc::new(MemoryStore::new());
        // 每次都只返回 4 道题
        let (coordinator, calls) = coordinator(store.clone(), 4, None, &config(1, 8));

        let status = wait_ready(&coordinator, 9).await;
        assert_eq!(status.questions, default_questions());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.task_state(9), Some(TaskState::Completed));
    }

    #[tokio::test]
    async fn test_failed_task_is_requeued() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail_next_save: AtomicBool::new(true),
        });
        let (coordinator, calls) = coordinator(store.clone(), 5, None, &config(1, 8));

        coordinator.get_question_status(4, "文本").unwrap();
        for _ in 0..200 {
            if coordinator.task_state(4) == Some(TaskState::Failed) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(coordinator.task_state(4), Some(TaskState::Failed));

        let status = coordinator.get_question_status(4, "文本").unwrap();
        assert_eq!(status.status, QuestionStatus::Generating);
        assert_eq!(coordinator.launched(), 2);

        wait_ready(&coordinator, 4).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_completed_without_questions_is_cleared() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, calls) = coordinator(store, 5, None, &config(1, 8));
        coordinator
            .tasks
            .insert(11, TaskEntry::new(TaskState::Completed));

        let status = coordinator.get_question_status(11, "文本").unwrap();
        assert_eq!(status.status, QuestionStatus::Generating);
        assert_eq!(coordinator.task_state(11), None);
        assert_eq!(coordinator.launched(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_full_queue_marks_failed() {
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(Notify::new());
        let (coordinator, _calls) = coordinator(store, 5, Some(gate.clone()), &config(1, 1));

        // 第一个任务被 worker 取走并阻塞在后端
        coordinator.get_question_status(1, "文本").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        coordinator.get_question_status(2, "文本").unwrap();
        coordinator.get_question_status(3, "文本").unwrap();

        assert!(coordinator.is_generating(1));
        assert!(coordinator.is_generating(2));
        assert_eq!(coordinator.task_state(3), Some(TaskState::Failed));
        assert_eq!(coordinator.launched(), 2);
    }

    #[tokio::test]
    async fn test_prefetch_and_clear() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, _calls) = coordinator(store.clone(), 5, None, &config(1, 8));

        coordinator.prefetch(5, "下一段").unwrap();
        coordinator.prefetch(5, "下一段").unwrap();
        assert_eq!(coordinator.launched(), 1);

        wait_ready(&coordinator, 5).await;
        coordinator.clear(5);
        assert_eq!(coordinator.task_state(5), None);

        // 已有题目时不再提交
        coordinator.prefetch(5, "下一段").unwrap();
        assert_eq!(coordinator.launched(), 1);
    }

    #[tokio::test]
    async fn test_prefetch_requeues_failed_task() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, calls) = coordinator(store, 5, None, &config(1, 8));
        coordinator
            .tasks
            .insert(6, TaskEntry::new(TaskState::Failed));

        coordinator.prefetch(6, "下一段").unwrap();
        assert_eq!(coordinator.launched(), 1);
        assert_ne!(coordinator.task_state(6), Some(TaskState::Failed));

        wait_ready(&coordinator, 6).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_prune_finished_tasks() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, _calls) = coordinator(store, 5, None, &config(1, 8));
        let old = TaskEntry {
            state: TaskState::Completed,
            updated_at: Utc::now() - Duration::hours(2),
        };
        coordinator.tasks.insert(1, old.clone());
        coordinator.tasks.insert(2, TaskEntry { state: TaskState::Generating, ..old });
        coordinator.tasks.insert(3, TaskEntry::new(TaskState::Failed));

        assert_eq!(coordinator.prune(Duration::hours(1)), 1);
        assert_eq!(coordinator.task_state(1), None);
        assert!(coordinator.is_generating(2));
        assert_eq!(coordinator.task_state(3), Some(TaskState::Failed));
    }
}
