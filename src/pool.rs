//! 固定大小的工作线程池
//!
//! 每个任务返回一个 [`TaskHandle`]，批量等待通过条件变量驱动，
//! 只在需要汇报进度时才会定期唤醒

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::info;

/// 任务层错误：包装一个任务的失败并标识出错的任务
#[derive(Debug)]
pub struct TaskError {
    label: String,
    source: anyhow::Error,
}

impl TaskError {
    fn new(label: impl Into<String>, source: anyhow::Error) -> Self {
        Self { label: label.into(), source }
    }

    /// 出错任务的标识，形如 `"index#3"`
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} failed: {}", self.label, self.source)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

struct TaskState<T> {
    slot: Mutex<Option<Result<T>>>,
    cv: Condvar,
}

impl<T> TaskState<T> {
    fn new() -> Self {
        Self { slot: Mutex::new(None), cv: Condvar::new() }
    }

    fn complete(&self, result: Result<T>) {
        let mut guard = self.slot.lock().unwrap();
        if guard.is_none() {
            *guard = Some(result);
        }
        drop(guard);
        self.cv.notify_all();
    }
}

/// 一个已提交任务的异步句柄
pub struct TaskHandle<T> {
    state: Arc<TaskState<T>>,
}

impl<T> TaskHandle<T> {
    pub fn is_done(&self) -> bool {
        self.state.slot.lock().unwrap().is_some()
    }

    fn wait_done(&self) {
        let mut guard = self.state.slot.lock().unwrap();
        while guard.is_none() {
            guard = self.state.cv.wait(guard).unwrap();
        }
    }

    /// 最多等待 `timeout`，返回任务是否已完成
    fn wait_done_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.state.slot.lock().unwrap();
        while guard.is_none() {
            let (g, wait) = self.state.cv.wait_timeout(guard, timeout).unwrap();
            guard = g;
            if wait.timed_out() {
                return guard.is_some();
            }
        }
        true
    }

    /// 阻塞等待任务完成并取出结果
    pub fn join(self) -> Result<T> {
        self.wait_done();
        let result = self.state.slot.lock().unwrap().take();
        result.expect("task result already taken")
    }
}

struct Job {
    run: Box<dyn FnOnce() + Send>,
    cancel: Box<dyn FnOnce() + Send>,
}

/// 被 [`WorkerPool::shutdown_now`] 排空的未开始任务
///
/// 可以在当前线程补跑；直接丢弃会让对应句柄以取消错误结束
pub struct PendingTask {
    job: Option<Job>,
}

impl PendingTask {
    pub fn run(mut self) {
        if let Some(job) = self.job.take() {
            (job.run)();
        }
    }
}

impl Drop for PendingTask {
    fn drop(&mut self) {
        if let Some(job) = self.job.take() {
            (job.cancel)();
        }
    }
}

/// 固定大小的线程池，线程命名为 `{prefix}-{n}`
///
/// 池是显式构造、显式持有的普通值，不存在进程级单例
pub struct WorkerPool {
    size: usize,
    tx: Option<Sender<Job>>,
    rx: Receiver<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(prefix: &str, size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = unbounded::<Job>();
        let workers = (0..size)
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("{prefix}-{i}"))
                    .spawn(move || {
                        for job in rx.iter() {
                            (job.run)();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self { size, tx: Some(tx), rx, workers }
    }

    /// 线程数默认取硬件并行度
    pub fn with_default_size(prefix: &str) -> Self {
        Self::new(prefix, num_cpus::get())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// 尚未被任何工作线程取走的任务数量
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// 提交一个任务；任务内的 panic 会被捕获并转成该任务的错误
    pub fn submit<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let state = Arc::new(TaskState::new());
        let run_state = state.clone();
        let cancel_state = state.clone();
        let job = Job {
            run: Box::new(move || {
                let result = match catch_unwind(AssertUnwindSafe(f)) {
                    Ok(r) => r,
                    Err(payload) => Err(anyhow!("task panicked: {}", panic_message(&payload))),
                };
                run_state.complete(result);
            }),
            cancel: Box::new(move || {
                cancel_state.complete(Err(anyhow!("task cancelled before execution")));
            }),
        };
        if let Some(tx) = &self.tx {
            if tx.send(job).is_ok() {
                return TaskHandle { state };
            }
        }
        state.complete(Err(anyhow!("worker pool is shut down")));
        TaskHandle { state }
    }

    pub fn submit_all<T, F>(&self, tasks: Vec<F>) -> Vec<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        tasks.into_iter().map(|f| self.submit(f)).collect()
    }

    /// 把输入切成至多 `concurrency`（默认池大小）个连续分片，
    /// 每个非空分片构造一个任务
    ///
    /// 分片按 ceil(len / concurrency) 均分，按分片顺序拼接即还原输入顺序；
    /// `task` 收到分片数据和分片在原序列中的起始下标
    pub fn submit_partitioned<I, T, F>(
        &self,
        items: Vec<I>,
        concurrency: Option<usize>,
        task: F,
    ) -> Vec<TaskHandle<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(Vec<I>, usize) -> Result<T> + Send + Sync + 'static,
    {
        let concurrency = concurrency.unwrap_or(self.size).max(1);
        let chunk_size = items.len().div_ceil(concurrency).max(1);
        let task = Arc::new(task);

        let mut handles = vec![];
        let mut offset = 0;
        let mut rest = items;
        while !rest.is_empty() {
            let tail = rest.split_off(chunk_size.min(rest.len()));
            let chunk = std::mem::replace(&mut rest, tail);
            let task = task.clone();
            let chunk_offset = offset;
            offset += chunk.len();
            handles.push(self.submit(move || task(chunk, chunk_offset)));
        }
        handles
    }

    /// 等待一批任务，按提交顺序返回结果
    ///
    /// `poll` 大于零时至多每个间隔输出一条完成百分比日志；
    /// 任意任务失败都会让整批以 [`TaskError`] 失败
    pub fn wait_all<T>(
        &self,
        handles: Vec<TaskHandle<T>>,
        label: &str,
        poll: Duration,
    ) -> Result<Vec<T>, TaskError> {
        let total = handles.len();
        let mut progress = |done: usize| {
            info!("{label}: {done}/{total} ({:.0}%)", done as f64 * 100.0 / total as f64);
        };
        if poll.is_zero() {
            wait_batch(&handles, poll, None);
        } else {
            info!("{label}: 已提交 {total} 个任务");
            wait_batch(&handles, poll, Some(&mut progress));
            info!("{label}: 完成");
        }
        let mut results = Vec::with_capacity(total);
        for (i, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(v) => results.push(v),
                Err(e) => return Err(TaskError::new(format!("{label}#{i}"), e)),
            }
        }
        Ok(results)
    }

    /// 同 [`wait_all`](Self::wait_all)，但把进度交给回调而不是日志
    pub fn wait_all_with<T, P>(
        &self,
        handles: Vec<TaskHandle<T>>,
        poll: Duration,
        mut on_progress: P,
    ) -> Result<Vec<T>, TaskError>
    where
        P: FnMut(usize, usize),
    {
        let total = handles.len();
        let mut progress = |done: usize| on_progress(done, total);
        let callback: Option<&mut dyn FnMut(usize)> =
            if poll.is_zero() { None } else { Some(&mut progress) };
        wait_batch(&handles, poll, callback);
        let mut results = Vec::with_capacity(total);
        for (i, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(v) => results.push(v),
                Err(e) => return Err(TaskError::new(format!("task#{i}"), e)),
            }
        }
        Ok(results)
    }

    /// 等待一批带 key 的任务，返回 key -> 结果
    pub fn wait_map<K, T>(
        &self,
        handles: BTreeMap<K, TaskHandle<T>>,
        label: &str,
        poll: Duration,
    ) -> Result<BTreeMap<K, T>, TaskError>
    where
        K: Ord + fmt::Debug,
    {
        let flat: Vec<_> = handles.values().collect();
        let total = flat.len();
        let mut progress = |done: usize| {
            info!("{label}: {done}/{total} ({:.0}%)", done as f64 * 100.0 / total as f64);
        };
        let callback: Option<&mut dyn FnMut(usize)> =
            if poll.is_zero() { None } else { Some(&mut progress) };
        wait_batch(&flat, poll, callback);

        let mut results = BTreeMap::new();
        for (key, handle) in handles {
            match handle.join() {
                Ok(v) => {
                    results.insert(key, v);
                }
                Err(e) => return Err(TaskError::new(format!("{label}[{key:?}]"), e)),
            }
        }
        Ok(results)
    }

    /// 等待队列中与正在执行的任务全部结束后关闭
    pub fn shutdown(self) {
        drop(self);
    }

    /// 立刻关闭：排空还没开始的任务并返回，正在执行的任务不被打断
    pub fn shutdown_now(mut self) -> Vec<PendingTask> {
        self.tx.take();
        let mut pending = vec![];
        while let Ok(job) = self.rx.try_recv() {
            pending.push(PendingTask { job: Some(job) });
        }
        // 不等待正在执行的任务，工作线程会在当前任务结束后自行退出
        self.workers.drain(..);
        pending
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn wait_batch<T>(
    handles: &[impl AsHandle<T>],
    poll: Duration,
    mut progress: Option<&mut dyn FnMut(usize)>,
) {
    if poll.is_zero() || progress.is_none() {
        for h in handles {
            h.handle().wait_done();
        }
        return;
    }
    loop {
        let done = handles.iter().filter(|h| h.handle().is_done()).count();
        if done == handles.len() {
            break;
        }
        if let Some(report) = progress.as_deref_mut() {
            report(done);
        }
        // 在第一个未完成的任务上限时等待，避免空转
        if let Some(h) = handles.iter().find(|h| !h.handle().is_done()) {
            h.handle().wait_done_timeout(poll);
        }
    }
}

trait AsHandle<T> {
    fn handle(&self) -> &TaskHandle<T>;
}

impl<T> AsHandle<T> for TaskHandle<T> {
    fn handle(&self) -> &TaskHandle<T> {
        self
    }
}

impl<T> AsHandle<T> for &TaskHandle<T> {
    fn handle(&self) -> &TaskHandle<T> {
        *self
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
