//! 执行上下文管理
//!
//! [`WorkerContext`] 是显式的 per-worker 状态：排除缓存和活动事务（scope）栈。
//! 线程池类宿主通过 [`WorkerContext::for_current_thread`] 获取线程绑定的实例；
//! 异步宿主使用 `tokio::task_local` 在任务作用域内传递（[`with_worker`] / [`current_worker`]）。

use crate::exclusion::ExclusionCache;
use crate::transaction::TransactionHandle;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task_local;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct WorkerState {
    exclusion: ExclusionCache,
    active: Mutex<Vec<(u64, TransactionHandle)>>,
}

/// 单个 worker（线程或任务）的执行上下文句柄
///
/// 克隆得到的是同一个上下文；不同 worker 之间从不共享。
#[derive(Debug, Clone, Default)]
pub struct WorkerContext {
    state: Arc<WorkerState>,
}

thread_local! {
    static THREAD_WORKER: WorkerContext = WorkerContext::new();
}

task_local! {
    static CURRENT_WORKER: WorkerContext;
}

impl WorkerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前线程绑定的 worker 上下文
    pub fn for_current_thread() -> Self {
        THREAD_WORKER.with(Clone::clone)
    }

    pub fn exclusion(&self) -> &ExclusionCache {
        &self.state.exclusion
    }

    fn active(&self) -> MutexGuard<'_, Vec<(u64, TransactionHandle)>> {
        self.state
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 将事务标记为当前活动事务，返回必须释放的 [`Scope`]
    pub fn activate(&self, transaction: TransactionHandle) -> Scope {
        let id = NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed);
        self.active().push((id, transaction));
        Scope {
            worker: self.clone(),
            id,
            released: false,
        }
    }

    /// 当前活动事务（最内层 scope）
    pub fn current_transaction(&self) -> Option<TransactionHandle> {
        self.active().last().map(|(_, tx)| tx.clone())
    }

    /// 活动 scope 的数量
    pub fn depth(&self) -> usize {
        self.active().len()
    }

    fn deactivate(&self, id: u64) -> bool {
        let mut active = self.active();
        match active.iter().rposition(|(scope_id, _)| *scope_id == id) {
            Some(index) => {
                active.remove(index);
                true
            }
            None => false,
        }
    }
}

/// "该事务是当前执行上下文的活动事务"的令牌
///
/// 必须释放恰好一次；重复释放是无操作，drop 时自动释放。
#[derive(Debug)]
pub struct Scope {
    worker: WorkerContext,
    id: u64,
    released: bool,
}

impl Scope {
    /// 释放 scope，返回本次调用是否真正释放
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.worker.deactivate(self.id)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.release();
    }
}

/// 获取当前任务作用域内的 worker 上下文
pub fn current_worker() -> Option<WorkerContext> {
    CURRENT_WORKER.try_with(Clone::clone).ok()
}

/// 在指定的 worker 上下文中执行异步操作
pub async fn with_worker<F, T>(worker: WorkerContext, future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    CURRENT_WORKER.scope(worker, future).await
}

/// 在指定的 worker 上下文中同步执行闭包
pub fn sync_with_worker<F, T>(worker: WorkerContext, f: F) -> T
where
    F: FnOnce() -> T,
{
    CURRENT_WORKER.sync_scope(worker, f)
}
