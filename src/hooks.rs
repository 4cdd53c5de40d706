//! 拦截钩子对
//!
//! 钩子安装器在分发体执行前调用 [`DispatchHooks::on_enter`]，在分发体返回或出错后
//! 调用 [`DispatchHooks::on_exit`]，各恰好一次。钩子自身不包含业务逻辑，只委托给
//! [`TransactionCoordinator`]，并保证：
//! - 永不让错误或 panic 逃逸到被拦截的方法
//! - 永远执行出口清理
//! - 不改变被拦截方法的返回值或错误

use crate::coordinator::TransactionCoordinator;
use crate::context::{Scope, WorkerContext};
use crate::error::fail_open;
use crate::extractor::{NoResponse, RawRequest, RawResponse};
use crate::tracer::Tracer;
use crate::transaction::{CapturedError, TransactionHandle};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// 钩子调用结果：`value` 总是可用，`ok` 表示内部是否发生过故障
#[derive(Debug)]
pub struct HookOutcome<T> {
    pub value: T,
    pub ok: bool,
}

impl<T> HookOutcome<T> {
    pub fn into_inner(self) -> T {
        self.value
    }
}

/// 入口钩子与出口钩子之间的帧局部状态
#[derive(Debug, Default)]
pub struct DispatchFrame {
    transaction: Option<TransactionHandle>,
    scope: Option<Scope>,
}

impl DispatchFrame {
    /// 本次调用创建的事务
    pub fn transaction(&self) -> Option<&TransactionHandle> {
        self.transaction.as_ref()
    }

    pub fn is_tracing(&self) -> bool {
        self.transaction.is_some()
    }
}

/// 注入了追踪器的钩子对；未注入时所有操作都是空操作
#[derive(Debug, Clone, Default)]
pub struct DispatchHooks {
    coordinator: Option<Arc<TransactionCoordinator>>,
}

impl DispatchHooks {
    pub fn new(tracer: Arc<Tracer>) -> Self {
        Self {
            coordinator: Some(Arc::new(TransactionCoordinator::new(tracer))),
        }
    }

    /// 没有追踪器的钩子对
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.coordinator.is_some()
    }

    pub fn tracer(&self) -> Option<&Arc<Tracer>> {
        self.coordinator.as_ref().map(|c| c.tracer())
    }

    /// 入口钩子
    pub fn on_enter(
        &self,
        worker: &WorkerContext,
        request: &dyn RawRequest,
    ) -> HookOutcome<DispatchFrame> {
        let Some(coordinator) = &self.coordinator else {
            return HookOutcome {
                value: DispatchFrame::default(),
                ok: true,
            };
        };
        if worker.exclusion().should_skip() {
            tracing::trace!("request already excluded on this worker");
            return HookOutcome {
                value: DispatchFrame::default(),
                ok: true,
            };
        }

        match fail_open("enter", || Ok(coordinator.begin(worker, request))) {
            Ok(Some((transaction, scope))) => HookOutcome {
                value: DispatchFrame {
                    transaction: Some(transaction),
                    scope: Some(scope),
                },
                ok: true,
            },
            Ok(None) => HookOutcome {
                value: DispatchFrame::default(),
                ok: true,
            },
            Err(err) => {
                tracing::warn!(error = %err, "enter hook failed, request will not be traced");
                HookOutcome {
                    value: DispatchFrame::default(),
                    ok: false,
                }
            }
        }
    }

    /// 出口钩子；`thrown` 只作为元数据记录，不会被重新抛出
    pub fn on_exit(
        &self,
        worker: &WorkerContext,
        frame: DispatchFrame,
        request: &dyn RawRequest,
        response: &dyn RawResponse,
        thrown: Option<CapturedError>,
        handler: &str,
    ) -> HookOutcome<()> {
        let Some(coordinator) = &self.coordinator else {
            return HookOutcome { value: (), ok: true };
        };
        let DispatchFrame { transaction, scope } = frame;

        let ok = match fail_open("exit", || {
            Ok(coordinator.end(worker, transaction, scope, request, response, thrown, handler))
        }) {
            Ok(ok) => ok,
            Err(err) => {
                tracing::warn!(error = %err, "exit hook failed");
                // 出口失败时至少保证排除标记不泄漏到下一个请求
                worker.exclusion().reset();
                false
            }
        };
        HookOutcome { value: (), ok }
    }

    /// 同步钩子安装器：在 `dispatch` 前后运行钩子对
    ///
    /// `dispatch` 的返回值与错误原样返回；panic 在出口钩子运行后继续传播。
    pub fn intercept<R, E, F>(
        &self,
        worker: &WorkerContext,
        request: &dyn RawRequest,
        handler: &str,
        dispatch: F,
    ) -> Result<R, E>
    where
        R: RawResponse,
        E: std::fmt::Display,
        F: FnOnce() -> Result<R, E>,
    {
        let frame = self.on_enter(worker, request).into_inner();
        let outcome = panic::catch_unwind(AssertUnwindSafe(dispatch));

        match outcome {
            Ok(Ok(response)) => {
                self.on_exit(worker, frame, request, &response, None, handler);
                Ok(response)
            }
            Ok(Err(err)) => {
                let thrown = CapturedError::from_error(&err);
                self.on_exit(worker, frame, request, &NoResponse, Some(thrown), handler);
                Err(err)
            }
            Err(payload) => {
                let thrown = CapturedError::from_panic(payload.as_ref());
                self.on_exit(worker, frame, request, &NoResponse, Some(thrown), handler);
                panic::resume_unwind(payload)
            }
        }
    }
}

impl From<Arc<Tracer>> for DispatchHooks {
    fn from(tracer: Arc<Tracer>) -> Self {
        Self::new(tracer)
    }
}
