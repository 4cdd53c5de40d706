//! 追踪器能力：配置、采样、事务创建与上报入口

use crate::config::TracerConfig;
use crate::context::WorkerContext;
use crate::reporter::{LoggingReporter, Reporter};
use crate::trace_id::TraceParent;
use crate::transaction::{Transaction, TransactionHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 采样器：上游决定优先，其次按采样率
#[derive(Debug, Clone, Copy)]
pub struct Sampler {
    rate: f64,
}

impl Sampler {
    pub fn new(rate: f64) -> Self {
        Self {
            rate: if rate.is_nan() { 1.0 } else { rate.clamp(0.0, 1.0) },
        }
    }

    pub fn is_sampled(&self, parent: Option<&TraceParent>) -> bool {
        if let Some(parent) = parent {
            return parent.is_sampled();
        }
        if self.rate >= 1.0 {
            true
        } else if self.rate <= 0.0 {
            false
        } else {
            fastrand::f64() < self.rate
        }
    }
}

pub struct Tracer {
    config: TracerConfig,
    sampler: Sampler,
    reporter: Arc<dyn Reporter>,
    running: AtomicBool,
}

impl Tracer {
    pub fn builder() -> TracerBuilder {
        TracerBuilder::default()
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    /// 追踪器当前是否可用
    pub fn is_active(&self) -> bool {
        self.config.active && self.running.load(Ordering::Acquire)
    }

    /// 运行时暂停追踪
    pub fn pause(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn resume(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// 通过执行上下文查找当前活动事务
    pub fn current_transaction(&self, worker: &WorkerContext) -> Option<TransactionHandle> {
        worker.current_transaction()
    }

    /// 创建事务；`traceparent` 合法时延续上游调用链并沿用其采样决定
    pub fn start_transaction(
        &self,
        traceparent: Option<&str>,
        service_context: Option<&str>,
    ) -> TransactionHandle {
        let parent = traceparent.and_then(|header| match header.parse::<TraceParent>() {
            Ok(parent) => Some(parent),
            Err(err) => {
                tracing::debug!(error = %err, "ignoring malformed traceparent");
                None
            }
        });
        let sampled = self.sampler.is_sampled(parent.as_ref());
        let mut transaction = Transaction::new(parent.as_ref(), sampled);
        transaction.service_name = service_context
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| self.config.service_name.clone());

        tracing::debug!(
            trace_id = %transaction.trace_id,
            transaction_id = %transaction.id,
            sampled,
            "transaction started"
        );
        TransactionHandle::new(transaction)
    }

    /// 交给上报管道；失败只记录日志
    pub fn report(&self, transaction: Transaction) {
        let id = transaction.id.clone();
        if let Err(err) = self.reporter.report(transaction) {
            tracing::warn!(transaction_id = %id, error = %err, "failed to report transaction");
        }
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("config", &self.config)
            .field("sampler", &self.sampler)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct TracerBuilder {
    config: Option<TracerConfig>,
    reporter: Option<Arc<dyn Reporter>>,
}

impl TracerBuilder {
    pub fn config(mut self, config: TracerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// 未指定上报器时使用 [`LoggingReporter`]
    pub fn build(self) -> Tracer {
        let config = self.config.unwrap_or_default();
        Tracer {
            sampler: Sampler::new(config.sample_rate()),
            config,
            reporter: self
                .reporter
                .unwrap_or_else(|| Arc::new(LoggingReporter) as Arc<dyn Reporter>),
            running: AtomicBool::new(true),
        }
    }
}
