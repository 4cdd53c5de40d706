//! 上报管道接入
//!
//! 本层对每个请求最多调用一次 [`Reporter::report`]，且从不等待投递完成。
//! 序列化与传输由具体实现负责。

use crate::error::TraceError;
use crate::transaction::Transaction;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

/// 已最终化事务的接收端
pub trait Reporter: Send + Sync {
    fn report(&self, transaction: Transaction) -> Result<(), TraceError>;
}

/// 以 JSON 形式写入日志
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingReporter;

impl Reporter for LoggingReporter {
    fn report(&self, transaction: Transaction) -> Result<(), TraceError> {
        match serde_json::to_string(&transaction) {
            Ok(json) => tracing::info!(target: "dispatch_apm::report", "{json}"),
            Err(err) => tracing::warn!(error = %err, "failed to serialize transaction"),
        }
        Ok(())
    }
}

/// 通过无界通道交给后台导出任务，永不阻塞
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    sender: mpsc::UnboundedSender<Transaction>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Transaction>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Reporter for ChannelReporter {
    fn report(&self, transaction: Transaction) -> Result<(), TraceError> {
        self.sender
            .send(transaction)
            .map_err(|_| TraceError::ReporterClosed)
    }
}

/// 内存中记录所有上报的事务
#[derive(Debug, Default)]
pub struct RecordingReporter {
    transactions: Mutex<Vec<Transaction>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first(&self) -> Option<Transaction> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .cloned()
    }

    pub fn clear(&self) {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Reporter for RecordingReporter {
    fn report(&self, transaction: Transaction) -> Result<(), TraceError> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transaction);
        Ok(())
    }
}
