//! 追踪层内部错误定义
//!
//! 这些错误永远不会越过钩子边界传播到被拦截的方法，
//! 只会被记录日志并降级为"不记录该字段/该请求的数据"。

use thiserror::Error;

/// 追踪层内部错误
#[derive(Debug, Error)]
pub enum TraceError {
    /// 容器不支持枚举响应头
    #[error("response header enumeration is not supported: {0}")]
    HeaderEnumeration(String),

    /// `traceparent` 头格式无效
    #[error("invalid traceparent header: {0}")]
    InvalidTraceParent(String),

    /// 通配符模式无法编译
    #[error("invalid wildcard pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// 上报管道已关闭
    #[error("reporter channel is closed")]
    ReporterClosed,

    /// 钩子内部发生 panic
    #[error("hook step `{0}` panicked")]
    Panicked(&'static str),
}

/// 追踪层内部结果类型
pub type Result<T> = std::result::Result<T, TraceError>;

/// 在故障隔离下执行一个钩子步骤：返回错误与 panic 都被转换为 [`TraceError`]
pub(crate) fn fail_open<T>(step: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(_) => Err(TraceError::Panicked(step)),
    }
}
