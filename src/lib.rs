//! 服务端请求追踪拦截层
//!
//! 包裹 Web 容器的请求分发入口：为每个入站请求创建追踪事务，
//! 补充请求/响应元数据，并在完成时交给上报管道。
//! 核心与具体 Web 框架无关，并为 Axum 提供了开箱即用的钩子安装器。
//!
//! ## Usage
//!
//! ### 基础用法：在分发调用前后运行钩子对
//! ```
//! use std::sync::Arc;
//! use dispatch_apm::testing::{MockRequest, MockResponse};
//! use dispatch_apm::{DispatchHooks, RecordingReporter, Tracer, WorkerContext};
//!
//! let reporter = Arc::new(RecordingReporter::new());
//! let tracer = Tracer::builder().reporter(reporter.clone()).build();
//! let hooks = DispatchHooks::new(Arc::new(tracer));
//!
//! let worker = WorkerContext::for_current_thread();
//! let request = MockRequest::get("/go");
//! let response: Result<MockResponse, String> =
//!     hooks.intercept(&worker, &request, "shop::GoServlet", || Ok(MockResponse::ok()));
//!
//! assert!(response.is_ok());
//! assert_eq!(reporter.first().unwrap().name(), "GET GoServlet");
//! ```
//!
//! ### Axum 集成（需要启用 axum feature）
//! ```ignore
//! use std::sync::Arc;
//! use axum::{routing::get, Router};
//! use dispatch_apm::{agent, ApmLayer, Tracer};
//!
//! #[tokio::main]
//! async fn main() {
//!     agent::init(Arc::new(Tracer::builder().build()));
//!
//!     let app = Router::new()
//!         .route("/", get(|| async { "Hello" }))
//!         .layer(ApmLayer::from_agent());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

pub mod agent;
mod config;
mod context;
mod coordinator;
mod error;
mod exclusion;
mod extractor;
mod hooks;
mod matcher;
mod reporter;
pub mod testing;
mod trace_id;
mod tracer;
mod transaction;

pub use config::{CaptureBody, TracerConfig};
pub use context::{current_worker, sync_with_worker, with_worker, Scope, WorkerContext};
pub use coordinator::{simplify_handler_name, TransactionCoordinator};
pub use error::TraceError;
pub use exclusion::ExclusionCache;
pub use extractor::{
    NoResponse, RawRequest, RawResponse, CONTENT_TYPE_HEADER, TRACEPARENT_HEADER,
    USER_AGENT_HEADER,
};
pub use hooks::{DispatchFrame, DispatchHooks, HookOutcome};
pub use matcher::WildcardMatcher;
pub use reporter::{ChannelReporter, LoggingReporter, RecordingReporter, Reporter};
pub use trace_id::{SpanId, TraceId, TraceParent};
pub use tracer::{Sampler, Tracer, TracerBuilder};
pub use transaction::{
    CapturedError, MultiValueMap, RequestContext, ResponseContext, Socket, Transaction,
    TransactionContext, TransactionHandle, Url, User, REDACTED,
};

// -- axum feature --
#[cfg(feature = "axum")]
mod integrations;
#[cfg(feature = "axum")]
pub use integrations::axum::{
    ApmLayer, ApmService, AuthenticatedPrincipal, AxumRequest, CurrentTransaction,
};
