//! 错误处理和边界情况测试
//!
//! 验证钩子在宿主对象、上报管道与配置出现异常时的故障隔离：
//! 被拦截方法的结果从不受影响，排除缓存与 scope 始终被清理。

use dispatch_apm::testing::{MockRequest, MockResponse};
use dispatch_apm::{
    CaptureBody, ChannelReporter, DispatchHooks, RawRequest, RecordingReporter, Reporter,
    TraceError, TraceParent, Tracer, TracerConfig, Transaction, WorkerContext,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 在指定访问点 panic 的请求对象
struct FaultyRequest {
    inner: MockRequest,
    panic_on: &'static str,
}

impl FaultyRequest {
    fn new(inner: MockRequest, panic_on: &'static str) -> Self {
        Self { inner, panic_on }
    }

    fn check(&self, point: &str) {
        if self.panic_on == point {
            panic!("container failure in {point}");
        }
    }
}

impl RawRequest for FaultyRequest {
    fn method(&self) -> Option<&str> {
        RawRequest::method(&self.inner)
    }

    fn protocol(&self) -> Option<&str> {
        RawRequest::protocol(&self.inner)
    }

    fn scheme(&self) -> Option<&str> {
        RawRequest::scheme(&self.inner)
    }

    fn server_name(&self) -> Option<&str> {
        RawRequest::server_name(&self.inner)
    }

    fn server_port(&self) -> Option<u16> {
        RawRequest::server_port(&self.inner)
    }

    fn request_uri(&self) -> Option<&str> {
        RawRequest::request_uri(&self.inner)
    }

    fn query_string(&self) -> Option<&str> {
        RawRequest::query_string(&self.inner)
    }

    fn remote_addr(&self) -> Option<&str> {
        RawRequest::remote_addr(&self.inner)
    }

    fn is_secure(&self) -> bool {
        RawRequest::is_secure(&self.inner)
    }

    fn servlet_path(&self) -> Option<&str> {
        RawRequest::servlet_path(&self.inner)
    }

    fn path_info(&self) -> Option<&str> {
        RawRequest::path_info(&self.inner)
    }

    fn header(&self, name: &str) -> Option<&str> {
        RawRequest::header(&self.inner, name)
    }

    fn header_names(&self) -> Vec<String> {
        self.check("header_names");
        RawRequest::header_names(&self.inner)
    }

    fn header_values(&self, name: &str) -> Vec<String> {
        RawRequest::header_values(&self.inner, name)
    }

    fn cookies(&self) -> Vec<(String, String)> {
        RawRequest::cookies(&self.inner)
    }

    fn user_principal(&self) -> Option<&str> {
        self.check("user_principal");
        RawRequest::user_principal(&self.inner)
    }

    fn parameter_map(&self) -> Vec<(String, Vec<String>)> {
        self.check("parameter_map");
        RawRequest::parameter_map(&self.inner)
    }
}

struct PanickingReporter;

impl Reporter for PanickingReporter {
    fn report(&self, _transaction: Transaction) -> Result<(), TraceError> {
        panic!("reporter crashed")
    }
}

fn hooks_with(reporter: Arc<dyn Reporter>, config: TracerConfig) -> DispatchHooks {
    let tracer = Tracer::builder().config(config).reporter(reporter).build();
    DispatchHooks::new(Arc::new(tracer))
}

/// 入口阶段读取头部时 panic：请求不被追踪，分发照常进行
#[test]
fn test_enter_failure_degrades_to_untraced() {
    init_logging();
    let reporter = Arc::new(RecordingReporter::new());
    let hooks = hooks_with(reporter.clone(), TracerConfig::default());
    let worker = WorkerContext::new();
    let request = FaultyRequest::new(MockRequest::get("/go"), "header_names");

    let enter = hooks.on_enter(&worker, &request);
    assert!(!enter.ok);
    assert!(!enter.value.is_tracing());
    assert_eq!(worker.depth(), 0, "失败路径上激活的 scope 必须被释放");

    let result: Result<MockResponse, String> =
        hooks.intercept(&worker, &request, "Go", || Ok(MockResponse::with_status(202)));
    assert_eq!(dispatch_apm::RawResponse::status(&result.unwrap()), Some(202));
    assert!(reporter.is_empty());
    assert!(!worker.exclusion().should_skip());
}

/// 命名步骤失败不影响最终化与上报
#[test]
fn test_naming_failure_still_reports() {
    init_logging();
    let reporter = Arc::new(RecordingReporter::new());
    let hooks = hooks_with(reporter.clone(), TracerConfig::default());
    let worker = WorkerContext::new();
    let request = FaultyRequest::new(MockRequest::get("/go"), "user_principal");

    let frame = hooks.on_enter(&worker, &request).into_inner();
    assert!(frame.is_tracing());
    let exit = hooks.on_exit(&worker, frame, &request, &MockResponse::ok(), None, "Go");
    assert!(!exit.ok);

    assert_eq!(reporter.len(), 1);
    let tx = reporter.first().unwrap();
    assert_eq!(tx.name(), "GET unknown route", "命名失败时使用默认名称");
    assert!(tx.context.user.username.is_none());
    assert_eq!(worker.depth(), 0);
}

/// 参数表物化失败：事务仍被清理，排除缓存被重置
#[test]
fn test_parameter_capture_failure_is_isolated() {
    init_logging();
    let reporter = Arc::new(RecordingReporter::new());
    let config = TracerConfig {
        capture_body: CaptureBody::All,
        ..TracerConfig::default()
    };
    let hooks = hooks_with(reporter.clone(), config);
    let worker = WorkerContext::new();
    let request = FaultyRequest::new(MockRequest::post_form("/login", "user=a"), "parameter_map");

    let result: Result<MockResponse, String> =
        hooks.intercept(&worker, &request, "Login", || Ok(MockResponse::ok()));
    assert!(result.is_ok());
    assert_eq!(worker.depth(), 0);
    assert!(!worker.exclusion().should_skip());
}

/// 上报管道 panic：钩子报告失败但不传播
#[test]
fn test_reporter_panic_is_contained() {
    init_logging();
    let hooks = hooks_with(Arc::new(PanickingReporter), TracerConfig::default());
    let worker = WorkerContext::new();
    let request = MockRequest::get("/go");

    let frame = hooks.on_enter(&worker, &request).into_inner();
    let tx = frame.transaction().cloned().unwrap();
    let exit = hooks.on_exit(&worker, frame, &request, &MockResponse::ok(), None, "Go");
    assert!(!exit.ok);
    assert!(tx.is_finished());
    assert_eq!(worker.depth(), 0);
    assert!(!worker.exclusion().should_skip());
}

/// 通道接收端已关闭：上报失败只记录日志
#[test]
fn test_closed_channel_reporter() {
    init_logging();
    let (reporter, receiver) = ChannelReporter::new();
    drop(receiver);
    let err = reporter
        .report(Transaction::new(None, true))
        .unwrap_err();
    assert!(matches!(err, TraceError::ReporterClosed));

    let hooks = hooks_with(Arc::new(reporter), TracerConfig::default());
    let worker = WorkerContext::new();
    let request = MockRequest::get("/go");
    let frame = hooks.on_enter(&worker, &request).into_inner();
    let exit = hooks.on_exit(&worker, frame, &request, &MockResponse::ok(), None, "Go");
    assert!(exit.ok, "上报失败不算钩子故障");
}

/// 格式错误的 traceparent 被忽略，开始新的调用链
#[test]
fn test_malformed_traceparent_starts_new_trace() {
    let malformed = [
        "",
        "garbage",
        "ff-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        "00-00000000000000000000000000000000-b7ad6b7169203331-01",
        "00-0af7651916cd43dd8448eb211c80319c-0000000000000000-01",
        "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-1",
        "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01-extra",
        "00-0AF7651916CD43DD8448EB211C80319C-b7ad6b7169203331-01",
    ];
    for header in malformed {
        assert!(
            header.parse::<TraceParent>().is_err(),
            "应该拒绝无效traceparent: {header}"
        );
    }

    let reporter = Arc::new(RecordingReporter::new());
    let hooks = hooks_with(reporter.clone(), TracerConfig::default());
    let worker = WorkerContext::new();
    let request = MockRequest::get("/go").header("traceparent", malformed[3]);
    let _: Result<MockResponse, String> =
        hooks.intercept(&worker, &request, "Go", || Ok(MockResponse::ok()));

    let tx = reporter.first().unwrap();
    assert!(tx.parent_id.is_none());
    assert_ne!(tx.trace_id.as_str(), "00000000000000000000000000000000");
}

/// 从 JSON 加载配置：缺失字段取默认值，非法值被拒绝
#[test]
fn test_config_deserialization() {
    let config: TracerConfig = serde_json::from_str(
        r#"{
            "service_name": "shop",
            "transaction_sample_rate": 7.5,
            "capture_body": "errors",
            "ignore_urls": ["/admin/*", "(?-i)/Internal*"]
        }"#,
    )
    .unwrap();
    assert_eq!(config.service_name.as_deref(), Some("shop"));
    assert_eq!(config.sample_rate(), 1.0, "采样率应被限制在 [0, 1]");
    assert_eq!(config.capture_body, CaptureBody::Errors);
    assert!(config.capture_headers);
    assert_eq!(config.ignore_urls.len(), 2);
    assert!(config.ignore_urls[0].matches("/ADMIN/users"));
    assert!(!config.ignore_urls[1].matches("/internal/x"));
    assert!(!config.sanitize_field_names.is_empty());

    let invalid = serde_json::from_str::<TracerConfig>(r#"{"capture_body": "sometimes"}"#);
    assert!(invalid.is_err());
}

/// 未安装时的钩子对从不失败
#[test]
fn test_disabled_hooks_with_faulty_request() {
    let hooks = DispatchHooks::disabled();
    let worker = WorkerContext::new();
    let request = FaultyRequest::new(MockRequest::get("/go"), "header_names");

    let result: Result<MockResponse, String> =
        hooks.intercept(&worker, &request, "Go", || Err("boom".to_string()));
    assert_eq!(result.unwrap_err(), "boom");
    assert_eq!(worker.depth(), 0);
}
