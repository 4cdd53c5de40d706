//! Axum/Tower 钩子安装器
//!
//! [`ApmLayer`] 包装一个 tower 服务：调用内部服务前执行入口钩子，内部 future
//! 完成（返回响应、返回错误或 panic）后执行出口钩子。响应、错误与 panic 都原样交还调用方。

use crate::context::{self, WorkerContext};
use crate::extractor::{parse_form_parameters, NoResponse, RawRequest, RawResponse};
use crate::hooks::{DispatchFrame, DispatchHooks};
use crate::transaction::{CapturedError, TransactionHandle};
use crate::{agent, TraceError};
use axum::{
    extract::{ConnectInfo, FromRequestParts, MatchedPath, Request},
    http::{request::Parts, HeaderMap, Method, Uri, Version},
    response::Response,
};
use futures_util::FutureExt;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::Instrument;

/// 认证后的用户标识
///
/// 由应用的认证中间件放入请求或响应扩展中，出口钩子据此设置用户名。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedPrincipal(pub String);

/// 追踪中间件层
#[derive(Clone)]
pub struct ApmLayer {
    hooks: DispatchHooks,
    handler_name: Option<Arc<str>>,
}

impl ApmLayer {
    /// 使用显式注入的钩子对
    pub fn new(hooks: DispatchHooks) -> Self {
        Self {
            hooks,
            handler_name: None,
        }
    }

    /// 使用 [`agent::init`] 安装的钩子对
    pub fn from_agent() -> Self {
        Self::new(agent::hooks())
    }

    /// 覆盖用于命名事务的处理器标识（默认为内部服务的类型名）
    pub fn with_handler_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.handler_name = Some(name.into());
        self
    }
}

impl<S> Layer<S> for ApmLayer {
    type Service = ApmService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ApmService {
            inner,
            hooks: self.hooks.clone(),
            handler_name: self.handler_name.clone(),
            type_name: std::any::type_name::<S>(),
        }
    }
}

#[derive(Clone)]
pub struct ApmService<S> {
    inner: S,
    hooks: DispatchHooks,
    handler_name: Option<Arc<str>>,
    type_name: &'static str,
}

impl<S> ApmService<S> {
    /// 处理器标识：显式名称 > 路由模式 > 内部服务类型名
    fn handler_for(&self, snapshot: &AxumRequest) -> Arc<str> {
        self.handler_name
            .clone()
            .or_else(|| snapshot.matched_path().map(Arc::from))
            .unwrap_or_else(|| Arc::from(self.type_name))
    }
}

impl<S> Service<Request> for ApmService<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        if !self.hooks.is_enabled() {
            return Box::pin(self.inner.call(req));
        }
        // 嵌套的层（内部转发）共享同一个 worker，排除缓存因此能生效
        let worker = context::current_worker().unwrap_or_default();
        if worker.exclusion().should_skip() {
            // 外层已排除该请求，由外层的出口钩子重置排除缓存
            return Box::pin(self.inner.call(req));
        }

        let snapshot = AxumRequest::from_request(&req);
        let frame = self.hooks.on_enter(&worker, &snapshot).into_inner();

        let span = match frame.transaction() {
            Some(tx) => tracing::info_span!(
                "request",
                trace_id = %tx.read(|t| t.trace_id.clone()),
                method = %snapshot.method,
                uri = %snapshot.uri
            ),
            None => tracing::Span::none(),
        };

        let inner = &mut self.inner;
        let future = context::sync_with_worker(worker.clone(), || inner.call(req));
        let guard = ExitGuard {
            hooks: self.hooks.clone(),
            worker: worker.clone(),
            frame: Some(frame),
            handler: self.handler_for(&snapshot),
            snapshot,
        };

        Box::pin(
            async move {
                let outcome =
                    context::with_worker(worker, AssertUnwindSafe(future).catch_unwind()).await;
                guard.finish(outcome)
            }
            .instrument(span),
        )
    }
}

/// 出口钩子的执行保证
///
/// 请求 future 在完成前被丢弃（客户端断开、外层超时）时，`Drop` 仍运行出口钩子：
/// 事务按当时的状态最终化，不记录错误，状态码保持为空。
struct ExitGuard {
    hooks: DispatchHooks,
    worker: WorkerContext,
    frame: Option<DispatchFrame>,
    snapshot: AxumRequest,
    handler: Arc<str>,
}

impl ExitGuard {
    fn finish<E: fmt::Display>(
        mut self,
        outcome: std::thread::Result<Result<Response, E>>,
    ) -> Result<Response, E> {
        let frame = self.frame.take().unwrap_or_default();
        let (hooks, worker, handler) = (&self.hooks, &self.worker, &*self.handler);
        match outcome {
            Ok(Ok(response)) => {
                if self.snapshot.principal.is_none() {
                    self.snapshot.principal = response
                        .extensions()
                        .get::<AuthenticatedPrincipal>()
                        .map(|p| p.0.clone());
                }
                let raw = AxumResponse(&response);
                hooks.on_exit(worker, frame, &self.snapshot, &raw, None, handler);
                Ok(response)
            }
            Ok(Err(err)) => {
                let thrown = CapturedError::from_error(&err);
                hooks.on_exit(worker, frame, &self.snapshot, &NoResponse, Some(thrown), handler);
                Err(err)
            }
            Err(payload) => {
                let thrown = CapturedError::from_panic(payload.as_ref());
                hooks.on_exit(worker, frame, &self.snapshot, &NoResponse, Some(thrown), handler);
                std::panic::resume_unwind(payload)
            }
        }
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            tracing::debug!("request future dropped before completion");
            self.hooks.on_exit(
                &self.worker,
                frame,
                &self.snapshot,
                &NoResponse,
                None,
                &self.handler,
            );
        }
    }
}

/// 入口时截取的请求快照
///
/// 请求体在分发时被内部服务消费，因此参数表只来自查询串。
/// 层通过 `route_layer` 挂在路由上时可读到路由模式（例如 `/users/{id}`），用于命名事务。
#[derive(Debug, Clone)]
pub struct AxumRequest {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    host: Option<String>,
    port: Option<u16>,
    scheme: String,
    remote_addr: Option<String>,
    matched_path: Option<String>,
    principal: Option<String>,
}

impl AxumRequest {
    pub fn from_request(req: &Request) -> Self {
        let headers = req.headers().clone();
        let uri = req.uri().clone();
        let authority = uri
            .authority()
            .map(|a| (a.host().to_string(), a.port_u16()))
            .or_else(|| {
                headers
                    .get(axum::http::header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .map(split_host_port)
            });
        let scheme = uri.scheme_str().unwrap_or("http").to_string();
        let (host, port) = match authority {
            Some((host, port)) => (Some(host), port),
            None => (None, None),
        };

        Self {
            method: req.method().clone(),
            version: req.version(),
            host,
            port,
            scheme,
            remote_addr: req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip().to_string()),
            matched_path: req
                .extensions()
                .get::<MatchedPath>()
                .map(|p| p.as_str().to_string()),
            principal: req
                .extensions()
                .get::<AuthenticatedPrincipal>()
                .map(|p| p.0.clone()),
            uri,
            headers,
        }
    }
}

fn split_host_port(value: &str) -> (String, Option<u16>) {
    match value.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (value.to_string(), None),
        },
        None => (value.to_string(), None),
    }
}

fn version_str(version: Version) -> Option<&'static str> {
    match version {
        Version::HTTP_09 => Some("HTTP/0.9"),
        Version::HTTP_10 => Some("HTTP/1.0"),
        Version::HTTP_11 => Some("HTTP/1.1"),
        Version::HTTP_2 => Some("HTTP/2.0"),
        Version::HTTP_3 => Some("HTTP/3.0"),
        _ => None,
    }
}

impl RawRequest for AxumRequest {
    fn method(&self) -> Option<&str> {
        Some(self.method.as_str())
    }

    fn protocol(&self) -> Option<&str> {
        version_str(self.version)
    }

    fn scheme(&self) -> Option<&str> {
        Some(&self.scheme)
    }

    fn server_name(&self) -> Option<&str> {
        self.host.as_deref()
    }

    fn server_port(&self) -> Option<u16> {
        self.port
    }

    fn request_uri(&self) -> Option<&str> {
        Some(self.uri.path())
    }

    fn query_string(&self) -> Option<&str> {
        self.uri.query()
    }

    fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    fn is_secure(&self) -> bool {
        self.scheme == "https"
    }

    fn servlet_path(&self) -> Option<&str> {
        Some(self.uri.path())
    }

    fn path_info(&self) -> Option<&str> {
        None
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn header_names(&self) -> Vec<String> {
        self.headers.keys().map(|k| k.as_str().to_string()).collect()
    }

    fn header_values(&self, name: &str) -> Vec<String> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect()
    }

    fn cookies(&self) -> Vec<(String, String)> {
        self.headers
            .get_all(axum::http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                Some((name.to_string(), value.to_string()))
            })
            .collect()
    }

    fn user_principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    fn parameter_map(&self) -> Vec<(String, Vec<String>)> {
        self.uri.query().map(parse_form_parameters).unwrap_or_default()
    }
}

impl AxumRequest {
    /// 路由匹配到的模式
    pub fn matched_path(&self) -> Option<&str> {
        self.matched_path.as_deref()
    }
}

/// 出口时的响应视图；响应已生成即视为已提交
struct AxumResponse<'a>(&'a Response);

impl RawResponse for AxumResponse<'_> {
    fn status(&self) -> Option<u16> {
        Some(self.0.status().as_u16())
    }

    fn is_committed(&self) -> bool {
        true
    }

    fn header_names(&self) -> Result<Vec<String>, TraceError> {
        Ok(self
            .0
            .headers()
            .keys()
            .map(|k| k.as_str().to_string())
            .collect())
    }

    fn header_values(&self, name: &str) -> Vec<String> {
        self.0
            .headers()
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect()
    }
}

// -- CurrentTransaction Extractor --

/// Axum 提取器：在 handler 中获取当前活动事务
///
/// handler 可在此处先行命名事务或设置用户名，更深层的插桩优先于出口钩子的默认命名。
///
/// # 示例
/// ```no_run
/// use axum::{routing::get, Router};
/// use dispatch_apm::{ApmLayer, CurrentTransaction};
///
/// async fn checkout(CurrentTransaction(tx): CurrentTransaction) -> &'static str {
///     if let Some(tx) = tx {
///         tx.set_name_if_unset("GET checkout");
///     }
///     "ok"
/// }
///
/// let app: Router = Router::new()
///     .route("/checkout", get(checkout))
///     .layer(ApmLayer::from_agent());
/// ```
#[derive(Debug, Clone)]
pub struct CurrentTransaction(pub Option<TransactionHandle>);

impl<S> FromRequestParts<S> for CurrentTransaction
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(_parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            context::current_worker().and_then(|worker| worker.current_transaction()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request as HttpRequest};

    fn request(uri: &str) -> Request {
        HttpRequest::builder()
            .uri(uri)
            .header("host", "example.com:3000")
            .header("cookie", "a=1; b=2")
            .header("accept", "text/html")
            .header("accept", "application/json")
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_snapshot_reads_request_fields() {
        let snapshot = AxumRequest::from_request(&request("/go?x=1&x=2"));

        assert_eq!(snapshot.method(), Some("GET"));
        assert_eq!(snapshot.protocol(), Some("HTTP/1.1"));
        assert_eq!(snapshot.server_name(), Some("example.com"));
        assert_eq!(snapshot.server_port(), Some(3000));
        assert_eq!(snapshot.request_uri(), Some("/go"));
        assert_eq!(snapshot.query_string(), Some("x=1&x=2"));
        assert_eq!(
            RawRequest::header_values(&snapshot, "Accept"),
            ["text/html", "application/json"]
        );
        assert_eq!(
            snapshot.cookies(),
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
        assert_eq!(
            snapshot.parameter_map(),
            vec![("x".to_string(), vec!["1".to_string(), "2".to_string()])]
        );
        assert!(!snapshot.is_secure());
        assert!(snapshot.matched_path().is_none());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com"), ("example.com".to_string(), None));
        assert_eq!(split_host_port("example.com:80"), ("example.com".to_string(), Some(80)));
        assert_eq!(split_host_port("[::1]:8080"), ("[::1]".to_string(), Some(8080)));
        assert_eq!(split_host_port("host:abc"), ("host:abc".to_string(), None));
    }

    #[test]
    fn test_response_view() {
        let mut response = Response::new(Body::empty());
        response
            .headers_mut()
            .append("x-multi", HeaderValue::from_static("1"));
        response
            .headers_mut()
            .append("x-multi", HeaderValue::from_static("2"));
        let view = AxumResponse(&response);

        assert_eq!(view.status(), Some(200));
        assert!(view.is_committed());
        assert_eq!(view.header_names().unwrap(), vec!["x-multi".to_string()]);
        assert_eq!(view.header_values("x-multi"), ["1", "2"]);
    }
}
