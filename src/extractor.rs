//! 请求/响应元数据提取
//!
//! 宿主容器的请求、响应对象对本层只读，通过 [`RawRequest`] / [`RawResponse`] 访问。
//! 提取分两次进行：分发前（请求字段、按需采集头与 cookie），分发后（状态码、
//! 已提交标记、按需采集响应头）。昂贵的部分由采样决定和配置共同把关。

use crate::config::TracerConfig;
use crate::error::TraceError;
use crate::transaction::{MultiValueMap, RequestContext, ResponseContext, REDACTED};

pub const USER_AGENT_HEADER: &str = "User-Agent";
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// 宿主的入站请求对象（只读）
pub trait RawRequest {
    fn method(&self) -> Option<&str>;
    /// 例如 `HTTP/1.1`
    fn protocol(&self) -> Option<&str>;
    fn scheme(&self) -> Option<&str>;
    fn server_name(&self) -> Option<&str>;
    fn server_port(&self) -> Option<u16>;
    fn request_uri(&self) -> Option<&str>;
    fn query_string(&self) -> Option<&str>;
    fn remote_addr(&self) -> Option<&str>;
    fn is_secure(&self) -> bool;
    /// 分发到处理器的路径部分
    fn servlet_path(&self) -> Option<&str>;
    fn path_info(&self) -> Option<&str>;
    /// 部署/应用标识，用于推导服务名
    fn service_context(&self) -> Option<&str> {
        None
    }
    /// 指定名称的第一个头部值
    fn header(&self, name: &str) -> Option<&str>;
    fn header_names(&self) -> Vec<String>;
    fn header_values(&self, name: &str) -> Vec<String>;
    fn cookies(&self) -> Vec<(String, String)>;
    fn user_principal(&self) -> Option<&str>;
    /// 物化参数表；可能在容器侧产生副作用，只在满足采集资格时调用
    fn parameter_map(&self) -> Vec<(String, Vec<String>)>;
}

/// 宿主的出站响应对象（只读）
pub trait RawResponse {
    fn status(&self) -> Option<u16>;
    fn is_committed(&self) -> bool;
    /// 某些容器版本不支持枚举响应头
    fn header_names(&self) -> Result<Vec<String>, TraceError>;
    fn header_values(&self, name: &str) -> Vec<String>;
}

/// 分发体未产生响应时使用（例如抛出了错误）
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResponse;

impl RawResponse for NoResponse {
    fn status(&self) -> Option<u16> {
        None
    }

    fn is_committed(&self) -> bool {
        false
    }

    fn header_names(&self) -> Result<Vec<String>, TraceError> {
        Ok(Vec::new())
    }

    fn header_values(&self, _name: &str) -> Vec<String> {
        Vec::new()
    }
}

fn sanitized(config: &TracerConfig, name: &str, value: String) -> String {
    if config.is_sanitized(name) {
        REDACTED.to_string()
    } else {
        value
    }
}

/// 分发前：采集全部 cookie 与请求头（每个头的所有值都保留）
///
/// 调用方负责确认事务已采样且启用了头部采集。
pub fn capture_request_headers(
    request: &dyn RawRequest,
    context: &mut RequestContext,
    config: &TracerConfig,
) {
    for (name, value) in request.cookies() {
        let value = sanitized(config, &name, value);
        context.cookies.add(&name, value);
    }
    for name in request.header_names() {
        let values = request
            .header_values(&name)
            .into_iter()
            .map(|v| sanitized(config, &name, v));
        context.headers.add_all(&name, values);
    }
}

/// 分发前：填充低成本字段，不受采样影响（命名与聚合需要）
pub fn fill_request_context(request: &dyn RawRequest, context: &mut RequestContext) {
    let owned = |s: Option<&str>| s.map(str::to_string);

    context.method = owned(request.method());
    context.http_version = request
        .protocol()
        .map(|p| p.strip_prefix("HTTP/").unwrap_or(p).to_string());
    context.content_type = owned(request.header(CONTENT_TYPE_HEADER));
    context.socket.remote_address = owned(request.remote_addr());
    context.socket.encrypted = request.is_secure();

    let url = &mut context.url;
    url.protocol = owned(request.scheme());
    url.hostname = owned(request.server_name());
    url.port = request.server_port();
    url.pathname = owned(request.request_uri());
    url.search = owned(request.query_string().filter(|q| !q.is_empty()));
    url.full = Some(full_url(
        request.scheme(),
        request.server_name(),
        request.server_port(),
        request.request_uri(),
        url.search.as_deref(),
    ));
}

fn full_url(
    scheme: Option<&str>,
    host: Option<&str>,
    port: Option<u16>,
    uri: Option<&str>,
    query: Option<&str>,
) -> String {
    let scheme = scheme.unwrap_or("http");
    let mut full = String::new();
    if let Some(host) = host {
        full.push_str(scheme);
        full.push_str("://");
        full.push_str(host);
        let default_port = match scheme {
            "https" => 443,
            _ => 80,
        };
        if let Some(port) = port.filter(|p| *p != default_port) {
            full.push(':');
            full.push_str(&port.to_string());
        }
    }
    full.push_str(uri.unwrap_or("/"));
    if let Some(query) = query {
        full.push('?');
        full.push_str(query);
    }
    full
}

/// 分发后：状态码与已提交标记
pub fn fill_response_context(context: &mut ResponseContext, status: Option<u16>, committed: bool) {
    context.status_code = status;
    context.headers_sent = committed;
    context.finished = true;
}

/// 分发后：尽力采集响应头
///
/// 枚举失败时返回错误且不写入任何数据，由调用方记录日志。
pub fn capture_response_headers(
    response: &dyn RawResponse,
    context: &mut ResponseContext,
    config: &TracerConfig,
) -> Result<(), TraceError> {
    let names = response.header_names()?;
    let mut headers = MultiValueMap::new();
    for name in names {
        let values = response
            .header_values(&name)
            .into_iter()
            .map(|v| sanitized(config, &name, v));
        headers.add_all(&name, values);
    }
    context.headers = headers;
    Ok(())
}

/// 物化并脱敏参数表
pub fn capture_parameters(request: &dyn RawRequest, config: &TracerConfig) -> MultiValueMap {
    let mut parameters = MultiValueMap::new();
    for (name, values) in request.parameter_map() {
        let values = values.into_iter().map(|v| sanitized(config, &name, v));
        parameters.add_all(&name, values);
    }
    parameters
}

/// 解析 `application/x-www-form-urlencoded` 形式的参数（查询串或表单体）
pub fn parse_form_parameters(input: &str) -> Vec<(String, Vec<String>)> {
    let mut map = MultiValueMap::new();
    for (name, value) in url::form_urlencoded::parse(input.as_bytes()) {
        map.add(&name, value.into_owned());
    }
    map.iter()
        .map(|(name, values)| (name.to_string(), values.to_vec()))
        .collect()
}
