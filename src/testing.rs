//! 内存中的请求/响应实现
//!
//! 便于在没有真实容器的情况下驱动钩子（测试、嵌入式宿主）。

use crate::error::TraceError;
use crate::extractor::{parse_form_parameters, RawRequest, RawResponse};
use crate::transaction::MultiValueMap;
use std::cell::Cell;

#[derive(Debug, Clone)]
pub struct MockRequest {
    method: String,
    protocol: String,
    scheme: String,
    server_name: String,
    server_port: u16,
    uri: String,
    query: Option<String>,
    remote_addr: String,
    secure: bool,
    servlet_path: Option<String>,
    path_info: Option<String>,
    service_context: Option<String>,
    headers: MultiValueMap,
    cookies: Vec<(String, String)>,
    principal: Option<String>,
    form_body: Option<String>,
    parameter_map_calls: Cell<usize>,
}

impl MockRequest {
    pub fn new(method: &str, uri: &str) -> Self {
        Self {
            method: method.to_string(),
            protocol: "HTTP/1.1".to_string(),
            scheme: "http".to_string(),
            server_name: "localhost".to_string(),
            server_port: 8080,
            uri: uri.to_string(),
            query: None,
            remote_addr: "127.0.0.1".to_string(),
            secure: false,
            servlet_path: None,
            path_info: None,
            service_context: None,
            headers: MultiValueMap::new(),
            cookies: Vec::new(),
            principal: None,
            form_body: None,
            parameter_map_calls: Cell::new(0),
        }
    }

    pub fn get(uri: &str) -> Self {
        Self::new("GET", uri)
    }

    /// 表单编码的 POST 请求
    pub fn post_form(uri: &str, body: &str) -> Self {
        let mut request = Self::new("POST", uri).header(
            "Content-Type",
            "application/x-www-form-urlencoded",
        );
        request.form_body = Some(body.to_string());
        request
    }

    pub fn query(mut self, query: &str) -> Self {
        self.query = Some(query.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.push((name.to_string(), value.to_string()));
        self
    }

    pub fn principal(mut self, name: &str) -> Self {
        self.principal = Some(name.to_string());
        self
    }

    pub fn servlet_path(mut self, path: &str) -> Self {
        self.servlet_path = Some(path.to_string());
        self
    }

    pub fn path_info(mut self, path: &str) -> Self {
        self.path_info = Some(path.to_string());
        self
    }

    pub fn service_context(mut self, context: &str) -> Self {
        self.service_context = Some(context.to_string());
        self
    }

    pub fn secure(mut self) -> Self {
        self.scheme = "https".to_string();
        self.server_port = 443;
        self.secure = true;
        self
    }

    /// `parameter_map` 被调用的次数
    pub fn parameter_map_calls(&self) -> usize {
        self.parameter_map_calls.get()
    }
}

impl RawRequest for MockRequest {
    fn method(&self) -> Option<&str> {
        Some(&self.method)
    }

    fn protocol(&self) -> Option<&str> {
        Some(&self.protocol)
    }

    fn scheme(&self) -> Option<&str> {
        Some(&self.scheme)
    }

    fn server_name(&self) -> Option<&str> {
        Some(&self.server_name)
    }

    fn server_port(&self) -> Option<u16> {
        Some(self.server_port)
    }

    fn request_uri(&self) -> Option<&str> {
        Some(&self.uri)
    }

    fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    fn remote_addr(&self) -> Option<&str> {
        Some(&self.remote_addr)
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    /// 未显式设置时使用完整 URI
    fn servlet_path(&self) -> Option<&str> {
        self.servlet_path.as_deref().or(Some(&self.uri))
    }

    fn path_info(&self) -> Option<&str> {
        self.path_info.as_deref()
    }

    fn service_context(&self) -> Option<&str> {
        self.service_context.as_deref()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get_first(name)
    }

    fn header_names(&self) -> Vec<String> {
        self.headers.iter().map(|(name, _)| name.to_string()).collect()
    }

    fn header_values(&self, name: &str) -> Vec<String> {
        self.headers.get_all(name).to_vec()
    }

    fn cookies(&self) -> Vec<(String, String)> {
        self.cookies.clone()
    }

    fn user_principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    fn parameter_map(&self) -> Vec<(String, Vec<String>)> {
        self.parameter_map_calls.set(self.parameter_map_calls.get() + 1);
        let mut params = self
            .query
            .as_deref()
            .map(parse_form_parameters)
            .unwrap_or_default();
        if let Some(body) = &self.form_body {
            params.extend(parse_form_parameters(body));
        }
        params
    }
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    status: Option<u16>,
    committed: bool,
    headers: MultiValueMap,
    enumeration_supported: bool,
}

impl MockResponse {
    pub fn with_status(status: u16) -> Self {
        Self {
            status: Some(status),
            committed: true,
            headers: MultiValueMap::new(),
            enumeration_supported: true,
        }
    }

    pub fn ok() -> Self {
        Self::with_status(200)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn uncommitted(mut self) -> Self {
        self.committed = false;
        self
    }

    /// 模拟不支持枚举响应头的容器
    pub fn unsupported_header_enumeration(mut self) -> Self {
        self.enumeration_supported = false;
        self
    }
}

impl RawResponse for MockResponse {
    fn status(&self) -> Option<u16> {
        self.status
    }

    fn is_committed(&self) -> bool {
        self.committed
    }

    fn header_names(&self) -> Result<Vec<String>, TraceError> {
        if !self.enumeration_supported {
            return Err(TraceError::HeaderEnumeration(
                "container does not expose response header names".to_string(),
            ));
        }
        Ok(self.headers.iter().map(|(name, _)| name.to_string()).collect())
    }

    fn header_values(&self, name: &str) -> Vec<String> {
        self.headers.get_all(name).to_vec()
    }
}
