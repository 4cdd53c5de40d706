//! 追踪器配置

use crate::matcher::{compile_all, WildcardMatcher};
use serde::Deserialize;

/// 默认忽略的URL（静态资源与心跳）
const DEFAULT_IGNORE_URLS: &[&str] = &[
    "/VAADIN/*",
    "/heartbeat*",
    "/favicon.ico",
    "*.js",
    "*.css",
    "*.jpg",
    "*.jpeg",
    "*.png",
    "*.gif",
    "*.webp",
    "*.svg",
    "*.woff",
    "*.woff2",
];

/// 默认脱敏的字段名
const DEFAULT_SANITIZE_FIELD_NAMES: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "secret",
    "*key",
    "*token*",
    "*session*",
    "*credit*",
    "*card*",
    "authorization",
    "set-cookie",
];

/// 请求体（表单参数）采集策略
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBody {
    #[default]
    Off,
    /// 仅在请求处理出错时采集
    Errors,
    /// 仅在正常完成的请求上采集
    Transactions,
    All,
}

impl CaptureBody {
    /// 根据请求是否出错判断是否采集
    pub fn applies(self, has_error: bool) -> bool {
        match self {
            CaptureBody::Off => false,
            CaptureBody::Errors => has_error,
            CaptureBody::Transactions => !has_error,
            CaptureBody::All => true,
        }
    }
}

/// 追踪器配置选项
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// 追踪器是否启用（默认启用）
    pub active: bool,
    /// 服务名；请求自身携带的上下文标识优先
    pub service_name: Option<String>,
    /// 事务采样率，取值 [0, 1]
    pub transaction_sample_rate: f64,
    /// 是否采集请求/响应头及 cookie（仅对采样事务生效）
    pub capture_headers: bool,
    pub capture_body: CaptureBody,
    /// 匹配 servlet path + path info 的忽略规则
    pub ignore_urls: Vec<WildcardMatcher>,
    pub ignore_user_agents: Vec<WildcardMatcher>,
    /// 值需要替换为 `[REDACTED]` 的字段名
    pub sanitize_field_names: Vec<WildcardMatcher>,
    /// 未被命名的事务使用请求路径命名，而不是 `unknown route`
    pub use_path_as_transaction_name: bool,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            active: true,
            service_name: None,
            transaction_sample_rate: 1.0,
            capture_headers: true,
            capture_body: CaptureBody::Off,
            ignore_urls: compile_all(DEFAULT_IGNORE_URLS),
            ignore_user_agents: Vec::new(),
            sanitize_field_names: compile_all(DEFAULT_SANITIZE_FIELD_NAMES),
            use_path_as_transaction_name: false,
        }
    }
}

impl TracerConfig {
    /// 参数采集资格：表单编码的 POST 请求，且 `capture_body` 适用
    ///
    /// 读取参数表可能在容器侧产生副作用（分配新的 map、消费输入流），
    /// 因此只有该谓词成立时才会去读取。
    pub fn captures_parameters(
        &self,
        method: Option<&str>,
        content_type: Option<&str>,
        has_error: bool,
    ) -> bool {
        let is_post = method.is_some_and(|m| m.eq_ignore_ascii_case("POST"));
        let is_form = content_type.is_some_and(|ct| {
            ct.trim_start()
                .to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded")
        });
        is_post && is_form && self.capture_body.applies(has_error)
    }

    /// 采样率，越界值会被截断到 [0, 1]
    pub fn sample_rate(&self) -> f64 {
        if self.transaction_sample_rate.is_nan() {
            return 1.0;
        }
        self.transaction_sample_rate.clamp(0.0, 1.0)
    }

    pub fn is_sanitized(&self, field_name: &str) -> bool {
        self.sanitize_field_names
            .iter()
            .any(|m| m.matches(field_name))
    }
}
