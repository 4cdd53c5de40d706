//! 追踪标识：TraceId、SpanId 与 W3C `traceparent` 头

use crate::error::TraceError;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// 机器ID，基于进程ID和启动时间戳生成，确保不同进程/实例的ID不冲突
static MACHINE_ID: LazyLock<u16> = LazyLock::new(|| {
    let pid = std::process::id();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;
    ((pid ^ timestamp) & 0xFFFF) as u16
});

/// 追踪ID（128位，32字符小写十六进制）
///
/// 同一条分布式调用链上的所有事务共享同一个 TraceId。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceId(String);

impl TraceId {
    /// 生成新的追踪ID
    ///
    /// 构造：timestamp(48位) + machine_id(16位) + counter(32位) + random(32位)
    #[inline]
    pub fn new() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
        let random_part = fastrand::u32(..);

        let high_64 = ((timestamp & 0xFFFF_FFFF_FFFF) << 16) | (*MACHINE_ID as u64);
        let low_64 = (counter & 0xFFFF_FFFF) << 32 | (random_part as u64);

        Self(format!("{high_64:016x}{low_64:016x}"))
    }

    /// 从字符串创建追踪ID，并进行 W3C TraceContext 规范校验
    ///
    /// # 校验规则
    /// - 长度必须是 32 个字符
    /// - 只能包含小写十六进制字符（0-9, a-f）
    /// - 不能全为零
    #[inline]
    pub fn from_string_validated(id: &str) -> Option<Self> {
        is_valid_hex_id(id, 32).then(|| Self(id.to_string()))
    }

    /// 获取追踪ID字符串
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl Serialize for TraceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// 事务/父span标识（64位，16字符小写十六进制）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpanId(String);

impl SpanId {
    /// 生成新的随机 SpanId（保证非零）
    pub fn new() -> Self {
        let value = fastrand::u64(1..);
        Self(format!("{value:016x}"))
    }

    /// 从字符串创建 SpanId，校验规则同 [`TraceId::from_string_validated`]，长度为16
    pub fn from_string_validated(id: &str) -> Option<Self> {
        is_valid_hex_id(id, 16).then(|| Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Default for SpanId {
    fn default() -> Self {
        Self::new()
    }
}

impl Serialize for SpanId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// 字节级十六进制ID校验：固定长度、小写十六进制、非全零
#[inline]
fn is_valid_hex_id(id: &str, len: usize) -> bool {
    id.len() == len
        && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        && id.bytes().any(|b| b != b'0')
}

/// W3C `traceparent` 头：`{version}-{trace-id}-{parent-id}-{trace-flags}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: TraceId,
    pub parent_id: SpanId,
    pub flags: u8,
}

impl TraceParent {
    const FLAG_SAMPLED: u8 = 0x01;

    /// 为新事务构造出站 `traceparent`
    pub fn new(trace_id: TraceId, parent_id: SpanId, sampled: bool) -> Self {
        let flags = if sampled { Self::FLAG_SAMPLED } else { 0 };
        Self {
            trace_id,
            parent_id,
            flags,
        }
    }

    /// 上游是否已决定采样
    pub fn is_sampled(&self) -> bool {
        self.flags & Self::FLAG_SAMPLED != 0
    }
}

impl FromStr for TraceParent {
    type Err = TraceError;

    /// 解析 `traceparent` 头
    ///
    /// 版本 `00` 必须恰好4段；更高版本允许尾部有附加字段（向前兼容），
    /// 版本 `ff` 被视为无效。
    fn from_str(header: &str) -> Result<Self, Self::Err> {
        let invalid = || TraceError::InvalidTraceParent(header.to_string());
        let header = header.trim();
        let mut parts = header.split('-');

        let version = parts.next().ok_or_else(invalid)?;
        if version.len() != 2
            || !version.bytes().all(|b| b.is_ascii_hexdigit())
            || version.eq_ignore_ascii_case("ff")
        {
            return Err(invalid());
        }

        let trace_id = parts
            .next()
            .and_then(TraceId::from_string_validated)
            .ok_or_else(invalid)?;
        let parent_id = parts
            .next()
            .and_then(SpanId::from_string_validated)
            .ok_or_else(invalid)?;
        let flags = parts
            .next()
            .filter(|f| f.len() == 2)
            .and_then(|f| u8::from_str_radix(f, 16).ok())
            .ok_or_else(invalid)?;

        if version == "00" && parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            trace_id,
            parent_id,
            flags,
        })
    }
}

impl fmt::Display for TraceParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "00-{}-{}-{:02x}", self.trace_id, self.parent_id, self.flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_creation() {
        let trace_id = TraceId::new();
        let id_str = trace_id.as_str();

        assert_eq!(id_str.len(), 32);
        assert!(id_str
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_ne!(id_str, "00000000000000000000000000000000");
    }

    #[test]
    fn test_from_string_validated() {
        let valid_id = "0af7651916cd43dd8448eb211c80319c";
        assert_eq!(
            TraceId::from_string_validated(valid_id).map(|id| id.to_string()),
            Some(valid_id.to_string())
        );

        // 长度不正确
        assert_eq!(TraceId::from_string_validated("short"), None);
        // 包含大写字符
        assert_eq!(
            TraceId::from_string_validated("0AF7651916CD43DD8448EB211C80319C"),
            None
        );
        // 全为零
        assert_eq!(
            TraceId::from_string_validated("00000000000000000000000000000000"),
            None
        );
    }

    #[test]
    fn test_span_id_generation_and_validation() {
        let span_id = SpanId::new();
        assert_eq!(span_id.as_str().len(), 16);
        assert!(SpanId::from_string_validated(span_id.as_str()).is_some());
        assert!(SpanId::from_string_validated("0000000000000000").is_none());
        assert!(SpanId::from_string_validated("b7ad6b716920333").is_none());
    }

    #[test]
    fn test_trace_id_uniqueness() {
        let mut ids = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(ids.insert(TraceId::new()), "Generated duplicate trace ID");
        }
    }

    #[test]
    fn test_parse_traceparent() {
        let header = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";
        let parent: TraceParent = header.parse().unwrap();
        assert_eq!(parent.trace_id.as_str(), "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(parent.parent_id.as_str(), "b7ad6b7169203331");
        assert!(parent.is_sampled());
        assert_eq!(parent.to_string(), header);

        let unsampled: TraceParent = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-00"
            .parse()
            .unwrap();
        assert!(!unsampled.is_sampled());
    }

    #[test]
    fn test_parse_traceparent_rejects_malformed() {
        let invalid = [
            "",
            "00",
            "ff-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
            "00-00000000000000000000000000000000-b7ad6b7169203331-01",
            "00-0af7651916cd43dd8448eb211c80319c-0000000000000000-01",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-1",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01-extra",
            "zz-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        ];
        for header in invalid {
            assert!(
                header.parse::<TraceParent>().is_err(),
                "应该拒绝无效的traceparent: {header}"
            );
        }
    }

    #[test]
    fn test_future_version_allows_extra_fields() {
        let header = "01-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01-what-the-future";
        assert!(header.parse::<TraceParent>().is_ok());
    }
}
