//! 事务数据模型
//!
//! 一个 [`Transaction`] 对应一次入站请求，从分发入口到出口。
//! 运行中的事务通过 [`TransactionHandle`] 共享给执行上下文，
//! 在最终化之后不再接受任何修改。

use crate::trace_id::{SpanId, TraceId, TraceParent};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// 脱敏后的字段值
pub const REDACTED: &str = "[REDACTED]";

/// 保序的多值映射（请求头、cookie、参数）
///
/// 名称比较不区分 ASCII 大小写，同名的每一个值都会保留。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiValueMap {
    entries: Vec<(String, Vec<String>)>,
}

impl MultiValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.position(name) {
            Some(i) => self.entries[i].1.push(value),
            None => self.entries.push((name.to_string(), vec![value])),
        }
    }

    pub fn add_all<I, V>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        for value in values {
            self.add(name, value);
        }
    }

    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.position(name)
            .map(|i| self.entries[i].1.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// 不同名称的数量
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

/// 单值序列化为字符串，多值序列化为数组
impl Serialize for MultiValueMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, values) in &self.entries {
            match values.as_slice() {
                [single] => map.serialize_entry(name, single)?,
                many => map.serialize_entry(name, many)?,
            }
        }
        map.end()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Url {
    pub protocol: Option<String>,
    pub full: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub pathname: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Socket {
    pub remote_address: Option<String>,
    pub encrypted: bool,
}

/// 请求上下文
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestContext {
    pub method: Option<String>,
    pub http_version: Option<String>,
    pub url: Url,
    pub socket: Socket,
    pub content_type: Option<String>,
    pub headers: MultiValueMap,
    pub cookies: MultiValueMap,
    /// 仅在满足参数采集资格时才会被填充
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<MultiValueMap>,
}

/// 响应上下文
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseContext {
    pub status_code: Option<u16>,
    pub headers: MultiValueMap,
    pub finished: bool,
    pub headers_sent: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct User {
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransactionContext {
    pub request: RequestContext,
    pub response: ResponseContext,
    pub user: User,
}

/// 分发过程中抛出并被捕获的错误
///
/// 只作为事务元数据记录；原始错误的传播由被拦截的方法自己负责。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapturedError {
    pub kind: String,
    pub message: String,
}

impl CapturedError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// 从任意可显示的错误值捕获
    pub fn from_error<E: fmt::Display + ?Sized>(error: &E) -> Self {
        Self::new(std::any::type_name::<E>(), error.to_string())
    }

    /// 从 panic 负载捕获
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "Box<dyn Any>".to_string());
        Self::new("panic", message)
    }
}

/// 事务：一次请求的追踪记录
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: SpanId,
    pub trace_id: TraceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SpanId>,
    name: String,
    #[serde(rename = "type")]
    pub transaction_type: &'static str,
    sampled: bool,
    /// 开始时间（Unix 微秒）
    pub timestamp: u64,
    /// 持续时间（微秒），最终化时写入
    pub duration: Option<u64>,
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub context: TransactionContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CapturedError>,
    #[serde(skip)]
    started: Instant,
}

impl Transaction {
    pub const TYPE_REQUEST: &'static str = "request";

    /// 创建事务；若存在上游 `traceparent` 则延续其调用链
    pub fn new(parent: Option<&TraceParent>, sampled: bool) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        Self {
            id: SpanId::new(),
            trace_id: parent.map(|p| p.trace_id.clone()).unwrap_or_default(),
            parent_id: parent.map(|p| p.parent_id.clone()),
            name: String::new(),
            transaction_type: Self::TYPE_REQUEST,
            sampled,
            timestamp,
            duration: None,
            result: None,
            service_name: None,
            context: TransactionContext::default(),
            error: None,
            started: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    pub fn has_name(&self) -> bool {
        !self.name.is_empty()
    }

    /// 先命名者胜出：仅在名称未设置时写入，返回是否写入
    pub fn set_name_if_unset(&mut self, name: impl Into<String>) -> bool {
        if self.has_name() {
            return false;
        }
        self.name = name.into();
        true
    }

    /// 先写入者胜出：仅在用户名未设置时写入，返回是否写入
    pub fn set_username_if_unset(&mut self, username: Option<&str>) -> bool {
        match (username, &self.context.user.username) {
            (Some(name), None) if !name.is_empty() => {
                self.context.user.username = Some(name.to_string());
                true
            }
            _ => false,
        }
    }

    /// 当前事务的出站 `traceparent`
    pub fn trace_parent(&self) -> TraceParent {
        TraceParent::new(self.trace_id.clone(), self.id.clone(), self.sampled)
    }

    fn record_duration(&mut self) {
        self.duration = Some(self.started.elapsed().as_micros() as u64);
    }
}

#[derive(Debug)]
struct Slot {
    transaction: Transaction,
    finished: bool,
}

/// 运行中事务的共享句柄
///
/// 最终化（[`TransactionHandle::finish`]）之后所有修改都会被忽略。
#[derive(Debug, Clone)]
pub struct TransactionHandle {
    inner: Arc<Mutex<Slot>>,
}

impl TransactionHandle {
    pub fn new(transaction: Transaction) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slot {
                transaction,
                finished: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // 锁中毒只意味着另一个钩子步骤panic过，数据本身仍可用
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 修改事务；已最终化时返回 `None`
    pub fn update<R>(&self, f: impl FnOnce(&mut Transaction) -> R) -> Option<R> {
        let mut slot = self.lock();
        if slot.finished {
            return None;
        }
        Some(f(&mut slot.transaction))
    }

    /// 只读访问
    pub fn read<R>(&self, f: impl FnOnce(&Transaction) -> R) -> R {
        f(&self.lock().transaction)
    }

    /// 获取当前状态的快照
    pub fn snapshot(&self) -> Transaction {
        self.read(Transaction::clone)
    }

    pub fn is_sampled(&self) -> bool {
        self.read(Transaction::is_sampled)
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn set_name_if_unset(&self, name: impl Into<String>) -> bool {
        self.update(|t| t.set_name_if_unset(name)).unwrap_or(false)
    }

    pub fn set_username_if_unset(&self, username: Option<&str>) -> bool {
        self.update(|t| t.set_username_if_unset(username))
            .unwrap_or(false)
    }

    /// 最终化事务：写入持续时间并返回用于上报的快照
    ///
    /// 只有第一次调用返回 `Some`。
    pub fn finish(&self) -> Option<Transaction> {
        let mut slot = self.lock();
        if slot.finished {
            return None;
        }
        slot.finished = true;
        slot.transaction.record_duration();
        Some(slot.transaction.clone())
    }

    /// 两个句柄是否指向同一个事务
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
