//! 事务生命周期协调器
//!
//! `begin` 在分发前创建事务并挂到执行上下文；`end` 在分发后（无论是否出错）
//! 重置排除缓存、释放 scope、命名事务并最终化上报。
//!
//! 单个请求的状态机：
//! `NOT_STARTED → ACTIVE → FINALIZED`，或 `NOT_STARTED → SKIPPED → SKIPPED`。

use crate::config::TracerConfig;
use crate::context::{Scope, WorkerContext};
use crate::error::{fail_open, TraceError};
use crate::extractor::{
    capture_parameters, capture_request_headers, capture_response_headers, fill_request_context,
    fill_response_context, RawRequest, RawResponse, CONTENT_TYPE_HEADER, TRACEPARENT_HEADER,
    USER_AGENT_HEADER,
};
use crate::matcher::{any_match, WildcardMatcher};
use crate::tracer::Tracer;
use crate::transaction::{CapturedError, MultiValueMap, TransactionHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 未被任何插桩命名时的默认路由名
const UNKNOWN_ROUTE: &str = "unknown route";

#[derive(Debug)]
pub struct TransactionCoordinator {
    tracer: Arc<Tracer>,
    header_enumeration_failed: AtomicBool,
}

impl TransactionCoordinator {
    pub fn new(tracer: Arc<Tracer>) -> Self {
        Self {
            tracer,
            header_enumeration_failed: AtomicBool::new(false),
        }
    }

    pub fn tracer(&self) -> &Arc<Tracer> {
        &self.tracer
    }

    fn config(&self) -> &TracerConfig {
        self.tracer.config()
    }

    /// 分发前：创建事务、激活 scope 并执行分发前的元数据提取
    ///
    /// 追踪器不可用或请求被排除时标记排除缓存并返回 `None`。
    pub fn begin(
        &self,
        worker: &WorkerContext,
        request: &dyn RawRequest,
    ) -> Option<(TransactionHandle, Scope)> {
        let Some(transaction) = self.start_transaction(
            request.service_context(),
            request.servlet_path(),
            request.path_info(),
            request.header(USER_AGENT_HEADER),
            request.header(TRACEPARENT_HEADER),
        ) else {
            // 同一请求再次进入分发时不必重新匹配全部忽略规则
            worker.exclusion().mark_excluded();
            return None;
        };

        let scope = worker.activate(transaction.clone());
        let config = self.config();
        transaction.update(|tx| {
            if tx.is_sampled() && config.capture_headers {
                capture_request_headers(request, &mut tx.context.request, config);
            }
            fill_request_context(request, &mut tx.context.request);
        });
        Some((transaction, scope))
    }

    /// 判断排除规则后创建事务；`traceparent` 合法时延续上游调用链
    pub fn start_transaction(
        &self,
        service_context: Option<&str>,
        servlet_path: Option<&str>,
        path_info: Option<&str>,
        user_agent: Option<&str>,
        traceparent: Option<&str>,
    ) -> Option<TransactionHandle> {
        if !self.tracer.is_active() {
            tracing::debug!("tracer inactive, not starting transaction");
            return None;
        }
        if let Some(pattern) = self.exclusion_match(servlet_path, path_info, user_agent) {
            tracing::debug!(
                servlet_path = servlet_path.unwrap_or_default(),
                path_info = path_info.unwrap_or_default(),
                pattern = %pattern,
                "request excluded from tracing"
            );
            return None;
        }
        Some(self.tracer.start_transaction(traceparent, service_context))
    }

    /// 命中的忽略规则（URL 或 User-Agent）
    pub fn exclusion_match(
        &self,
        servlet_path: Option<&str>,
        path_info: Option<&str>,
        user_agent: Option<&str>,
    ) -> Option<&WildcardMatcher> {
        let config = self.config();
        let by_url = servlet_path
            .and_then(|path| any_match(&config.ignore_urls, path, path_info))
            .or_else(|| {
                // 没有 servlet path 时只匹配 path info
                path_info
                    .filter(|_| servlet_path.is_none())
                    .and_then(|info| any_match(&config.ignore_urls, info, None))
            });
        by_url.or_else(|| {
            user_agent.and_then(|ua| any_match(&config.ignore_user_agents, ua, None))
        })
    }

    /// 分发后：无论 `begin` 是否返回事务都必须调用
    ///
    /// 各步骤互相隔离，任一步骤失败不影响其余步骤；返回是否全部成功。
    #[allow(clippy::too_many_arguments)]
    pub fn end(
        &self,
        worker: &WorkerContext,
        transaction: Option<TransactionHandle>,
        scope: Option<Scope>,
        request: &dyn RawRequest,
        response: &dyn RawResponse,
        thrown: Option<CapturedError>,
        handler: &str,
    ) -> bool {
        let mut ok = true;
        let mut record = |result: Result<(), TraceError>| {
            if let Err(err) = result {
                tracing::warn!(error = %err, "transaction end step failed");
                ok = false;
            }
        };

        record(fail_open("reset exclusion", || {
            worker.exclusion().reset();
            Ok(())
        }));

        record(fail_open("release scope", || {
            if let Some(mut scope) = scope {
                scope.release();
            }
            Ok(())
        }));

        // 事务句柄未被完整传递时，仍可通过执行上下文找到活动事务
        record(fail_open("name transaction", || {
            let current = self
                .tracer
                .current_transaction(worker)
                .or_else(|| transaction.clone());
            if let Some(current) = current {
                self.name_transaction(&current, request.method(), handler, request.user_principal());
            }
            Ok(())
        }));

        if let Some(transaction) = transaction {
            record(fail_open("finalize transaction", || {
                self.complete(&transaction, request, response, thrown);
                Ok(())
            }));
        }
        ok
    }

    /// 按处理器命名并设置用户名；两者都是先写入者胜出
    pub fn name_transaction(
        &self,
        transaction: &TransactionHandle,
        method: Option<&str>,
        handler: &str,
        principal: Option<&str>,
    ) {
        if let Some(method) = method {
            let handler = simplify_handler_name(handler);
            if !handler.is_empty() {
                transaction.set_name_if_unset(format!("{method} {handler}"));
            }
        }
        transaction.set_username_if_unset(principal);
    }

    fn complete(
        &self,
        transaction: &TransactionHandle,
        request: &dyn RawRequest,
        response: &dyn RawResponse,
        thrown: Option<CapturedError>,
    ) {
        let config = self.config();
        let sampled = transaction.is_sampled();

        if sampled && config.capture_headers {
            let outcome = transaction
                .update(|tx| capture_response_headers(response, &mut tx.context.response, config));
            if let Some(Err(err)) = outcome {
                self.log_header_enumeration_failure(&err);
            }
        }

        let method = request.method();
        let content_type = request.header(CONTENT_TYPE_HEADER);
        // 读取参数表可能有副作用，只在采样且满足资格时物化
        let parameters = (sampled
            && config.captures_parameters(method, content_type, thrown.is_some()))
        .then(|| capture_parameters(request, config));

        self.finalize(
            transaction,
            thrown,
            response.is_committed(),
            response.status(),
            method,
            parameters,
            request.servlet_path(),
            request.path_info(),
            content_type,
        );
    }

    /// 写入分发后的数据并交给上报管道；之后事务不再可变
    #[allow(clippy::too_many_arguments)]
    pub fn finalize(
        &self,
        transaction: &TransactionHandle,
        thrown: Option<CapturedError>,
        committed: bool,
        status: Option<u16>,
        method: Option<&str>,
        parameters: Option<MultiValueMap>,
        servlet_path: Option<&str>,
        path_info: Option<&str>,
        content_type: Option<&str>,
    ) {
        let use_path = self.config().use_path_as_transaction_name;
        let updated = transaction.update(|tx| {
            let status = effective_status(status, thrown.is_some());
            fill_response_context(&mut tx.context.response, status, committed);
            tx.result = status.map(result_for_status);
            tx.error = thrown;

            if tx.is_sampled() {
                tx.context.request.parameters = parameters;
            }
            if tx.context.request.content_type.is_none() {
                tx.context.request.content_type = content_type.map(str::to_string);
            }
            if !tx.has_name() {
                tx.set_name_if_unset(default_name(method, servlet_path, path_info, use_path));
            }
        });
        if updated.is_none() {
            tracing::debug!("transaction already finalized, skipping");
            return;
        }

        if let Some(finished) = transaction.finish() {
            tracing::debug!(
                transaction_id = %finished.id,
                transaction_name = finished.name(),
                status = ?finished.context.response.status_code,
                "transaction finished"
            );
            self.tracer.report(finished);
        }
    }

    fn log_header_enumeration_failure(&self, err: &TraceError) {
        if self.header_enumeration_failed.swap(true, Ordering::AcqRel) {
            tracing::debug!(error = %err, "response headers not captured");
        } else {
            tracing::error!(
                error = %err,
                "response header enumeration failed; response headers will not be captured for this container"
            );
        }
    }
}

/// 分发出错但状态码缺失或为200时，记录为500
fn effective_status(status: Option<u16>, has_error: bool) -> Option<u16> {
    match status {
        None | Some(200) if has_error => Some(500),
        other => other,
    }
}

/// `HTTP 2xx` 形式的结果
fn result_for_status(status: u16) -> String {
    match status {
        100..=599 => format!("HTTP {}xx", status / 100),
        _ => "HTTP".to_string(),
    }
}

fn default_name(
    method: Option<&str>,
    servlet_path: Option<&str>,
    path_info: Option<&str>,
    use_path: bool,
) -> String {
    let method = method.unwrap_or("UNKNOWN");
    if use_path {
        if let Some(path) = servlet_path.filter(|p| !p.is_empty()) {
            return format!("{method} {path}{}", path_info.unwrap_or_default());
        }
    }
    format!("{method} {UNKNOWN_ROUTE}")
}

/// 处理器类型的简短标识：去掉泛型参数与模块路径
///
/// `my_app::web::GoHandler<alloc::string::String>` → `GoHandler`；
/// 闭包等匿名类型保留完整路径。
pub fn simplify_handler_name(type_name: &str) -> &str {
    let base = type_name
        .find('<')
        .map_or(type_name, |i| &type_name[..i])
        .trim();
    match base.rsplit_once("::") {
        Some((_, last)) if !last.starts_with('{') && !last.is_empty() => last,
        _ => base,
    }
}
