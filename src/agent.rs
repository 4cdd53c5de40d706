//! 进程级安装与卸载
//!
//! 钩子安装器在启动时调用 [`init`] 注入追踪器，之后通过 [`hooks`] 取得钩子对；
//! [`reset`] 卸载后 [`hooks`] 返回空操作的钩子对。

use crate::hooks::DispatchHooks;
use crate::tracer::Tracer;
use std::sync::{Arc, PoisonError, RwLock};

static INSTALLED: RwLock<Option<DispatchHooks>> = RwLock::new(None);

/// 安装追踪器，返回对应的钩子对；重复调用会替换之前的安装
pub fn init(tracer: Arc<Tracer>) -> DispatchHooks {
    let hooks = DispatchHooks::new(tracer);
    let previous = INSTALLED
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(hooks.clone());
    if previous.is_some() {
        tracing::warn!("dispatch hooks re-initialized, replacing previous tracer");
    } else {
        tracing::debug!("dispatch hooks installed");
    }
    hooks
}

/// 当前安装的钩子对；未安装时返回空操作钩子
pub fn hooks() -> DispatchHooks {
    INSTALLED
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .unwrap_or_default()
}

/// 卸载追踪器
pub fn reset() {
    if INSTALLED
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .is_some()
    {
        tracing::debug!("dispatch hooks uninstalled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 全局状态只在这一个测试中修改，避免测试间相互干扰
    #[test]
    fn test_init_and_reset_lifecycle() {
        assert!(!hooks().is_enabled());

        let tracer = Arc::new(Tracer::builder().build());
        let installed = init(tracer.clone());
        assert!(installed.is_enabled());
        assert!(Arc::ptr_eq(hooks().tracer().unwrap(), &tracer));

        let replacement = Arc::new(Tracer::builder().build());
        init(replacement.clone());
        assert!(Arc::ptr_eq(hooks().tracer().unwrap(), &replacement));

        reset();
        assert!(!hooks().is_enabled());
        reset();
    }
}
