//! 排除缓存
//!
//! 记录当前 worker 上的请求是否已被判定为不追踪。容器可能对同一个逻辑请求
//! 多次调用被拦截的分发方法（例如内部转发），缓存判定结果可以避免重复匹配
//! 忽略规则。每次分发结束时无条件重置，判定结果不会泄漏到同一 worker 处理的下一个请求。

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct ExclusionCache {
    excluded: AtomicBool,
}

impl ExclusionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之前的调用是否已判定当前请求被排除
    #[inline]
    pub fn should_skip(&self) -> bool {
        self.excluded.load(Ordering::Acquire)
    }

    pub fn mark_excluded(&self) {
        self.excluded.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.excluded.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_reset() {
        let cache = ExclusionCache::new();
        assert!(!cache.should_skip());

        cache.mark_excluded();
        assert!(cache.should_skip());
        // 重复查询不会改变状态
        assert!(cache.should_skip());

        cache.reset();
        assert!(!cache.should_skip());
        // 重置是幂等的
        cache.reset();
        assert!(!cache.should_skip());
    }
}
