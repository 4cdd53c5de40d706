//! 通配符匹配器
//!
//! 用于 URL 忽略规则、User-Agent 忽略规则以及敏感字段名匹配。
//! `*` 匹配任意长度字符；默认大小写不敏感，以 `(?-i)` 开头则大小写敏感。

use crate::error::TraceError;
use regex::Regex;
use serde::Deserialize;
use std::fmt;

const CASE_SENSITIVE_PREFIX: &str = "(?-i)";
const CASE_INSENSITIVE_PREFIX: &str = "(?i)";

#[derive(Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct WildcardMatcher {
    pattern: String,
    regex: Regex,
}

impl WildcardMatcher {
    /// 编译通配符模式
    pub fn new(pattern: &str) -> Result<Self, TraceError> {
        let (case_sensitive, body) = if let Some(rest) = pattern.strip_prefix(CASE_SENSITIVE_PREFIX)
        {
            (true, rest)
        } else if let Some(rest) = pattern.strip_prefix(CASE_INSENSITIVE_PREFIX) {
            (false, rest)
        } else {
            (false, pattern)
        };

        let mut source = String::with_capacity(body.len() + 8);
        if !case_sensitive {
            source.push_str("(?i)");
        }
        source.push('^');
        let escaped: Vec<String> = body.split('*').map(regex::escape).collect();
        source.push_str(&escaped.join(".*"));
        source.push('$');

        let regex = Regex::new(&source).map_err(|source| TraceError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    /// 匹配 `first + second` 的拼接结果（例如 servlet path 与 path info）
    pub fn matches_concat(&self, first: &str, second: Option<&str>) -> bool {
        match second {
            Some(second) if !second.is_empty() => self.matches(&format!("{first}{second}")),
            _ => self.matches(first),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl TryFrom<String> for WildcardMatcher {
    type Error = TraceError;

    fn try_from(pattern: String) -> Result<Self, Self::Error> {
        Self::new(&pattern)
    }
}

impl fmt::Debug for WildcardMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WildcardMatcher").field(&self.pattern).finish()
    }
}

impl fmt::Display for WildcardMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

/// 任一匹配器命中则返回匹配的模式
pub fn any_match<'a>(
    matchers: &'a [WildcardMatcher],
    first: &str,
    second: Option<&str>,
) -> Option<&'a WildcardMatcher> {
    matchers.iter().find(|m| m.matches_concat(first, second))
}

/// 批量编译模式；内置默认值使用，非法模式直接跳过并记录警告
pub(crate) fn compile_all(patterns: &[&str]) -> Vec<WildcardMatcher> {
    patterns
        .iter()
        .filter_map(|p| match WildcardMatcher::new(p) {
            Ok(m) => Some(m),
            Err(err) => {
                tracing::warn!(error = %err, "skipping invalid wildcard pattern");
                None
            }
        })
        .collect()
}
