//! 远程只读调用的进程内缓存
//!
//! 只缓存以读动词（get / list / search）开头的工具；键为 (用户, 工具名, 参数 JSON)。
//! TTL 取上游 Cache-Control max-age 或 Expires，缺省用默认值，并夹在 [min, max] 之间；
//! 上游声明 no-store / no-cache 时不缓存。

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::header::{HeaderMap, CACHE_CONTROL, EXPIRES};
use serde_json::Value;

fn read_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?i:get|list|search)(?:[_\-.A-Z0-9]|$)").ok())
        .as_ref()
}

/// 工具名是否为读操作：读动词必须是名字的第一个词（`get_x`、`listIssues`、`search`）
pub fn is_read_call(tool: &str) -> bool {
    read_pattern().is_some_and(|re| re.is_match(tool))
}

#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    pub default_ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            min_ttl: Duration::from_secs(10),
            max_ttl: Duration::from_secs(3600),
            default_ttl: Duration::from_secs(60),
        }
    }
}

impl CachePolicy {
    /// 由响应头计算 TTL；None 表示不缓存
    pub fn ttl_from_headers(&self, headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
        if let Some(cc) = headers.get(CACHE_CONTROL).and_then(|v| v.to_str().ok()) {
            let cc = cc.to_ascii_lowercase();
            let directives: Vec<&str> = cc.split(',').map(str::trim).collect();
            if directives.iter().any(|d| *d == "no-store" || *d == "no-cache") {
                return None;
            }
            if let Some(secs) = directives
                .iter()
                .find_map(|d| d.strip_prefix("max-age="))
                .and_then(|s| s.trim_matches('"').parse::<u64>().ok())
            {
                return Some(self.clamp(Duration::from_secs(secs)));
            }
        }
        if let Some(expires) = headers
            .get(EXPIRES)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        {
            let secs = (expires.with_timezone(&Utc) - now).num_seconds().max(0) as u64;
            return Some(self.clamp(Duration::from_secs(secs)));
        }
        Some(self.clamp(self.default_ttl))
    }

    fn clamp(&self, ttl: Duration) -> Duration {
        ttl.clamp(self.min_ttl, self.max_ttl)
    }
}

type CacheKey = (String, String, String);

pub struct ResponseCache {
    policy: CachePolicy,
    entries: Mutex<HashMap<CacheKey, (Value, Instant)>>,
}

impl ResponseCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    fn key(user_id: &str, tool: &str, args: &Value) -> CacheKey {
        (user_id.to_string(), tool.to_string(), args.to_string())
    }

    pub fn get(&self, user_id: &str, tool: &str, args: &Value) -> Option<Value> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let key = Self::key(user_id, tool, args);
        match entries.get(&key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, user_id: &str, tool: &str, args: &Value, value: Value, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, (_, expires)| *expires > Instant::now());
        entries.insert(Self::key(user_id, tool, args), (value, Instant::now() + ttl));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;

    fn headers(pairs: &[(reqwest::header::HeaderName, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(k.clone(), HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn test_read_call_detection() {
        assert!(is_read_call("list_issues"));
        assert!(is_read_call("getUser"));
        assert!(is_read_call("search.repos"));
        assert!(is_read_call("Search"));
        assert!(!is_read_call("create_issue"));
        assert!(!is_read_call("target_update"));
        // 读动词不在开头的写操作
        assert!(!is_read_call("create_list"));
        assert!(!is_read_call("delete_search_index"));
        assert!(!is_read_call("update_getter"));
        assert!(!is_read_call("add_to_list"));
        assert!(!is_read_call("getter"));
        assert!(!is_read_call("repo_search"));
    }

    #[test]
    fn test_ttl_from_max_age_is_clamped() {
        let p = CachePolicy::default();
        let now = Utc::now();
        let ttl = |v: &str| p.ttl_from_headers(&headers(&[(CACHE_CONTROL, v)]), now);
        assert_eq!(ttl("public, max-age=120"), Some(Duration::from_secs(120)));
        assert_eq!(ttl("max-age=1"), Some(Duration::from_secs(10)));
        assert_eq!(ttl("max-age=999999"), Some(Duration::from_secs(3600)));
        assert_eq!(ttl("no-store"), None);
    }

    #[test]
    fn test_ttl_from_expires_and_default() {
        let p = CachePolicy::default();
        let now = Utc::now();
        let expires = (now + chrono::Duration::seconds(300)).to_rfc2822();
        let ttl = p.ttl_from_headers(&headers(&[(EXPIRES, &expires)]), now).unwrap();
        assert!(ttl >= Duration::from_secs(299) && ttl <= Duration::from_secs(300));
        assert_eq!(
            p.ttl_from_headers(&HeaderMap::new(), now),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_get_put_and_expiry() {
        let cache = ResponseCache::new(CachePolicy::default());
        let args = json!({"q": "rust"});
        cache.put("u1", "search", &args, json!([1]), Duration::from_secs(30));
        assert_eq!(cache.get("u1", "search", &args), Some(json!([1])));
        assert_eq!(cache.get("u2", "search", &args), None);
        assert_eq!(cache.get("u1", "search", &json!({"q": "go"})), None);

        cache.put("u1", "list", &args, json!(2), Duration::ZERO);
        assert_eq!(cache.get("u1", "list", &args), None);
    }
}
