//! In-process cache substrate
//!
//! A `HashMap` behind a tokio mutex with lazy TTL expiry. Deadlines use
//! `tokio::time::Instant` so tests can drive expiry with a paused clock.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{CacheError, CacheStore};

#[derive(Debug, Clone)]
enum Stored {
    Text(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

/// Thread-safe in-memory implementation of [`CacheStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().await.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Drop the entry at `key` if it has expired, then return the live entry
fn live_entry<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| !e.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

/// Translate a redis-style glob into an anchored regex
fn glob_to_regex(pattern: &str) -> Result<Regex, CacheError> {
    let mut expr = String::with_capacity(pattern.len() + 2);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| CacheError::Backend(e.to_string()))
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, key, Instant::now()) {
            None => Ok(None),
            Some(Entry { value: Stored::Text(text), .. }) => Ok(Some(text.clone())),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.lock().await.insert(
            key.to_string(),
            Entry {
                value: Stored::Text(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if live_entry(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Text(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let removed = keys
            .iter()
            .filter_map(|key| entries.remove(key))
            .filter(|entry| entry.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock().await;
        Ok(live_entry(&mut entries, key, Instant::now()).is_some())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let matcher = glob_to_regex(pattern)?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.is_live(now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| matcher.is_match(key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, key, now) {
            Some(Entry { value: Stored::List(items), .. }) => {
                items.push(value.to_string());
                Ok(items.len() as u64)
            }
            Some(_) => Err(CacheError::WrongType(key.to_string())),
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Stored::List(vec![value.to_string()]),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, CacheError> {
        let mut entries = self.entries.lock().await;
        let items = match live_entry(&mut entries, key, Instant::now()) {
            None => return Ok(Vec::new()),
            Some(Entry { value: Stored::List(items), .. }) => items,
            Some(_) => return Err(CacheError::WrongType(key.to_string())),
        };

        let len = items.len() as i64;
        let resolve = |index: i64| if index < 0 { len + index } else { index };
        let start = resolve(start).max(0);
        let stop = resolve(stop).min(len - 1);
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(items[start as usize..=stop as usize].to_vec())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_only_first_writer_wins() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);

        assert!(store.set_nx("k", "a", ttl).await.unwrap());
        assert!(!store.set_nx("k", "b", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store.set("k", "v", Some(Duration::from_secs(5))).await.unwrap();
        store.set("forever", "v", None).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_nx("k", "again", Duration::from_secs(5)).await.unwrap());
        assert!(store.exists("forever").await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_glob() {
        let store = MemoryStore::new();
        for key in ["session:busy:a", "session:busy:b", "session:state:a", "x?y"] {
            store.set(key, "1", None).await.unwrap();
        }

        assert_eq!(
            store.scan("session:busy:*").await.unwrap(),
            vec!["session:busy:a", "session:busy:b"]
        );
        assert_eq!(store.scan("session:*:a").await.unwrap().len(), 2);
        assert_eq!(store.scan("x?y").await.unwrap(), vec!["x?y"]);
    }

    #[tokio::test]
    async fn test_list_ops() {
        let store = MemoryStore::new();
        for line in ["one", "two", "three"] {
            store.rpush("log", line).await.unwrap();
        }

        assert_eq!(store.lrange("log", 0, -1).await.unwrap(), vec!["one", "two", "three"]);
        assert_eq!(store.lrange("log", -2, -1).await.unwrap(), vec!["two", "three"]);
        assert_eq!(store.lrange("log", 5, 10).await.unwrap(), Vec::<String>::new());
        assert!(store.lrange("missing", 0, -1).await.unwrap().is_empty());
        assert!(matches!(store.get("log").await, Err(CacheError::WrongType(_))));
    }

    #[tokio::test]
    async fn test_delete_counts_live_keys() {
        let store = MemoryStore::new();
        store.set("a", "1", None).await.unwrap();
        store.set("b", "1", None).await.unwrap();

        let removed = store
            .delete(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.is_empty().await);
    }
}
