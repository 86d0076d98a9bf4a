use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::KeyValueStore;
use crate::{GatewayError, Result, lock};

/// One call made against a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Hgetall(String),
    Hmset(String, Vec<(String, String)>),
    Hdel(String, Vec<String>),
    Keys(String),
    Get(String),
    Set(String, String),
    Mset(Vec<(String, String)>),
    Lpush(String, String),
}

#[derive(Debug, Clone)]
enum Value {
    String(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

/// In-process store that records every call it receives.
///
/// Used by tests to assert exactly which store operations a component issued,
/// and by single-box deployments that do not need persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Value>>,
    journal: Mutex<Vec<StoreCall>>,
    failure: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls made since the last snapshot.
    pub fn snapshot(&self) -> Vec<StoreCall> {
        std::mem::take(&mut *lock(&self.journal))
    }

    /// Make every following call fail with `reason`, or succeed again with `None`.
    pub fn fail_with(&self, reason: Option<&str>) {
        *lock(&self.failure) = reason.map(str::to_string);
    }

    /// Replace a hash without journaling the write.
    pub fn seed_hash<K, V>(&self, key: &str, fields: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        let hash = fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        lock(&self.data).insert(key.to_string(), Value::Hash(hash));
    }

    /// Current contents of a list, head first, without journaling the read.
    pub fn list(&self, key: &str) -> Vec<String> {
        match lock(&self.data).get(key) {
            Some(Value::List(list)) => list.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Current string value, without journaling the read.
    pub fn value(&self, key: &str) -> Option<String> {
        match lock(&self.data).get(key) {
            Some(Value::String(value)) => Some(value.clone()),
            _ => None,
        }
    }

    fn record(&self, call: StoreCall) -> Result<()> {
        lock(&self.journal).push(call);
        match lock(&self.failure).as_ref() {
            Some(reason) => Err(GatewayError::store_error(reason.clone())),
            None => Ok(()),
        }
    }
}

fn wrong_type(key: &str) -> GatewayError {
    GatewayError::store_error(format!(
        "WRONGTYPE operation against key {key} holding the wrong kind of value"
    ))
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.record(StoreCall::Hgetall(key.to_string()))?;
        match lock(&self.data).get(key) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hmset(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        self.record(StoreCall::Hmset(key.to_string(), fields.to_vec()))?;
        let mut data = lock(&self.data);
        let entry = data.entry(key.to_string()).or_insert_with(|| Value::Hash(HashMap::new()));
        let Value::Hash(hash) = entry else {
            return Err(wrong_type(key));
        };
        hash.extend(fields.iter().cloned());
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize> {
        self.record(StoreCall::Hdel(key.to_string(), fields.to_vec()))?;
        let mut data = lock(&self.data);
        let removed = match data.get_mut(key) {
            None => 0,
            Some(Value::Hash(hash)) => fields.iter().filter(|f| hash.remove(*f).is_some()).count(),
            Some(_) => return Err(wrong_type(key)),
        };
        if matches!(data.get(key), Some(Value::Hash(hash)) if hash.is_empty()) {
            data.remove(key);
        }
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.record(StoreCall::Keys(pattern.to_string()))?;
        let mut keys: Vec<String> =
            lock(&self.data).keys().filter(|key| glob_match(pattern, key)).cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.record(StoreCall::Get(key.to_string()))?;
        match lock(&self.data).get(key) {
            None => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.record(StoreCall::Set(key.to_string(), value.to_string()))?;
        lock(&self.data).insert(key.to_string(), Value::String(value.to_string()));
        Ok(())
    }

    async fn mset(&self, pairs: &[(String, String)]) -> Result<()> {
        self.record(StoreCall::Mset(pairs.to_vec()))?;
        let mut data = lock(&self.data);
        for (key, value) in pairs {
            data.insert(key.clone(), Value::String(value.clone()));
        }
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<usize> {
        self.record(StoreCall::Lpush(key.to_string(), value.to_string()))?;
        let mut data = lock(&self.data);
        let entry = data.entry(key.to_string()).or_insert_with(|| Value::List(VecDeque::new()));
        let Value::List(list) = entry else {
            return Err(wrong_type(key));
        };
        list.push_front(value.to_string());
        Ok(list.len())
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}
