use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{Store, StoreError, StoreResult, Txn};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: i64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(old) => {
                self.ordered.remove(&(old, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn range(&self, min: i64, max: i64) -> impl Iterator<Item = &(i64, String)> + '_ {
        self.ordered
            .range((min, String::new())..)
            .take_while(move |(score, _)| *score <= max)
    }
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    ZSet(SortedSet),
    Set(HashSet<String>),
    List(VecDeque<String>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::Hash(h) => h.is_empty(),
            Value::ZSet(z) => z.scores.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::List(l) => l.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<i64>,
}

type Keyspace = HashMap<String, Entry>;

/// In-process store holding the whole keyspace behind one mutex.
///
/// A script holds the lock for its full duration, which gives the same
/// serializable isolation as server-side scripting. TTLs are evaluated
/// against the injected [`Clock`].
pub struct MemoryStore {
    keyspace: Arc<Mutex<Keyspace>>,
    clock: Arc<dyn Clock>,
    calls: Arc<Mutex<HashMap<&'static str, u64>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace: Arc::new(Mutex::new(HashMap::new())),
            clock,
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// How many times a script ran against this store.
    pub fn script_calls(&self, script: &str) -> u64 {
        self.calls.lock().get(script).copied().unwrap_or(0)
    }

    /// Total number of scripts run against this store.
    pub fn total_calls(&self) -> u64 {
        self.calls.lock().values().sum()
    }

    /// Number of live keys (test helper)
    pub fn key_count(&self) -> usize {
        let now = self.clock.now_ms();
        self.keyspace
            .lock()
            .values()
            .filter(|e| e.expires_at.map_or(true, |at| at > now))
            .count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn atomic<T, F>(&self, script: &'static str, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut dyn Txn) -> StoreResult<T> + Send,
        T: Send,
    {
        *self.calls.lock().entry(script).or_default() += 1;

        let now = self.clock.now_ms();
        let mut keyspace = self.keyspace.lock();
        let mut txn = MemTxn {
            data: &mut *keyspace,
            now,
            undo: HashMap::new(),
        };

        match f(&mut txn) {
            Ok(value) => Ok(value),
            Err(err) => {
                trace!(script, error = %err, "rolling back script");
                txn.rollback();
                Err(err)
            }
        }
    }
}

struct MemTxn<'a> {
    data: &'a mut Keyspace,
    now: i64,
    /// Value of every touched key before the script first changed it.
    undo: HashMap<String, Option<Entry>>,
}

impl MemTxn<'_> {
    fn rollback(self) {
        for (key, previous) in self.undo {
            match previous {
                Some(entry) => {
                    self.data.insert(key, entry);
                }
                None => {
                    self.data.remove(&key);
                }
            }
        }
    }

    fn live(&self, key: &str) -> Option<&Entry> {
        self.data
            .get(key)
            .filter(|e| e.expires_at.map_or(true, |at| at > self.now))
    }

    /// Records the pre-image of `key` and drops it if expired.
    fn touch(&mut self, key: &str) {
        if !self.undo.contains_key(key) {
            self.undo.insert(key.to_string(), self.data.get(key).cloned());
        }
        let expired = self
            .data
            .get(key)
            .is_some_and(|e| e.expires_at.is_some_and(|at| at <= self.now));
        if expired {
            self.data.remove(key);
        }
    }

    fn prune(&mut self, key: &str) {
        if self.data.get(key).is_some_and(|e| e.value.is_empty()) {
            self.data.remove(key);
        }
    }

    fn entry_mut(&mut self, key: &str, empty: fn() -> Value) -> &mut Entry {
        self.touch(key);
        self.data.entry(key.to_string()).or_insert_with(|| Entry {
            value: empty(),
            expires_at: None,
        })
    }

    fn hash(&self, key: &str) -> StoreResult<Option<&HashMap<String, String>>> {
        match self.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(Some(h)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn zset(&self, key: &str) -> StoreResult<Option<&SortedSet>> {
        match self.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::ZSet(z)) => Ok(Some(z)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set_value(&self, key: &str) -> StoreResult<Option<&HashSet<String>>> {
        match self.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Set(s)) => Ok(Some(s)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn list(&self, key: &str) -> StoreResult<Option<&VecDeque<String>>> {
        match self.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::List(l)) => Ok(Some(l)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn hash_mut(&mut self, key: &str) -> StoreResult<&mut HashMap<String, String>> {
        match &mut self.entry_mut(key, || Value::Hash(HashMap::new())).value {
            Value::Hash(h) => Ok(h),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn zset_mut(&mut self, key: &str) -> StoreResult<&mut SortedSet> {
        match &mut self.entry_mut(key, || Value::ZSet(SortedSet::default())).value {
            Value::ZSet(z) => Ok(z),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set_mut(&mut self, key: &str) -> StoreResult<&mut HashSet<String>> {
        match &mut self.entry_mut(key, || Value::Set(HashSet::new())).value {
            Value::Set(s) => Ok(s),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn list_mut(&mut self, key: &str) -> StoreResult<&mut VecDeque<String>> {
        match &mut self.entry_mut(key, || Value::List(VecDeque::new())).value {
            Value::List(l) => Ok(l),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }
}

/// Resolves a redis-style inclusive index range against a length.
fn list_bounds(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let norm = |i: i64| if i < 0 { len + i } else { i };
    let start = norm(start).max(0);
    let stop = norm(stop).min(len - 1);
    if len == 0 || start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}

impl Txn for MemTxn<'_> {
    fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        match self.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set(&mut self, key: &str, value: &str, ttl_ms: Option<i64>) -> StoreResult<()> {
        self.touch(key);
        let expires_at = ttl_ms.map(|ttl| self.now.saturating_add(ttl.max(1)));
        self.data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    fn del(&mut self, key: &str) -> StoreResult<bool> {
        self.touch(key);
        Ok(self.data.remove(key).is_some())
    }

    fn exists(&mut self, key: &str) -> StoreResult<bool> {
        Ok(self.live(key).is_some())
    }

    fn hget(&mut self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self.hash(key)?.and_then(|h| h.get(field).cloned()))
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.hash_mut(key)?
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    fn hdel(&mut self, key: &str, field: &str) -> StoreResult<bool> {
        if self.hash(key)?.is_none() {
            return Ok(false);
        }
        let removed = self.hash_mut(key)?.remove(field).is_some();
        self.prune(key);
        Ok(removed)
    }

    fn hexists(&mut self, key: &str, field: &str) -> StoreResult<bool> {
        Ok(self.hash(key)?.is_some_and(|h| h.contains_key(field)))
    }

    fn hmget(&mut self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>> {
        let hash = self.hash(key)?;
        Ok(fields
            .iter()
            .map(|f| hash.and_then(|h| h.get(f).cloned()))
            .collect())
    }

    fn hlen(&mut self, key: &str) -> StoreResult<usize> {
        Ok(self.hash(key)?.map_or(0, |h| h.len()))
    }

    fn zadd(&mut self, key: &str, member: &str, score: i64) -> StoreResult<()> {
        self.zset_mut(key)?.insert(member, score);
        Ok(())
    }

    fn zscore(&mut self, key: &str, member: &str) -> StoreResult<Option<i64>> {
        Ok(self.zset(key)?.and_then(|z| z.scores.get(member).copied()))
    }

    fn zrem(&mut self, key: &str, member: &str) -> StoreResult<bool> {
        if self.zset(key)?.is_none() {
            return Ok(false);
        }
        let removed = self.zset_mut(key)?.remove(member);
        self.prune(key);
        Ok(removed)
    }

    fn zcard(&mut self, key: &str) -> StoreResult<usize> {
        Ok(self.zset(key)?.map_or(0, |z| z.scores.len()))
    }

    fn zcount(&mut self, key: &str, min: i64, max: i64) -> StoreResult<usize> {
        Ok(self.zset(key)?.map_or(0, |z| z.range(min, max).count()))
    }

    fn zrange_by_score(
        &mut self,
        key: &str,
        min: i64,
        max: i64,
        offset: usize,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, i64)>> {
        let Some(z) = self.zset(key)? else {
            return Ok(Vec::new());
        };
        Ok(z.range(min, max)
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(score, member)| (member.clone(), *score))
            .collect())
    }

    fn sadd(&mut self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self.set_mut(key)?.insert(member.to_string()))
    }

    fn srem(&mut self, key: &str, member: &str) -> StoreResult<bool> {
        if self.set_value(key)?.is_none() {
            return Ok(false);
        }
        let removed = self.set_mut(key)?.remove(member);
        self.prune(key);
        Ok(removed)
    }

    fn scard(&mut self, key: &str) -> StoreResult<usize> {
        Ok(self.set_value(key)?.map_or(0, |s| s.len()))
    }

    fn sismember(&mut self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self.set_value(key)?.is_some_and(|s| s.contains(member)))
    }

    fn smembers(&mut self, key: &str) -> StoreResult<Vec<String>> {
        let mut members: Vec<String> = self
            .set_value(key)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    fn rpush(&mut self, key: &str, value: &str) -> StoreResult<usize> {
        let list = self.list_mut(key)?;
        list.push_back(value.to_string());
        Ok(list.len())
    }

    fn ltrim(&mut self, key: &str, start: i64, stop: i64) -> StoreResult<()> {
        let Some(len) = self.list(key)?.map(|l| l.len()) else {
            return Ok(());
        };
        let bounds = list_bounds(len, start, stop);
        let list = self.list_mut(key)?;
        match bounds {
            Some((start, stop)) => {
                list.truncate(stop + 1);
                list.drain(..start);
            }
            None => list.clear(),
        }
        self.prune(key);
        Ok(())
    }

    fn lrange(&mut self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let Some(list) = self.list(key)? else {
            return Ok(Vec::new());
        };
        Ok(match list_bounds(list.len(), start, stop) {
            Some((start, stop)) => list.range(start..=stop).cloned().collect(),
            None => Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn store_at(now: i64) -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new(now);
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_sorted_set_orders_by_score_then_member() {
        let (store, _) = store_at(0);

        let range = store
            .atomic("test", |tx| {
                tx.zadd("z", "b", 10)?;
                tx.zadd("z", "a", 10)?;
                tx.zadd("z", "c", 5)?;
                tx.zadd("z", "c", 20)?;
                tx.zrange_by_score("z", i64::MIN, i64::MAX, 0, None)
            })
            .await
            .unwrap();

        let members: Vec<&str> = range.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_failed_script_rolls_back() {
        let (store, _) = store_at(0);
        store
            .atomic("seed", |tx| tx.hset("h", "f", "v1"))
            .await
            .unwrap();

        let result: StoreResult<()> = store
            .atomic("fail", |tx| {
                tx.hset("h", "f", "v2")?;
                tx.zadd("z", "m", 1)?;
                Err(StoreError::Aborted {
                    script: "fail",
                    reason: "boom".to_string(),
                })
            })
            .await;
        assert!(result.is_err());

        let (value, exists) = store
            .atomic("check", |tx| Ok((tx.hget("h", "f")?, tx.exists("z")?)))
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("v1"));
        assert!(!exists);
    }

    #[tokio::test]
    async fn test_ttl_follows_clock() {
        let (store, clock) = store_at(1_000);
        store
            .atomic("set", |tx| tx.set("k", "v", Some(500)))
            .await
            .unwrap();

        clock.advance(Duration::from_millis(499));
        assert!(store.atomic("get", |tx| tx.exists("k")).await.unwrap());

        clock.advance(Duration::from_millis(1));
        assert!(!store.atomic("get", |tx| tx.exists("k")).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_collections_disappear() {
        let (store, _) = store_at(0);
        let exists = store
            .atomic("test", |tx| {
                tx.sadd("s", "a")?;
                tx.srem("s", "a")?;
                tx.zadd("z", "a", 1)?;
                tx.zrem("z", "a")?;
                Ok(tx.exists("s")? || tx.exists("z")?)
            })
            .await
            .unwrap();
        assert!(!exists);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_type_is_an_error() {
        let (store, _) = store_at(0);
        let result = store
            .atomic("test", |tx| {
                tx.set("k", "v", None)?;
                tx.zadd("k", "m", 1)
            })
            .await;
        assert!(matches!(result, Err(StoreError::WrongType(_))));
    }

    #[tokio::test]
    async fn test_list_trim_keeps_tail() {
        let (store, _) = store_at(0);
        let values = store
            .atomic("test", |tx| {
                for v in ["1", "2", "3", "4"] {
                    tx.rpush("l", v)?;
                }
                tx.ltrim("l", -2, -1)?;
                tx.lrange("l", 0, -1)
            })
            .await
            .unwrap();
        assert_eq!(values, vec!["3".to_string(), "4".to_string()]);
        assert_eq!(store.script_calls("test"), 1);
    }
}
