use std::collections::{HashMap, HashSet};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::FastStoreError;

use super::fast::{
    AtomicOutcome, AtomicProgram, Expectation, FastStore, Guard, GuardedWrite, TxnOutcome, WriteOp,
};

#[derive(Default)]
struct MemInner {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, HashMap<String, i64>>,
    /// Lease deadlines for keys written through `set_nx_ex`.
    deadlines: HashMap<String, Instant>,
}

impl MemInner {
    fn purge(&mut self, key: &str) {
        if let Some(deadline) = self.deadlines.get(key) {
            if Instant::now() >= *deadline {
                self.deadlines.remove(key);
                self.strings.remove(key);
            }
        }
    }

    fn string(&mut self, key: &str) -> Option<String> {
        self.purge(key);
        self.strings.get(key).cloned()
    }

    fn int(&mut self, key: &str) -> Result<Option<i64>, FastStoreError> {
        match self.string(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<i64>().map(Some).map_err(|_| {
                FastStoreError::Backend(format!("key `{key}` holds a non-integer value"))
            }),
        }
    }

    fn remove_everywhere(&mut self, key: &str) {
        self.strings.remove(key);
        self.hashes.remove(key);
        self.sets.remove(key);
        self.zsets.remove(key);
        self.deadlines.remove(key);
    }

    fn check_watch(&mut self, key: &str, expect: Expectation) -> Result<bool, FastStoreError> {
        match expect {
            Expectation::IntEquals(expected) => Ok(self.int(key)? == Some(expected)),
            Expectation::Absent => Ok(self.string(key).is_none()),
            // No change monitoring in-process; the caller pins the version
            // key with IntEquals, which moves on every mutation.
            Expectation::Any => Ok(true),
        }
    }

    fn check_guard(&mut self, guard: &Guard) -> Result<bool, FastStoreError> {
        match guard {
            Guard::HashFieldEquals {
                key,
                field,
                expected,
                ..
            } => Ok(self
                .hashes
                .get(key)
                .and_then(|h| h.get(field))
                .map(|v| v == expected)
                .unwrap_or(false)),
            Guard::HashFieldIntAtMost {
                key, field, max, ..
            } => {
                let value = self
                    .hashes
                    .get(key)
                    .and_then(|h| h.get(field))
                    .and_then(|v| v.parse::<i64>().ok());
                Ok(value.map(|v| v <= *max).unwrap_or(false))
            }
            Guard::IntAtLeast { key, min, .. } => {
                let value = self.int(key)?.unwrap_or(0);
                Ok(value >= *min)
            }
        }
    }

    fn apply(&mut self, op: &WriteOp) -> Result<(), FastStoreError> {
        match op {
            WriteOp::SetInt { key, value } => {
                self.deadlines.remove(key);
                self.strings.insert(key.clone(), value.to_string());
            }
            WriteOp::IncrBy { key, delta } => {
                let current = self.int(key)?.unwrap_or(0);
                self.strings.insert(key.clone(), (current + delta).to_string());
            }
            WriteOp::HashSet { key, fields } => {
                let hash = self.hashes.entry(key.clone()).or_default();
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
            }
            WriteOp::SetAdd { key, member } => {
                self.sets.entry(key.clone()).or_default().insert(member.clone());
            }
            WriteOp::SetRemove { key, member } => {
                if let Some(set) = self.sets.get_mut(key) {
                    set.remove(member);
                }
            }
            WriteOp::SortedSetAdd { key, member, score } => {
                self.zsets
                    .entry(key.clone())
                    .or_default()
                    .insert(member.clone(), *score);
            }
            WriteOp::SortedSetRemove { key, member } => {
                if let Some(zset) = self.zsets.get_mut(key) {
                    zset.remove(member);
                }
            }
            WriteOp::Delete { key } => self.remove_everywhere(key),
        }
        Ok(())
    }

    fn run_program(&mut self, program: &AtomicProgram) -> Result<AtomicOutcome, FastStoreError> {
        for guard in &program.guards {
            if !self.check_guard(guard)? {
                return Ok(AtomicOutcome::Rejected(guard.code()));
            }
        }
        for op in &program.writes {
            self.apply(op)?;
        }
        Ok(AtomicOutcome::Applied)
    }
}

/// Glob match supporting `*` wildcards; everything else is literal. This is
/// the subset of the wire pattern language the crate actually uses.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }
    let mut rest = candidate;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with `*`.
    true
}

/// In-process [`FastStore`] backend.
///
/// All multi-key operations run under a single mutex, which is what makes
/// `guarded_write` and `run_atomic` indivisible here. Useful for
/// single-process deployments and for the test suite; the lock is never
/// held across an await point.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FastStore for MemoryStore {
    async fn ping(&self) -> Result<(), FastStoreError> {
        Ok(())
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, FastStoreError> {
        self.inner.lock().int(key)
    }

    async fn set_i64(&self, key: &str, value: i64) -> Result<(), FastStoreError> {
        self.inner.lock().apply(&WriteOp::SetInt {
            key: key.to_string(),
            value,
        })
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, FastStoreError> {
        let mut inner = self.inner.lock();
        let next = inner.int(key)?.unwrap_or(0) + delta;
        inner.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>, FastStoreError> {
        Ok(self.inner.lock().string(key))
    }

    async fn hash_get_all(
        &self,
        key: &str,
    ) -> Result<Option<HashMap<String, String>>, FastStoreError> {
        let inner = self.inner.lock();
        Ok(inner.hashes.get(key).filter(|h| !h.is_empty()).cloned())
    }

    async fn hash_get_all_multi(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<HashMap<String, String>>>, FastStoreError> {
        let inner = self.inner.lock();
        Ok(keys
            .iter()
            .map(|key| inner.hashes.get(key).filter(|h| !h.is_empty()).cloned())
            .collect())
    }

    async fn hash_set_multi(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), FastStoreError> {
        self.inner.lock().apply(&WriteOp::HashSet {
            key: key.to_string(),
            fields: fields.to_vec(),
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), FastStoreError> {
        self.inner.lock().apply(&WriteOp::SetAdd {
            key: key.to_string(),
            member: member.to_string(),
        })
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), FastStoreError> {
        self.inner.lock().apply(&WriteOp::SetRemove {
            key: key.to_string(),
            member: member.to_string(),
        })
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, FastStoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sorted_set_add(
        &self,
        key: &str,
        member: &str,
        score: i64,
    ) -> Result<(), FastStoreError> {
        self.inner.lock().apply(&WriteOp::SortedSetAdd {
            key: key.to_string(),
            member: member.to_string(),
            score,
        })
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<(), FastStoreError> {
        self.inner.lock().apply(&WriteOp::SortedSetRemove {
            key: key.to_string(),
            member: member.to_string(),
        })
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>, FastStoreError> {
        let inner = self.inner.lock();
        let mut scored: Vec<(i64, String)> = inner
            .zsets
            .get(key)
            .map(|zset| {
                zset.iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(member, score)| (*score, member.clone()))
                    .collect()
            })
            .unwrap_or_default();
        scored.sort();
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, member)| member)
            .collect())
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, FastStoreError> {
        let inner = self.inner.lock();
        let mut keys: Vec<String> = inner
            .strings
            .keys()
            .chain(inner.hashes.keys())
            .chain(inner.sets.keys())
            .chain(inner.zsets.keys())
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), FastStoreError> {
        self.inner.lock().remove_everywhere(key);
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, FastStoreError> {
        let mut inner = self.inner.lock();
        inner.purge(key);
        if inner.strings.contains_key(key) {
            return Ok(false);
        }
        inner.strings.insert(key.to_string(), value.to_string());
        inner.deadlines.insert(
            key.to_string(),
            Instant::now() + std::time::Duration::from_secs(ttl_secs),
        );
        Ok(true)
    }

    async fn guarded_write(&self, txn: GuardedWrite) -> Result<TxnOutcome, FastStoreError> {
        let mut inner = self.inner.lock();
        for watch in &txn.watches {
            if !inner.check_watch(&watch.key, watch.expect)? {
                return Ok(TxnOutcome::Conflict);
            }
        }
        for op in &txn.writes {
            inner.apply(op)?;
        }
        Ok(TxnOutcome::Committed)
    }

    async fn run_atomic(&self, program: AtomicProgram) -> Result<AtomicOutcome, FastStoreError> {
        self.inner.lock().run_program(&program)
    }

    async fn run_atomic_batch(
        &self,
        programs: Vec<AtomicProgram>,
    ) -> Result<Vec<AtomicOutcome>, FastStoreError> {
        let mut inner = self.inner.lock();
        programs.iter().map(|p| inner.run_program(p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guarded_write_conflict_on_changed_int() {
        let store = MemoryStore::new();
        store.set_i64("stock_version:1", 4).await.unwrap();

        let txn = GuardedWrite {
            watches: vec![super::super::fast::WatchKey::int_equals("stock_version:1", 3)],
            writes: vec![WriteOp::SetInt {
                key: "available_stock:1".into(),
                value: 9,
            }],
        };
        assert_eq!(store.guarded_write(txn).await.unwrap(), TxnOutcome::Conflict);
        assert_eq!(store.get_i64("available_stock:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_atomic_program_rejects_without_writing() {
        let store = MemoryStore::new();
        store
            .hash_set_multi("hold:h1", &[("status".into(), "used".into())])
            .await
            .unwrap();
        store.set_i64("reserved_stock:1", 5).await.unwrap();

        let program = AtomicProgram {
            guards: vec![Guard::HashFieldEquals {
                key: "hold:h1".into(),
                field: "status".into(),
                expected: "active".into(),
                code: "not_active",
            }],
            writes: vec![WriteOp::IncrBy {
                key: "reserved_stock:1".into(),
                delta: -5,
            }],
        };
        assert_eq!(
            store.run_atomic(program).await.unwrap(),
            AtomicOutcome::Rejected("not_active")
        );
        assert_eq!(store.get_i64("reserved_stock:1").await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_int_at_least_treats_absent_as_zero() {
        let store = MemoryStore::new();
        let program = AtomicProgram {
            guards: vec![Guard::IntAtLeast {
                key: "reserved_stock:9".into(),
                min: 1,
                code: "insufficient_reserved",
            }],
            writes: vec![],
        };
        assert_eq!(
            store.run_atomic(program).await.unwrap(),
            AtomicOutcome::Rejected("insufficient_reserved")
        );
    }

    #[tokio::test]
    async fn test_set_nx_ex_lease_semantics() {
        let store = MemoryStore::new();
        assert!(store.set_nx_ex("expire_lock:h1", "a:1:0", 5).await.unwrap());
        assert!(!store.set_nx_ex("expire_lock:h1", "b:2:0", 5).await.unwrap());
        assert_eq!(
            store.get_string("expire_lock:h1").await.unwrap().as_deref(),
            Some("a:1:0")
        );
    }

    #[tokio::test]
    async fn test_range_by_score_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        for (member, score) in [("a", 30), ("b", 10), ("c", 20), ("d", 40)] {
            store
                .sorted_set_add("expiring_index:1", member, score)
                .await
                .unwrap();
        }
        let hits = store
            .sorted_set_range_by_score("expiring_index:1", 0, 30, 2)
            .await
            .unwrap();
        assert_eq!(hits, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("expiring_index:*", "expiring_index:42"));
        assert!(!glob_match("expiring_index:*", "product_holds:42"));
        assert!(glob_match("hold:*", "hold:abc"));
        assert!(glob_match("plain", "plain"));
        assert!(!glob_match("plain", "plainer"));
    }
}
