use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::FastStoreError;

/// One queued mutation inside an optimistic transaction or an atomic
/// program. The batch either applies in full or not at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    SetInt { key: String, value: i64 },
    IncrBy { key: String, delta: i64 },
    HashSet { key: String, fields: Vec<(String, String)> },
    SetAdd { key: String, member: String },
    SetRemove { key: String, member: String },
    SortedSetAdd { key: String, member: String, score: i64 },
    SortedSetRemove { key: String, member: String },
    Delete { key: String },
}

/// What a watched key is expected to look like at commit time.
///
/// `Any` keys are monitored for concurrent mutation only (no value
/// comparison). A backend without change monitoring may treat `Any` as a
/// no-op; callers therefore always pin the decision-relevant values with
/// `IntEquals`/`Absent` — in practice the strictly-increasing stock version
/// key — and use `Any` for the index keys that only ever change together
/// with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    IntEquals(i64),
    Absent,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchKey {
    pub key: String,
    pub expect: Expectation,
}

impl WatchKey {
    pub fn int_equals(key: impl Into<String>, value: i64) -> Self {
        Self {
            key: key.into(),
            expect: Expectation::IntEquals(value),
        }
    }

    pub fn absent(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            expect: Expectation::Absent,
        }
    }

    pub fn any(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            expect: Expectation::Any,
        }
    }
}

/// An optimistic multi-key transaction: the write batch commits only if
/// every watched key still matches its expectation (and, where the backend
/// supports it, has not been touched at all since the watch began).
#[derive(Debug, Clone)]
pub struct GuardedWrite {
    pub watches: Vec<WatchKey>,
    pub writes: Vec<WriteOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed,
    /// A watched key changed; no writes took effect. Retry policy belongs
    /// to the caller.
    Conflict,
}

/// Server-side guard inside an atomic program. Guards are evaluated in
/// order; the first failure rejects the whole program with its `code` and
/// nothing is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// `HGET key field == expected` (absent field fails the guard).
    HashFieldEquals {
        key: String,
        field: String,
        expected: String,
        code: &'static str,
    },
    /// `HGET key field <= max`, numerically (absent field fails the guard).
    HashFieldIntAtMost {
        key: String,
        field: String,
        max: i64,
        code: &'static str,
    },
    /// `GET key >= min`, numerically; an absent key counts as 0.
    IntAtLeast {
        key: String,
        min: i64,
        code: &'static str,
    },
}

impl Guard {
    pub fn code(&self) -> &'static str {
        match self {
            Guard::HashFieldEquals { code, .. }
            | Guard::HashFieldIntAtMost { code, .. }
            | Guard::IntAtLeast { code, .. } => code,
        }
    }
}

/// A guard-gated write batch executed as one indivisible server-side step.
/// The Redis backend compiles this to a Lua script; the in-process backend
/// evaluates it under its lock.
#[derive(Debug, Clone)]
pub struct AtomicProgram {
    pub guards: Vec<Guard>,
    pub writes: Vec<WriteOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOutcome {
    Applied,
    /// The named guard failed; no writes took effect.
    Rejected(&'static str),
}

/// Thin capability layer over the in-memory key-value store.
///
/// Two production-shaped backends implement this: `RedisStore` (the wire
/// contract) and `MemoryStore` (single-process deployments and the test
/// suite). The adapter never retries and never interprets domain semantics;
/// both belong to callers.
#[async_trait]
pub trait FastStore: Send + Sync {
    /// Cheap availability probe.
    async fn ping(&self) -> Result<(), FastStoreError>;

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, FastStoreError>;

    async fn set_i64(&self, key: &str, value: i64) -> Result<(), FastStoreError>;

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, FastStoreError>;

    async fn decr_by(&self, key: &str, delta: i64) -> Result<i64, FastStoreError> {
        self.incr_by(key, -delta).await
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>, FastStoreError>;

    /// `None` when the hash does not exist (an empty hash and an absent
    /// hash are indistinguishable on the wire, and both mean "absent").
    async fn hash_get_all(
        &self,
        key: &str,
    ) -> Result<Option<HashMap<String, String>>, FastStoreError>;

    /// Pipelined multi-hash read; one round trip, positionally aligned
    /// with `keys`.
    async fn hash_get_all_multi(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<HashMap<String, String>>>, FastStoreError>;

    async fn hash_set_multi(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), FastStoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), FastStoreError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), FastStoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, FastStoreError>;

    async fn sorted_set_add(
        &self,
        key: &str,
        member: &str,
        score: i64,
    ) -> Result<(), FastStoreError>;

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<(), FastStoreError>;

    /// Members with `min <= score <= max`, ascending, at most `limit`.
    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>, FastStoreError>;

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, FastStoreError>;

    async fn delete(&self, key: &str) -> Result<(), FastStoreError>;

    /// Set-if-absent with a TTL lease. Returns `true` when this caller won
    /// the key.
    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, FastStoreError>;

    async fn guarded_write(&self, txn: GuardedWrite) -> Result<TxnOutcome, FastStoreError>;

    async fn run_atomic(&self, program: AtomicProgram) -> Result<AtomicOutcome, FastStoreError>;

    /// Execute several programs as one indivisible step (single round
    /// trip). Each program's guards gate only its own writes; outcomes are
    /// positionally aligned with the input.
    async fn run_atomic_batch(
        &self,
        programs: Vec<AtomicProgram>,
    ) -> Result<Vec<AtomicOutcome>, FastStoreError>;
}
