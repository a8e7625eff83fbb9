use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::error::FastStoreError;

use super::fast::{
    AtomicOutcome, AtomicProgram, Expectation, FastStore, Guard, GuardedWrite, TxnOutcome, WriteOp,
};

fn map_err(err: redis::RedisError) -> FastStoreError {
    if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
    {
        FastStoreError::Unavailable(err.to_string())
    } else {
        FastStoreError::Backend(err.to_string())
    }
}

/// Redis-backed [`FastStore`].
///
/// Plain capability calls go through a shared multiplexed
/// [`ConnectionManager`]. Optimistic transactions need WATCH state, which a
/// multiplexed connection cannot carry safely, so `guarded_write` opens a
/// dedicated connection per transaction. Atomic programs are compiled to
/// Lua and evaluated server-side in a single step.
pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, FastStoreError> {
        let client = redis::Client::open(url).map_err(map_err)?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(map_err)?;
        Ok(Self { client, manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn queue_op(pipe: &mut redis::Pipeline, op: &WriteOp) {
    match op {
        WriteOp::SetInt { key, value } => {
            pipe.cmd("SET").arg(key).arg(value).ignore();
        }
        WriteOp::IncrBy { key, delta } => {
            pipe.cmd("INCRBY").arg(key).arg(delta).ignore();
        }
        WriteOp::HashSet { key, fields } => {
            let mut cmd = pipe.cmd("HSET");
            cmd.arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
            cmd.ignore();
        }
        WriteOp::SetAdd { key, member } => {
            pipe.cmd("SADD").arg(key).arg(member).ignore();
        }
        WriteOp::SetRemove { key, member } => {
            pipe.cmd("SREM").arg(key).arg(member).ignore();
        }
        WriteOp::SortedSetAdd { key, member, score } => {
            pipe.cmd("ZADD").arg(key).arg(score).arg(member).ignore();
        }
        WriteOp::SortedSetRemove { key, member } => {
            pipe.cmd("ZREM").arg(key).arg(member).ignore();
        }
        WriteOp::Delete { key } => {
            pipe.cmd("DEL").arg(key).ignore();
        }
    }
}

/// Collects KEYS/ARGV while emitting script text, so every dynamic value
/// travels out-of-band and nothing is spliced into the Lua source.
#[derive(Default)]
struct LuaBuilder {
    text: String,
    keys: Vec<String>,
    args: Vec<String>,
}

impl LuaBuilder {
    fn key(&mut self, key: &str) -> String {
        self.keys.push(key.to_string());
        format!("KEYS[{}]", self.keys.len())
    }

    fn arg(&mut self, value: impl ToString) -> String {
        self.args.push(value.to_string());
        format!("ARGV[{}]", self.args.len())
    }

    fn line(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
    }

    fn emit_guard(&mut self, guard: &Guard) {
        match guard {
            Guard::HashFieldEquals {
                key,
                field,
                expected,
                code,
            } => {
                let (k, f, e, c) = (
                    self.key(key),
                    self.arg(field),
                    self.arg(expected),
                    self.arg(code),
                );
                self.line(&format!(
                    "if not rejected and redis.call('HGET', {k}, {f}) ~= {e} then rejected = {c} end"
                ));
            }
            Guard::HashFieldIntAtMost {
                key,
                field,
                max,
                code,
            } => {
                let (k, f, m, c) = (
                    self.key(key),
                    self.arg(field),
                    self.arg(max),
                    self.arg(code),
                );
                self.line(&format!(
                    "if not rejected then local v = redis.call('HGET', {k}, {f}) \
                     if not v or tonumber(v) > tonumber({m}) then rejected = {c} end end"
                ));
            }
            Guard::IntAtLeast { key, min, code } => {
                let (k, m, c) = (self.key(key), self.arg(min), self.arg(code));
                self.line(&format!(
                    "if not rejected and tonumber(redis.call('GET', {k}) or '0') < tonumber({m}) \
                     then rejected = {c} end"
                ));
            }
        }
    }

    fn emit_write(&mut self, op: &WriteOp) {
        match op {
            WriteOp::SetInt { key, value } => {
                let (k, v) = (self.key(key), self.arg(value));
                self.line(&format!("redis.call('SET', {k}, {v})"));
            }
            WriteOp::IncrBy { key, delta } => {
                let (k, v) = (self.key(key), self.arg(delta));
                self.line(&format!("redis.call('INCRBY', {k}, {v})"));
            }
            WriteOp::HashSet { key, fields } => {
                let k = self.key(key);
                let mut pairs = Vec::with_capacity(fields.len() * 2);
                for (field, value) in fields {
                    pairs.push(self.arg(field));
                    pairs.push(self.arg(value));
                }
                self.line(&format!("redis.call('HSET', {k}, {})", pairs.join(", ")));
            }
            WriteOp::SetAdd { key, member } => {
                let (k, m) = (self.key(key), self.arg(member));
                self.line(&format!("redis.call('SADD', {k}, {m})"));
            }
            WriteOp::SetRemove { key, member } => {
                let (k, m) = (self.key(key), self.arg(member));
                self.line(&format!("redis.call('SREM', {k}, {m})"));
            }
            WriteOp::SortedSetAdd { key, member, score } => {
                let (k, s, m) = (self.key(key), self.arg(score), self.arg(member));
                self.line(&format!("redis.call('ZADD', {k}, {s}, {m})"));
            }
            WriteOp::SortedSetRemove { key, member } => {
                let (k, m) = (self.key(key), self.arg(member));
                self.line(&format!("redis.call('ZREM', {k}, {m})"));
            }
            WriteOp::Delete { key } => {
                let k = self.key(key);
                self.line(&format!("redis.call('DEL', {k})"));
            }
        }
    }

    fn emit_program(&mut self, program: &AtomicProgram) {
        self.line("do");
        self.line("local rejected = nil");
        for guard in &program.guards {
            self.emit_guard(guard);
        }
        self.line("if rejected then results[#results+1] = rejected else");
        for op in &program.writes {
            self.emit_write(op);
        }
        self.line("results[#results+1] = 'ok'");
        self.line("end");
        self.line("end");
    }
}

fn compile(programs: &[AtomicProgram]) -> LuaBuilder {
    let mut lua = LuaBuilder::default();
    lua.line("local results = {}");
    for program in programs {
        lua.emit_program(program);
    }
    lua.line("return results");
    lua
}

fn match_outcome(
    program: &AtomicProgram,
    raw: &str,
) -> Result<AtomicOutcome, FastStoreError> {
    if raw == "ok" {
        return Ok(AtomicOutcome::Applied);
    }
    program
        .guards
        .iter()
        .find(|g| g.code() == raw)
        .map(|g| AtomicOutcome::Rejected(g.code()))
        .ok_or_else(|| FastStoreError::Backend(format!("atomic program returned `{raw}`")))
}

#[async_trait]
impl FastStore for RedisStore {
    async fn ping(&self) -> Result<(), FastStoreError> {
        let _: String = redis::cmd("PING")
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, FastStoreError> {
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn set_i64(&self, key: &str, value: i64) -> Result<(), FastStoreError> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, FastStoreError> {
        redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>, FastStoreError> {
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn hash_get_all(
        &self,
        key: &str,
    ) -> Result<Option<HashMap<String, String>>, FastStoreError> {
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)?;
        Ok(if map.is_empty() { None } else { Some(map) })
    }

    async fn hash_get_all_multi(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<HashMap<String, String>>>, FastStoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("HGETALL").arg(key);
        }
        let maps: Vec<HashMap<String, String>> = pipe
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)?;
        Ok(maps
            .into_iter()
            .map(|map| if map.is_empty() { None } else { Some(map) })
            .collect())
    }

    async fn hash_set_multi(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), FastStoreError> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        cmd.query_async(&mut self.conn()).await.map_err(map_err)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), FastStoreError> {
        redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), FastStoreError> {
        redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, FastStoreError> {
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn sorted_set_add(
        &self,
        key: &str,
        member: &str,
        score: i64,
    ) -> Result<(), FastStoreError> {
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<(), FastStoreError> {
        redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>, FastStoreError> {
        redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, FastStoreError> {
        redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn delete(&self, key: &str) -> Result<(), FastStoreError> {
        redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, FastStoreError> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn guarded_write(&self, txn: GuardedWrite) -> Result<TxnOutcome, FastStoreError> {
        // WATCH needs connection-local state; the multiplexed manager
        // interleaves commands, so each transaction gets its own link.
        let mut conn = self.client.get_async_connection().await.map_err(map_err)?;

        let mut watch = redis::cmd("WATCH");
        for key in txn.watches.iter().map(|w| w.key.as_str()) {
            watch.arg(key);
        }
        watch
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_err)?;

        // Re-read the pinned values inside the watch window; a mismatch
        // means the caller decided on stale data.
        for watched in &txn.watches {
            let matches = match watched.expect {
                Expectation::IntEquals(expected) => {
                    let current: Option<i64> = redis::cmd("GET")
                        .arg(&watched.key)
                        .query_async(&mut conn)
                        .await
                        .map_err(map_err)?;
                    current == Some(expected)
                }
                Expectation::Absent => {
                    let exists: bool = redis::cmd("EXISTS")
                        .arg(&watched.key)
                        .query_async(&mut conn)
                        .await
                        .map_err(map_err)?;
                    !exists
                }
                Expectation::Any => true,
            };
            if !matches {
                let _: Result<(), _> = redis::cmd("UNWATCH").query_async(&mut conn).await;
                return Ok(TxnOutcome::Conflict);
            }
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &txn.writes {
            queue_op(&mut pipe, op);
        }
        let committed: Option<()> = pipe.query_async(&mut conn).await.map_err(map_err)?;
        Ok(match committed {
            Some(()) => TxnOutcome::Committed,
            None => TxnOutcome::Conflict,
        })
    }

    async fn run_atomic(&self, program: AtomicProgram) -> Result<AtomicOutcome, FastStoreError> {
        let mut outcomes = self.run_atomic_batch(vec![program]).await?;
        outcomes
            .pop()
            .ok_or_else(|| FastStoreError::Backend("empty atomic batch reply".into()))
    }

    async fn run_atomic_batch(
        &self,
        programs: Vec<AtomicProgram>,
    ) -> Result<Vec<AtomicOutcome>, FastStoreError> {
        if programs.is_empty() {
            return Ok(Vec::new());
        }
        let lua = compile(&programs);
        let script = redis::Script::new(&lua.text);
        let mut invocation = script.prepare_invoke();
        for key in &lua.keys {
            invocation.key(key.as_str());
        }
        for arg in &lua.args {
            invocation.arg(arg.as_str());
        }
        let raw: Vec<String> = invocation
            .invoke_async(&mut self.conn())
            .await
            .map_err(map_err)?;
        if raw.len() != programs.len() {
            return Err(FastStoreError::Backend(format!(
                "atomic batch returned {} results for {} programs",
                raw.len(),
                programs.len()
            )));
        }
        programs
            .iter()
            .zip(raw.iter())
            .map(|(program, code)| match_outcome(program, code))
            .collect()
    }
}
