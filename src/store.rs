use std::collections::HashMap;

use anyhow::{Context, Result};
use redis::AsyncCommands;
use redis::Script;

use crate::constants::UNIQUE_LATCH_TTL_SECONDS;
use crate::job::Job;
use crate::keys::Namespace;
use crate::sampler::JobTypeKeys;

const FETCH_JOB_LUA: &str = include_str!("lua/fetch_job.lua");
const REMOVE_JOB_FROM_IN_PROGRESS_LUA: &str = include_str!("lua/remove_job_from_in_progress.lua");
const REENQUEUE_JOB_LUA: &str = include_str!("lua/reenqueue_job.lua");
const REQUEUE_DUE_LUA: &str = include_str!("lua/requeue_due.lua");
const DELETE_SINGLE_LUA: &str = include_str!("lua/delete_single.lua");
const REQUEUE_SINGLE_DEAD_LUA: &str = include_str!("lua/requeue_single_dead.lua");
const REQUEUE_ALL_DEAD_LUA: &str = include_str!("lua/requeue_all_dead.lua");
const ENQUEUE_UNIQUE_LUA: &str = include_str!("lua/enqueue_unique.lua");
const ENQUEUE_UNIQUE_IN_LUA: &str = include_str!("lua/enqueue_unique_in.lua");
const REAP_STALE_LOCKS_LUA: &str = include_str!("lua/reap_stale_locks.lua");
const GET_UNKNOWN_POOLS_LUA: &str = include_str!("lua/get_unknown_pools.lua");
const REMOVE_DANGLING_LOCKS_LUA: &str = include_str!("lua/remove_dangling_locks.lua");
const RELEASE_REAPER_LOCK_LUA: &str = include_str!("lua/release_reaper_lock.lua");

/// Where a failed job goes when its in-progress entry is committed away.
#[derive(Debug, Clone)]
pub(crate) struct ForwardTarget {
    pub queue: String,
    pub score: i64,
    pub payload: Vec<u8>,
}

/// Key tuple for one job type's orphan recovery.
#[derive(Debug, Clone)]
pub(crate) struct ReenqueueKeys {
    pub in_progress: String,
    pub jobs: String,
    pub lock: String,
    pub lock_info: String,
}

/// All access to the shared store. Every mutation that has to be indivisible
/// goes through one of the server-side scripts; everything else is plain
/// commands on a multiplexed connection.
#[derive(Clone)]
pub struct Store {
    keys: Namespace,
    pub(crate) conn: redis::aio::MultiplexedConnection,
    fetch_script: Script,
    remove_in_progress_script: Script,
    reenqueue_script: Script,
    requeue_due_script: Script,
    delete_single_script: Script,
    requeue_single_dead_script: Script,
    requeue_all_dead_script: Script,
    enqueue_unique_script: Script,
    enqueue_unique_in_script: Script,
    reap_stale_locks_script: Script,
    get_unknown_pools_script: Script,
    remove_dangling_locks_script: Script,
    release_reaper_lock_script: Script,
}

impl Store {
    pub async fn new(redis_dsn: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(redis_dsn).with_context(|| "failed to create Redis client")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| "failed to connect to Redis")?;
        Ok(Self::with_connection(namespace, conn))
    }

    pub fn with_connection(namespace: &str, conn: redis::aio::MultiplexedConnection) -> Self {
        Self {
            keys: Namespace::new(namespace),
            conn,
            fetch_script: Script::new(FETCH_JOB_LUA),
            remove_in_progress_script: Script::new(REMOVE_JOB_FROM_IN_PROGRESS_LUA),
            reenqueue_script: Script::new(REENQUEUE_JOB_LUA),
            requeue_due_script: Script::new(REQUEUE_DUE_LUA),
            delete_single_script: Script::new(DELETE_SINGLE_LUA),
            requeue_single_dead_script: Script::new(REQUEUE_SINGLE_DEAD_LUA),
            requeue_all_dead_script: Script::new(REQUEUE_ALL_DEAD_LUA),
            enqueue_unique_script: Script::new(ENQUEUE_UNIQUE_LUA),
            enqueue_unique_in_script: Script::new(ENQUEUE_UNIQUE_IN_LUA),
            reap_stale_locks_script: Script::new(REAP_STALE_LOCKS_LUA),
            get_unknown_pools_script: Script::new(GET_UNKNOWN_POOLS_LUA),
            remove_dangling_locks_script: Script::new(REMOVE_DANGLING_LOCKS_LUA),
            release_reaper_lock_script: Script::new(RELEASE_REAPER_LOCK_LUA),
        }
    }

    pub fn keys(&self) -> &Namespace {
        &self.keys
    }

    // Dequeue / release / orphan recovery

    pub(crate) async fn fetch_job<'a>(
        &mut self,
        samples: impl Iterator<Item = &'a JobTypeKeys>,
        pool_id: &str,
    ) -> Result<Option<(Vec<u8>, String, String)>> {
        let script = self.fetch_script.clone();
        let mut invocation = script.prepare_invoke();
        for keys in samples {
            invocation
                .key(&keys.jobs)
                .key(&keys.in_progress)
                .key(&keys.paused)
                .key(&keys.lock)
                .key(&keys.lock_info)
                .key(&keys.max_concurrency);
        }
        invocation.arg(pool_id);
        let claimed: Option<(Vec<u8>, String, String)> =
            invocation.invoke_async(&mut self.conn).await?;
        Ok(claimed)
    }

    pub(crate) async fn remove_job_from_in_progress(
        &mut self,
        job: &Job,
        pool_id: &str,
        forward: Option<&ForwardTarget>,
    ) -> Result<()> {
        let script = self.remove_in_progress_script.clone();
        let mut invocation = script.prepare_invoke();
        invocation
            .key(&job.in_progress_queue)
            .key(self.keys.lock(&job.name))
            .key(self.keys.lock_info(&job.name))
            .key(forward.map(|target| target.queue.as_str()).unwrap_or(""))
            .arg(pool_id)
            .arg(job.raw.as_slice())
            .arg(if forward.is_some() { "1" } else { "0" })
            .arg(forward.map(|target| target.score).unwrap_or(0))
            .arg(forward.map(|target| target.payload.as_slice()).unwrap_or(b""));
        let _: () = invocation.invoke_async(&mut self.conn).await?;
        Ok(())
    }

    pub(crate) async fn reenqueue_orphan(
        &mut self,
        tuples: &[ReenqueueKeys],
        pool_id: &str,
    ) -> Result<Option<(Vec<u8>, String, String)>> {
        let script = self.reenqueue_script.clone();
        let mut invocation = script.prepare_invoke();
        for keys in tuples {
            invocation
                .key(&keys.in_progress)
                .key(&keys.jobs)
                .key(&keys.lock)
                .key(&keys.lock_info);
        }
        invocation.arg(pool_id);
        let moved: Option<(Vec<u8>, String, String)> = invocation.invoke_async(&mut self.conn).await?;
        Ok(moved)
    }

    // Retry / scheduled / dead sorted sets

    /// Promotes the most-due entry of `source` onto its ready list. Returns
    /// `Some("ok")` on promotion or deadline drop, `Some("dead")` when the
    /// job name was unknown, `None` when nothing is due.
    pub(crate) async fn requeue_due(
        &mut self,
        source: &str,
        known_queues: &[String],
        now: i64,
    ) -> Result<Option<String>> {
        let script = self.requeue_due_script.clone();
        let mut invocation = script.prepare_invoke();
        invocation.key(source).key(self.keys.dead());
        for queue in known_queues {
            invocation.key(queue);
        }
        invocation.arg(self.keys.jobs_prefix()).arg(now);
        let outcome: Option<String> = invocation.invoke_async(&mut self.conn).await?;
        Ok(outcome)
    }

    pub(crate) async fn delete_single(
        &mut self,
        zset: &str,
        score: i64,
        job_id: &str,
    ) -> Result<(i64, Vec<u8>)> {
        let script = self.delete_single_script.clone();
        let mut invocation = script.prepare_invoke();
        invocation.key(zset).arg(score).arg(job_id);
        let (deleted, payload): (i64, Vec<u8>) = invocation.invoke_async(&mut self.conn).await?;
        Ok((deleted, payload))
    }

    pub(crate) async fn requeue_single_dead(
        &mut self,
        known_queues: &[String],
        now: i64,
        died_at: i64,
        job_id: &str,
    ) -> Result<i64> {
        let script = self.requeue_single_dead_script.clone();
        let mut invocation = script.prepare_invoke();
        invocation.key(self.keys.dead());
        for queue in known_queues {
            invocation.key(queue);
        }
        invocation
            .arg(self.keys.jobs_prefix())
            .arg(now)
            .arg(died_at)
            .arg(job_id);
        let requeued: i64 = invocation.invoke_async(&mut self.conn).await?;
        Ok(requeued)
    }

    pub(crate) async fn requeue_all_dead(
        &mut self,
        known_queues: &[String],
        now: i64,
        limit: usize,
    ) -> Result<i64> {
        let script = self.requeue_all_dead_script.clone();
        let mut invocation = script.prepare_invoke();
        invocation.key(self.keys.dead());
        for queue in known_queues {
            invocation.key(queue);
        }
        invocation.arg(self.keys.jobs_prefix()).arg(now).arg(limit);
        let requeued: i64 = invocation.invoke_async(&mut self.conn).await?;
        Ok(requeued)
    }

    // Enqueue paths

    pub(crate) async fn enqueue(&mut self, job: &Job) -> Result<()> {
        let payload = job.serialize()?;
        self.conn
            .lpush::<_, _, ()>(self.keys.jobs(&job.name), payload)
            .await?;
        Ok(())
    }

    pub(crate) async fn schedule(&mut self, job: &Job, run_at: i64) -> Result<()> {
        let payload = job.serialize()?;
        self.conn
            .zadd::<_, _, _, ()>(self.keys.scheduled(), payload, run_at)
            .await?;
        Ok(())
    }

    /// Returns false when the uniqueness latch was already held.
    pub(crate) async fn enqueue_unique(&mut self, job: &Job, latch_key: &str) -> Result<bool> {
        let payload = job.serialize()?;
        let script = self.enqueue_unique_script.clone();
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.keys.jobs(&job.name))
            .key(latch_key)
            .arg(payload)
            .arg(UNIQUE_LATCH_TTL_SECONDS);
        let outcome: String = invocation.invoke_async(&mut self.conn).await?;
        Ok(outcome == "ok")
    }

    /// Returns false when the uniqueness latch was already held.
    pub(crate) async fn enqueue_unique_in(
        &mut self,
        job: &Job,
        latch_key: &str,
        run_at: i64,
    ) -> Result<bool> {
        let payload = job.serialize()?;
        let script = self.enqueue_unique_in_script.clone();
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.keys.scheduled())
            .key(latch_key)
            .arg(payload)
            .arg(run_at)
            .arg(UNIQUE_LATCH_TTL_SECONDS);
        let outcome: String = invocation.invoke_async(&mut self.conn).await?;
        Ok(outcome == "ok")
    }

    pub(crate) async fn delete_unique_latch(&mut self, latch_key: &str) -> Result<()> {
        let _: i64 = self.conn.del(latch_key).await?;
        Ok(())
    }

    // Job type registration state

    pub(crate) async fn add_known_jobs(&mut self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        self.conn
            .sadd::<_, _, ()>(self.keys.known_jobs(), names)
            .await?;
        Ok(())
    }

    pub(crate) async fn known_job_names(&mut self) -> Result<Vec<String>> {
        let names: Vec<String> = self.conn.smembers(self.keys.known_jobs()).await?;
        Ok(names)
    }

    pub(crate) async fn set_max_concurrency(&mut self, job_name: &str, cap: u32) -> Result<()> {
        self.conn
            .set::<_, _, ()>(self.keys.max_concurrency(job_name), cap)
            .await?;
        Ok(())
    }

    pub(crate) async fn pause_jobs(&mut self, job_name: &str) -> Result<()> {
        self.conn
            .set::<_, _, ()>(self.keys.paused(job_name), "1")
            .await?;
        Ok(())
    }

    pub(crate) async fn unpause_jobs(&mut self, job_name: &str) -> Result<()> {
        let _: i64 = self.conn.del(self.keys.paused(job_name)).await?;
        Ok(())
    }

    // Pool membership and heartbeats

    pub(crate) async fn write_heartbeat(
        &mut self,
        pool_id: &str,
        fields: &[(&str, String)],
        ttl_seconds: i64,
    ) -> Result<()> {
        let hash = self.keys.heartbeat(pool_id);
        let fields_ref: Vec<(&str, &str)> = fields
            .iter()
            .map(|(field, value)| (*field, value.as_str()))
            .collect();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.sadd(self.keys.worker_pools(), pool_id);
        pipe.hset_multiple(&hash, &fields_ref);
        pipe.expire(&hash, ttl_seconds);
        pipe.query_async::<()>(&mut self.conn).await?;
        Ok(())
    }

    /// Drops a pool from membership and deletes its heartbeat hash. Used on
    /// graceful shutdown and by the reaper.
    pub(crate) async fn remove_worker_pool(&mut self, pool_id: &str) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.srem(self.keys.worker_pools(), pool_id);
        pipe.del(self.keys.heartbeat(pool_id));
        pipe.query_async::<()>(&mut self.conn).await?;
        Ok(())
    }

    pub(crate) async fn worker_pool_ids(&mut self) -> Result<Vec<String>> {
        let ids: Vec<String> = self.conn.smembers(self.keys.worker_pools()).await?;
        Ok(ids)
    }

    pub(crate) async fn heartbeat_exists(&mut self, pool_id: &str) -> Result<bool> {
        let exists: bool = self.conn.exists(self.keys.heartbeat(pool_id)).await?;
        Ok(exists)
    }

    pub(crate) async fn read_heartbeat(
        &mut self,
        pool_id: &str,
    ) -> Result<Option<HashMap<String, String>>> {
        let raw: HashMap<String, String> = self.conn.hgetall(self.keys.heartbeat(pool_id)).await?;
        Ok(if raw.is_empty() { None } else { Some(raw) })
    }

    // Reaper support

    pub(crate) async fn acquire_reaper_lock(&mut self, token: &str, ttl_seconds: u64) -> Result<bool> {
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.keys.reaper_lock())
            .arg(token)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut self.conn)
            .await?;
        Ok(acquired.is_some())
    }

    pub(crate) async fn release_reaper_lock(&mut self, token: &str) -> Result<bool> {
        let script = self.release_reaper_lock_script.clone();
        let mut invocation = script.prepare_invoke();
        invocation.key(self.keys.reaper_lock()).arg(token);
        let released: i64 = invocation.invoke_async(&mut self.conn).await?;
        Ok(released != 0)
    }

    /// Subtracts a dead pool's contribution from each (lock, lock_info)
    /// pair. Returns the lock keys that went negative and were clamped.
    pub(crate) async fn reap_stale_locks(
        &mut self,
        pairs: &[(String, String)],
        dead_pool_id: &str,
    ) -> Result<Vec<String>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let script = self.reap_stale_locks_script.clone();
        let mut invocation = script.prepare_invoke();
        for (lock, lock_info) in pairs {
            invocation.key(lock).key(lock_info);
        }
        invocation.arg(dead_pool_id);
        let clamped: Vec<String> = invocation.invoke_async(&mut self.conn).await?;
        Ok(clamped)
    }

    /// Pool ids referenced by lock-info hashes but absent from the worker
    /// pools set, mapped to the lock-info keys naming them.
    pub(crate) async fn unknown_pools(
        &mut self,
        lock_info_keys: &[String],
    ) -> Result<HashMap<String, Vec<String>>> {
        if lock_info_keys.is_empty() {
            return Ok(HashMap::new());
        }
        let script = self.get_unknown_pools_script.clone();
        let mut invocation = script.prepare_invoke();
        invocation.key(self.keys.worker_pools());
        for key in lock_info_keys {
            invocation.key(key);
        }
        let encoded: String = invocation.invoke_async(&mut self.conn).await?;
        Ok(serde_json::from_str(&encoded)?)
    }

    /// Re-aligns lock counters with their lock-info sums. Returns the lock
    /// keys that had drifted.
    pub(crate) async fn remove_dangling_locks(
        &mut self,
        pairs: &[(String, String)],
    ) -> Result<Vec<String>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let script = self.remove_dangling_locks_script.clone();
        let mut invocation = script.prepare_invoke();
        for (lock, lock_info) in pairs {
            invocation.key(lock).key(lock_info);
        }
        let fixed: Vec<String> = invocation.invoke_async(&mut self.conn).await?;
        Ok(fixed)
    }

    // Periodic enqueuer watermark

    pub(crate) async fn last_periodic_enqueue(&mut self) -> Result<Option<i64>> {
        let watermark: Option<i64> = self.conn.get(self.keys.last_periodic_enqueue()).await?;
        Ok(watermark)
    }

    pub(crate) async fn set_last_periodic_enqueue(&mut self, now: i64) -> Result<()> {
        self.conn
            .set::<_, _, ()>(self.keys.last_periodic_enqueue(), now)
            .await?;
        Ok(())
    }

    // Worker observations

    pub(crate) async fn write_worker_observation(
        &mut self,
        worker_id: &str,
        set: &[(&str, String)],
        clear: &[&str],
        ttl_seconds: i64,
    ) -> Result<()> {
        let hash = self.keys.worker_observation(worker_id);
        let set_ref: Vec<(&str, &str)> = set
            .iter()
            .map(|(field, value)| (*field, value.as_str()))
            .collect();
        let mut pipe = redis::pipe();
        pipe.atomic();
        if !clear.is_empty() {
            pipe.hdel(&hash, clear);
        }
        if !set_ref.is_empty() {
            pipe.hset_multiple(&hash, &set_ref);
        }
        pipe.expire(&hash, ttl_seconds);
        pipe.query_async::<()>(&mut self.conn).await?;
        Ok(())
    }

    pub(crate) async fn delete_worker_observation(&mut self, worker_id: &str) -> Result<()> {
        let _: i64 = self.conn.del(self.keys.worker_observation(worker_id)).await?;
        Ok(())
    }

    pub(crate) async fn read_worker_observation(
        &mut self,
        worker_id: &str,
    ) -> Result<Option<HashMap<String, String>>> {
        let raw: HashMap<String, String> = self
            .conn
            .hgetall(self.keys.worker_observation(worker_id))
            .await?;
        Ok(if raw.is_empty() { None } else { Some(raw) })
    }

    // Introspection primitives for the client

    pub(crate) async fn queue_len(&mut self, job_name: &str) -> Result<i64> {
        let len: i64 = self.conn.llen(self.keys.jobs(job_name)).await?;
        Ok(len)
    }

    /// The next job that would be claimed from a ready list, if any.
    pub(crate) async fn next_ready_job(&mut self, job_name: &str) -> Result<Option<Job>> {
        let raw: Option<Vec<u8>> = redis::cmd("LINDEX")
            .arg(self.keys.jobs(job_name))
            .arg(-1)
            .query_async(&mut self.conn)
            .await?;
        match raw {
            Some(raw) => {
                let queue = self.keys.jobs(job_name);
                Ok(Some(Job::from_raw(raw, queue, String::new())?))
            }
            None => Ok(None),
        }
    }

    pub(crate) async fn zset_len(&mut self, zset: &str) -> Result<i64> {
        let len: i64 = self.conn.zcard(zset).await?;
        Ok(len)
    }

    pub(crate) async fn zset_page(
        &mut self,
        zset: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(Vec<u8>, f64)>> {
        let entries: Vec<(Vec<u8>, f64)> = self.conn.zrange_withscores(zset, start, stop).await?;
        Ok(entries)
    }

    pub async fn flushdb(&mut self) -> Result<()> {
        redis::cmd("FLUSHDB").query_async::<()>(&mut self.conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::now_epoch_seconds;
    use crate::test_support::RedisTestContext;
    use serde_json::json;

    fn type_keys(keys: &Namespace, pool_id: &str, job_name: &str) -> JobTypeKeys {
        JobTypeKeys {
            jobs: keys.jobs(job_name),
            in_progress: keys.in_progress(pool_id, job_name),
            paused: keys.paused(job_name),
            lock: keys.lock(job_name),
            lock_info: keys.lock_info(job_name),
            max_concurrency: keys.max_concurrency(job_name),
        }
    }

    fn build_job(name: &str) -> Job {
        let mut args = serde_json::Map::new();
        args.insert("k".to_string(), json!("v"));
        Job::new(name, args)
    }

    async fn counter(store: &mut Store, key: &str) -> i64 {
        let value: Option<i64> = store.conn.get(key).await.unwrap();
        value.unwrap_or(0)
    }

    async fn fetch_one(ctx: &mut RedisTestContext, pool_id: &str, job_name: &str) -> Option<Job> {
        let keys = ctx.store.keys().clone();
        let sample = [type_keys(&keys, pool_id, job_name)];
        let claimed = ctx
            .store
            .fetch_job(sample.iter(), pool_id)
            .await
            .unwrap();
        claimed.map(|(raw, dequeued_from, in_progress)| {
            Job::from_raw(raw, dequeued_from, in_progress).unwrap()
        })
    }

    #[tokio::test]
    async fn lua_scripts_compile_in_redis() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        for script in [
            FETCH_JOB_LUA,
            REMOVE_JOB_FROM_IN_PROGRESS_LUA,
            REENQUEUE_JOB_LUA,
            REQUEUE_DUE_LUA,
            DELETE_SINGLE_LUA,
            REQUEUE_SINGLE_DEAD_LUA,
            REQUEUE_ALL_DEAD_LUA,
            ENQUEUE_UNIQUE_LUA,
            ENQUEUE_UNIQUE_IN_LUA,
            REAP_STALE_LOCKS_LUA,
            GET_UNKNOWN_POOLS_LUA,
            REMOVE_DANGLING_LOCKS_LUA,
            RELEASE_REAPER_LOCK_LUA,
        ] {
            let sha: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(script)
                .query_async(&mut ctx.store.conn)
                .await
                .unwrap();
            assert_eq!(sha.len(), 40);
        }
    }

    #[tokio::test]
    async fn fetch_claims_job_and_takes_lock() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        let job = build_job("email");
        ctx.store.enqueue(&job).await.unwrap();

        let claimed = fetch_one(&mut ctx, "pool-1", "email").await.unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.dequeued_from, keys.jobs("email"));
        assert_eq!(claimed.in_progress_queue, keys.in_progress("pool-1", "email"));

        assert_eq!(counter(&mut ctx.store, &keys.lock("email")).await, 1);
        let held: Option<i64> = ctx
            .store
            .conn
            .hget(keys.lock_info("email"), "pool-1")
            .await
            .unwrap();
        assert_eq!(held, Some(1));

        let in_progress: i64 = ctx
            .store
            .conn
            .llen(keys.in_progress("pool-1", "email"))
            .await
            .unwrap();
        assert_eq!(in_progress, 1);
        assert_eq!(ctx.store.queue_len("email").await.unwrap(), 0);

        // nothing left to claim
        assert!(fetch_one(&mut ctx, "pool-1", "email").await.is_none());
    }

    #[tokio::test]
    async fn fetch_skips_paused_job_types() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let job = build_job("email");
        ctx.store.enqueue(&job).await.unwrap();
        ctx.store.pause_jobs("email").await.unwrap();

        assert!(fetch_one(&mut ctx, "pool-1", "email").await.is_none());

        ctx.store.unpause_jobs("email").await.unwrap();
        assert!(fetch_one(&mut ctx, "pool-1", "email").await.is_some());
    }

    #[tokio::test]
    async fn fetch_respects_concurrency_cap() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        ctx.store.enqueue(&build_job("email")).await.unwrap();
        ctx.store.enqueue(&build_job("email")).await.unwrap();
        ctx.store.set_max_concurrency("email", 1).await.unwrap();

        let first = fetch_one(&mut ctx, "pool-1", "email").await.unwrap();
        assert!(fetch_one(&mut ctx, "pool-2", "email").await.is_none());

        ctx.store
            .remove_job_from_in_progress(&first, "pool-1", None)
            .await
            .unwrap();
        assert!(fetch_one(&mut ctx, "pool-2", "email").await.is_some());
    }

    #[tokio::test]
    async fn remove_from_in_progress_releases_lock() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        ctx.store.enqueue(&build_job("email")).await.unwrap();
        let claimed = fetch_one(&mut ctx, "pool-1", "email").await.unwrap();

        ctx.store
            .remove_job_from_in_progress(&claimed, "pool-1", None)
            .await
            .unwrap();

        assert_eq!(counter(&mut ctx.store, &keys.lock("email")).await, 0);
        let held: Option<i64> = ctx
            .store
            .conn
            .hget(keys.lock_info("email"), "pool-1")
            .await
            .unwrap();
        assert_eq!(held, Some(0));
        let in_progress: i64 = ctx
            .store
            .conn
            .llen(keys.in_progress("pool-1", "email"))
            .await
            .unwrap();
        assert_eq!(in_progress, 0);
    }

    #[tokio::test]
    async fn remove_from_in_progress_forwards_failed_job() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        ctx.store.enqueue(&build_job("email")).await.unwrap();
        let mut claimed = fetch_one(&mut ctx, "pool-1", "email").await.unwrap();

        claimed.record_failure("boom");
        let target = ForwardTarget {
            queue: keys.retry(),
            score: 12_345,
            payload: claimed.serialize().unwrap(),
        };
        ctx.store
            .remove_job_from_in_progress(&claimed, "pool-1", Some(&target))
            .await
            .unwrap();

        let entries = ctx.store.zset_page(&keys.retry(), 0, -1).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, target.payload);
        assert_eq!(entries[0].1 as i64, 12_345);
        assert_eq!(counter(&mut ctx.store, &keys.lock("email")).await, 0);
    }

    #[tokio::test]
    async fn enqueue_unique_suppresses_duplicates() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        let mut job = build_job("email");
        job.unique = true;
        let latch = keys.unique_job(&job.name, &job.args).unwrap();

        assert!(ctx.store.enqueue_unique(&job, &latch).await.unwrap());
        assert!(!ctx.store.enqueue_unique(&job, &latch).await.unwrap());
        assert_eq!(ctx.store.queue_len("email").await.unwrap(), 1);

        ctx.store.delete_unique_latch(&latch).await.unwrap();
        assert!(ctx.store.enqueue_unique(&job, &latch).await.unwrap());
    }

    #[tokio::test]
    async fn enqueue_unique_in_suppresses_duplicates() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        let mut job = build_job("email");
        job.unique = true;
        let latch = keys.unique_job(&job.name, &job.args).unwrap();
        let run_at = now_epoch_seconds() + 60;

        assert!(ctx.store.enqueue_unique_in(&job, &latch, run_at).await.unwrap());
        assert!(!ctx.store.enqueue_unique_in(&job, &latch, run_at).await.unwrap());
        assert_eq!(ctx.store.zset_len(&keys.scheduled()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn requeue_due_promotes_known_jobs() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        let job = build_job("email");
        let now = now_epoch_seconds();
        ctx.store.schedule(&job, now - 5).await.unwrap();

        let known = vec![keys.jobs("email")];
        let outcome = ctx
            .store
            .requeue_due(&keys.scheduled(), &known, now)
            .await
            .unwrap();
        assert_eq!(outcome.as_deref(), Some("ok"));
        assert_eq!(ctx.store.queue_len("email").await.unwrap(), 1);

        let promoted = ctx.store.next_ready_job("email").await.unwrap().unwrap();
        assert_eq!(promoted.id, job.id);
        assert_eq!(promoted.enqueued_at, now);

        // drained
        let outcome = ctx
            .store
            .requeue_due(&keys.scheduled(), &known, now)
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn requeue_due_diverts_unknown_jobs_to_dead() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        let job = build_job("gone");
        let now = now_epoch_seconds();
        ctx.store.schedule(&job, now - 5).await.unwrap();

        let known = vec![keys.jobs("email")];
        let outcome = ctx
            .store
            .requeue_due(&keys.scheduled(), &known, now)
            .await
            .unwrap();
        assert_eq!(outcome.as_deref(), Some("dead"));

        let entries = ctx.store.zset_page(&keys.dead(), 0, -1).await.unwrap();
        assert_eq!(entries.len(), 1);
        let dead: Job = serde_json::from_slice(&entries[0].0).unwrap();
        assert_eq!(dead.err.as_deref(), Some("unknown job when requeueing"));
        assert_eq!(dead.failed_at, Some(now));
    }

    #[tokio::test]
    async fn requeue_due_drops_expired_deadlines() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        let mut job = build_job("email");
        let now = now_epoch_seconds();
        job.deadline = Some(now - 10);
        ctx.store.schedule(&job, now - 60).await.unwrap();

        let known = vec![keys.jobs("email")];
        let outcome = ctx
            .store
            .requeue_due(&keys.scheduled(), &known, now)
            .await
            .unwrap();
        assert_eq!(outcome.as_deref(), Some("ok"));
        assert_eq!(ctx.store.queue_len("email").await.unwrap(), 0);
        assert_eq!(ctx.store.zset_len(&keys.scheduled()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_single_matches_on_id() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        let wanted = build_job("email");
        let other = build_job("email");
        let score = 1_000;
        ctx.store.schedule(&wanted, score).await.unwrap();
        ctx.store.schedule(&other, score).await.unwrap();

        let (deleted, payload) = ctx
            .store
            .delete_single(&keys.scheduled(), score, &wanted.id)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        let removed: Job = serde_json::from_slice(&payload).unwrap();
        assert_eq!(removed.id, wanted.id);
        assert_eq!(ctx.store.zset_len(&keys.scheduled()).await.unwrap(), 1);

        let (deleted, _) = ctx
            .store
            .delete_single(&keys.scheduled(), score, "missing")
            .await
            .unwrap();
        assert_eq!(deleted, 0);
    }

    #[tokio::test]
    async fn requeue_single_dead_clears_failure_state() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        let mut job = build_job("email");
        job.record_failure("boom");
        let died_at = now_epoch_seconds() - 30;
        let payload = job.serialize().unwrap();
        ctx.store
            .conn
            .zadd::<_, _, _, ()>(keys.dead(), payload, died_at)
            .await
            .unwrap();

        let known = vec![keys.jobs("email")];
        let now = now_epoch_seconds();
        let requeued = ctx
            .store
            .requeue_single_dead(&known, now, died_at, &job.id)
            .await
            .unwrap();
        assert_eq!(requeued, 1);

        let revived = ctx.store.next_ready_job("email").await.unwrap().unwrap();
        assert_eq!(revived.id, job.id);
        assert_eq!(revived.fails, 0);
        assert!(revived.err.is_none());
        assert!(revived.failed_at.is_none());
        assert_eq!(revived.enqueued_at, now);
    }

    #[tokio::test]
    async fn requeue_all_dead_moves_batch() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        let died_at = now_epoch_seconds() - 30;
        for _ in 0..3 {
            let mut job = build_job("email");
            job.record_failure("boom");
            let payload = job.serialize().unwrap();
            ctx.store
                .conn
                .zadd::<_, _, _, ()>(keys.dead(), payload, died_at)
                .await
                .unwrap();
        }

        let known = vec![keys.jobs("email")];
        let requeued = ctx
            .store
            .requeue_all_dead(&known, now_epoch_seconds(), 100)
            .await
            .unwrap();
        assert_eq!(requeued, 3);
        assert_eq!(ctx.store.queue_len("email").await.unwrap(), 3);
        assert_eq!(ctx.store.zset_len(&keys.dead()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reenqueue_orphan_returns_job_and_releases_lock() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        ctx.store.enqueue(&build_job("email")).await.unwrap();
        let claimed = fetch_one(&mut ctx, "dead-pool", "email").await.unwrap();

        let tuples = vec![ReenqueueKeys {
            in_progress: keys.in_progress("dead-pool", "email"),
            jobs: keys.jobs("email"),
            lock: keys.lock("email"),
            lock_info: keys.lock_info("email"),
        }];
        let moved = ctx
            .store
            .reenqueue_orphan(&tuples, "dead-pool")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.0, claimed.raw);
        assert_eq!(counter(&mut ctx.store, &keys.lock("email")).await, 0);
        assert_eq!(ctx.store.queue_len("email").await.unwrap(), 1);

        // idempotent once the in-progress list is empty
        assert!(
            ctx.store
                .reenqueue_orphan(&tuples, "dead-pool")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn reap_stale_locks_subtracts_and_clamps() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        ctx.store
            .conn
            .set::<_, _, ()>(keys.lock("email"), 1)
            .await
            .unwrap();
        ctx.store
            .conn
            .hset::<_, _, _, ()>(keys.lock_info("email"), "dead-pool", 2)
            .await
            .unwrap();

        let pairs = vec![(keys.lock("email"), keys.lock_info("email"))];
        let clamped = ctx
            .store
            .reap_stale_locks(&pairs, "dead-pool")
            .await
            .unwrap();
        assert_eq!(clamped, vec![keys.lock("email")]);
        assert_eq!(counter(&mut ctx.store, &keys.lock("email")).await, 0);
        let held: Option<i64> = ctx
            .store
            .conn
            .hget(keys.lock_info("email"), "dead-pool")
            .await
            .unwrap();
        assert_eq!(held, None);

        // a pool with no contribution is a no-op
        let clamped = ctx
            .store
            .reap_stale_locks(&pairs, "other-pool")
            .await
            .unwrap();
        assert!(clamped.is_empty());
        assert_eq!(counter(&mut ctx.store, &keys.lock("email")).await, 0);
    }

    #[tokio::test]
    async fn unknown_pools_reports_unregistered_holders() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        ctx.store
            .conn
            .sadd::<_, _, ()>(keys.worker_pools(), "live-pool")
            .await
            .unwrap();
        ctx.store
            .conn
            .hset::<_, _, _, ()>(keys.lock_info("email"), "live-pool", 1)
            .await
            .unwrap();
        ctx.store
            .conn
            .hset::<_, _, _, ()>(keys.lock_info("email"), "ghost-pool", 1)
            .await
            .unwrap();

        let lock_infos = vec![keys.lock_info("email")];
        let unknown = ctx.store.unknown_pools(&lock_infos).await.unwrap();
        assert_eq!(unknown.len(), 1);
        assert_eq!(
            unknown.get("ghost-pool"),
            Some(&vec![keys.lock_info("email")])
        );
    }

    #[tokio::test]
    async fn remove_dangling_locks_realigns_counter() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        ctx.store
            .conn
            .set::<_, _, ()>(keys.lock("email"), 5)
            .await
            .unwrap();
        ctx.store
            .conn
            .hset::<_, _, _, ()>(keys.lock_info("email"), "pool-1", 2)
            .await
            .unwrap();

        let pairs = vec![(keys.lock("email"), keys.lock_info("email"))];
        let fixed = ctx.store.remove_dangling_locks(&pairs).await.unwrap();
        assert_eq!(fixed, vec![keys.lock("email")]);
        assert_eq!(counter(&mut ctx.store, &keys.lock("email")).await, 2);

        // already aligned: nothing reported
        let fixed = ctx.store.remove_dangling_locks(&pairs).await.unwrap();
        assert!(fixed.is_empty());
    }

    #[tokio::test]
    async fn reaper_lock_requires_matching_token() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        assert!(ctx.store.acquire_reaper_lock("token-a", 60).await.unwrap());
        assert!(!ctx.store.acquire_reaper_lock("token-b", 60).await.unwrap());

        assert!(!ctx.store.release_reaper_lock("token-b").await.unwrap());
        assert!(ctx.store.release_reaper_lock("token-a").await.unwrap());
        assert!(ctx.store.acquire_reaper_lock("token-b", 60).await.unwrap());
    }

    #[tokio::test]
    async fn heartbeat_round_trip() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let fields = vec![
            ("heartbeat_at", "100".to_string()),
            ("job_names", "a,b".to_string()),
        ];
        ctx.store
            .write_heartbeat("pool-1", &fields, 30)
            .await
            .unwrap();

        assert!(ctx.store.heartbeat_exists("pool-1").await.unwrap());
        assert_eq!(ctx.store.worker_pool_ids().await.unwrap(), vec!["pool-1"]);
        let hash = ctx.store.read_heartbeat("pool-1").await.unwrap().unwrap();
        assert_eq!(hash.get("job_names").map(String::as_str), Some("a,b"));

        ctx.store.remove_worker_pool("pool-1").await.unwrap();
        assert!(!ctx.store.heartbeat_exists("pool-1").await.unwrap());
        assert!(ctx.store.worker_pool_ids().await.unwrap().is_empty());
    }
}
