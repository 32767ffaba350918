//! Redis-backed store.
//!
//! Every operation runs as one Lua script so Redis executes it atomically.
//!
//! Key layout, with `{queue}` short for `{prefix}:{queue name}`:
//! - `{prefix}:rl:{window}`: sorted set of request timestamps (score = ms),
//!   shared by every queue since platform limits apply per account
//! - `{queue}:job:{id}`: hash holding one scheduled job
//! - `{queue}:item:{work_item_id}`: id of the pending job for a work item
//! - `{queue}:delayed`, `:active`, `:completed`, `:failed`: sorted sets of
//!   job ids scored by due, claim and finish time respectively

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cadence_common::{IdGenerator, RedisConfig};
use cadence_core::WorkItemId;
use fred::clients::Client as RedisClient;
use fred::error::{Error as RedisError, ErrorKind};
use fred::interfaces::{ClientLike, HashesInterface, KeysInterface, LuaInterface};
use fred::types::config::Config as FredConfig;
use tracing::info;

use super::{QueueCounts, STALLED_ERROR, SharedStore, StoreError, WindowDecision};
use crate::jobs::{JobOutcome, JobState, ScheduleId, ScheduledJob};

const WINDOW_ACQUIRE: &str = r"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local capacity = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. (now - window))
if redis.call('ZCARD', KEYS[1]) >= capacity then
  local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
  local wait = tonumber(oldest[2]) + window + 1 - now
  if wait < 1 then wait = 1 end
  return {0, wait}
end
redis.call('ZADD', KEYS[1], now, ARGV[4])
redis.call('PEXPIRE', KEYS[1], window)
return {1, 0}
";

const WINDOW_COUNT: &str = r"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. (tonumber(ARGV[1]) - tonumber(ARGV[2])))
return redis.call('ZCARD', KEYS[1])
";

const SCHEDULE: &str = r"
local replaced = false
local previous = redis.call('GET', KEYS[1])
if previous and redis.call('ZREM', KEYS[2], previous) == 1 then
  redis.call('DEL', ARGV[6] .. ':job:' .. previous)
  replaced = previous
end
redis.call('HSET', KEYS[3], 'id', ARGV[1], 'workItemId', ARGV[2], 'dueAt', ARGV[3],
  'priority', ARGV[4], 'enqueuedAt', ARGV[5], 'state', 'delayed')
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
redis.call('SET', KEYS[1], ARGV[1])
return replaced
";

const CANCEL: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
local item = redis.call('HGET', KEYS[2], 'workItemId')
redis.call('DEL', KEYS[2])
if item then
  local itemKey = ARGV[2] .. ':item:' .. item
  if redis.call('GET', itemKey) == ARGV[1] then
    redis.call('DEL', itemKey)
  end
end
return 1
";

const CANCEL_WORK_ITEM: &str = r"
local id = redis.call('GET', KEYS[1])
if not id or redis.call('ZREM', KEYS[2], id) == 0 then
  return false
end
redis.call('DEL', ARGV[1] .. ':job:' .. id)
redis.call('DEL', KEYS[1])
return id
";

const CLAIM_DUE: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'WITHSCORES')
local candidates = {}
for i = 1, #due, 2 do
  local priority = redis.call('HGET', ARGV[3] .. ':job:' .. due[i], 'priority')
  table.insert(candidates, {id = due[i], due = tonumber(due[i + 1]), priority = tonumber(priority) or 255})
end
table.sort(candidates, function(a, b)
  if a.due ~= b.due then return a.due < b.due end
  if a.priority ~= b.priority then return a.priority < b.priority end
  return a.id < b.id
end)
local ids = {}
for i = 1, math.min(tonumber(ARGV[2]), #candidates) do
  ids[i] = candidates[i].id
end
for _, id in ipairs(ids) do
  local jobKey = ARGV[3] .. ':job:' .. id
  redis.call('ZREM', KEYS[1], id)
  redis.call('ZADD', KEYS[2], ARGV[1], id)
  redis.call('HSET', jobKey, 'state', 'active', 'claimedAt', ARGV[1])
  local item = redis.call('HGET', jobKey, 'workItemId')
  if item then
    local itemKey = ARGV[3] .. ':item:' .. item
    if redis.call('GET', itemKey) == id then
      redis.call('DEL', itemKey)
    end
  end
end
return ids
";

const FINISH: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
redis.call('HSET', KEYS[3], 'state', ARGV[3], 'finishedAt', ARGV[2])
if ARGV[4] ~= '' then
  redis.call('HSET', KEYS[3], 'error', ARGV[4])
end
return 1
";

const REAP_STALLED: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('ZADD', KEYS[2], ARGV[2], id)
  redis.call('HSET', ARGV[3] .. ':job:' .. id, 'state', 'failed', 'finishedAt', ARGV[2], 'error', ARGV[4])
end
return ids
";

const PURGE_FINISHED: &str = r"
local function purge(key, before)
  local ids = redis.call('ZRANGEBYSCORE', key, '-inf', '(' .. before)
  for _, id in ipairs(ids) do
    redis.call('DEL', ARGV[3] .. ':job:' .. id)
  end
  redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. before)
  return #ids
end
return purge(KEYS[1], ARGV[1]) + purge(KEYS[2], ARGV[2])
";

const COUNTS: &str = r"
local waiting = redis.call('ZCOUNT', KEYS[1], '-inf', ARGV[1])
local pending = redis.call('ZCARD', KEYS[1])
return {waiting, redis.call('ZCARD', KEYS[2]), redis.call('ZCARD', KEYS[3]),
  redis.call('ZCARD', KEYS[4]), pending - waiting}
";

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        match err.kind() {
            ErrorKind::IO | ErrorKind::Timeout | ErrorKind::Canceled | ErrorKind::Backpressure => {
                Self::Unavailable(err.to_string())
            }
            _ => Self::Redis(err.to_string()),
        }
    }
}

/// [`SharedStore`] on a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    redis: Arc<RedisClient>,
    prefix: String,
    queue_prefix: String,
    ids: IdGenerator,
}

impl RedisStore {
    /// Wrap an already connected client. Jobs live under `{prefix}:{queue}`,
    /// rate windows under `{prefix}`.
    pub fn new(redis: Arc<RedisClient>, prefix: impl Into<String>, queue: &str) -> Self {
        let prefix = prefix.into();
        Self {
            redis,
            queue_prefix: format!("{prefix}:{queue}"),
            prefix,
            ids: IdGenerator::new(),
        }
    }

    /// Connect to the configured Redis server for one queue.
    pub async fn connect(config: &RedisConfig, queue: &str) -> Result<Self, StoreError> {
        let fred_config = FredConfig::from_url(&config.url)?;
        let client = RedisClient::new(fred_config, None, None, None);
        client.connect();
        client.wait_for_connect().await?;
        info!(prefix = %config.prefix, queue = %queue, "Connected to Redis store");
        Ok(Self::new(Arc::new(client), config.prefix.clone(), queue))
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.queue_prefix)
    }

    fn window_key(&self, key: &str) -> String {
        format!("{}:rl:{key}", self.prefix)
    }

    fn job_key(&self, id: &ScheduleId) -> String {
        format!("{}:job:{id}", self.queue_prefix)
    }

    fn item_key(&self, work_item_id: &WorkItemId) -> String {
        format!("{}:item:{work_item_id}", self.queue_prefix)
    }

    fn state_key(&self, state: JobState) -> String {
        self.key(state.as_str())
    }

    async fn load_jobs(&self, ids: Vec<String>) -> Result<Vec<ScheduledJob>, StoreError> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.get_job(&ScheduleId::new(id)).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, StoreError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Serialization(format!("job hash missing field {name}")))
}

fn parse_ms(fields: &HashMap<String, String>, name: &str) -> Result<Option<i64>, StoreError> {
    fields
        .get(name)
        .map(|value| {
            value
                .parse::<i64>()
                .map_err(|e| StoreError::Serialization(format!("job field {name}: {e}")))
        })
        .transpose()
}

fn job_from_fields(fields: &HashMap<String, String>) -> Result<ScheduledJob, StoreError> {
    let state = JobState::parse(field(fields, "state")?)
        .ok_or_else(|| StoreError::Serialization("unknown job state".to_string()))?;
    let priority = field(fields, "priority")?
        .parse::<u8>()
        .map_err(|e| StoreError::Serialization(format!("job field priority: {e}")))?;

    Ok(ScheduledJob {
        id: ScheduleId::new(field(fields, "id")?),
        work_item_id: WorkItemId::new(field(fields, "workItemId")?),
        due_at_ms: parse_ms(fields, "dueAt")?.unwrap_or_default(),
        priority,
        enqueued_at_ms: parse_ms(fields, "enqueuedAt")?.unwrap_or_default(),
        state,
        claimed_at_ms: parse_ms(fields, "claimedAt")?,
        finished_at_ms: parse_ms(fields, "finishedAt")?,
        error: fields.get("error").cloned(),
    })
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn window_acquire(
        &self,
        key: &str,
        capacity: u32,
        window_ms: u64,
        now_ms: i64,
    ) -> Result<WindowDecision, StoreError> {
        let member = format!("{now_ms}:{}", self.ids.generate_token());
        let reply: Vec<i64> = self
            .redis
            .eval(
                WINDOW_ACQUIRE,
                vec![self.window_key(key)],
                vec![
                    now_ms.to_string(),
                    window_ms.to_string(),
                    capacity.max(1).to_string(),
                    member,
                ],
            )
            .await?;

        match reply.as_slice() {
            [1, ..] => Ok(WindowDecision::Allowed),
            [0, wait_ms] => Ok(WindowDecision::Limited {
                wait_ms: u64::try_from(*wait_ms).unwrap_or(1).max(1),
            }),
            other => Err(StoreError::Serialization(format!(
                "unexpected window reply: {other:?}"
            ))),
        }
    }

    async fn window_count(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: i64,
    ) -> Result<u32, StoreError> {
        let count: u32 = self
            .redis
            .eval(
                WINDOW_COUNT,
                vec![self.window_key(key)],
                vec![now_ms.to_string(), window_ms.to_string()],
            )
            .await?;
        Ok(count)
    }

    async fn window_clear(&self, key: &str) -> Result<(), StoreError> {
        let _: i64 = self.redis.del(self.window_key(key)).await?;
        Ok(())
    }

    async fn schedule(&self, job: &ScheduledJob) -> Result<Option<ScheduleId>, StoreError> {
        let replaced: Option<String> = self
            .redis
            .eval(
                SCHEDULE,
                vec![
                    self.item_key(&job.work_item_id),
                    self.state_key(JobState::Delayed),
                    self.job_key(&job.id),
                ],
                vec![
                    job.id.to_string(),
                    job.work_item_id.to_string(),
                    job.due_at_ms.to_string(),
                    job.priority.to_string(),
                    job.enqueued_at_ms.to_string(),
                    self.queue_prefix.clone(),
                ],
            )
            .await?;
        Ok(replaced.map(ScheduleId::new))
    }

    async fn cancel(&self, id: &ScheduleId) -> Result<bool, StoreError> {
        let removed: i64 = self
            .redis
            .eval(
                CANCEL,
                vec![self.state_key(JobState::Delayed), self.job_key(id)],
                vec![id.to_string(), self.queue_prefix.clone()],
            )
            .await?;
        Ok(removed == 1)
    }

    async fn cancel_work_item(
        &self,
        work_item_id: &WorkItemId,
    ) -> Result<Option<ScheduleId>, StoreError> {
        let cancelled: Option<String> = self
            .redis
            .eval(
                CANCEL_WORK_ITEM,
                vec![
                    self.item_key(work_item_id),
                    self.state_key(JobState::Delayed),
                ],
                vec![self.queue_prefix.clone()],
            )
            .await?;
        Ok(cancelled.map(ScheduleId::new))
    }

    async fn claim_due(&self, now_ms: i64, limit: usize) -> Result<Vec<ScheduledJob>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = self
            .redis
            .eval(
                CLAIM_DUE,
                vec![
                    self.state_key(JobState::Delayed),
                    self.state_key(JobState::Active),
                ],
                vec![now_ms.to_string(), limit.to_string(), self.queue_prefix.clone()],
            )
            .await?;
        self.load_jobs(ids).await
    }

    async fn finish(
        &self,
        id: &ScheduleId,
        outcome: &JobOutcome,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let moved: i64 = self
            .redis
            .eval(
                FINISH,
                vec![
                    self.state_key(JobState::Active),
                    self.state_key(outcome.state()),
                    self.job_key(id),
                ],
                vec![
                    id.to_string(),
                    now_ms.to_string(),
                    outcome.state().as_str().to_string(),
                    outcome.error().unwrap_or_default().to_string(),
                ],
            )
            .await?;
        Ok(moved == 1)
    }

    async fn reap_stalled(
        &self,
        claimed_before_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        let ids: Vec<String> = self
            .redis
            .eval(
                REAP_STALLED,
                vec![
                    self.state_key(JobState::Active),
                    self.state_key(JobState::Failed),
                ],
                vec![
                    claimed_before_ms.to_string(),
                    now_ms.to_string(),
                    self.queue_prefix.clone(),
                    STALLED_ERROR.to_string(),
                ],
            )
            .await?;
        self.load_jobs(ids).await
    }

    async fn purge_finished(
        &self,
        completed_before_ms: i64,
        failed_before_ms: i64,
    ) -> Result<u64, StoreError> {
        let purged: u64 = self
            .redis
            .eval(
                PURGE_FINISHED,
                vec![
                    self.state_key(JobState::Completed),
                    self.state_key(JobState::Failed),
                ],
                vec![
                    completed_before_ms.to_string(),
                    failed_before_ms.to_string(),
                    self.queue_prefix.clone(),
                ],
            )
            .await?;
        Ok(purged)
    }

    async fn counts(&self, now_ms: i64) -> Result<QueueCounts, StoreError> {
        let reply: Vec<u64> = self
            .redis
            .eval(
                COUNTS,
                vec![
                    self.state_key(JobState::Delayed),
                    self.state_key(JobState::Active),
                    self.state_key(JobState::Completed),
                    self.state_key(JobState::Failed),
                ],
                vec![now_ms.to_string()],
            )
            .await?;

        match reply.as_slice() {
            &[waiting, active, completed, failed, delayed] => Ok(QueueCounts {
                waiting,
                active,
                completed,
                failed,
                delayed,
            }),
            other => Err(StoreError::Serialization(format!(
                "unexpected counts reply: {other:?}"
            ))),
        }
    }

    async fn get_job(&self, id: &ScheduleId) -> Result<Option<ScheduledJob>, StoreError> {
        let fields: HashMap<String, String> = self.redis.hgetall(self.job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        job_from_fields(&fields).map(Some)
    }
}
