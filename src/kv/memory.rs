//! In-memory key-value driver
//!
//! A thread-safe keyspace behind one mutex, speaking the same data model a
//! networked key-value server does: strings with expiry, hashes, lists, sets
//! and sorted sets. Used as a test double and by the binaries; an optional
//! per-call latency simulates the network round trip.

use super::driver::{KvDriver, PipeOp, PipeValue, ScoredMember};
use crate::config::Endpoint;
use crate::error::{DriverError, DriverResult};
use crate::pool::ConnectionPool;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    Set(HashSet<String>),
    ZSet(HashMap<String, f64>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::Hash(hash) => hash.is_empty(),
            Value::List(list) => list.is_empty(),
            Value::Set(set) => set.is_empty(),
            Value::ZSet(zset) => zset.is_empty(),
        }
    }
}

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn wrong_type(key: &str) -> DriverError {
    DriverError::WrongType { key: key.to_string() }
}

/// Absolute expiry for a relative TTL. A TTL past the clock's range is an
/// argument error.
fn deadline(ttl: Duration) -> DriverResult<Instant> {
    Instant::now()
        .checked_add(ttl)
        .ok_or_else(|| DriverError::InvalidArgument(format!("expiry of {}s is out of range", ttl.as_secs())))
}

/// Clamp an inclusive, possibly negative index range to `0..len`.
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Glob match supporting `*` and `?`.
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

fn ranked(zset: &HashMap<String, f64>) -> Vec<ScoredMember> {
    let mut members: Vec<ScoredMember> = zset
        .iter()
        .map(|(member, score)| ScoredMember::new(member.clone(), *score))
        .collect();
    members.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| b.member.cmp(&a.member)));
    members
}

#[derive(Default)]
struct Keyspace {
    entries: HashMap<String, Slot>,
}

impl Keyspace {
    /// Live slot for `key`, evicting it first if it has expired.
    fn slot(&mut self, key: &str) -> Option<&mut Slot> {
        if self
            .entries
            .get(key)
            .is_some_and(|slot| slot.is_expired(Instant::now()))
        {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn slot_or_insert(&mut self, key: &str, empty: fn() -> Value) -> &mut Slot {
        self.slot(key);
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(empty()))
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(|slot| slot.value.is_empty()) {
            self.entries.remove(key);
        }
    }

    fn string(&mut self, key: &str) -> DriverResult<Option<&mut String>> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot { value: Value::Str(s), .. }) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash(&mut self, key: &str) -> DriverResult<Option<&mut HashMap<String, String>>> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot { value: Value::Hash(h), .. }) => Ok(Some(h)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash_mut(&mut self, key: &str) -> DriverResult<&mut HashMap<String, String>> {
        match &mut self.slot_or_insert(key, || Value::Hash(HashMap::new())).value {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type(key)),
        }
    }

    fn list(&mut self, key: &str) -> DriverResult<Option<&mut VecDeque<String>>> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot { value: Value::List(l), .. }) => Ok(Some(l)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn list_mut(&mut self, key: &str) -> DriverResult<&mut VecDeque<String>> {
        match &mut self.slot_or_insert(key, || Value::List(VecDeque::new())).value {
            Value::List(l) => Ok(l),
            _ => Err(wrong_type(key)),
        }
    }

    fn set_of(&mut self, key: &str) -> DriverResult<Option<&mut HashSet<String>>> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot { value: Value::Set(s), .. }) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set_mut(&mut self, key: &str) -> DriverResult<&mut HashSet<String>> {
        match &mut self.slot_or_insert(key, || Value::Set(HashSet::new())).value {
            Value::Set(s) => Ok(s),
            _ => Err(wrong_type(key)),
        }
    }

    fn zset(&mut self, key: &str) -> DriverResult<Option<&mut HashMap<String, f64>>> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot { value: Value::ZSet(z), .. }) => Ok(Some(z)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn zset_mut(&mut self, key: &str) -> DriverResult<&mut HashMap<String, f64>> {
        match &mut self.slot_or_insert(key, || Value::ZSet(HashMap::new())).value {
            Value::ZSet(z) => Ok(z),
            _ => Err(wrong_type(key)),
        }
    }

    fn get(&mut self, key: &str) -> DriverResult<String> {
        self.string(key)?.cloned().ok_or(DriverError::NotFound)
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> DriverResult<()> {
        let slot = Slot {
            value: Value::Str(value.to_string()),
            expires_at: ttl.map(deadline).transpose()?,
        };
        self.entries.insert(key.to_string(), slot);
        Ok(())
    }

    fn set_nx(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> DriverResult<bool> {
        if self.slot(key).is_some() {
            return Ok(false);
        }
        self.set(key, value, ttl)?;
        Ok(true)
    }

    fn del(&mut self, key: &str) -> u64 {
        self.slot(key);
        u64::from(self.entries.remove(key).is_some())
    }

    fn keys(&mut self, pattern: &str) -> Vec<String> {
        let now = Instant::now();
        self.entries.retain(|_, slot| !slot.is_expired(now));
        let mut keys: Vec<String> = self
            .entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> DriverResult<bool> {
        match self.slot(key) {
            None => Ok(false),
            Some(_) if ttl.is_zero() => {
                self.entries.remove(key);
                Ok(true)
            }
            Some(slot) => {
                slot.expires_at = Some(deadline(ttl)?);
                Ok(true)
            }
        }
    }

    fn expire_at(&mut self, key: &str, at: SystemTime) -> DriverResult<bool> {
        let ttl = at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO);
        self.expire(key, ttl)
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) -> DriverResult<bool> {
        let hash = self.hash_mut(key)?;
        Ok(hash.insert(field.to_string(), value.to_string()).is_none())
    }

    fn hget(&mut self, key: &str, field: &str) -> DriverResult<String> {
        self.hash(key)?
            .and_then(|hash| hash.get(field).cloned())
            .ok_or(DriverError::NotFound)
    }

    fn hmset(&mut self, key: &str, entries: &[(String, String)]) -> DriverResult<()> {
        let hash = self.hash_mut(key)?;
        hash.extend(entries.iter().cloned());
        self.drop_if_empty(key);
        Ok(())
    }

    fn hmget(&mut self, key: &str, fields: &[String]) -> DriverResult<Vec<Option<String>>> {
        let hash = self.hash(key)?;
        Ok(fields
            .iter()
            .map(|field| hash.as_ref().and_then(|hash| hash.get(field).cloned()))
            .collect())
    }

    fn hgetall(&mut self, key: &str) -> DriverResult<HashMap<String, String>> {
        Ok(self.hash(key)?.map(|hash| hash.clone()).unwrap_or_default())
    }

    fn hdel(&mut self, key: &str, fields: &[String]) -> DriverResult<u64> {
        let removed = match self.hash(key)? {
            None => 0,
            Some(hash) => fields.iter().filter(|field| hash.remove(*field).is_some()).count() as u64,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> DriverResult<i64> {
        let hash = self.hash_mut(key)?;
        let current = match hash.get(field) {
            None => 0,
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                DriverError::InvalidArgument("hash value is not an integer".to_string())
            })?,
        };
        let next = current.checked_add(delta).ok_or_else(|| {
            DriverError::InvalidArgument("increment or decrement would overflow".to_string())
        })?;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    fn push(&mut self, key: &str, values: &[String], front: bool) -> DriverResult<u64> {
        let list = self.list_mut(key)?;
        for value in values {
            if front {
                list.push_front(value.clone());
            } else {
                list.push_back(value.clone());
            }
        }
        let len = list.len() as u64;
        self.drop_if_empty(key);
        Ok(len)
    }

    fn pop(&mut self, key: &str, front: bool) -> DriverResult<String> {
        let popped = match self.list(key)? {
            None => None,
            Some(list) if front => list.pop_front(),
            Some(list) => list.pop_back(),
        };
        self.drop_if_empty(key);
        popped.ok_or(DriverError::NotFound)
    }

    fn lrange(&mut self, key: &str, start: i64, stop: i64) -> DriverResult<Vec<String>> {
        let Some(list) = self.list(key)? else {
            return Ok(Vec::new());
        };
        Ok(match normalize_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    fn zadd(&mut self, key: &str, members: &[ScoredMember]) -> DriverResult<u64> {
        let zset = self.zset_mut(key)?;
        let added = members
            .iter()
            .filter(|m| zset.insert(m.member.clone(), m.score).is_none())
            .count() as u64;
        self.drop_if_empty(key);
        Ok(added)
    }

    fn zrevrank(&mut self, key: &str, member: &str) -> DriverResult<u64> {
        let zset = self.zset(key)?.ok_or(DriverError::NotFound)?;
        ranked(zset)
            .iter()
            .position(|m| m.member == member)
            .map(|rank| rank as u64)
            .ok_or(DriverError::NotFound)
    }

    fn zrevrange(&mut self, key: &str, start: i64, stop: i64) -> DriverResult<Vec<ScoredMember>> {
        let Some(zset) = self.zset(key)? else {
            return Ok(Vec::new());
        };
        let members = ranked(zset);
        Ok(match normalize_range(members.len(), start, stop) {
            Some((from, to)) => members[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    fn zincrby(&mut self, key: &str, increment: f64, member: &str) -> DriverResult<f64> {
        let zset = self.zset_mut(key)?;
        let score = zset.entry(member.to_string()).or_insert(0.0);
        *score += increment;
        Ok(*score)
    }

    fn zrem(&mut self, key: &str, members: &[String]) -> DriverResult<u64> {
        let removed = match self.zset(key)? {
            None => 0,
            Some(zset) => members.iter().filter(|m| zset.remove(*m).is_some()).count() as u64,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn sadd(&mut self, key: &str, members: &[String]) -> DriverResult<u64> {
        let set = self.set_mut(key)?;
        let added = members.iter().filter(|m| set.insert((*m).clone())).count() as u64;
        self.drop_if_empty(key);
        Ok(added)
    }

    fn smembers(&mut self, key: &str) -> DriverResult<Vec<String>> {
        let mut members: Vec<String> = self
            .set_of(key)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    fn sismember(&mut self, key: &str, member: &str) -> DriverResult<bool> {
        Ok(self.set_of(key)?.is_some_and(|set| set.contains(member)))
    }

    fn srandmember(&mut self, key: &str) -> DriverResult<String> {
        // HashSet iteration order is randomized per process
        self.set_of(key)?
            .and_then(|set| set.iter().next().cloned())
            .ok_or(DriverError::NotFound)
    }

    fn srem(&mut self, key: &str, members: &[String]) -> DriverResult<u64> {
        let removed = match self.set_of(key)? {
            None => 0,
            Some(set) => members.iter().filter(|m| set.remove(*m)).count() as u64,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn apply(&mut self, op: &PipeOp) -> DriverResult<PipeValue> {
        match op {
            PipeOp::Get { key } => self.get(key).map(PipeValue::Str),
            PipeOp::Set { key, value, ttl } => self.set(key, value, *ttl).map(|()| PipeValue::Unit),
            PipeOp::Del { key } => Ok(PipeValue::Int(self.del(key) as i64)),
            PipeOp::Expire { key, ttl } => self.expire(key, *ttl).map(PipeValue::Bool),
            PipeOp::HGet { key, field } => self.hget(key, field).map(PipeValue::Str),
            PipeOp::HSet { key, field, value } => self.hset(key, field, value).map(PipeValue::Bool),
            PipeOp::HIncrBy { key, field, delta } => {
                self.hincrby(key, field, *delta).map(PipeValue::Int)
            }
            PipeOp::LPush { key, values } => {
                self.push(key, values, true).map(|len| PipeValue::Int(len as i64))
            }
            PipeOp::RPush { key, values } => {
                self.push(key, values, false).map(|len| PipeValue::Int(len as i64))
            }
            PipeOp::LRange { key, start, stop } => {
                self.lrange(key, *start, *stop).map(PipeValue::List)
            }
            PipeOp::SAdd { key, members } => {
                self.sadd(key, members).map(|n| PipeValue::Int(n as i64))
            }
            PipeOp::ZAdd { key, members } => {
                self.zadd(key, members).map(|n| PipeValue::Int(n as i64))
            }
            PipeOp::ZIncrBy { key, member, increment } => {
                self.zincrby(key, *increment, member).map(PipeValue::Float)
            }
        }
    }
}

/// Thread-safe in-memory key-value driver
#[derive(Default)]
pub struct MemoryKv {
    keyspace: Mutex<Keyspace>,
    latency: Option<Duration>,
    pool: Option<ConnectionPool>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a driver that sleeps for `latency` on every round trip
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Allow at most `pool_size` round trips in flight at once
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool = Some(ConnectionPool::new(pool_size));
        self
    }

    /// Driver factory for `KvClient::connect`
    pub fn connect(endpoint: &Endpoint, pool_size: usize) -> DriverResult<Arc<dyn KvDriver>> {
        debug!(endpoint = %endpoint.authority(), pool_size, "in-memory key-value driver connected");
        Ok(Arc::new(Self::new().with_pool_size(pool_size)))
    }

    pub fn pool(&self) -> Option<&ConnectionPool> {
        self.pool.as_ref()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.keyspace
            .lock()
            .entries
            .values()
            .filter(|slot| !slot.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn round_trip(&self) -> parking_lot::MutexGuard<'_, Keyspace> {
        let _connection = self.pool.as_ref().map(ConnectionPool::acquire);
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }
        self.keyspace.lock()
    }
}

impl KvDriver for MemoryKv {
    fn get(&self, key: &str) -> DriverResult<String> {
        self.round_trip().get(key)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> DriverResult<()> {
        self.round_trip().set(key, value, ttl)
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> DriverResult<bool> {
        self.round_trip().set_nx(key, value, ttl)
    }

    fn del(&self, key: &str) -> DriverResult<u64> {
        Ok(self.round_trip().del(key))
    }

    fn keys(&self, pattern: &str) -> DriverResult<Vec<String>> {
        Ok(self.round_trip().keys(pattern))
    }

    fn expire(&self, key: &str, ttl: Duration) -> DriverResult<bool> {
        self.round_trip().expire(key, ttl)
    }

    fn expire_at(&self, key: &str, at: SystemTime) -> DriverResult<bool> {
        self.round_trip().expire_at(key, at)
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> DriverResult<bool> {
        self.round_trip().hset(key, field, value)
    }

    fn hget(&self, key: &str, field: &str) -> DriverResult<String> {
        self.round_trip().hget(key, field)
    }

    fn hmset(&self, key: &str, entries: &[(String, String)]) -> DriverResult<()> {
        self.round_trip().hmset(key, entries)
    }

    fn hmget(&self, key: &str, fields: &[String]) -> DriverResult<Vec<Option<String>>> {
        self.round_trip().hmget(key, fields)
    }

    fn hgetall(&self, key: &str) -> DriverResult<HashMap<String, String>> {
        self.round_trip().hgetall(key)
    }

    fn hdel(&self, key: &str, fields: &[String]) -> DriverResult<u64> {
        self.round_trip().hdel(key, fields)
    }

    fn hincrby(&self, key: &str, field: &str, delta: i64) -> DriverResult<i64> {
        self.round_trip().hincrby(key, field, delta)
    }

    fn lpush(&self, key: &str, values: &[String]) -> DriverResult<u64> {
        self.round_trip().push(key, values, true)
    }

    fn rpush(&self, key: &str, values: &[String]) -> DriverResult<u64> {
        self.round_trip().push(key, values, false)
    }

    fn lpop(&self, key: &str) -> DriverResult<String> {
        self.round_trip().pop(key, true)
    }

    fn rpop(&self, key: &str) -> DriverResult<String> {
        self.round_trip().pop(key, false)
    }

    fn lrange(&self, key: &str, start: i64, stop: i64) -> DriverResult<Vec<String>> {
        self.round_trip().lrange(key, start, stop)
    }

    fn zadd(&self, key: &str, members: &[ScoredMember]) -> DriverResult<u64> {
        self.round_trip().zadd(key, members)
    }

    fn zrevrank(&self, key: &str, member: &str) -> DriverResult<u64> {
        self.round_trip().zrevrank(key, member)
    }

    fn zrevrange(&self, key: &str, start: i64, stop: i64) -> DriverResult<Vec<ScoredMember>> {
        self.round_trip().zrevrange(key, start, stop)
    }

    fn zincrby(&self, key: &str, increment: f64, member: &str) -> DriverResult<f64> {
        self.round_trip().zincrby(key, increment, member)
    }

    fn zrem(&self, key: &str, members: &[String]) -> DriverResult<u64> {
        self.round_trip().zrem(key, members)
    }

    fn sadd(&self, key: &str, members: &[String]) -> DriverResult<u64> {
        self.round_trip().sadd(key, members)
    }

    fn smembers(&self, key: &str) -> DriverResult<Vec<String>> {
        self.round_trip().smembers(key)
    }

    fn sismember(&self, key: &str, member: &str) -> DriverResult<bool> {
        self.round_trip().sismember(key, member)
    }

    fn srandmember(&self, key: &str) -> DriverResult<String> {
        self.round_trip().srandmember(key)
    }

    fn srem(&self, key: &str, members: &[String]) -> DriverResult<u64> {
        self.round_trip().srem(key, members)
    }

    fn exec_pipeline(&self, ops: &[PipeOp]) -> DriverResult<Vec<DriverResult<PipeValue>>> {
        let mut keyspace = self.round_trip();
        Ok(ops.iter().map(|op| keyspace.apply(op)).collect())
    }
}
