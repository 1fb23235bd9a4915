//! Key-value driver interface
//!
//! The driver is the synchronous, network-facing half of a key-value client.
//! Every call blocks until the store answers. Implementations must be safe to
//! call from all workers at once; connection pooling is their business.

use crate::error::{DriverError, DriverResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// A sorted-set member with its score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

impl ScoredMember {
    pub fn new(member: impl Into<String>, score: f64) -> Self {
        Self {
            member: member.into(),
            score,
        }
    }
}

/// Synchronous key-value store operations.
///
/// Lookups of absent keys, fields or members return `DriverError::NotFound`.
/// Range and collection reads of absent keys return empty collections.
pub trait KvDriver: Send + Sync {
    fn get(&self, key: &str) -> DriverResult<String>;
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> DriverResult<()>;
    /// Set only if the key does not exist; returns whether it was set
    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> DriverResult<bool>;
    /// Returns the number of keys removed
    fn del(&self, key: &str) -> DriverResult<u64>;
    fn keys(&self, pattern: &str) -> DriverResult<Vec<String>>;
    /// Returns false when the key does not exist
    fn expire(&self, key: &str, ttl: Duration) -> DriverResult<bool>;
    fn expire_at(&self, key: &str, at: SystemTime) -> DriverResult<bool>;

    /// Returns true when the field is new
    fn hset(&self, key: &str, field: &str, value: &str) -> DriverResult<bool>;
    fn hget(&self, key: &str, field: &str) -> DriverResult<String>;
    fn hmset(&self, key: &str, entries: &[(String, String)]) -> DriverResult<()>;
    fn hmget(&self, key: &str, fields: &[String]) -> DriverResult<Vec<Option<String>>>;
    fn hgetall(&self, key: &str) -> DriverResult<HashMap<String, String>>;
    fn hdel(&self, key: &str, fields: &[String]) -> DriverResult<u64>;
    fn hincrby(&self, key: &str, field: &str, delta: i64) -> DriverResult<i64>;

    /// Returns the list length after the push
    fn lpush(&self, key: &str, values: &[String]) -> DriverResult<u64>;
    fn rpush(&self, key: &str, values: &[String]) -> DriverResult<u64>;
    fn lpop(&self, key: &str) -> DriverResult<String>;
    fn rpop(&self, key: &str) -> DriverResult<String>;
    fn lrange(&self, key: &str, start: i64, stop: i64) -> DriverResult<Vec<String>>;

    /// Returns the number of members newly added
    fn zadd(&self, key: &str, members: &[ScoredMember]) -> DriverResult<u64>;
    /// Zero-based rank with scores ordered high to low
    fn zrevrank(&self, key: &str, member: &str) -> DriverResult<u64>;
    fn zrevrange(&self, key: &str, start: i64, stop: i64) -> DriverResult<Vec<ScoredMember>>;
    fn zincrby(&self, key: &str, increment: f64, member: &str) -> DriverResult<f64>;
    fn zrem(&self, key: &str, members: &[String]) -> DriverResult<u64>;

    fn sadd(&self, key: &str, members: &[String]) -> DriverResult<u64>;
    fn smembers(&self, key: &str) -> DriverResult<Vec<String>>;
    fn sismember(&self, key: &str, member: &str) -> DriverResult<bool>;
    fn srandmember(&self, key: &str) -> DriverResult<String>;
    fn srem(&self, key: &str, members: &[String]) -> DriverResult<u64>;

    /// Send a batch of operations in one round trip.
    ///
    /// The outer error is a transport-level failure of the whole batch. On
    /// success there is exactly one inner result per op, in op order.
    fn exec_pipeline(&self, ops: &[PipeOp]) -> DriverResult<Vec<DriverResult<PipeValue>>>;
}

/// One sub-operation of a pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum PipeOp {
    Get { key: String },
    Set { key: String, value: String, ttl: Option<Duration> },
    Del { key: String },
    Expire { key: String, ttl: Duration },
    HGet { key: String, field: String },
    HSet { key: String, field: String, value: String },
    HIncrBy { key: String, field: String, delta: i64 },
    LPush { key: String, values: Vec<String> },
    RPush { key: String, values: Vec<String> },
    LRange { key: String, start: i64, stop: i64 },
    SAdd { key: String, members: Vec<String> },
    ZAdd { key: String, members: Vec<ScoredMember> },
    ZIncrBy { key: String, member: String, increment: f64 },
}

impl PipeOp {
    pub fn key(&self) -> &str {
        match self {
            PipeOp::Get { key }
            | PipeOp::Set { key, .. }
            | PipeOp::Del { key }
            | PipeOp::Expire { key, .. }
            | PipeOp::HGet { key, .. }
            | PipeOp::HSet { key, .. }
            | PipeOp::HIncrBy { key, .. }
            | PipeOp::LPush { key, .. }
            | PipeOp::RPush { key, .. }
            | PipeOp::LRange { key, .. }
            | PipeOp::SAdd { key, .. }
            | PipeOp::ZAdd { key, .. }
            | PipeOp::ZIncrBy { key, .. } => key,
        }
    }
}

/// Value produced by one pipeline sub-operation
#[derive(Debug, Clone, PartialEq)]
pub enum PipeValue {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
}

/// Outcome of one pipeline sub-operation, paired with the op that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct PipeResult {
    pub op: PipeOp,
    pub result: DriverResult<PipeValue>,
}

impl PipeResult {
    pub fn value(&self) -> Option<&PipeValue> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&DriverError> {
        self.result.as_ref().err()
    }
}

/// Collects the sub-operations of a pipeline in submission order
#[derive(Debug, Default)]
pub struct Pipeline {
    ops: Vec<PipeOp>,
}

pub(crate) fn strings<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, op: PipeOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn get(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(PipeOp::Get { key: key.into() })
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> &mut Self {
        self.push(PipeOp::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        })
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(PipeOp::Del { key: key.into() })
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.push(PipeOp::Expire { key: key.into(), ttl })
    }

    pub fn hget(&mut self, key: impl Into<String>, field: impl Into<String>) -> &mut Self {
        self.push(PipeOp::HGet {
            key: key.into(),
            field: field.into(),
        })
    }

    pub fn hset(&mut self, key: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.push(PipeOp::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn hincrby(&mut self, key: impl Into<String>, field: impl Into<String>, delta: i64) -> &mut Self {
        self.push(PipeOp::HIncrBy {
            key: key.into(),
            field: field.into(),
            delta,
        })
    }

    pub fn lpush<I, S>(&mut self, key: impl Into<String>, values: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(PipeOp::LPush {
            key: key.into(),
            values: strings(values),
        })
    }

    pub fn rpush<I, S>(&mut self, key: impl Into<String>, values: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(PipeOp::RPush {
            key: key.into(),
            values: strings(values),
        })
    }

    pub fn lrange(&mut self, key: impl Into<String>, start: i64, stop: i64) -> &mut Self {
        self.push(PipeOp::LRange {
            key: key.into(),
            start,
            stop,
        })
    }

    pub fn sadd<I, S>(&mut self, key: impl Into<String>, members: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(PipeOp::SAdd {
            key: key.into(),
            members: strings(members),
        })
    }

    pub fn zadd(&mut self, key: impl Into<String>, members: Vec<ScoredMember>) -> &mut Self {
        self.push(PipeOp::ZAdd {
            key: key.into(),
            members,
        })
    }

    pub fn zincrby(&mut self, key: impl Into<String>, member: impl Into<String>, increment: f64) -> &mut Self {
        self.push(PipeOp::ZIncrBy {
            key: key.into(),
            member: member.into(),
            increment,
        })
    }

    pub fn ops(&self) -> &[PipeOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn into_ops(self) -> Vec<PipeOp> {
        self.ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_keeps_submission_order() {
        let mut pipeline = Pipeline::new();
        pipeline
            .set("a", "1", None)
            .get("a")
            .lpush("l", ["x", "y"])
            .zincrby("z", "m", 1.5);

        let keys: Vec<_> = pipeline.ops().iter().map(PipeOp::key).collect();
        assert_eq!(keys, vec!["a", "a", "l", "z"]);
        assert_eq!(
            pipeline.ops()[2],
            PipeOp::LPush {
                key: "l".to_string(),
                values: vec!["x".to_string(), "y".to_string()],
            }
        );
        assert_eq!(pipeline.len(), 4);
    }

    #[test]
    fn test_pipe_result_accessors() {
        let hit = PipeResult {
            op: PipeOp::Get { key: "a".to_string() },
            result: Ok(PipeValue::Str("1".to_string())),
        };
        let miss = PipeResult {
            op: PipeOp::Get { key: "b".to_string() },
            result: Err(DriverError::NotFound),
        };
        assert_eq!(hit.value(), Some(&PipeValue::Str("1".to_string())));
        assert!(hit.error().is_none());
        assert_eq!(miss.error(), Some(&DriverError::NotFound));
    }
}
