//! Key-value commands
//!
//! One variant per operation, each carrying only what that operation needs
//! plus a callback typed by the operation's natural result.

use super::driver::{KvDriver, PipeOp, PipeResult, PipeValue, Pipeline, ScoredMember};
use crate::engine::{call_driver, Command, Delivery};
use crate::error::{DriverError, DriverResult};
use crate::reply::{Callback, Reply};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

/// Caller-supplied function that fills a pipeline with sub-operations
pub type PipelineFn = Box<dyn FnOnce(&mut Pipeline) -> DriverResult<()> + Send + 'static>;

pub enum KvCommand {
    Get { key: String, callback: Callback<String> },
    Set { key: String, value: String, ttl: Option<Duration>, callback: Callback<()> },
    SetNx { key: String, value: String, ttl: Option<Duration>, callback: Callback<bool> },
    Del { key: String, callback: Callback<u64> },
    Keys { pattern: String, callback: Callback<Vec<String>> },
    Expire { key: String, ttl: Duration, callback: Callback<bool> },
    ExpireAt { key: String, at: SystemTime, callback: Callback<bool> },

    HSet { key: String, field: String, value: String, callback: Callback<bool> },
    HGet { key: String, field: String, callback: Callback<String> },
    HMSet { key: String, entries: Vec<(String, String)>, callback: Callback<()> },
    HMGet { key: String, fields: Vec<String>, callback: Callback<Vec<Option<String>>> },
    HGetAll { key: String, callback: Callback<HashMap<String, String>> },
    HDel { key: String, fields: Vec<String>, callback: Callback<u64> },
    HIncrBy { key: String, field: String, delta: i64, callback: Callback<i64> },

    LPush { key: String, values: Vec<String>, callback: Callback<u64> },
    RPush { key: String, values: Vec<String>, callback: Callback<u64> },
    LPop { key: String, callback: Callback<String> },
    RPop { key: String, callback: Callback<String> },
    LRange { key: String, start: i64, stop: i64, callback: Callback<Vec<String>> },

    ZAdd { key: String, members: Vec<ScoredMember>, callback: Callback<u64> },
    ZRevRank { key: String, member: String, callback: Callback<u64> },
    ZRevRange { key: String, start: i64, stop: i64, callback: Callback<Vec<ScoredMember>> },
    ZIncrBy { key: String, member: String, increment: f64, callback: Callback<f64> },
    ZRem { key: String, members: Vec<String>, callback: Callback<u64> },

    SAdd { key: String, members: Vec<String>, callback: Callback<u64> },
    SMembers { key: String, callback: Callback<Vec<String>> },
    SIsMember { key: String, member: String, callback: Callback<bool> },
    SRandMember { key: String, callback: Callback<String> },
    SRem { key: String, members: Vec<String>, callback: Callback<u64> },

    Pipeline { build: PipelineFn, callback: Callback<Vec<PipeResult>> },
}

/// Pair each op with its result. The pipeline takes the classification of
/// its first failing sub-operation.
fn pipeline_reply(ops: Vec<PipeOp>, results: Vec<DriverResult<PipeValue>>) -> Reply<Vec<PipeResult>> {
    if results.len() != ops.len() {
        let err = DriverError::Execution(format!(
            "pipeline returned {} results for {} operations",
            results.len(),
            ops.len()
        ));
        return Reply::new("", Vec::new(), Some(err));
    }

    let first_error = results.iter().find_map(|result| result.as_ref().err()).cloned();
    let outcomes = ops
        .into_iter()
        .zip(results)
        .map(|(op, result)| PipeResult { op, result })
        .collect();
    Reply::new("", outcomes, first_error)
}

fn run_pipeline(driver: &dyn KvDriver, build: PipelineFn) -> Reply<Vec<PipeResult>> {
    let mut pipeline = Pipeline::new();
    if let Err(err) = call_driver(|| build(&mut pipeline)) {
        return Reply::new("", Vec::new(), Some(err));
    }

    let ops = pipeline.into_ops();
    match call_driver(|| driver.exec_pipeline(&ops)) {
        Ok(results) => pipeline_reply(ops, results),
        Err(err) => Reply::new("", Vec::new(), Some(err)),
    }
}

impl Command for KvCommand {
    type Driver = dyn KvDriver;

    fn kind(&self) -> &'static str {
        match self {
            KvCommand::Get { .. } => "get",
            KvCommand::Set { .. } => "set",
            KvCommand::SetNx { .. } => "setnx",
            KvCommand::Del { .. } => "del",
            KvCommand::Keys { .. } => "keys",
            KvCommand::Expire { .. } => "expire",
            KvCommand::ExpireAt { .. } => "expireat",
            KvCommand::HSet { .. } => "hset",
            KvCommand::HGet { .. } => "hget",
            KvCommand::HMSet { .. } => "hmset",
            KvCommand::HMGet { .. } => "hmget",
            KvCommand::HGetAll { .. } => "hgetall",
            KvCommand::HDel { .. } => "hdel",
            KvCommand::HIncrBy { .. } => "hincrby",
            KvCommand::LPush { .. } => "lpush",
            KvCommand::RPush { .. } => "rpush",
            KvCommand::LPop { .. } => "lpop",
            KvCommand::RPop { .. } => "rpop",
            KvCommand::LRange { .. } => "lrange",
            KvCommand::ZAdd { .. } => "zadd",
            KvCommand::ZRevRank { .. } => "zrevrank",
            KvCommand::ZRevRange { .. } => "zrevrange",
            KvCommand::ZIncrBy { .. } => "zincrby",
            KvCommand::ZRem { .. } => "zrem",
            KvCommand::SAdd { .. } => "sadd",
            KvCommand::SMembers { .. } => "smembers",
            KvCommand::SIsMember { .. } => "sismember",
            KvCommand::SRandMember { .. } => "srandmember",
            KvCommand::SRem { .. } => "srem",
            KvCommand::Pipeline { .. } => "pipeline",
        }
    }

    fn target(&self) -> &str {
        match self {
            KvCommand::Keys { pattern, .. } => pattern,
            KvCommand::Pipeline { .. } => "",
            KvCommand::Get { key, .. }
            | KvCommand::Set { key, .. }
            | KvCommand::SetNx { key, .. }
            | KvCommand::Del { key, .. }
            | KvCommand::Expire { key, .. }
            | KvCommand::ExpireAt { key, .. }
            | KvCommand::HSet { key, .. }
            | KvCommand::HGet { key, .. }
            | KvCommand::HMSet { key, .. }
            | KvCommand::HMGet { key, .. }
            | KvCommand::HGetAll { key, .. }
            | KvCommand::HDel { key, .. }
            | KvCommand::HIncrBy { key, .. }
            | KvCommand::LPush { key, .. }
            | KvCommand::RPush { key, .. }
            | KvCommand::LPop { key, .. }
            | KvCommand::RPop { key, .. }
            | KvCommand::LRange { key, .. }
            | KvCommand::ZAdd { key, .. }
            | KvCommand::ZRevRank { key, .. }
            | KvCommand::ZRevRange { key, .. }
            | KvCommand::ZIncrBy { key, .. }
            | KvCommand::ZRem { key, .. }
            | KvCommand::SAdd { key, .. }
            | KvCommand::SMembers { key, .. }
            | KvCommand::SIsMember { key, .. }
            | KvCommand::SRandMember { key, .. }
            | KvCommand::SRem { key, .. } => key,
        }
    }

    fn execute(self, driver: &Self::Driver) -> Delivery {
        let kind = self.kind();
        match self {
            KvCommand::Get { key, callback } => Delivery::call(kind, key, callback, |k| driver.get(k)),
            KvCommand::Set { key, value, ttl, callback } => {
                Delivery::call(kind, key, callback, |k| driver.set(k, &value, ttl))
            }
            KvCommand::SetNx { key, value, ttl, callback } => {
                Delivery::call(kind, key, callback, |k| driver.set_nx(k, &value, ttl))
            }
            KvCommand::Del { key, callback } => Delivery::call(kind, key, callback, |k| driver.del(k)),
            KvCommand::Keys { pattern, callback } => {
                Delivery::call(kind, pattern, callback, |p| driver.keys(p))
            }
            KvCommand::Expire { key, ttl, callback } => {
                Delivery::call(kind, key, callback, |k| driver.expire(k, ttl))
            }
            KvCommand::ExpireAt { key, at, callback } => {
                Delivery::call(kind, key, callback, |k| driver.expire_at(k, at))
            }

            KvCommand::HSet { key, field, value, callback } => {
                Delivery::call(kind, key, callback, |k| driver.hset(k, &field, &value))
            }
            KvCommand::HGet { key, field, callback } => {
                Delivery::call(kind, key, callback, |k| driver.hget(k, &field))
            }
            KvCommand::HMSet { key, entries, callback } => {
                Delivery::call(kind, key, callback, |k| driver.hmset(k, &entries))
            }
            KvCommand::HMGet { key, fields, callback } => {
                Delivery::call(kind, key, callback, |k| driver.hmget(k, &fields))
            }
            KvCommand::HGetAll { key, callback } => {
                Delivery::call(kind, key, callback, |k| driver.hgetall(k))
            }
            KvCommand::HDel { key, fields, callback } => {
                Delivery::call(kind, key, callback, |k| driver.hdel(k, &fields))
            }
            KvCommand::HIncrBy { key, field, delta, callback } => {
                Delivery::call(kind, key, callback, |k| driver.hincrby(k, &field, delta))
            }

            KvCommand::LPush { key, values, callback } => {
                Delivery::call(kind, key, callback, |k| driver.lpush(k, &values))
            }
            KvCommand::RPush { key, values, callback } => {
                Delivery::call(kind, key, callback, |k| driver.rpush(k, &values))
            }
            KvCommand::LPop { key, callback } => Delivery::call(kind, key, callback, |k| driver.lpop(k)),
            KvCommand::RPop { key, callback } => Delivery::call(kind, key, callback, |k| driver.rpop(k)),
            KvCommand::LRange { key, start, stop, callback } => {
                Delivery::call(kind, key, callback, |k| driver.lrange(k, start, stop))
            }

            KvCommand::ZAdd { key, members, callback } => {
                Delivery::call(kind, key, callback, |k| driver.zadd(k, &members))
            }
            KvCommand::ZRevRank { key, member, callback } => {
                Delivery::call(kind, key, callback, |k| driver.zrevrank(k, &member))
            }
            KvCommand::ZRevRange { key, start, stop, callback } => {
                Delivery::call(kind, key, callback, |k| driver.zrevrange(k, start, stop))
            }
            KvCommand::ZIncrBy { key, member, increment, callback } => {
                Delivery::call(kind, key, callback, |k| driver.zincrby(k, increment, &member))
            }
            KvCommand::ZRem { key, members, callback } => {
                Delivery::call(kind, key, callback, |k| driver.zrem(k, &members))
            }

            KvCommand::SAdd { key, members, callback } => {
                Delivery::call(kind, key, callback, |k| driver.sadd(k, &members))
            }
            KvCommand::SMembers { key, callback } => {
                Delivery::call(kind, key, callback, |k| driver.smembers(k))
            }
            KvCommand::SIsMember { key, member, callback } => {
                Delivery::call(kind, key, callback, |k| driver.sismember(k, &member))
            }
            KvCommand::SRandMember { key, callback } => {
                Delivery::call(kind, key, callback, |k| driver.srandmember(k))
            }
            KvCommand::SRem { key, members, callback } => {
                Delivery::call(kind, key, callback, |k| driver.srem(k, &members))
            }

            KvCommand::Pipeline { build, callback } => {
                Delivery::new(kind, run_pipeline(driver, build), callback)
            }
        }
    }
}

impl fmt::Debug for KvCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvCommand")
            .field("kind", &self.kind())
            .field("target", &self.target())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Classification;
    use crate::kv::memory::MemoryKv;
    use crate::logging::capture;
    use std::sync::mpsc;

    fn execute<T: Send + 'static>(
        driver: &MemoryKv,
        make: impl FnOnce(Callback<T>) -> KvCommand,
    ) -> Reply<T> {
        let (tx, rx) = mpsc::channel();
        let command = make(Box::new(move |reply: Reply<T>| {
            let _ = tx.send(reply);
        }));
        command.execute(driver).deliver();
        rx.recv().unwrap()
    }

    #[test]
    fn test_get_missing_key_is_miss() {
        let driver = MemoryKv::new();
        let reply = execute(&driver, |callback| KvCommand::Get {
            key: "k1".to_string(),
            callback,
        });
        assert_eq!(reply.key, "k1");
        assert_eq!(reply.value, "");
        assert_eq!(reply.classification, Classification::Miss);
    }

    #[test]
    fn test_wrong_type_is_fail() {
        let driver = MemoryKv::new();
        driver.set("k", "v", None).unwrap();
        let reply = execute(&driver, |callback| KvCommand::HGet {
            key: "k".to_string(),
            field: "f".to_string(),
            callback,
        });
        assert!(reply.is_fail());
        assert_eq!(reply.error, Some(DriverError::WrongType { key: "k".to_string() }));
    }

    #[test]
    fn test_fail_is_logged_with_kind_and_target() {
        let driver = MemoryKv::new();
        driver.set("profile", "v", None).unwrap();
        let (reply, output) = capture(|| {
            execute(&driver, |callback| KvCommand::HGet {
                key: "profile".to_string(),
                field: "f".to_string(),
                callback,
            })
        });

        assert!(reply.is_fail());
        assert!(output.contains("ERROR"));
        assert!(output.contains("command failed"));
        assert!(output.contains("hget"));
        assert!(output.contains("target=profile"));
        assert!(output.contains("wrong type"));
    }

    #[test]
    fn test_miss_is_not_logged() {
        let driver = MemoryKv::new();
        let (reply, output) = capture(|| {
            execute(&driver, |callback| KvCommand::Get {
                key: "nope".to_string(),
                callback,
            })
        });

        assert!(reply.is_miss());
        assert!(!output.contains("ERROR"));
        assert!(!output.contains("nope"));
    }

    #[test]
    fn test_pipeline_results_in_submission_order() {
        let driver = MemoryKv::new();
        let reply = execute(&driver, |callback| KvCommand::Pipeline {
            build: Box::new(|pipe: &mut Pipeline| -> DriverResult<()> {
                pipe.set("a", "1", None).hincrby("h", "n", 5).get("a");
                Ok(())
            }),
            callback,
        });

        assert!(reply.is_success());
        let values: Vec<_> = reply.value.iter().map(|r| r.result.clone()).collect();
        assert_eq!(
            values,
            vec![
                Ok(PipeValue::Unit),
                Ok(PipeValue::Int(5)),
                Ok(PipeValue::Str("1".to_string())),
            ]
        );
    }

    #[test]
    fn test_pipeline_takes_first_sub_error() {
        let driver = MemoryKv::new();
        let reply = execute(&driver, |callback| KvCommand::Pipeline {
            build: Box::new(|pipe: &mut Pipeline| -> DriverResult<()> {
                pipe.get("missing").set("b", "2", None);
                Ok(())
            }),
            callback,
        });

        assert_eq!(reply.classification, Classification::Miss);
        assert_eq!(reply.value.len(), 2);
        assert_eq!(reply.value[1].result, Ok(PipeValue::Unit));
    }

    #[test]
    fn test_pipeline_build_error_sends_nothing() {
        let driver = MemoryKv::new();
        let reply = execute(&driver, |callback| KvCommand::Pipeline {
            build: Box::new(|pipe: &mut Pipeline| -> DriverResult<()> {
                pipe.set("never", "written", None);
                Err(DriverError::InvalidArgument("refused".to_string()))
            }),
            callback,
        });

        assert!(reply.is_fail());
        assert!(reply.value.is_empty());
        assert_eq!(driver.get("never"), Err(DriverError::NotFound));
    }

    #[test]
    fn test_kind_and_target() {
        let command = KvCommand::ZIncrBy {
            key: "board".to_string(),
            member: "alice".to_string(),
            increment: 2.0,
            callback: Box::new(|_: Reply<f64>| {}),
        };
        assert_eq!(command.kind(), "zincrby");
        assert_eq!(command.target(), "board");
        assert_eq!(format!("{:?}", command), "KvCommand { kind: \"zincrby\", target: \"board\" }");
    }
}
