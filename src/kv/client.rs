//! Asynchronous key-value client
//!
//! Every operation method enqueues one command and returns as soon as it is
//! queued. The callback receives the classified `Reply` later, on a worker
//! thread or on the configured executor.

use super::command::KvCommand;
use super::driver::{strings, KvDriver, PipeResult, Pipeline, ScoredMember};
use crate::config::{ClientOptions, Endpoint};
use crate::engine::{call_driver, Engine, EngineStats};
use crate::error::{DbQueueError, DriverError, DriverResult, Result};
use crate::executor::Executor;
use crate::reply::Reply;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::info;

/// Handle to a key-value command engine. Clones share the same engine.
#[derive(Clone)]
pub struct KvClient {
    engine: Arc<Engine<KvCommand>>,
    endpoint: Arc<Endpoint>,
}

impl KvClient {
    /// Validate `options` and start the worker pool over `driver`.
    pub fn new(
        options: &ClientOptions,
        driver: Arc<dyn KvDriver>,
        executor: Option<Arc<dyn Executor>>,
    ) -> Result<Self> {
        let endpoint = options.validate()?;
        Self::start(options, endpoint, driver, executor)
    }

    /// Validate `options`, then build the driver from the resolved endpoint
    /// and `pool_size` before starting the worker pool.
    pub fn connect<F>(options: &ClientOptions, connect: F, executor: Option<Arc<dyn Executor>>) -> Result<Self>
    where
        F: FnOnce(&Endpoint, usize) -> DriverResult<Arc<dyn KvDriver>>,
    {
        let endpoint = options.validate()?;
        let driver = connect(&endpoint, options.pool_size).map_err(|err| DbQueueError::Connect {
            endpoint: endpoint.authority(),
            source: err,
        })?;
        Self::start(options, endpoint, driver, executor)
    }

    fn start(
        options: &ClientOptions,
        endpoint: Endpoint,
        driver: Arc<dyn KvDriver>,
        executor: Option<Arc<dyn Executor>>,
    ) -> Result<Self> {
        let engine = Engine::start(
            &options.name,
            driver,
            options.worker_count,
            options.queue_capacity,
            executor,
        )?;
        info!(client = %options.name, endpoint = %endpoint.authority(), "key-value client ready");
        Ok(Self {
            engine: Arc::new(engine),
            endpoint: Arc::new(endpoint),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Enqueue a prepared command
    pub fn submit(&self, command: KvCommand) -> Result<()> {
        self.engine.submit(command)
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    /// Stop the engine for every clone of this client; returns how many
    /// queued commands were abandoned.
    pub fn stop(&self) -> usize {
        self.engine.stop()
    }

    pub fn is_stopped(&self) -> bool {
        self.engine.is_stopped()
    }

    /// Read a key on the calling thread, bypassing the queue.
    pub fn get_sync(&self, key: &str) -> DriverResult<Option<String>> {
        match call_driver(|| self.engine.driver().get(key)) {
            Ok(value) => Ok(Some(value)),
            Err(DriverError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn get(
        &self,
        key: impl Into<String>,
        callback: impl FnOnce(Reply<String>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::Get {
            key: key.into(),
            callback: Box::new(callback),
        })
    }

    pub fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Option<Duration>,
        callback: impl FnOnce(Reply<()>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::Set {
            key: key.into(),
            value: value.into(),
            ttl,
            callback: Box::new(callback),
        })
    }

    /// Set only if absent; the reply value tells whether it was set
    pub fn set_nx(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Option<Duration>,
        callback: impl FnOnce(Reply<bool>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::SetNx {
            key: key.into(),
            value: value.into(),
            ttl,
            callback: Box::new(callback),
        })
    }

    pub fn del(
        &self,
        key: impl Into<String>,
        callback: impl FnOnce(Reply<u64>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::Del {
            key: key.into(),
            callback: Box::new(callback),
        })
    }

    pub fn keys(
        &self,
        pattern: impl Into<String>,
        callback: impl FnOnce(Reply<Vec<String>>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::Keys {
            pattern: pattern.into(),
            callback: Box::new(callback),
        })
    }

    pub fn expire(
        &self,
        key: impl Into<String>,
        ttl: Duration,
        callback: impl FnOnce(Reply<bool>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::Expire {
            key: key.into(),
            ttl,
            callback: Box::new(callback),
        })
    }

    pub fn expire_at(
        &self,
        key: impl Into<String>,
        at: SystemTime,
        callback: impl FnOnce(Reply<bool>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::ExpireAt {
            key: key.into(),
            at,
            callback: Box::new(callback),
        })
    }

    pub fn hset(
        &self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
        callback: impl FnOnce(Reply<bool>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
            callback: Box::new(callback),
        })
    }

    pub fn hget(
        &self,
        key: impl Into<String>,
        field: impl Into<String>,
        callback: impl FnOnce(Reply<String>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::HGet {
            key: key.into(),
            field: field.into(),
            callback: Box::new(callback),
        })
    }

    pub fn hmset(
        &self,
        key: impl Into<String>,
        entries: Vec<(String, String)>,
        callback: impl FnOnce(Reply<()>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::HMSet {
            key: key.into(),
            entries,
            callback: Box::new(callback),
        })
    }

    /// One slot per requested field, `None` where the field is absent
    pub fn hmget<I, S>(
        &self,
        key: impl Into<String>,
        fields: I,
        callback: impl FnOnce(Reply<Vec<Option<String>>>) + Send + 'static,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit(KvCommand::HMGet {
            key: key.into(),
            fields: strings(fields),
            callback: Box::new(callback),
        })
    }

    pub fn hgetall(
        &self,
        key: impl Into<String>,
        callback: impl FnOnce(Reply<HashMap<String, String>>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::HGetAll {
            key: key.into(),
            callback: Box::new(callback),
        })
    }

    pub fn hdel<I, S>(
        &self,
        key: impl Into<String>,
        fields: I,
        callback: impl FnOnce(Reply<u64>) + Send + 'static,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit(KvCommand::HDel {
            key: key.into(),
            fields: strings(fields),
            callback: Box::new(callback),
        })
    }

    pub fn hincrby(
        &self,
        key: impl Into<String>,
        field: impl Into<String>,
        delta: i64,
        callback: impl FnOnce(Reply<i64>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::HIncrBy {
            key: key.into(),
            field: field.into(),
            delta,
            callback: Box::new(callback),
        })
    }

    pub fn lpush<I, S>(
        &self,
        key: impl Into<String>,
        values: I,
        callback: impl FnOnce(Reply<u64>) + Send + 'static,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit(KvCommand::LPush {
            key: key.into(),
            values: strings(values),
            callback: Box::new(callback),
        })
    }

    pub fn rpush<I, S>(
        &self,
        key: impl Into<String>,
        values: I,
        callback: impl FnOnce(Reply<u64>) + Send + 'static,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit(KvCommand::RPush {
            key: key.into(),
            values: strings(values),
            callback: Box::new(callback),
        })
    }

    pub fn lpop(
        &self,
        key: impl Into<String>,
        callback: impl FnOnce(Reply<String>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::LPop {
            key: key.into(),
            callback: Box::new(callback),
        })
    }

    pub fn rpop(
        &self,
        key: impl Into<String>,
        callback: impl FnOnce(Reply<String>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::RPop {
            key: key.into(),
            callback: Box::new(callback),
        })
    }

    /// Inclusive range; negative indexes count from the tail
    pub fn lrange(
        &self,
        key: impl Into<String>,
        start: i64,
        stop: i64,
        callback: impl FnOnce(Reply<Vec<String>>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::LRange {
            key: key.into(),
            start,
            stop,
            callback: Box::new(callback),
        })
    }

    pub fn zadd(
        &self,
        key: impl Into<String>,
        members: Vec<ScoredMember>,
        callback: impl FnOnce(Reply<u64>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::ZAdd {
            key: key.into(),
            members,
            callback: Box::new(callback),
        })
    }

    pub fn zrevrank(
        &self,
        key: impl Into<String>,
        member: impl Into<String>,
        callback: impl FnOnce(Reply<u64>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::ZRevRank {
            key: key.into(),
            member: member.into(),
            callback: Box::new(callback),
        })
    }

    pub fn zrevrange(
        &self,
        key: impl Into<String>,
        start: i64,
        stop: i64,
        callback: impl FnOnce(Reply<Vec<ScoredMember>>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::ZRevRange {
            key: key.into(),
            start,
            stop,
            callback: Box::new(callback),
        })
    }

    pub fn zincrby(
        &self,
        key: impl Into<String>,
        member: impl Into<String>,
        increment: f64,
        callback: impl FnOnce(Reply<f64>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::ZIncrBy {
            key: key.into(),
            member: member.into(),
            increment,
            callback: Box::new(callback),
        })
    }

    pub fn zrem<I, S>(
        &self,
        key: impl Into<String>,
        members: I,
        callback: impl FnOnce(Reply<u64>) + Send + 'static,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit(KvCommand::ZRem {
            key: key.into(),
            members: strings(members),
            callback: Box::new(callback),
        })
    }

    pub fn sadd<I, S>(
        &self,
        key: impl Into<String>,
        members: I,
        callback: impl FnOnce(Reply<u64>) + Send + 'static,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit(KvCommand::SAdd {
            key: key.into(),
            members: strings(members),
            callback: Box::new(callback),
        })
    }

    pub fn smembers(
        &self,
        key: impl Into<String>,
        callback: impl FnOnce(Reply<Vec<String>>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::SMembers {
            key: key.into(),
            callback: Box::new(callback),
        })
    }

    pub fn sismember(
        &self,
        key: impl Into<String>,
        member: impl Into<String>,
        callback: impl FnOnce(Reply<bool>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::SIsMember {
            key: key.into(),
            member: member.into(),
            callback: Box::new(callback),
        })
    }

    pub fn srandmember(
        &self,
        key: impl Into<String>,
        callback: impl FnOnce(Reply<String>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::SRandMember {
            key: key.into(),
            callback: Box::new(callback),
        })
    }

    pub fn srem<I, S>(
        &self,
        key: impl Into<String>,
        members: I,
        callback: impl FnOnce(Reply<u64>) + Send + 'static,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit(KvCommand::SRem {
            key: key.into(),
            members: strings(members),
            callback: Box::new(callback),
        })
    }

    /// Queue a batch. `build` runs on the worker, fills the pipeline, and
    /// the batch goes to the driver in one round trip. Returning an error
    /// from `build` cancels the batch.
    pub fn pipeline(
        &self,
        build: impl FnOnce(&mut Pipeline) -> DriverResult<()> + Send + 'static,
        callback: impl FnOnce(Reply<Vec<PipeResult>>) + Send + 'static,
    ) -> Result<()> {
        self.submit(KvCommand::Pipeline {
            build: Box::new(build),
            callback: Box::new(callback),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Classification;
    use crate::kv::driver::PipeValue;
    use crate::kv::memory::MemoryKv;
    use crate::reply::channel;

    fn client() -> (KvClient, Arc<MemoryKv>) {
        let driver = Arc::new(MemoryKv::new());
        let options = ClientOptions {
            name: "kv-test".to_string(),
            worker_count: 4,
            queue_capacity: 64,
            ..ClientOptions::default()
        };
        let client = KvClient::new(&options, driver.clone(), None).unwrap();
        (client, driver)
    }

    #[tokio::test]
    async fn test_get_before_and_after_set() {
        let (client, _driver) = client();

        let (callback, rx) = channel();
        client.get("k1", callback).unwrap();
        let reply = rx.await.unwrap();
        assert_eq!(reply.key, "k1");
        assert_eq!(reply.value, "");
        assert_eq!(reply.classification, Classification::Miss);

        let (callback, rx) = channel();
        client.set("k1", "v1", None, callback).unwrap();
        assert!(rx.await.unwrap().is_success());

        let (callback, rx) = channel();
        client.get("k1", callback).unwrap();
        let reply = rx.await.unwrap();
        assert_eq!(reply.value, "v1");
        assert_eq!(reply.classification, Classification::Success);
    }

    #[tokio::test]
    async fn test_sorted_set_flow() {
        let (client, _driver) = client();

        let (callback, rx) = channel();
        client
            .zadd(
                "board",
                vec![ScoredMember::new("a", 1.0), ScoredMember::new("b", 2.0)],
                callback,
            )
            .unwrap();
        assert_eq!(rx.await.unwrap().value, 2);

        let (callback, rx) = channel();
        client.zincrby("board", "a", 5.0, callback).unwrap();
        assert_eq!(rx.await.unwrap().value, 6.0);

        let (callback, rx) = channel();
        client.zrevrank("board", "a", callback).unwrap();
        assert_eq!(rx.await.unwrap().value, 0);

        let (callback, rx) = channel();
        client.zrevrank("board", "ghost", callback).unwrap();
        assert!(rx.await.unwrap().is_miss());
    }

    #[tokio::test]
    async fn test_hash_and_set_replies() {
        let (client, driver) = client();
        driver
            .hmset("user:1", &[("name".to_string(), "ada".to_string())])
            .unwrap();

        let (callback, rx) = channel();
        client.hmget("user:1", ["name", "email"], callback).unwrap();
        assert_eq!(rx.await.unwrap().value, vec![Some("ada".to_string()), None]);

        let (callback, rx) = channel();
        client.sadd("tags", ["x", "y"], callback).unwrap();
        assert_eq!(rx.await.unwrap().value, 2);

        let (callback, rx) = channel();
        client.sismember("tags", "y", callback).unwrap();
        assert!(rx.await.unwrap().value);

        let (callback, rx) = channel();
        client.lpush("tags", ["z"], callback).unwrap();
        let reply = rx.await.unwrap();
        assert!(reply.is_fail());
        assert_eq!(reply.value, 0);
    }

    #[tokio::test]
    async fn test_pipeline_through_client() {
        let (client, _driver) = client();
        let (callback, rx) = channel();
        client
            .pipeline(
                |pipe| {
                    pipe.rpush("l", ["a", "b"]).lrange("l", 0, -1).del("l");
                    Ok(())
                },
                callback,
            )
            .unwrap();

        let reply = rx.await.unwrap();
        assert!(reply.is_success());
        let values: Vec<_> = reply.value.iter().filter_map(|r| r.value().cloned()).collect();
        assert_eq!(
            values,
            vec![
                PipeValue::Int(2),
                PipeValue::List(vec!["a".to_string(), "b".to_string()]),
                PipeValue::Int(1),
            ]
        );
    }

    #[test]
    fn test_get_sync_bypasses_queue() {
        let (client, driver) = client();
        assert_eq!(client.get_sync("k"), Ok(None));
        driver.set("k", "v", None).unwrap();
        assert_eq!(client.get_sync("k"), Ok(Some("v".to_string())));
        driver.lpush("l", &["x".to_string()]).unwrap();
        assert!(matches!(client.get_sync("l"), Err(DriverError::WrongType { .. })));
    }

    #[test]
    fn test_invalid_options_do_not_start() {
        let driver = Arc::new(MemoryKv::new());
        let options = ClientOptions {
            address: String::new(),
            ..ClientOptions::default()
        };
        assert!(KvClient::new(&options, driver, None).is_err());
    }

    #[test]
    fn test_connect_hands_endpoint_and_pool_size_to_driver() {
        let options = ClientOptions {
            name: "kv-connect".to_string(),
            address: "redis://:hunter2@cache.local:6380/2".to_string(),
            pool_size: 3,
            worker_count: 2,
            ..ClientOptions::default()
        };
        let mut seen = None;
        let client = KvClient::connect(
            &options,
            |endpoint: &Endpoint, pool_size| {
                seen = Some((endpoint.authority(), endpoint.password.clone(), pool_size));
                MemoryKv::connect(endpoint, pool_size)
            },
            None,
        )
        .unwrap();

        assert_eq!(
            seen,
            Some(("cache.local:6380".to_string(), Some("hunter2".to_string()), 3))
        );
        assert_eq!(client.endpoint().database.as_deref(), Some("2"));
        assert_eq!(client.get_sync("k"), Ok(None));
    }

    #[test]
    fn test_connect_failure_does_not_start() {
        let options = ClientOptions::new("cache.local:6380");
        let result = KvClient::connect(
            &options,
            |_: &Endpoint, _| Err(DriverError::Connection("refused".to_string())),
            None,
        );
        assert!(matches!(
            result,
            Err(DbQueueError::Connect { ref endpoint, .. }) if endpoint == "cache.local:6380"
        ));
    }

    #[test]
    fn test_clones_share_engine() {
        let (client, _driver) = client();
        let other = client.clone();
        assert_eq!(other.stop(), 0);
        assert!(client.is_stopped());
        assert!(client.get("k", |_| {}).is_err());
    }
}
