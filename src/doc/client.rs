//! Asynchronous document store client

use super::command::DocCommand;
use super::driver::{DocDriver, Document};
use crate::config::{ClientOptions, Endpoint};
use crate::engine::{call_driver, Engine, EngineStats};
use crate::error::{DbQueueError, DriverError, DriverResult, Result};
use crate::executor::Executor;
use crate::reply::Reply;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// Handle to a document command engine. Clones share the same engine.
#[derive(Clone)]
pub struct DocClient {
    engine: Arc<Engine<DocCommand>>,
    endpoint: Arc<Endpoint>,
    find_max_count: usize,
}

impl DocClient {
    pub fn new(
        options: &ClientOptions,
        driver: Arc<dyn DocDriver>,
        executor: Option<Arc<dyn Executor>>,
    ) -> Result<Self> {
        let endpoint = options.validate()?;
        Self::start(options, endpoint, driver, executor)
    }

    /// Validate `options`, then build the driver from the resolved endpoint
    /// and `pool_size` before starting the worker pool.
    pub fn connect<F>(options: &ClientOptions, connect: F, executor: Option<Arc<dyn Executor>>) -> Result<Self>
    where
        F: FnOnce(&Endpoint, usize) -> DriverResult<Arc<dyn DocDriver>>,
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
        driver: Arc<dyn DocDriver>,
        executor: Option<Arc<dyn Executor>>,
    ) -> Result<Self> {
        let engine = Engine::start(
            &options.name,
            driver,
            options.worker_count,
            options.queue_capacity,
            executor,
        )?;
        info!(
            client = %options.name,
            endpoint = %endpoint.authority(),
            database = endpoint.database.as_deref().unwrap_or(""),
            "document client ready"
        );
        Ok(Self {
            engine: Arc::new(engine),
            endpoint: Arc::new(endpoint),
            find_max_count: options.find_max_count,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn submit(&self, command: DocCommand) -> Result<()> {
        self.engine.submit(command)
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    pub fn stop(&self) -> usize {
        self.engine.stop()
    }

    pub fn is_stopped(&self) -> bool {
        self.engine.is_stopped()
    }

    /// First match, read on the calling thread
    pub fn find_sync(&self, collection: &str, filter: &Document) -> DriverResult<Option<Document>> {
        match call_driver(|| self.engine.driver().find_one(collection, filter)) {
            Ok(document) => Ok(Some(document)),
            Err(DriverError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Upsert on the calling thread; true when a document was inserted
    pub fn upsert_sync(&self, collection: &str, filter: &Document, update: &Document) -> DriverResult<bool> {
        call_driver(|| self.engine.driver().upsert(collection, filter, update))
    }

    /// Declare an index on the calling thread
    pub fn ensure_index<I, S>(&self, collection: &str, keys: I) -> DriverResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        call_driver(|| self.engine.driver().ensure_index(collection, &keys))
    }

    pub fn find(
        &self,
        collection: impl Into<String>,
        filter: Document,
        callback: impl FnOnce(Reply<Document>) + Send + 'static,
    ) -> Result<()> {
        self.submit(DocCommand::Find {
            collection: collection.into(),
            filter,
            callback: Box::new(callback),
        })
    }

    /// Find and decode the first match. A document that does not decode as
    /// `T` is delivered as FAIL with a decode error.
    pub fn find_as<T>(
        &self,
        collection: impl Into<String>,
        filter: Document,
        callback: impl FnOnce(Reply<Option<T>>) + Send + 'static,
    ) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.find(collection, filter, move |reply| callback(decode(reply)))
    }

    /// Matches up to the configured `find_max_count`
    pub fn find_all(
        &self,
        collection: impl Into<String>,
        filter: Document,
        callback: impl FnOnce(Reply<Vec<Document>>) + Send + 'static,
    ) -> Result<()> {
        self.submit(DocCommand::FindAll {
            collection: collection.into(),
            filter,
            limit: self.find_max_count,
            callback: Box::new(callback),
        })
    }

    pub fn aggregate(
        &self,
        collection: impl Into<String>,
        stages: Vec<Document>,
        callback: impl FnOnce(Reply<Vec<Document>>) + Send + 'static,
    ) -> Result<()> {
        self.submit(DocCommand::Aggregate {
            collection: collection.into(),
            stages,
            callback: Box::new(callback),
        })
    }

    pub fn upsert(
        &self,
        collection: impl Into<String>,
        filter: Document,
        update: Document,
        callback: impl FnOnce(Reply<bool>) + Send + 'static,
    ) -> Result<()> {
        self.submit(DocCommand::Upsert {
            collection: collection.into(),
            filter,
            update,
            callback: Box::new(callback),
        })
    }

    pub fn update_by_id(
        &self,
        collection: impl Into<String>,
        id: Document,
        update: Document,
        callback: impl FnOnce(Reply<()>) + Send + 'static,
    ) -> Result<()> {
        self.submit(DocCommand::UpdateById {
            collection: collection.into(),
            id,
            update,
            callback: Box::new(callback),
        })
    }

    pub fn update_all(
        &self,
        collection: impl Into<String>,
        filter: Document,
        update: Document,
        callback: impl FnOnce(Reply<u64>) + Send + 'static,
    ) -> Result<()> {
        self.submit(DocCommand::UpdateAll {
            collection: collection.into(),
            filter,
            update,
            callback: Box::new(callback),
        })
    }

    /// The reply carries the stored document's `_id`
    pub fn insert(
        &self,
        collection: impl Into<String>,
        document: Document,
        callback: impl FnOnce(Reply<Document>) + Send + 'static,
    ) -> Result<()> {
        self.submit(DocCommand::Insert {
            collection: collection.into(),
            document,
            callback: Box::new(callback),
        })
    }

    /// Serialize `value` and insert it
    pub fn insert_as<T: Serialize>(
        &self,
        collection: impl Into<String>,
        value: &T,
        callback: impl FnOnce(Reply<Document>) + Send + 'static,
    ) -> Result<()> {
        let document = serde_json::to_value(value)?;
        self.insert(collection, document, callback)
    }

    /// Remove the first match; MISS when nothing matched
    pub fn remove(
        &self,
        collection: impl Into<String>,
        filter: Document,
        callback: impl FnOnce(Reply<()>) + Send + 'static,
    ) -> Result<()> {
        self.submit(DocCommand::Remove {
            collection: collection.into(),
            filter,
            callback: Box::new(callback),
        })
    }
}

fn decode<T: DeserializeOwned>(reply: Reply<Document>) -> Reply<Option<T>> {
    if !reply.is_success() {
        return Reply {
            key: reply.key,
            value: None,
            classification: reply.classification,
            error: reply.error,
        };
    }
    match serde_json::from_value::<T>(reply.value) {
        Ok(value) => Reply::new(reply.key, Some(value), None),
        Err(err) => {
            let err = DriverError::from(err);
            error!(kind = "find", target = %reply.key, error = %err, "command failed");
            Reply::new(reply.key, None, Some(err))
        }
    }
}
