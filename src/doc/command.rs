//! Document store commands

use super::driver::{DocDriver, Document};
use crate::engine::{Command, Delivery};
use crate::reply::Callback;
use std::fmt;

pub enum DocCommand {
    Find { collection: String, filter: Document, callback: Callback<Document> },
    FindAll { collection: String, filter: Document, limit: usize, callback: Callback<Vec<Document>> },
    Aggregate { collection: String, stages: Vec<Document>, callback: Callback<Vec<Document>> },
    Upsert { collection: String, filter: Document, update: Document, callback: Callback<bool> },
    UpdateById { collection: String, id: Document, update: Document, callback: Callback<()> },
    UpdateAll { collection: String, filter: Document, update: Document, callback: Callback<u64> },
    Insert { collection: String, document: Document, callback: Callback<Document> },
    Remove { collection: String, filter: Document, callback: Callback<()> },
}

impl Command for DocCommand {
    type Driver = dyn DocDriver;

    fn kind(&self) -> &'static str {
        match self {
            DocCommand::Find { .. } => "find",
            DocCommand::FindAll { .. } => "find_all",
            DocCommand::Aggregate { .. } => "aggregate",
            DocCommand::Upsert { .. } => "upsert",
            DocCommand::UpdateById { .. } => "update_by_id",
            DocCommand::UpdateAll { .. } => "update_all",
            DocCommand::Insert { .. } => "insert",
            DocCommand::Remove { .. } => "remove",
        }
    }

    fn target(&self) -> &str {
        match self {
            DocCommand::Find { collection, .. }
            | DocCommand::FindAll { collection, .. }
            | DocCommand::Aggregate { collection, .. }
            | DocCommand::Upsert { collection, .. }
            | DocCommand::UpdateById { collection, .. }
            | DocCommand::UpdateAll { collection, .. }
            | DocCommand::Insert { collection, .. }
            | DocCommand::Remove { collection, .. } => collection,
        }
    }

    fn execute(self, driver: &Self::Driver) -> Delivery {
        let kind = self.kind();
        match self {
            DocCommand::Find { collection, filter, callback } => {
                Delivery::call(kind, collection, callback, |c| driver.find_one(c, &filter))
            }
            DocCommand::FindAll { collection, filter, limit, callback } => {
                Delivery::call(kind, collection, callback, |c| driver.find_all(c, &filter, limit))
            }
            DocCommand::Aggregate { collection, stages, callback } => {
                Delivery::call(kind, collection, callback, |c| driver.aggregate(c, &stages))
            }
            DocCommand::Upsert { collection, filter, update, callback } => {
                Delivery::call(kind, collection, callback, |c| driver.upsert(c, &filter, &update))
            }
            DocCommand::UpdateById { collection, id, update, callback } => {
                Delivery::call(kind, collection, callback, |c| driver.update_by_id(c, &id, &update))
            }
            DocCommand::UpdateAll { collection, filter, update, callback } => {
                Delivery::call(kind, collection, callback, |c| driver.update_all(c, &filter, &update))
            }
            DocCommand::Insert { collection, document, callback } => {
                Delivery::call(kind, collection, callback, |c| driver.insert(c, &document))
            }
            DocCommand::Remove { collection, filter, callback } => {
                Delivery::call(kind, collection, callback, |c| driver.remove(c, &filter))
            }
        }
    }
}

impl fmt::Debug for DocCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocCommand")
            .field("kind", &self.kind())
            .field("collection", &self.target())
            .finish()
    }
}
