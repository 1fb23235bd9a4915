//! Document driver interface
//!
//! Documents, filters and updates are JSON values. Filters are objects of
//! field/value equality conditions; dotted field names address nested
//! fields. Updates are either a replacement document or an object of
//! `$set`, `$inc` and `$unset` operators.

use crate::error::DriverResult;
use serde_json::Value;

/// A stored document
pub type Document = Value;

/// Synchronous document store operations.
///
/// A lookup or targeted write that matches nothing returns
/// `DriverError::NotFound`; queries that return lists return them empty.
pub trait DocDriver: Send + Sync {
    /// First document matching `filter`
    fn find_one(&self, collection: &str, filter: &Document) -> DriverResult<Document>;

    /// Up to `limit` documents matching `filter`, in insertion order
    fn find_all(&self, collection: &str, filter: &Document, limit: usize) -> DriverResult<Vec<Document>>;

    /// Run an aggregation pipeline of `$match`, `$sort`, `$skip` and `$limit`
    /// stages.
    fn aggregate(&self, collection: &str, stages: &[Document]) -> DriverResult<Vec<Document>>;

    /// Update the first match or insert a new document; true when inserted
    fn upsert(&self, collection: &str, filter: &Document, update: &Document) -> DriverResult<bool>;

    fn update_by_id(&self, collection: &str, id: &Document, update: &Document) -> DriverResult<()>;

    /// Returns the number of documents updated
    fn update_all(&self, collection: &str, filter: &Document, update: &Document) -> DriverResult<u64>;

    /// Returns the `_id` of the stored document, generated when absent
    fn insert(&self, collection: &str, document: &Document) -> DriverResult<Document>;

    /// Remove the first document matching `filter`
    fn remove(&self, collection: &str, filter: &Document) -> DriverResult<()>;

    /// Declare an index on `keys`. Idempotent.
    fn ensure_index(&self, collection: &str, keys: &[String]) -> DriverResult<()>;
}
