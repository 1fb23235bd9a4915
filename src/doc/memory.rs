//! In-memory document driver
//!
//! Collections of JSON documents kept in insertion order. Supports the subset
//! of document-store semantics the client exercises: equality filters over
//! dotted paths, replacement and operator updates, upserts, simple
//! aggregation pipelines and generated `_id`s.

use super::driver::{DocDriver, Document};
use crate::config::Endpoint;
use crate::error::{DriverError, DriverResult};
use crate::pool::{ConnectionPool, PooledConnection};
use parking_lot::{Mutex, MutexGuard};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::debug;

type Conditions<'a> = Option<&'a Map<String, Value>>;

fn invalid(message: impl Into<String>) -> DriverError {
    DriverError::InvalidArgument(message.into())
}

fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(document, |current, part| current.get(part))
}

fn lookup_mut<'a>(document: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.').try_fold(document, |current, part| current.get_mut(part))
}

fn set_path(document: &mut Value, path: &str, value: Value) -> DriverResult<()> {
    let mut current = document;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        let fields = current
            .as_object_mut()
            .ok_or_else(|| invalid(format!("cannot set {} inside a non-object", path)))?;
        if parts.peek().is_none() {
            fields.insert(part.to_string(), value);
            return Ok(());
        }
        current = fields
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(())
}

fn unset_path(document: &mut Value, path: &str) {
    let (parent, field) = match path.rsplit_once('.') {
        Some((parent, field)) => (lookup_mut(document, parent), field),
        None => (Some(document), path),
    };
    if let Some(Value::Object(fields)) = parent {
        fields.remove(field);
    }
}

fn conditions(filter: &Document) -> DriverResult<Conditions<'_>> {
    match filter {
        Value::Null => Ok(None),
        Value::Object(fields) => Ok(Some(fields)),
        _ => Err(invalid("filter must be an object")),
    }
}

/// Every condition must equal the field at its path. A null condition
/// also matches a missing field.
fn matches(document: &Document, conditions: Conditions<'_>) -> bool {
    conditions.map_or(true, |conditions| {
        conditions
            .iter()
            .all(|(path, expected)| match lookup(document, path) {
                Some(actual) => actual == expected,
                None => expected.is_null(),
            })
    })
}

enum Update<'a> {
    Replace(&'a Map<String, Value>),
    Operators(&'a Map<String, Value>),
}

fn parse_update(update: &Document) -> DriverResult<Update<'_>> {
    let fields = update
        .as_object()
        .ok_or_else(|| invalid("update must be an object"))?;
    let operators = fields.keys().filter(|key| key.starts_with('$')).count();
    if operators == 0 {
        Ok(Update::Replace(fields))
    } else if operators == fields.len() {
        Ok(Update::Operators(fields))
    } else {
        Err(invalid("update mixes operators and plain fields"))
    }
}

fn increment(current: Option<&Value>, by: &Value, path: &str) -> DriverResult<Value> {
    let not_numeric = || invalid(format!("cannot increment non-numeric field {}", path));
    let current = current.cloned().unwrap_or_else(|| Value::from(0));
    match (current.as_i64(), by.as_i64()) {
        (Some(a), Some(b)) => a
            .checked_add(b)
            .map(Value::from)
            .ok_or_else(|| invalid(format!("increment of {} overflows", path))),
        _ => {
            let a = current.as_f64().ok_or_else(not_numeric)?;
            let b = by.as_f64().ok_or_else(not_numeric)?;
            Ok(Value::from(a + b))
        }
    }
}

/// Apply `update` to a copy of `document`, committing only on success.
fn apply_update(document: &mut Document, update: &Update<'_>) -> DriverResult<()> {
    let mut next = document.clone();
    match update {
        Update::Replace(fields) => {
            let mut replacement = (*fields).clone();
            if let Some(id) = document.get("_id") {
                replacement.insert("_id".to_string(), id.clone());
            }
            next = Value::Object(replacement);
        }
        Update::Operators(operators) => {
            for (operator, arguments) in operators.iter() {
                let arguments = arguments
                    .as_object()
                    .ok_or_else(|| invalid(format!("{} expects an object", operator)))?;
                for (path, value) in arguments {
                    match operator.as_str() {
                        "$set" => set_path(&mut next, path, value.clone())?,
                        "$unset" => unset_path(&mut next, path),
                        "$inc" => {
                            let sum = increment(lookup(&next, path), value, path)?;
                            set_path(&mut next, path, sum)?;
                        }
                        other => return Err(invalid(format!("unsupported update operator {}", other))),
                    }
                }
            }
        }
    }
    *document = next;
    Ok(())
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.total_cmp(&y)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// `{"field": 1, "other": -1}` into (path, descending) pairs
fn sort_keys(order: &Value) -> DriverResult<Vec<(String, bool)>> {
    let fields = order
        .as_object()
        .ok_or_else(|| invalid("$sort expects an object"))?;
    fields
        .iter()
        .map(|(path, direction)| match direction.as_i64() {
            Some(1) => Ok((path.clone(), false)),
            Some(-1) => Ok((path.clone(), true)),
            _ => Err(invalid(format!("$sort direction for {} must be 1 or -1", path))),
        })
        .collect()
}

fn stage_count(value: &Value, stage: &str) -> DriverResult<usize> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| invalid(format!("{} expects a non-negative integer", stage)))
}

fn run_pipeline(documents: &[Document], stages: &[Document]) -> DriverResult<Vec<Document>> {
    let mut output = documents.to_vec();
    for stage in stages {
        let (name, argument) = stage
            .as_object()
            .filter(|fields| fields.len() == 1)
            .and_then(|fields| fields.iter().next())
            .ok_or_else(|| invalid("each stage must be an object with exactly one operator"))?;

        match name.as_str() {
            "$match" => {
                let conditions = conditions(argument)?;
                output.retain(|document| matches(document, conditions));
            }
            "$sort" => {
                let keys = sort_keys(argument)?;
                output.sort_by(|a, b| {
                    keys.iter()
                        .map(|(path, descending)| {
                            let order = compare(lookup(a, path), lookup(b, path));
                            if *descending {
                                order.reverse()
                            } else {
                                order
                            }
                        })
                        .find(|order| order.is_ne())
                        .unwrap_or(Ordering::Equal)
                });
            }
            "$skip" => {
                let skip = stage_count(argument, name)?.min(output.len());
                output = output.split_off(skip);
            }
            "$limit" => output.truncate(stage_count(argument, name)?),
            other => return Err(invalid(format!("unsupported aggregation stage {}", other))),
        }
    }
    Ok(output)
}

#[derive(Default)]
struct Collection {
    documents: Vec<Document>,
    indexes: Vec<Vec<String>>,
}

impl Collection {
    fn position(&self, conditions: Conditions<'_>) -> Option<usize> {
        self.documents
            .iter()
            .position(|document| matches(document, conditions))
    }
}

#[derive(Default)]
struct Catalog {
    collections: HashMap<String, Collection>,
    next_id: u64,
}

impl Catalog {
    fn generate_id(&mut self) -> Value {
        self.next_id += 1;
        Value::String(format!("{:024x}", self.next_id))
    }

    fn collection_mut(&mut self, name: &str) -> &mut Collection {
        self.collections.entry(name.to_string()).or_default()
    }

    fn insert(&mut self, collection: &str, mut document: Document) -> DriverResult<Document> {
        let fields = document
            .as_object_mut()
            .ok_or_else(|| invalid("document must be an object"))?;
        if !fields.contains_key("_id") {
            let id = self.generate_id();
            fields.insert("_id".to_string(), id);
        }
        let id = fields.get("_id").cloned().unwrap_or(Value::Null);

        let target = self.collection_mut(collection);
        if target.documents.iter().any(|d| d.get("_id") == Some(&id)) {
            return Err(DriverError::Execution(format!(
                "duplicate key {} in collection {}",
                id, collection
            )));
        }
        target.documents.push(document);
        Ok(id)
    }

    fn upsert(&mut self, collection: &str, filter: &Document, update: &Document) -> DriverResult<bool> {
        let conditions = conditions(filter)?;
        let update = parse_update(update)?;

        let target = self.collection_mut(collection);
        if let Some(index) = target.position(conditions) {
            apply_update(&mut target.documents[index], &update)?;
            return Ok(false);
        }

        // Seed the new document with the filter's equality fields
        let mut seed = Value::Object(Map::new());
        for (path, value) in conditions.into_iter().flatten() {
            set_path(&mut seed, path, value.clone())?;
        }
        apply_update(&mut seed, &update)?;
        self.insert(collection, seed)?;
        Ok(true)
    }

    fn update_by_id(&mut self, collection: &str, id: &Document, update: &Document) -> DriverResult<()> {
        let update = parse_update(update)?;
        let document = self
            .collections
            .get_mut(collection)
            .and_then(|target| {
                target
                    .documents
                    .iter_mut()
                    .find(|document| document.get("_id") == Some(id))
            })
            .ok_or(DriverError::NotFound)?;
        apply_update(document, &update)
    }

    fn update_all(&mut self, collection: &str, filter: &Document, update: &Document) -> DriverResult<u64> {
        let conditions = conditions(filter)?;
        let update = parse_update(update)?;
        let Some(target) = self.collections.get_mut(collection) else {
            return Ok(0);
        };

        // Stage every change first so a failing update leaves the collection untouched
        let mut staged = Vec::new();
        for (index, document) in target.documents.iter().enumerate() {
            if matches(document, conditions) {
                let mut next = document.clone();
                apply_update(&mut next, &update)?;
                staged.push((index, next));
            }
        }
        let updated = staged.len() as u64;
        for (index, document) in staged {
            target.documents[index] = document;
        }
        Ok(updated)
    }

    fn remove(&mut self, collection: &str, filter: &Document) -> DriverResult<()> {
        let conditions = conditions(filter)?;
        let target = self
            .collections
            .get_mut(collection)
            .ok_or(DriverError::NotFound)?;
        let index = target.position(conditions).ok_or(DriverError::NotFound)?;
        target.documents.remove(index);
        Ok(())
    }
}

/// Thread-safe in-memory document driver
#[derive(Default)]
pub struct MemoryDocs {
    catalog: Mutex<Catalog>,
    pool: Option<ConnectionPool>,
}

/// The catalog, locked for one round trip over a pooled connection
struct Session<'a> {
    catalog: MutexGuard<'a, Catalog>,
    _connection: Option<PooledConnection<'a>>,
}

impl Deref for Session<'_> {
    type Target = Catalog;

    fn deref(&self) -> &Catalog {
        &self.catalog
    }
}

impl DerefMut for Session<'_> {
    fn deref_mut(&mut self) -> &mut Catalog {
        &mut self.catalog
    }
}

impl MemoryDocs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow at most `pool_size` round trips in flight at once
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool = Some(ConnectionPool::new(pool_size));
        self
    }

    /// Driver factory for `DocClient::connect`
    pub fn connect(endpoint: &Endpoint, pool_size: usize) -> DriverResult<Arc<dyn DocDriver>> {
        debug!(
            endpoint = %endpoint.authority(),
            database = endpoint.database.as_deref().unwrap_or(""),
            pool_size,
            "in-memory document driver connected"
        );
        Ok(Arc::new(Self::new().with_pool_size(pool_size)))
    }

    pub fn pool(&self) -> Option<&ConnectionPool> {
        self.pool.as_ref()
    }

    fn round_trip(&self) -> Session<'_> {
        let connection = self.pool.as_ref().map(ConnectionPool::acquire);
        Session {
            catalog: self.catalog.lock(),
            _connection: connection,
        }
    }

    /// Number of documents in `collection`
    pub fn count(&self, collection: &str) -> usize {
        self.catalog
            .lock()
            .collections
            .get(collection)
            .map_or(0, |target| target.documents.len())
    }

    /// Index key lists declared on `collection`, in declaration order
    pub fn indexes(&self, collection: &str) -> Vec<Vec<String>> {
        self.catalog
            .lock()
            .collections
            .get(collection)
            .map(|target| target.indexes.clone())
            .unwrap_or_default()
    }
}

impl DocDriver for MemoryDocs {
    fn find_one(&self, collection: &str, filter: &Document) -> DriverResult<Document> {
        let conditions = conditions(filter)?;
        let catalog = self.round_trip();
        catalog
            .collections
            .get(collection)
            .and_then(|target| target.documents.iter().find(|d| matches(d, conditions)))
            .cloned()
            .ok_or(DriverError::NotFound)
    }

    fn find_all(&self, collection: &str, filter: &Document, limit: usize) -> DriverResult<Vec<Document>> {
        let conditions = conditions(filter)?;
        let catalog = self.round_trip();
        Ok(catalog
            .collections
            .get(collection)
            .map(|target| {
                target
                    .documents
                    .iter()
                    .filter(|d| matches(d, conditions))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn aggregate(&self, collection: &str, stages: &[Document]) -> DriverResult<Vec<Document>> {
        let catalog = self.round_trip();
        match catalog.collections.get(collection) {
            Some(target) => run_pipeline(&target.documents, stages),
            None => run_pipeline(&[], stages),
        }
    }

    fn upsert(&self, collection: &str, filter: &Document, update: &Document) -> DriverResult<bool> {
        self.round_trip().upsert(collection, filter, update)
    }

    fn update_by_id(&self, collection: &str, id: &Document, update: &Document) -> DriverResult<()> {
        self.round_trip().update_by_id(collection, id, update)
    }

    fn update_all(&self, collection: &str, filter: &Document, update: &Document) -> DriverResult<u64> {
        self.round_trip().update_all(collection, filter, update)
    }

    fn insert(&self, collection: &str, document: &Document) -> DriverResult<Document> {
        self.round_trip().insert(collection, document.clone())
    }

    fn remove(&self, collection: &str, filter: &Document) -> DriverResult<()> {
        self.round_trip().remove(collection, filter)
    }

    fn ensure_index(&self, collection: &str, keys: &[String]) -> DriverResult<()> {
        if keys.is_empty() || keys.iter().any(|key| key.is_empty()) {
            return Err(invalid("index keys must be non-empty"));
        }
        let mut catalog = self.round_trip();
        let target = catalog.collection_mut(collection);
        if !target.indexes.iter().any(|existing| existing.as_slice() == keys) {
            target.indexes.push(keys.to_vec());
        }
        Ok(())
    }
}
