mod opcode;

pub use opcode::Opcode;

use futures::stream::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{DeleteOneModel, ReturnDocument, UpdateOneModel, WriteModel};
use mongodb::results::{DeleteResult, SummaryBulkWriteResult};
use mongodb::{Client, Collection};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::Config;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The supplied document has no usable `_id` (absent, null, or an
    /// empty string).
    #[error("document has no usable _id field")]
    MissingId,
    #[error("unknown update opcode '{0}'")]
    UnknownOpcode(String),
    #[error(transparent)]
    Driver(#[from] mongodb::error::Error),
}

/// Result of a best-effort batch operation.
///
/// `bulk_update`, `bulk_unset`, and `prune_empty` never surface individual
/// request failures: a batch that partially fails is logged and collapsed to
/// `PartiallyFailed`. Callers needing definitive per-write outcomes should
/// use the single-document operations with their `_fetch` variants instead.
#[derive(Debug)]
pub enum BulkOutcome {
    /// Nothing to write; the store was not contacted.
    Empty,
    Applied(SummaryBulkWriteResult),
    /// One or more requests in the batch failed; details were logged.
    PartiallyFailed,
}

/// Opens a client for the configured deployment. The driver connects lazily
/// and manages its own pool, so this does not touch the network yet.
pub async fn connect(config: &Config) -> Result<Client, StoreError> {
    let client = Client::with_uri_str(&config.mongo_uri).await?;
    info!("Database: client initialized (target db '{}')", config.mongo_db);
    Ok(client)
}

/// Schema-free access to one keyed collection.
///
/// Every operation works on plain BSON documents keyed by `_id`, so callers
/// can pass ad hoc field sets per collection without a fixed record type.
/// Writes to the same `_id` are last-writer-wins; nothing here adds retries,
/// transactions, or timeouts on top of the driver.
#[derive(Clone)]
pub struct DocumentStore {
    client: Client,
    collection: Collection<Document>,
}

impl DocumentStore {
    /// Binds one collection. The client is kept alongside the collection
    /// handle because batch submission goes through [`Client::bulk_write`].
    pub fn new(client: &Client, database: &str, name: &str) -> Self {
        debug!("Database: opening collection '{}.{}'", database, name);
        Self {
            client: client.clone(),
            collection: client.database(database).collection::<Document>(name),
        }
    }

    pub fn name(&self) -> &str {
        self.collection.name()
    }

    /// Point lookup by `_id`. An absent document is `Ok(None)`, never an
    /// error.
    pub async fn find(
        &self,
        id: impl Into<Bson>,
        projection: impl Into<Option<Document>>,
    ) -> Result<Option<Document>, StoreError> {
        let mut op = self.collection.find_one(doc! { "_id": id.into() });
        if let Some(projection) = projection.into() {
            op = op.projection(projection);
        }
        Ok(op.await?)
    }

    /// Point lookup by an arbitrary filter.
    pub async fn find_one(
        &self,
        filter: Document,
        projection: impl Into<Option<Document>>,
    ) -> Result<Option<Document>, StoreError> {
        let mut op = self.collection.find_one(filter);
        if let Some(projection) = projection.into() {
            op = op.projection(projection);
        }
        Ok(op.await?)
    }

    /// Multi-document query described by a [`FindSpec`].
    ///
    /// A spec with only a filter (and optional projection) runs as a direct
    /// filtered scan; anything needing limit, sort, or group runs as an
    /// aggregation pipeline. Results are always fully materialized.
    pub async fn find_many(&self, spec: FindSpec) -> Result<Vec<Document>, StoreError> {
        let cursor = if spec.direct_scan() {
            let mut op = self.collection.find(spec.filter.clone().unwrap_or_default());
            if let Some(projection) = spec.projection.clone() {
                op = op.projection(projection);
            }
            op.await?
        } else {
            self.collection.aggregate(spec.pipeline()).await?
        };
        Ok(cursor.try_collect().await?)
    }

    /// Runs a caller-built aggregation pipeline, materialized.
    pub async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>, StoreError> {
        Ok(self.collection.aggregate(pipeline).await?.try_collect().await?)
    }

    /// Inserts a new document. The document must carry its own `_id`.
    pub async fn insert(&self, document: Document) -> Result<(), StoreError> {
        ensure_keyed(&document)?;
        self.collection.insert_one(document).await?;
        Ok(())
    }

    /// Sets `fields` on the document with this `_id`, creating it if absent.
    pub async fn upsert(&self, id: impl Into<Bson>, fields: Document) -> Result<(), StoreError> {
        self.collection
            .update_one(doc! { "_id": id.into() }, doc! { "$set": fields })
            .upsert(true)
            .await?;
        Ok(())
    }

    /// Like [`DocumentStore::upsert`], returning the post-update document.
    pub async fn upsert_fetch(
        &self,
        id: impl Into<Bson>,
        fields: Document,
    ) -> Result<Option<Document>, StoreError> {
        Ok(self
            .collection
            .find_one_and_update(doc! { "_id": id.into() }, doc! { "$set": fields })
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await?)
    }

    /// Removes the named fields from the document with this `_id`.
    pub async fn unset<I, S>(&self, id: impl Into<Bson>, fields: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.collection
            .update_one(doc! { "_id": id.into() }, doc! { "$unset": null_fields(fields) })
            .upsert(true)
            .await?;
        Ok(())
    }

    /// Like [`DocumentStore::unset`], returning the post-update document.
    pub async fn unset_fetch<I, S>(
        &self,
        id: impl Into<Bson>,
        fields: I,
    ) -> Result<Option<Document>, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(self
            .collection
            .find_one_and_update(
                doc! { "_id": id.into() },
                doc! { "$unset": null_fields(fields) },
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await?)
    }

    /// Applies a raw caller-constructed update document, upserting by `_id`.
    pub async fn update_by_id(
        &self,
        id: impl Into<Bson>,
        update: Document,
    ) -> Result<(), StoreError> {
        self.collection
            .update_one(doc! { "_id": id.into() }, update)
            .upsert(true)
            .await?;
        Ok(())
    }

    /// Like [`DocumentStore::update_by_id`], returning the post-update
    /// document.
    pub async fn update_by_id_fetch(
        &self,
        id: impl Into<Bson>,
        update: Document,
    ) -> Result<Option<Document>, StoreError> {
        Ok(self
            .collection
            .find_one_and_update(doc! { "_id": id.into() }, update)
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await?)
    }

    /// Replaces the whole document body, upserting if absent. Fields missing
    /// from `document` are lost.
    pub async fn replace(&self, id: impl Into<Bson>, document: Document) -> Result<(), StoreError> {
        self.collection
            .replace_one(doc! { "_id": id.into() }, document)
            .upsert(true)
            .await?;
        Ok(())
    }

    /// Adds numeric deltas to the named fields, upserting.
    pub async fn increment(
        &self,
        id: impl Into<Bson>,
        deltas: Document,
    ) -> Result<(), StoreError> {
        self.collection
            .update_one(doc! { "_id": id.into() }, doc! { "$inc": deltas })
            .upsert(true)
            .await?;
        Ok(())
    }

    /// Like [`DocumentStore::increment`], returning the post-update document.
    pub async fn increment_fetch(
        &self,
        id: impl Into<Bson>,
        deltas: Document,
    ) -> Result<Option<Document>, StoreError> {
        Ok(self
            .collection
            .find_one_and_update(doc! { "_id": id.into() }, doc! { "$inc": deltas })
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await?)
    }

    pub async fn delete_by_id(&self, id: impl Into<Bson>) -> Result<DeleteResult, StoreError> {
        Ok(self.collection.delete_many(doc! { "_id": id.into() }).await?)
    }

    /// Deletes everything matching `filter`; an empty filter clears the
    /// collection.
    pub async fn delete_many(
        &self,
        filter: impl Into<Option<Document>>,
    ) -> Result<DeleteResult, StoreError> {
        Ok(self
            .collection
            .delete_many(filter.into().unwrap_or_default())
            .await?)
    }

    /// Full collection scan, materialized.
    pub async fn get_all(&self) -> Result<Vec<Document>, StoreError> {
        Ok(self.collection.find(doc! {}).await?.try_collect().await?)
    }

    /// Builds an upserting update request against this collection, for use
    /// with [`DocumentStore::bulk_write`].
    pub fn update_model(&self, id: impl Into<Bson>, update: Document) -> WriteModel {
        WriteModel::UpdateOne(
            UpdateOneModel::builder()
                .namespace(self.collection.namespace())
                .filter(doc! { "_id": id.into() })
                .update(update)
                .upsert(true)
                .build(),
        )
    }

    /// Builds a delete request against this collection, for use with
    /// [`DocumentStore::bulk_write`].
    pub fn delete_model(&self, id: impl Into<Bson>) -> WriteModel {
        WriteModel::DeleteOne(
            DeleteOneModel::builder()
                .namespace(self.collection.namespace())
                .filter(doc! { "_id": id.into() })
                .build(),
        )
    }

    /// Submits a heterogeneous batch in one round trip. An empty batch is a
    /// no-op returning `None`. With `ordered` false, one request's failure
    /// does not block the others; the resulting error carries the partial
    /// outcome and propagates to the caller.
    pub async fn bulk_write(
        &self,
        models: Vec<WriteModel>,
        ordered: bool,
    ) -> Result<Option<SummaryBulkWriteResult>, StoreError> {
        if models.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.client.bulk_write(models).ordered(ordered).await?))
    }

    /// Upserts one request per input document, applying `opcode` to the
    /// listed fields, or to every field but `_id` when `fields` is `None`.
    /// Documents yielding no fields are skipped. Best-effort: partial batch
    /// failures are logged, not raised.
    pub async fn bulk_update(
        &self,
        documents: Vec<Document>,
        fields: Option<&[&str]>,
        opcode: Opcode,
    ) -> Result<BulkOutcome, StoreError> {
        let models = bulk_update_changes(&documents, fields)?
            .into_iter()
            .map(|(id, changes)| self.update_model(id, opcode.wrap(changes)))
            .collect();
        self.best_effort(models, "update").await
    }

    /// Strips `field` from every document carrying it, in one unordered
    /// batch. Best-effort: partial batch failures are logged, not raised.
    pub async fn bulk_unset(&self, field: &str) -> Result<BulkOutcome, StoreError> {
        let spec = FindSpec::new()
            .filter(doc! { field: { "$exists": true } })
            .projection(doc! { field: 1 });
        let models = self
            .find_many(spec)
            .await?
            .iter()
            .filter_map(|document| document.get("_id"))
            .map(|id| self.update_model(id.clone(), doc! { "$unset": { field: Bson::Null } }))
            .collect();
        self.best_effort(models, "unset").await
    }

    /// Deletes every document that holds nothing besides its `_id`.
    /// Best-effort: partial batch failures are logged, not raised.
    pub async fn prune_empty(&self) -> Result<BulkOutcome, StoreError> {
        let models = self
            .get_all()
            .await?
            .iter()
            .filter(|document| document.len() == 1)
            .filter_map(|document| document.get("_id"))
            .map(|id| self.delete_model(id.clone()))
            .collect();
        self.best_effort(models, "prune").await
    }

    /// The shared best-effort submission path: unordered, with bulk-write
    /// partial failures logged and collapsed to `PartiallyFailed` instead of
    /// propagating. Transport-level errors still propagate.
    async fn best_effort(
        &self,
        models: Vec<WriteModel>,
        label: &str,
    ) -> Result<BulkOutcome, StoreError> {
        if models.is_empty() {
            return Ok(BulkOutcome::Empty);
        }
        match self.client.bulk_write(models).ordered(false).await {
            Ok(result) => Ok(BulkOutcome::Applied(result)),
            Err(err) if matches!(*err.kind, ErrorKind::ClientBulkWrite(_)) => {
                error!(
                    "Database: bulk {} on '{}' partially failed: {:?}",
                    label,
                    self.name(),
                    err
                );
                Ok(BulkOutcome::PartiallyFailed)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Query description for [`DocumentStore::find_many`].
#[derive(Debug, Clone, Default)]
pub struct FindSpec {
    filter: Option<Document>,
    limit: i64,
    skip: u64,
    sort: Option<Document>,
    group: Option<Document>,
    projection: Option<Document>,
}

impl FindSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Document) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    pub fn sort(mut self, sort: Document) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn group(mut self, group: Document) -> Self {
        self.group = Some(group);
        self
    }

    pub fn projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }

    fn direct_scan(&self) -> bool {
        self.limit <= 0 && self.sort.is_none() && self.group.is_none() && self.filter.is_some()
    }

    /// Pipeline stages in the fixed order sort, skip, project, group, match,
    /// limit. The match stage runs after project/group, so filters refer to
    /// projected field names, not stored ones.
    fn pipeline(&self) -> Vec<Document> {
        let mut stages = Vec::new();
        if let Some(sort) = &self.sort {
            stages.push(doc! { "$sort": sort.clone() });
        }
        if self.skip > 0 {
            stages.push(doc! { "$skip": self.skip as i64 });
        }
        if let Some(projection) = &self.projection {
            stages.push(doc! { "$project": projection.clone() });
        }
        if let Some(group) = &self.group {
            stages.push(doc! { "$group": group.clone() });
        }
        if let Some(filter) = &self.filter {
            stages.push(doc! { "$match": filter.clone() });
        }
        if self.limit > 0 {
            stages.push(doc! { "$limit": self.limit });
        }
        stages
    }
}

fn ensure_keyed(document: &Document) -> Result<&Bson, StoreError> {
    match document.get("_id") {
        None | Some(Bson::Null) => Err(StoreError::MissingId),
        Some(Bson::String(s)) if s.is_empty() => Err(StoreError::MissingId),
        Some(id) => Ok(id),
    }
}

fn null_fields<I, S>(fields: I) -> Document
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    fields
        .into_iter()
        .map(|field| (field.as_ref().to_string(), Bson::Null))
        .collect()
}

/// The per-document change sets a `bulk_update` batch will carry: one
/// `(_id, field subset)` pair per document, with fieldless documents
/// dropped.
fn bulk_update_changes(
    documents: &[Document],
    fields: Option<&[&str]>,
) -> Result<Vec<(Bson, Document)>, StoreError> {
    let mut changes = Vec::with_capacity(documents.len());
    for document in documents {
        let id = ensure_keyed(document)?.clone();
        let subset = select_fields(document, fields);
        if subset.is_empty() {
            continue;
        }
        changes.push((id, subset));
    }
    Ok(changes)
}

fn select_fields(document: &Document, fields: Option<&[&str]>) -> Document {
    match fields {
        None => document
            .iter()
            .filter(|(key, _)| key.as_str() != "_id")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        Some(names) => names
            .iter()
            .filter_map(|name| document.get(*name).map(|value| (name.to_string(), value.clone())))
            .collect(),
    }
}
