//! Database facade
//!
//! The user-facing surface: validated writes, reads that hide
//! tombstones, condition queries over parent and attached documents,
//! change subscriptions, migrations and reset. The facade owns the
//! store connection (established lazily, exactly once) and the shared
//! change-feed registry.

use crate::attached::put_attached_bulk;
use crate::changes::{AttachedHandler, ChangeFeed, DocHandler, HandlerToken};
use crate::executor::{QueryExecutor, QueryOptions, RawQueryRequest, RawQueryResponse};
use crate::store::MemoryStore;
use parking_lot::Mutex;
use std::sync::Arc;
use tide_core::{
    AttachedWithParent, Clock, Conditions, DocStore, Document, EmittedDoc, Error,
    PutAttachedDocument, PutAttachedResponse, PutDocument, PutResponse, Result, StorePut,
    SystemClock, Value,
};
use tracing::info;

/// Field names the facade reserves for itself
const RESERVED_FIELDS: [&str; 4] = ["_attachments", "_conflicts", "filters", "views"];

/// Id of the bookkeeping document recording executed migrations
const MIGRATIONS_DOC_ID: &str = "migrations";

/// Migration callback; receives the database it runs against
pub type MigrationCallback = Arc<dyn Fn(&Arc<Database>) -> Result<()> + Send + Sync>;

/// Callback invoked by [`Database::reset`] between teardown and reconnect
pub type ResetCallback = Arc<dyn Fn(&Arc<Database>) -> Result<()> + Send + Sync>;

/// One named migration, executed at most once per database
#[derive(Clone)]
pub struct Migration {
    /// Stable identifier; doubles as the bookkeeping field name
    pub id: String,
    /// The migration body
    pub callback: MigrationCallback,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Database construction options
#[derive(Clone, Default)]
pub struct DatabaseOptions {
    /// Compare string sort values without case folding
    pub case_sensitive_sorting: bool,
    /// Migrations run on connect, in order
    pub migrations: Vec<Migration>,
    /// Retries for attached writes racing on their parent (0 = single attempt)
    pub retries: usize,
}

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Newly settled rows per read that trigger an index rebuild
    pub reindex_threshold: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Self { reindex_threshold: 1 }
    }
}

/// Builds the store on (re)connect; swappable for tests
pub type StoreFactory = Arc<dyn Fn(Arc<dyn Clock>) -> Arc<dyn DocStore> + Send + Sync>;

enum ConnectState {
    Unconnected,
    Ready(Arc<dyn DocStore>),
}

/// The database facade
pub struct Database {
    name: String,
    options: DatabaseOptions,
    clock: Arc<dyn Clock>,
    factory: StoreFactory,
    state: Mutex<ConnectState>,
    feed: Arc<ChangeFeed>,
    executor: QueryExecutor,
}

impl Database {
    /// Open a database backed by the in-memory store
    pub fn open(name: impl Into<String>, options: DatabaseOptions, config: Configuration) -> Arc<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let factory: StoreFactory = Arc::new(|clock| Arc::new(MemoryStore::new(clock)));
        Self::open_with(name, options, config, clock, factory)
    }

    /// Open a database with an explicit clock and store factory
    pub fn open_with(
        name: impl Into<String>,
        options: DatabaseOptions,
        config: Configuration,
        clock: Arc<dyn Clock>,
        factory: StoreFactory,
    ) -> Arc<Self> {
        let executor = QueryExecutor::new(
            clock.clone(),
            config.reindex_threshold,
            options.case_sensitive_sorting,
        );
        Arc::new(Self {
            name: name.into(),
            options,
            clock,
            factory,
            state: Mutex::new(ConnectState::Unconnected),
            feed: Arc::new(ChangeFeed::default()),
            executor,
        })
    }

    /// Database name
    pub fn name(&self) -> &str {
        &self.name
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    /// Connected store, connecting (and migrating) on first use
    ///
    /// The transition to the connected state happens before migrations
    /// run, so migration callbacks can use the database recursively
    /// without re-entering the connect path.
    fn store(self: &Arc<Self>) -> Result<Arc<dyn DocStore>> {
        let (store, fresh) = {
            let mut state = self.state.lock();
            match &*state {
                ConnectState::Ready(store) => (store.clone(), false),
                ConnectState::Unconnected => {
                    let store = (self.factory)(self.clock.clone());
                    *state = ConnectState::Ready(store.clone());
                    (store, true)
                }
            }
        };
        if fresh {
            info!(name = self.name.as_str(), "connected");
            self.refresh_subscription()?;
            self.migrate()?;
        }
        Ok(store)
    }

    fn connected_store(&self) -> Option<Arc<dyn DocStore>> {
        match &*self.state.lock() {
            ConnectState::Ready(store) => Some(store.clone()),
            ConnectState::Unconnected => None,
        }
    }

    /// Reconcile the store-boundary subscription with the handler pools
    ///
    /// At most one subscription exists; it is created when the first
    /// handler appears and dropped when the last one leaves.
    fn refresh_subscription(self: &Arc<Self>) -> Result<()> {
        let store = self.connected_store();
        match (&store, self.feed.handler_count() > 0) {
            (Some(store), true) => {
                if self.feed.subscription().is_none() {
                    let feed = self.feed.clone();
                    let id = store.subscribe(Arc::new(move |change| feed.dispatch(change)));
                    self.feed.set_subscription(Some(id));
                }
            }
            _ => {
                if let Some(id) = self.feed.take_subscription() {
                    if let Some(store) = store {
                        store.unsubscribe(id);
                    }
                }
            }
        }
        Ok(())
    }

    /// Destroy all data and reconnect from scratch
    ///
    /// The optional callback runs while the database is torn down,
    /// before the new store is created; migrations run again against
    /// the empty store.
    pub fn reset(self: &Arc<Self>, callback: Option<ResetCallback>) -> Result<()> {
        let store = self.store()?;
        store.destroy()?;
        *self.state.lock() = ConnectState::Unconnected;
        // The destroyed store dropped its subscriptions; forget ours so
        // reconnect creates a fresh one.
        self.feed.set_subscription(None);
        info!(name = self.name.as_str(), "reset");
        if let Some(callback) = callback {
            callback(self)?;
        }
        self.store()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Migrations
    // ------------------------------------------------------------------

    fn migrate(self: &Arc<Self>) -> Result<()> {
        if self.options.migrations.is_empty() {
            return Ok(());
        }
        let migrations = self.options.migrations.clone();
        let stored = self.get_if_exists(MIGRATIONS_DOC_ID)?;
        let mut fields = stored.as_ref().map(|doc| doc.fields.clone()).unwrap_or_default();
        let mut rev = stored.map(|doc| doc.rev);

        for migration in migrations {
            if fields.get(&migration.id) == Some(&Value::Bool(true)) {
                continue;
            }
            info!(name = self.name.as_str(), migration = migration.id.as_str(), "running migration");
            (migration.callback)(self)?;
            fields.insert(migration.id.clone(), Value::Bool(true));
            let response = self.put(PutDocument {
                id: Some(MIGRATIONS_DOC_ID.to_string()),
                rev: rev.clone(),
                deleted: false,
                fields: fields.clone(),
                attached: None,
            })?;
            rev = Some(response.rev);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Write a parent document
    ///
    /// # Errors
    ///
    /// `Validation` for reserved field names or malformed attached ids;
    /// `Conflict` when the revision guard fails; `NotFound` when
    /// preserving attached entries of a document that does not exist.
    pub fn put(self: &Arc<Self>, doc: PutDocument) -> Result<PutResponse> {
        let store = self.store()?;
        let request = self.resolve_put(&store, doc)?;
        store.put(request)
    }

    /// Write a parent document, treating a revision conflict as "already
    /// exists": returns `None` instead of failing
    pub fn put_if_not_exists(self: &Arc<Self>, doc: PutDocument) -> Result<Option<PutResponse>> {
        match self.put(doc) {
            Ok(response) => Ok(Some(response)),
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write several parent documents; only successful writes are
    /// acknowledged, individual conflicts are dropped silently
    pub fn bulk_docs(self: &Arc<Self>, docs: Vec<PutDocument>) -> Result<Vec<PutResponse>> {
        let store = self.store()?;
        let requests = docs
            .into_iter()
            .map(|doc| self.resolve_put(&store, doc))
            .collect::<Result<Vec<_>>>()?;
        let outcomes = store.bulk_put(requests)?;
        Ok(outcomes.into_iter().filter_map(|outcome| outcome.ok()).collect())
    }

    fn resolve_put(&self, store: &Arc<dyn DocStore>, doc: PutDocument) -> Result<StorePut> {
        for field in doc.fields.keys() {
            if RESERVED_FIELDS.contains(&field.as_str()) {
                return Err(Error::validation(format!("reserved field name: {field}")));
            }
        }
        let attached = match doc.attached {
            None => Vec::new(),
            Some(entries) if entries.is_empty() => {
                // Preserve what is stored; only meaningful for updates.
                let id = doc.id.as_deref().ok_or_else(|| {
                    Error::validation("preserving attached documents requires an id")
                })?;
                if doc.rev.is_none() {
                    return Err(Error::validation(
                        "preserving attached documents requires a revision",
                    ));
                }
                let stored = store.get(id)?.ok_or_else(|| Error::not_found(id))?;
                stored.attached
            }
            Some(entries) => {
                for (position, entry) in entries.iter().enumerate() {
                    if entry.id != position {
                        return Err(Error::validation(format!(
                            "attached id {} does not match its position {position}",
                            entry.id
                        )));
                    }
                }
                entries
            }
        };
        Ok(StorePut {
            id: doc.id,
            rev: doc.rev,
            deleted: doc.deleted,
            fields: doc.fields,
            attached,
            last_touched_attached: Vec::new(),
        })
    }

    /// Write a single attached document
    pub fn put_attached(
        self: &Arc<Self>,
        parent_id: &str,
        doc: PutAttachedDocument,
    ) -> Result<PutAttachedResponse> {
        let mut responses = self.put_attached_bulk(parent_id, vec![doc])?;
        Ok(responses.remove(0))
    }

    /// Write a batch of attached documents into one parent atomically
    pub fn put_attached_bulk(
        self: &Arc<Self>,
        parent_id: &str,
        docs: Vec<PutAttachedDocument>,
    ) -> Result<Vec<PutAttachedResponse>> {
        let store = self.store()?;
        put_attached_bulk(store.as_ref(), parent_id, &docs, self.options.retries)
    }

    /// Write an attached document, treating a revision conflict as
    /// "already exists": returns `None` instead of failing
    pub fn put_if_not_exists_attached(
        self: &Arc<Self>,
        parent_id: &str,
        doc: PutAttachedDocument,
    ) -> Result<Option<PutAttachedResponse>> {
        match self.put_attached(parent_id, doc) {
            Ok(response) => Ok(Some(response)),
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write attached documents across several parents
    ///
    /// Entries are grouped per parent and written with one atomic batch
    /// each; responses preserve input order.
    pub fn bulk_docs_attached(
        self: &Arc<Self>,
        docs: Vec<(String, PutAttachedDocument)>,
    ) -> Result<Vec<PutAttachedResponse>> {
        let store = self.store()?;
        let mut order: Vec<String> = Vec::new();
        let mut groups: std::collections::HashMap<String, Vec<PutAttachedDocument>> =
            std::collections::HashMap::new();
        for (parent_id, doc) in docs {
            if !groups.contains_key(&parent_id) {
                order.push(parent_id.clone());
            }
            groups.entry(parent_id).or_default().push(doc);
        }
        let mut responses = Vec::new();
        for parent_id in order {
            let batch = groups.remove(&parent_id).unwrap_or_default();
            responses.extend(put_attached_bulk(
                store.as_ref(),
                &parent_id,
                &batch,
                self.options.retries,
            )?);
        }
        Ok(responses)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read a parent document; tombstones read as missing
    ///
    /// # Errors
    ///
    /// `NotFound` when the document does not exist or is deleted.
    pub fn get(self: &Arc<Self>, id: &str) -> Result<Document> {
        let store = self.store()?;
        store
            .get(id)?
            .filter(|doc| !doc.deleted)
            .map(|doc| doc.parent_projection())
            .ok_or_else(|| Error::not_found(id))
    }

    /// Read a parent document if it exists
    pub fn get_if_exists(self: &Arc<Self>, id: &str) -> Result<Option<Document>> {
        match self.get(id) {
            Ok(doc) => Ok(Some(doc)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// True when a live (non-deleted) document exists under this id
    pub fn exists(self: &Arc<Self>, id: &str) -> Result<bool> {
        Ok(self.get_if_exists(id)?.is_some())
    }

    /// Read an attached document joined with its parent projection
    ///
    /// # Errors
    ///
    /// `NotFound` when the parent is missing or deleted, the position is
    /// out of range, or the entry is tombstoned.
    pub fn get_attached(self: &Arc<Self>, id: usize, parent_id: &str) -> Result<AttachedWithParent> {
        let store = self.store()?;
        let parent = store
            .get(parent_id)?
            .filter(|doc| !doc.deleted)
            .ok_or_else(|| Error::not_found(parent_id))?;
        let attached = parent
            .attached
            .get(id)
            .filter(|entry| !entry.deleted)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("{parent_id}/{id}")))?;
        Ok(AttachedWithParent {
            attached,
            parent: parent.parent_projection(),
        })
    }

    /// Read an attached document if it exists
    pub fn get_if_exists_attached(
        self: &Arc<Self>,
        id: usize,
        parent_id: &str,
    ) -> Result<Option<AttachedWithParent>> {
        match self.get_attached(id, parent_id) {
            Ok(row) => Ok(Some(row)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// True when a live attached document exists at this position
    pub fn exists_attached(self: &Arc<Self>, id: usize, parent_id: &str) -> Result<bool> {
        Ok(self.get_if_exists_attached(id, parent_id)?.is_some())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Run a raw query; the untyped entry point the typed queries wrap
    pub fn raw_query(
        self: &Arc<Self>,
        options: &QueryOptions,
        raw: &RawQueryRequest,
    ) -> Result<RawQueryResponse> {
        let store = self.store()?;
        self.executor.raw_query(store.as_ref(), options, raw)
    }

    /// Query parent documents matching the conditions
    pub fn query(self: &Arc<Self>, conditions: Conditions, options: &QueryOptions) -> Result<Vec<Document>> {
        let response = self.raw_query(
            options,
            &RawQueryRequest {
                conditions,
                docs: true,
                ..RawQueryRequest::default()
            },
        )?;
        Ok(response
            .docs
            .into_iter()
            .filter_map(|doc| match doc {
                EmittedDoc::Parent(doc) => Some(doc),
                EmittedDoc::Attached(_) => None,
            })
            .collect())
    }

    /// Query attached documents matching the conditions
    pub fn query_attached(
        self: &Arc<Self>,
        conditions: Conditions,
        parent_conditions: Conditions,
        options: &QueryOptions,
    ) -> Result<Vec<AttachedWithParent>> {
        let response = self.raw_query(
            options,
            &RawQueryRequest {
                conditions,
                parent_conditions: Some(parent_conditions),
                docs: true,
                ..RawQueryRequest::default()
            },
        )?;
        Ok(response
            .docs
            .into_iter()
            .filter_map(|doc| match doc {
                EmittedDoc::Attached(row) => Some(row),
                EmittedDoc::Parent(_) => None,
            })
            .collect())
    }

    /// Exact count of parent documents matching the conditions
    pub fn count(self: &Arc<Self>, conditions: Conditions) -> Result<usize> {
        let response = self.raw_query(
            &QueryOptions::default(),
            &RawQueryRequest {
                conditions,
                count: true,
                ..RawQueryRequest::default()
            },
        )?;
        Ok(response.count)
    }

    /// Exact count of attached documents matching the conditions
    pub fn count_attached(
        self: &Arc<Self>,
        conditions: Conditions,
        parent_conditions: Conditions,
    ) -> Result<usize> {
        let response = self.raw_query(
            &QueryOptions::default(),
            &RawQueryRequest {
                conditions,
                parent_conditions: Some(parent_conditions),
                count: true,
                ..RawQueryRequest::default()
            },
        )?;
        Ok(response.count)
    }

    /// Number of unsettled rows under the conditions' index
    ///
    /// A reactive layer polls this to know when re-querying may change
    /// results without any document having been written.
    pub fn unsettled(self: &Arc<Self>, conditions: Conditions, options: &QueryOptions) -> Result<usize> {
        let response = self.raw_query(
            options,
            &RawQueryRequest {
                conditions,
                unsettled_count: true,
                ..RawQueryRequest::default()
            },
        )?;
        Ok(response.unsettled_count)
    }

    /// Number of unsettled rows under the attached conditions' index
    pub fn unsettled_attached(
        self: &Arc<Self>,
        conditions: Conditions,
        parent_conditions: Conditions,
        options: &QueryOptions,
    ) -> Result<usize> {
        let response = self.raw_query(
            options,
            &RawQueryRequest {
                conditions,
                parent_conditions: Some(parent_conditions),
                unsettled_count: true,
                ..RawQueryRequest::default()
            },
        )?;
        Ok(response.unsettled_count)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe to parent document changes
    pub fn subscribe(self: &Arc<Self>, handler: DocHandler) -> Result<HandlerToken> {
        let token = self.feed.add_doc_handler(handler);
        self.refresh_subscription()?;
        Ok(token)
    }

    /// Subscribe to attached document changes
    pub fn subscribe_attached(self: &Arc<Self>, handler: AttachedHandler) -> Result<HandlerToken> {
        let token = self.feed.add_attached_handler(handler);
        self.refresh_subscription()?;
        Ok(token)
    }

    /// Drop a parent-change subscription
    ///
    /// # Errors
    ///
    /// `Validation` when the token is unknown.
    pub fn unsubscribe(self: &Arc<Self>, token: HandlerToken) -> Result<()> {
        self.feed.remove_doc_handler(token)?;
        self.refresh_subscription()
    }

    /// Drop an attached-change subscription
    ///
    /// # Errors
    ///
    /// `Validation` when the token is unknown.
    pub fn unsubscribe_attached(self: &Arc<Self>, token: HandlerToken) -> Result<()> {
        self.feed.remove_attached_handler(token)?;
        self.refresh_subscription()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;
    use tide_core::{AttachedDocument, FieldOp};

    fn db() -> Arc<Database> {
        Database::open("test", DatabaseOptions::default(), Configuration::default())
    }

    #[test]
    fn test_put_get_round_trip() {
        let db = db();
        let response = db.put(PutDocument::new().with_id("d").field("x", 1i64)).unwrap();
        assert_eq!(response.id, "d");
        let doc = db.get("d").unwrap();
        assert_eq!(doc.field("x"), Some(&Value::Number(1.0)));
        assert!(doc.attached.is_empty());
    }

    #[test]
    fn test_get_hides_tombstones() {
        let db = db();
        let response = db.put(PutDocument::new().with_id("d")).unwrap();
        db.put(PutDocument {
            id: Some("d".into()),
            rev: Some(response.rev),
            deleted: true,
            ..PutDocument::default()
        })
        .unwrap();
        assert!(db.get("d").unwrap_err().is_not_found());
        assert_eq!(db.get_if_exists("d").unwrap(), None);
        assert!(!db.exists("d").unwrap());
    }

    #[test]
    fn test_reserved_fields_rejected() {
        let db = db();
        for field in RESERVED_FIELDS {
            let err = db
                .put(PutDocument::new().with_id("d").field(field, 1i64))
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "field {field}");
        }
    }

    #[test]
    fn test_attached_ids_must_match_positions() {
        let db = db();
        let err = db
            .put(PutDocument {
                id: Some("d".into()),
                attached: Some(vec![AttachedDocument {
                    id: 1,
                    rev: 1,
                    deleted: false,
                    fields: Default::default(),
                }]),
                ..PutDocument::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_empty_attached_preserves_stored_sequence() {
        let db = db();
        db.put(PutDocument::new().with_id("d")).unwrap();
        db.put_attached("d", PutAttachedDocument::new().field("n", 1i64)).unwrap();

        let stored = db.get_if_exists("d").unwrap().unwrap();
        db.put(PutDocument {
            id: Some("d".into()),
            rev: Some(stored.rev),
            fields: stored.fields,
            attached: Some(Vec::new()),
            ..PutDocument::default()
        })
        .unwrap();

        let row = db.get_attached(0, "d").unwrap();
        assert_eq!(row.attached.field("n"), Some(&Value::Number(1.0)));
    }

    #[test]
    fn test_put_without_attached_drops_sequence() {
        let db = db();
        db.put(PutDocument::new().with_id("d")).unwrap();
        db.put_attached("d", PutAttachedDocument::new()).unwrap();
        let stored = db.get_if_exists("d").unwrap().unwrap();
        db.put(PutDocument {
            id: Some("d".into()),
            rev: Some(stored.rev),
            attached: None,
            ..PutDocument::default()
        })
        .unwrap();
        assert!(!db.exists_attached(0, "d").unwrap());
    }

    #[test]
    fn test_put_if_not_exists_absorbs_conflicts() {
        let db = db();
        assert!(db.put_if_not_exists(PutDocument::new().with_id("d")).unwrap().is_some());
        assert!(db.put_if_not_exists(PutDocument::new().with_id("d")).unwrap().is_none());
    }

    #[test]
    fn test_bulk_docs_keeps_only_successes() {
        let db = db();
        db.put(PutDocument::new().with_id("taken")).unwrap();
        let responses = db
            .bulk_docs(vec![
                PutDocument::new().with_id("a"),
                PutDocument::new().with_id("taken"),
                PutDocument::new().with_id("b"),
            ])
            .unwrap();
        let ids: Vec<&str> = responses.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_attached_lifecycle() {
        let db = db();
        db.put(PutDocument::new().with_id("p")).unwrap();
        let first = db.put_attached("p", PutAttachedDocument::new().field("n", 1i64)).unwrap();
        assert_eq!((first.id, first.rev), (0, 1));

        // Tombstoning hides the entry from reads but keeps the position.
        db.put_attached(
            "p",
            PutAttachedDocument {
                id: Some(0),
                rev: Some(1),
                deleted: true,
                ..PutAttachedDocument::default()
            },
        )
        .unwrap();
        assert!(db.get_attached(0, "p").unwrap_err().is_not_found());
        let next = db.put_attached("p", PutAttachedDocument::new()).unwrap();
        assert_eq!(next.id, 1);
    }

    #[test]
    fn test_bulk_docs_attached_groups_per_parent() {
        let db = db();
        db.put(PutDocument::new().with_id("p1")).unwrap();
        db.put(PutDocument::new().with_id("p2")).unwrap();
        let responses = db
            .bulk_docs_attached(vec![
                ("p1".into(), PutAttachedDocument::new()),
                ("p2".into(), PutAttachedDocument::new()),
                ("p1".into(), PutAttachedDocument::new()),
            ])
            .unwrap();
        assert_eq!(responses.len(), 3);
        // p1 got two entries through one atomic write.
        let p1 = db.get_if_exists("p1").unwrap().unwrap();
        assert_eq!(p1.rev.generation(), 2);
        assert!(db.exists_attached(1, "p1").unwrap());
    }

    #[test]
    fn test_query_and_count() {
        let db = db();
        for (id, x) in [("a", 1i64), ("b", 2), ("c", 3)] {
            db.put(PutDocument::new().with_id(id).field("x", x)).unwrap();
        }
        let conds = Conditions::field("x", FieldOp::Gte(Value::Number(2.0)));
        let docs = db.query(conds.clone(), &QueryOptions::default()).unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(db.count(conds).unwrap(), 2);
    }

    #[test]
    fn test_query_attached_filters_both_scopes() {
        let db = db();
        db.put(PutDocument::new().with_id("p1").field("kind", "open")).unwrap();
        db.put(PutDocument::new().with_id("p2").field("kind", "closed")).unwrap();
        for parent in ["p1", "p2"] {
            db.put_attached(parent, PutAttachedDocument::new().field("n", 1i64)).unwrap();
            db.put_attached(parent, PutAttachedDocument::new().field("n", 2i64)).unwrap();
        }
        let rows = db
            .query_attached(
                Conditions::field("n", FieldOp::Eq(Value::Number(2.0))),
                Conditions::field("kind", FieldOp::Eq(Value::String("open".into()))),
                &QueryOptions::default(),
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].parent.id, "p1");
        assert_eq!(rows[0].attached.id, 1);
        assert_eq!(
            db.count_attached(
                Conditions::new(),
                Conditions::field("kind", FieldOp::Eq(Value::String("open".into())))
            )
            .unwrap(),
            2
        );
    }

    #[test]
    fn test_subscription_lifecycle() {
        let db = db();
        let seen = Arc::new(PMutex::new(Vec::new()));
        let sink = seen.clone();
        let token = db
            .subscribe(Arc::new(move |doc: &Document| sink.lock().push(doc.id.clone())))
            .unwrap();

        db.put(PutDocument::new().with_id("d")).unwrap();
        assert_eq!(*seen.lock(), vec!["d".to_string()]);

        db.unsubscribe(token).unwrap();
        db.put(PutDocument::new().with_id("e")).unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert!(db.unsubscribe(token).is_err());
    }

    #[test]
    fn test_migrations_run_once() {
        let ran = Arc::new(PMutex::new(0usize));
        let counter = ran.clone();
        let db = Database::open(
            "test",
            DatabaseOptions {
                migrations: vec![Migration {
                    id: "m1".into(),
                    callback: Arc::new(move |db| {
                        *counter.lock() += 1;
                        db.put(PutDocument::new().with_id("seeded"))?;
                        Ok(())
                    }),
                }],
                ..DatabaseOptions::default()
            },
            Configuration::default(),
        );
        assert!(db.exists("seeded").unwrap());
        // Further store access must not run the migration again.
        assert!(!db.exists("other").unwrap());
        assert_eq!(*ran.lock(), 1);

        let bookkeeping = db.get(MIGRATIONS_DOC_ID).unwrap();
        assert_eq!(bookkeeping.field("m1"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_reset_destroys_and_reruns_migrations() {
        let ran = Arc::new(PMutex::new(0usize));
        let counter = ran.clone();
        let db = Database::open(
            "test",
            DatabaseOptions {
                migrations: vec![Migration {
                    id: "m1".into(),
                    callback: Arc::new(move |_| {
                        *counter.lock() += 1;
                        Ok(())
                    }),
                }],
                ..DatabaseOptions::default()
            },
            Configuration::default(),
        );
        db.put(PutDocument::new().with_id("d")).unwrap();
        assert_eq!(*ran.lock(), 1);

        let called = Arc::new(PMutex::new(false));
        let flag = called.clone();
        db.reset(Some(Arc::new(move |_| {
            *flag.lock() = true;
            Ok(())
        })))
        .unwrap();

        assert!(*called.lock());
        assert!(!db.exists("d").unwrap());
        assert_eq!(*ran.lock(), 2);
    }

    #[test]
    fn test_subscription_survives_reset() {
        let db = db();
        let seen = Arc::new(PMutex::new(0usize));
        let sink = seen.clone();
        db.subscribe(Arc::new(move |_: &Document| *sink.lock() += 1)).unwrap();

        db.put(PutDocument::new().with_id("d")).unwrap();
        db.reset(None).unwrap();
        db.put(PutDocument::new().with_id("d")).unwrap();
        assert_eq!(*seen.lock(), 2);
    }
}
