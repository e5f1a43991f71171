//! In-memory reference store
//!
//! Implements [`DocStore`] over a plain map guarded by a `parking_lot`
//! mutex. Index artifacts are materialized views: rows are computed when
//! a document is written or when the artifact is (re)built, with the
//! clock's instant at that moment. That is exactly what lets a row's
//! settled/unsettled classification go stale until the executor
//! triggers an in-place rebuild.
//!
//! Change fan-out is synchronous and in commit order: sequence numbers
//! are assigned and changes enqueued while the commit lock is held, and
//! a single drain delivers them in queue order with no internal lock
//! held, so handlers may re-enter the store.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tide_core::{
    emit_rows, reduce, Change, ChangeHandler, Clock, DocStore, Document, Error,
    GroupedQueryOptions, GroupedRow, IndexDefinition, IndexKey, PutResponse, Reduced, Result,
    Rev, StorePut, SubscriptionId,
};
use tracing::debug;
use uuid::Uuid;

struct MaterializedView {
    definition: IndexDefinition,
    /// Emitted rows keyed by their emit key (unique per row: the key
    /// always ends with the document id and, for attached rows, the
    /// attached id)
    rows: BTreeMap<IndexKey, Reduced>,
    /// Emit keys per document id, for incremental maintenance
    by_doc: HashMap<String, Vec<IndexKey>>,
}

impl MaterializedView {
    fn build(definition: IndexDefinition, docs: &BTreeMap<String, Document>, now: chrono::DateTime<chrono::Utc>) -> Self {
        let mut view = MaterializedView {
            definition,
            rows: BTreeMap::new(),
            by_doc: HashMap::new(),
        };
        for doc in docs.values() {
            view.update_doc(doc, now);
        }
        view
    }

    fn update_doc(&mut self, doc: &Document, now: chrono::DateTime<chrono::Utc>) {
        if let Some(old_keys) = self.by_doc.remove(&doc.id) {
            for key in old_keys {
                self.rows.remove(&key);
            }
        }
        let emitted = emit_rows(&self.definition, doc, now);
        if emitted.is_empty() {
            return;
        }
        let mut keys = Vec::with_capacity(emitted.len());
        for (key, value) in emitted {
            keys.push(key.clone());
            self.rows.insert(key, value);
        }
        self.by_doc.insert(doc.id.clone(), keys);
    }
}

#[derive(Default)]
struct StoreInner {
    docs: BTreeMap<String, Document>,
    views: HashMap<String, MaterializedView>,
    seq: u64,
}

#[derive(Default)]
struct NotifyQueue {
    pending: VecDeque<Change>,
    draining: bool,
}

/// In-memory document store with materialized grouped views
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<StoreInner>,
    subscribers: Mutex<HashMap<SubscriptionId, ChangeHandler>>,
    queue: Mutex<NotifyQueue>,
}

impl MemoryStore {
    /// Create an empty store reading time from the given clock
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(StoreInner::default()),
            subscribers: Mutex::new(HashMap::new()),
            queue: Mutex::new(NotifyQueue::default()),
        }
    }

    /// Deliver queued changes in commit order
    ///
    /// Changes enter the queue under the commit lock, so queue order is
    /// commit order. Only one drain runs at a time; a committer that
    /// finds a drain in progress leaves its change for the draining
    /// thread, which keeps delivery serialized even across threads.
    fn dispatch(&self) {
        {
            let mut queue = self.queue.lock();
            if queue.draining {
                return;
            }
            queue.draining = true;
        }
        loop {
            let change = {
                let mut queue = self.queue.lock();
                match queue.pending.pop_front() {
                    Some(change) => change,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            let handlers: Vec<ChangeHandler> =
                self.subscribers.lock().values().cloned().collect();
            for handler in handlers {
                handler(&change);
            }
        }
    }

    fn put_locked(&self, inner: &mut StoreInner, request: StorePut) -> Result<Document> {
        let id = request
            .id
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let rev = match inner.docs.get(&id) {
            Some(existing) => match &request.rev {
                Some(rev) if *rev == existing.rev => existing.rev.next(),
                Some(_) => {
                    return Err(Error::conflict(format!("revision mismatch for {id}")));
                }
                None => {
                    return Err(Error::conflict(format!("document {id} already exists")));
                }
            },
            None => {
                if request.rev.is_some() {
                    return Err(Error::conflict(format!("document {id} does not exist")));
                }
                Rev::first()
            }
        };
        let doc = Document {
            id: id.clone(),
            rev,
            deleted: request.deleted,
            fields: request.fields,
            attached: request.attached,
            last_touched_attached: request.last_touched_attached,
        };
        let now = self.clock.now();
        for view in inner.views.values_mut() {
            view.update_doc(&doc, now);
        }
        inner.docs.insert(id, doc.clone());
        inner.seq += 1;
        self.queue.lock().pending.push_back(Change {
            seq: inner.seq,
            doc: doc.clone(),
        });
        Ok(doc)
    }
}

impl DocStore for MemoryStore {
    fn get(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.inner.lock().docs.get(id).cloned())
    }

    fn put(&self, request: StorePut) -> Result<PutResponse> {
        let doc = {
            let mut inner = self.inner.lock();
            self.put_locked(&mut inner, request)?
        };
        self.dispatch();
        Ok(PutResponse {
            id: doc.id,
            rev: doc.rev,
        })
    }

    fn bulk_put(&self, requests: Vec<StorePut>) -> Result<Vec<Result<PutResponse>>> {
        let mut outcomes = Vec::with_capacity(requests.len());
        {
            let mut inner = self.inner.lock();
            for request in requests {
                outcomes.push(self.put_locked(&mut inner, request).map(|doc| PutResponse {
                    id: doc.id,
                    rev: doc.rev,
                }));
            }
        }
        self.dispatch();
        Ok(outcomes)
    }

    fn create_index(&self, id: &str, definition: IndexDefinition) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.views.contains_key(id) {
            return Err(Error::conflict(format!("index {id} already exists")));
        }
        debug!(index = id, "creating index artifact");
        let view = MaterializedView::build(definition, &inner.docs, self.clock.now());
        inner.views.insert(id.to_string(), view);
        Ok(())
    }

    fn rebuild_index(&self, id: &str, definition: IndexDefinition) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.views.contains_key(id) {
            return Err(Error::not_found(format!("index {id}")));
        }
        debug!(index = id, "rebuilding index artifact in place");
        let view = MaterializedView::build(definition, &inner.docs, self.clock.now());
        inner.views.insert(id.to_string(), view);
        Ok(())
    }

    fn grouped_query(
        &self,
        index_id: &str,
        options: GroupedQueryOptions,
    ) -> Result<Vec<GroupedRow>> {
        let inner = self.inner.lock();
        let view = inner
            .views
            .get(index_id)
            .ok_or_else(|| Error::not_found(format!("index {index_id}")))?;

        let mut groups: Vec<GroupedRow> = Vec::new();
        let mut pending: Vec<Reduced> = Vec::new();
        let mut current: Option<IndexKey> = None;
        for (key, value) in &view.rows {
            let prefix = key.prefix(options.group_level);
            match &current {
                Some(open) if *open == prefix => pending.push(value.clone()),
                Some(open) => {
                    groups.push(GroupedRow {
                        key: open.clone(),
                        value: reduce(pending.drain(..)),
                    });
                    current = Some(prefix);
                    pending.push(value.clone());
                }
                None => {
                    current = Some(prefix);
                    pending.push(value.clone());
                }
            }
        }
        if let Some(open) = current {
            groups.push(GroupedRow {
                key: open,
                value: reduce(pending.drain(..)),
            });
        }

        if options.descending {
            groups.reverse();
        }
        if let Some(limit) = options.limit {
            groups.truncate(limit);
        }
        Ok(groups)
    }

    fn subscribe(&self, handler: ChangeHandler) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.subscribers.lock().insert(id, handler);
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().remove(&id);
    }

    fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.docs.clear();
        inner.views.clear();
        self.subscribers.lock().clear();
        Ok(())
    }
}
