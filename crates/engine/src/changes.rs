//! Change-feed fan-out
//!
//! The facade exposes two handler pools (document-level and
//! attached-level) but holds at most one subscription at the store
//! boundary, created when the first handler registers and dropped when
//! the last one leaves. Each store change fans out to:
//!
//! - every document handler, with the parent projection
//! - every attached handler, once per attached position the write
//!   touched (tombstoned entries included, so deletions propagate)

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tide_core::{AttachedWithParent, Change, Document, Error, Result, SubscriptionId};
use uuid::Uuid;

/// Document-level change handler
pub type DocHandler = Arc<dyn Fn(&Document) + Send + Sync>;

/// Attached-level change handler
pub type AttachedHandler = Arc<dyn Fn(&AttachedWithParent) + Send + Sync>;

/// Token identifying one registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(Uuid);

impl HandlerToken {
    fn new() -> Self {
        HandlerToken(Uuid::new_v4())
    }
}

#[derive(Default)]
struct Pools {
    docs: HashMap<HandlerToken, DocHandler>,
    attached: HashMap<HandlerToken, AttachedHandler>,
}

/// Handler registry shared between the facade and its store callback
#[derive(Default)]
pub struct ChangeFeed {
    pools: Mutex<Pools>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl ChangeFeed {
    /// Register a document-level handler
    pub fn add_doc_handler(&self, handler: DocHandler) -> HandlerToken {
        let token = HandlerToken::new();
        self.pools.lock().docs.insert(token, handler);
        token
    }

    /// Register an attached-level handler
    pub fn add_attached_handler(&self, handler: AttachedHandler) -> HandlerToken {
        let token = HandlerToken::new();
        self.pools.lock().attached.insert(token, handler);
        token
    }

    /// Remove a document-level handler
    ///
    /// # Errors
    ///
    /// `Validation` when the token is not registered in this pool.
    pub fn remove_doc_handler(&self, token: HandlerToken) -> Result<()> {
        self.pools
            .lock()
            .docs
            .remove(&token)
            .map(|_| ())
            .ok_or_else(|| Error::validation("unknown change handler token"))
    }

    /// Remove an attached-level handler
    ///
    /// # Errors
    ///
    /// `Validation` when the token is not registered in this pool.
    pub fn remove_attached_handler(&self, token: HandlerToken) -> Result<()> {
        self.pools
            .lock()
            .attached
            .remove(&token)
            .map(|_| ())
            .ok_or_else(|| Error::validation("unknown change handler token"))
    }

    /// Total registered handlers across both pools
    pub fn handler_count(&self) -> usize {
        let pools = self.pools.lock();
        pools.docs.len() + pools.attached.len()
    }

    /// Current store-boundary subscription, if any
    pub fn subscription(&self) -> Option<SubscriptionId> {
        *self.subscription.lock()
    }

    /// Record the store-boundary subscription
    pub fn set_subscription(&self, id: Option<SubscriptionId>) {
        *self.subscription.lock() = id;
    }

    /// Take the store-boundary subscription, leaving none
    pub fn take_subscription(&self) -> Option<SubscriptionId> {
        self.subscription.lock().take()
    }

    /// Fan one store change out to the registered handlers
    ///
    /// Handlers are snapshotted before invocation so they may register
    /// or remove handlers without deadlocking.
    pub fn dispatch(&self, change: &Change) {
        let (docs, attached): (Vec<DocHandler>, Vec<AttachedHandler>) = {
            let pools = self.pools.lock();
            (
                pools.docs.values().cloned().collect(),
                pools.attached.values().cloned().collect(),
            )
        };

        if !docs.is_empty() {
            let projection = change.doc.parent_projection();
            for handler in &docs {
                handler(&projection);
            }
        }

        if !attached.is_empty() {
            let parent = change.doc.parent_projection();
            for &position in &change.doc.last_touched_attached {
                let Some(entry) = change.doc.attached.get(position) else {
                    continue;
                };
                let row = AttachedWithParent {
                    attached: entry.clone(),
                    parent: parent.clone(),
                };
                for handler in &attached {
                    handler(&row);
                }
            }
        }
    }
}
