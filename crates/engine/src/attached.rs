//! Attached document writer
//!
//! Attached documents live inside their parent, so every attached write
//! is a read-modify-write of the parent under its revision guard. Two
//! failure modes are distinguished strictly:
//!
//! - a mismatched *attached* revision means the caller's view of that
//!   entry is stale; retrying cannot help, so it fails immediately
//! - a mismatched *parent* revision means someone else wrote the parent
//!   between our read and our write; the whole attempt is retried from a
//!   fresh read, up to the configured number of retries

use tide_core::{
    AttachedDocument, DocStore, Error, PutAttachedDocument, PutAttachedResponse, Result, StorePut,
};
use tracing::trace;

/// Outcome of one write attempt
enum Attempt {
    Done(Vec<PutAttachedResponse>),
    /// Parent revision guard failed; retry from a fresh read
    Conflicted,
}

/// Write a batch of attached documents into one parent
///
/// All entries are carried by a single parent write, so the batch is
/// atomic: either every entry lands (with one new parent revision) or
/// none does. New entries are appended at the next free positions in
/// input order.
///
/// # Errors
///
/// - `NotFound`: the parent does not exist or is deleted, or an update
///   targets a position outside the attached sequence
/// - `Conflict`: an update's attached revision does not match the stored
///   entry
/// - `RetryExhausted`: the parent kept being written concurrently for
///   `retries + 1` consecutive attempts
pub fn put_attached_bulk(
    store: &dyn DocStore,
    parent_id: &str,
    docs: &[PutAttachedDocument],
    retries: usize,
) -> Result<Vec<PutAttachedResponse>> {
    let attempts = retries + 1;
    for attempt in 0..attempts {
        match try_put_attached(store, parent_id, docs)? {
            Attempt::Done(responses) => return Ok(responses),
            Attempt::Conflicted => {
                trace!(parent_id, attempt, "parent write conflicted, retrying");
            }
        }
    }
    Err(Error::RetryExhausted { attempts })
}

fn try_put_attached(
    store: &dyn DocStore,
    parent_id: &str,
    docs: &[PutAttachedDocument],
) -> Result<Attempt> {
    let parent = store
        .get(parent_id)?
        .filter(|doc| !doc.deleted)
        .ok_or_else(|| Error::not_found(parent_id))?;

    let mut attached = parent.attached.clone();
    let mut touched = Vec::with_capacity(docs.len());
    let mut assigned: Vec<(usize, u64)> = Vec::with_capacity(docs.len());

    for doc in docs {
        match doc.id {
            Some(id) => {
                let slot = attached
                    .get_mut(id)
                    .ok_or_else(|| Error::not_found(format!("{parent_id}/{id}")))?;
                if doc.rev != Some(slot.rev) {
                    return Err(Error::conflict(format!(
                        "attached document update conflict: {parent_id}/{id}"
                    )));
                }
                let rev = slot.rev + 1;
                *slot = AttachedDocument {
                    id,
                    rev,
                    deleted: doc.deleted,
                    fields: doc.fields.clone(),
                };
                touched.push(id);
                assigned.push((id, rev));
            }
            None => {
                let id = attached.len();
                let rev = doc.rev.unwrap_or(0) + 1;
                attached.push(AttachedDocument {
                    id,
                    rev,
                    deleted: doc.deleted,
                    fields: doc.fields.clone(),
                });
                touched.push(id);
                assigned.push((id, rev));
            }
        }
    }

    let write = StorePut {
        id: Some(parent.id.clone()),
        rev: Some(parent.rev),
        deleted: parent.deleted,
        fields: parent.fields,
        attached,
        last_touched_attached: touched,
    };
    match store.put(write) {
        Ok(response) => Ok(Attempt::Done(
            assigned
                .into_iter()
                .map(|(id, rev)| PutAttachedResponse {
                    id,
                    rev,
                    parent_id: response.id.clone(),
                    parent_rev: response.rev.clone(),
                })
                .collect(),
        )),
        Err(e) if e.is_conflict() => Ok(Attempt::Conflicted),
        Err(e) => Err(e),
    }
}
