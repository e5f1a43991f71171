//! Reactive handles
//!
//! A reactive handle wraps one query (or read) and keeps its result
//! current: it re-runs the fetch whenever a relevant change arrives on
//! the change feed and, optionally, on a fixed timer so time-relative
//! conditions drift into place without any write happening.
//!
//! Refreshes collapse: triggers arriving while a fetch is in flight
//! coalesce into a single trailing rerun instead of queueing one fetch
//! per trigger, so the handle always lands on the latest state. A
//! failed background refresh keeps the previous value and reports
//! through the global error hook.

use crate::changes::HandlerToken;
use crate::database::Database;
use crate::executor::QueryOptions;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tide_core::{AttachedWithParent, Conditions, Document, Error, Result};
use tracing::error;

/// Hook receiving errors from background refreshes
pub type ErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;

static ERROR_HOOK: RwLock<Option<ErrorHook>> = RwLock::new(None);

/// Install (or clear) the global background-error hook
///
/// Without a hook, background refresh failures are logged at error
/// level and otherwise swallowed; the handle keeps its previous value.
pub fn set_error_hook(hook: Option<ErrorHook>) {
    *ERROR_HOOK.write() = hook;
}

fn report_error(e: &Error) {
    let hook = ERROR_HOOK.read().clone();
    match hook {
        Some(hook) => hook(e),
        None => error!(error = %e, "reactive refresh failed"),
    }
}

enum WatchKind {
    Docs,
    Attached,
}

struct HandleState<T> {
    value: T,
    loading: bool,
    /// A trigger arrived while a fetch was in flight; rerun once it lands
    pending: bool,
}

struct HandleInner<T> {
    state: Mutex<HandleState<T>>,
    stopped: AtomicBool,
    db: Weak<Database>,
    subscription: Mutex<Option<(WatchKind, HandlerToken)>>,
    timer: Mutex<Option<TimerStop>>,
}

/// Signals the timer thread to exit promptly
struct TimerStop(Arc<(Mutex<bool>, Condvar)>);

impl TimerStop {
    fn stop(&self) {
        let (lock, cvar) = &*self.0;
        *lock.lock() = true;
        cvar.notify_all();
    }
}

/// A live result that tracks database changes until unsubscribed
///
/// Dropping the handle unsubscribes it.
pub struct ReactiveHandle<T> {
    inner: Arc<HandleInner<T>>,
}

impl<T: Clone> ReactiveHandle<T> {
    /// Snapshot of the current value
    pub fn get(&self) -> T {
        self.inner.state.lock().value.clone()
    }
}

impl<T> ReactiveHandle<T> {
    /// True while a background refresh is in flight
    pub fn loading(&self) -> bool {
        self.inner.state.lock().loading
    }

    /// Stop tracking changes; the last value stays readable
    ///
    /// Idempotent; also invoked on drop.
    pub fn unsubscribe(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.stop();
        }
        if let Some((kind, token)) = self.inner.subscription.lock().take() {
            if let Some(db) = self.inner.db.upgrade() {
                let _ = match kind {
                    WatchKind::Docs => db.unsubscribe(token),
                    WatchKind::Attached => db.unsubscribe_attached(token),
                };
            }
        }
    }
}

impl<T> Drop for ReactiveHandle<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn refresh<T>(
    db: &Arc<Database>,
    inner: &Arc<HandleInner<T>>,
    fetch: &(dyn Fn(&Arc<Database>) -> Result<T> + Send + Sync),
) {
    if inner.stopped.load(Ordering::SeqCst) {
        return;
    }
    {
        let mut state = inner.state.lock();
        if state.loading {
            // The in-flight fetch reruns once more when it lands, so
            // whatever this trigger observed is picked up then.
            state.pending = true;
            return;
        }
        state.loading = true;
    }
    loop {
        match fetch(db) {
            Ok(value) => inner.state.lock().value = value,
            Err(e) => report_error(&e),
        }
        let mut state = inner.state.lock();
        if state.pending && !inner.stopped.load(Ordering::SeqCst) {
            state.pending = false;
            continue;
        }
        state.loading = false;
        return;
    }
}

/// Which changes trigger a refresh
enum Watch {
    Docs(Option<crate::executor::UpdatePredicate>),
    Attached(Option<crate::executor::AttachedUpdatePredicate>),
}

fn spawn<T, F>(
    db: &Arc<Database>,
    options: &QueryOptions,
    watch: Watch,
    fetch: F,
) -> Result<ReactiveHandle<T>>
where
    T: Send + 'static,
    F: Fn(&Arc<Database>) -> Result<T> + Send + Sync + 'static,
{
    // The initial fetch is synchronous; construction fails if it does.
    let value = fetch(db)?;
    let inner = Arc::new(HandleInner {
        state: Mutex::new(HandleState {
            value,
            loading: false,
            pending: false,
        }),
        stopped: AtomicBool::new(false),
        db: Arc::downgrade(db),
        subscription: Mutex::new(None),
        timer: Mutex::new(None),
    });

    // Weak on both sides: the handle must not keep the database alive,
    // and registered handlers must not keep a dropped handle alive.
    let weak_db = Arc::downgrade(db);
    let weak_inner = Arc::downgrade(&inner);
    let fetch = Arc::new(fetch);
    let trigger: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
        let (Some(db), Some(inner)) = (weak_db.upgrade(), weak_inner.upgrade()) else {
            return;
        };
        refresh(&db, &inner, fetch.as_ref());
    });

    let subscription = match watch {
        Watch::Docs(update) => {
            let trigger = trigger.clone();
            let token = db.subscribe(Arc::new(move |doc: &Document| {
                if update.as_ref().map_or(true, |gate| gate(doc)) {
                    trigger();
                }
            }))?;
            (WatchKind::Docs, token)
        }
        Watch::Attached(update) => {
            let trigger = trigger.clone();
            let token = db.subscribe_attached(Arc::new(move |row: &AttachedWithParent| {
                if update.as_ref().map_or(true, |gate| gate(row)) {
                    trigger();
                }
            }))?;
            (WatchKind::Attached, token)
        }
    };
    *inner.subscription.lock() = Some(subscription);

    if let Some(interval) = options.update_interval {
        *inner.timer.lock() = Some(start_timer(interval, trigger));
    }

    Ok(ReactiveHandle { inner })
}

fn start_timer(interval: Duration, trigger: Arc<dyn Fn() + Send + Sync>) -> TimerStop {
    let pair = Arc::new((Mutex::new(false), Condvar::new()));
    let thread_pair = pair.clone();
    thread::spawn(move || {
        let (lock, cvar) = &*thread_pair;
        let mut stopped = lock.lock();
        loop {
            let timed_out = cvar.wait_for(&mut stopped, interval).timed_out();
            if *stopped {
                break;
            }
            if timed_out {
                MutexGuard::unlocked(&mut stopped, || trigger());
            }
        }
    });
    TimerStop(pair)
}

impl Database {
    /// Live query over parent documents
    pub fn reactive_query(
        self: &Arc<Self>,
        conditions: Conditions,
        options: &QueryOptions,
    ) -> Result<ReactiveHandle<Vec<Document>>> {
        let fetch_options = options.clone();
        spawn(self, options, Watch::Docs(options.update.clone()), move |db| {
            db.query(conditions.clone(), &fetch_options)
        })
    }

    /// Live query over attached documents
    pub fn reactive_query_attached(
        self: &Arc<Self>,
        conditions: Conditions,
        parent_conditions: Conditions,
        options: &QueryOptions,
    ) -> Result<ReactiveHandle<Vec<AttachedWithParent>>> {
        let fetch_options = options.clone();
        spawn(
            self,
            options,
            Watch::Attached(options.update_attached.clone()),
            move |db| {
                db.query_attached(conditions.clone(), parent_conditions.clone(), &fetch_options)
            },
        )
    }

    /// Live count of matching parent documents
    pub fn reactive_count(
        self: &Arc<Self>,
        conditions: Conditions,
        options: &QueryOptions,
    ) -> Result<ReactiveHandle<usize>> {
        spawn(self, options, Watch::Docs(options.update.clone()), move |db| {
            db.count(conditions.clone())
        })
    }

    /// Live count of matching attached documents
    pub fn reactive_count_attached(
        self: &Arc<Self>,
        conditions: Conditions,
        parent_conditions: Conditions,
        options: &QueryOptions,
    ) -> Result<ReactiveHandle<usize>> {
        spawn(
            self,
            options,
            Watch::Attached(options.update_attached.clone()),
            move |db| db.count_attached(conditions.clone(), parent_conditions.clone()),
        )
    }

    /// Live read of one parent document
    ///
    /// Unless overridden by `options.update`, only changes to this id
    /// trigger a refresh.
    pub fn reactive_get(
        self: &Arc<Self>,
        id: impl Into<String>,
        options: &QueryOptions,
    ) -> Result<ReactiveHandle<Document>> {
        let id = id.into();
        let fetch_id = id.clone();
        spawn(self, options, Watch::Docs(Some(id_gate(options, id))), move |db| {
            db.get(&fetch_id)
        })
    }

    /// Live read of one parent document that may not exist
    pub fn reactive_get_if_exists(
        self: &Arc<Self>,
        id: impl Into<String>,
        options: &QueryOptions,
    ) -> Result<ReactiveHandle<Option<Document>>> {
        let id = id.into();
        let fetch_id = id.clone();
        spawn(self, options, Watch::Docs(Some(id_gate(options, id))), move |db| {
            db.get_if_exists(&fetch_id)
        })
    }

    /// Live existence check of one parent document
    pub fn reactive_exists(
        self: &Arc<Self>,
        id: impl Into<String>,
        options: &QueryOptions,
    ) -> Result<ReactiveHandle<bool>> {
        let id = id.into();
        let fetch_id = id.clone();
        spawn(self, options, Watch::Docs(Some(id_gate(options, id))), move |db| {
            db.exists(&fetch_id)
        })
    }

    /// Live read of one attached document
    pub fn reactive_get_attached(
        self: &Arc<Self>,
        id: usize,
        parent_id: impl Into<String>,
        options: &QueryOptions,
    ) -> Result<ReactiveHandle<AttachedWithParent>> {
        let parent_id = parent_id.into();
        let fetch_parent = parent_id.clone();
        spawn(
            self,
            options,
            Watch::Attached(Some(attached_gate(options, id, parent_id))),
            move |db| db.get_attached(id, &fetch_parent),
        )
    }

    /// Live read of one attached document that may not exist
    pub fn reactive_get_if_exists_attached(
        self: &Arc<Self>,
        id: usize,
        parent_id: impl Into<String>,
        options: &QueryOptions,
    ) -> Result<ReactiveHandle<Option<AttachedWithParent>>> {
        let parent_id = parent_id.into();
        let fetch_parent = parent_id.clone();
        spawn(
            self,
            options,
            Watch::Attached(Some(attached_gate(options, id, parent_id))),
            move |db| db.get_if_exists_attached(id, &fetch_parent),
        )
    }

    /// Live existence check of one attached document
    pub fn reactive_exists_attached(
        self: &Arc<Self>,
        id: usize,
        parent_id: impl Into<String>,
        options: &QueryOptions,
    ) -> Result<ReactiveHandle<bool>> {
        let parent_id = parent_id.into();
        let fetch_parent = parent_id.clone();
        spawn(
            self,
            options,
            Watch::Attached(Some(attached_gate(options, id, parent_id))),
            move |db| db.exists_attached(id, &fetch_parent),
        )
    }

    /// Live unsettled-row count for the conditions' index
    pub fn reactive_unsettled(
        self: &Arc<Self>,
        conditions: Conditions,
        options: &QueryOptions,
    ) -> Result<ReactiveHandle<usize>> {
        let fetch_options = options.clone();
        spawn(self, options, Watch::Docs(options.update.clone()), move |db| {
            db.unsettled(conditions.clone(), &fetch_options)
        })
    }

    /// Live unsettled-row count for the attached conditions' index
    pub fn reactive_unsettled_attached(
        self: &Arc<Self>,
        conditions: Conditions,
        parent_conditions: Conditions,
        options: &QueryOptions,
    ) -> Result<ReactiveHandle<usize>> {
        let fetch_options = options.clone();
        spawn(
            self,
            options,
            Watch::Attached(options.update_attached.clone()),
            move |db| {
                db.unsettled_attached(
                    conditions.clone(),
                    parent_conditions.clone(),
                    &fetch_options,
                )
            },
        )
    }
}

fn id_gate(options: &QueryOptions, id: String) -> crate::executor::UpdatePredicate {
    match &options.update {
        Some(update) => update.clone(),
        None => Arc::new(move |doc: &Document| doc.id == id),
    }
}

fn attached_gate(
    options: &QueryOptions,
    id: usize,
    parent_id: String,
) -> crate::executor::AttachedUpdatePredicate {
    match &options.update_attached {
        Some(update) => update.clone(),
        None => Arc::new(move |row: &AttachedWithParent| {
            row.parent.id == parent_id && row.attached.id == id
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Configuration, DatabaseOptions};
    use parking_lot::Mutex as PMutex;
    use std::sync::atomic::AtomicUsize;
    use tide_core::{FieldOp, PutAttachedDocument, PutDocument, Value};

    fn db() -> Arc<Database> {
        Database::open("test", DatabaseOptions::default(), Configuration::default())
    }

    fn eq(field: &str, value: i64) -> Conditions {
        Conditions::field(field, FieldOp::Eq(Value::Number(value as f64)))
    }

    #[test]
    fn test_query_handle_tracks_writes() {
        let db = db();
        db.put(PutDocument::new().with_id("a").field("x", 1i64)).unwrap();

        let handle = db.reactive_query(eq("x", 1), &QueryOptions::default()).unwrap();
        assert_eq!(handle.get().len(), 1);

        db.put(PutDocument::new().with_id("b").field("x", 1i64)).unwrap();
        assert_eq!(handle.get().len(), 2);

        handle.unsubscribe();
        db.put(PutDocument::new().with_id("c").field("x", 1i64)).unwrap();
        assert_eq!(handle.get().len(), 2);
    }

    #[test]
    fn test_update_gate_filters_refreshes() {
        let db = db();
        let options = QueryOptions {
            update: Some(Arc::new(|doc: &Document| doc.id.starts_with("keep-"))),
            ..QueryOptions::default()
        };
        let handle = db.reactive_count(Conditions::new(), &options).unwrap();
        assert_eq!(handle.get(), 0);

        db.put(PutDocument::new().with_id("skip-1")).unwrap();
        assert_eq!(handle.get(), 0);

        // A gated write refreshes the whole result, stale rows included.
        db.put(PutDocument::new().with_id("keep-1")).unwrap();
        assert_eq!(handle.get(), 2);
    }

    #[test]
    fn test_get_handle_refreshes_only_its_id() {
        let db = db();
        db.put(PutDocument::new().with_id("d").field("x", 1i64)).unwrap();
        let handle = db.reactive_get("d", &QueryOptions::default()).unwrap();

        db.put(PutDocument::new().with_id("other").field("x", 9i64)).unwrap();
        assert_eq!(handle.get().field("x"), Some(&Value::Number(1.0)));

        let stored = db.get("d").unwrap();
        db.put(PutDocument {
            id: Some("d".into()),
            rev: Some(stored.rev),
            fields: [("x".to_string(), Value::Number(2.0))].into_iter().collect(),
            ..PutDocument::default()
        })
        .unwrap();
        assert_eq!(handle.get().field("x"), Some(&Value::Number(2.0)));
    }

    #[test]
    fn test_attached_handle_tracks_attached_writes() {
        let db = db();
        db.put(PutDocument::new().with_id("p")).unwrap();
        db.put_attached("p", PutAttachedDocument::new().field("n", 1i64)).unwrap();

        let handle = db.reactive_get_attached(0, "p", &QueryOptions::default()).unwrap();
        assert_eq!(handle.get().attached.rev, 1);

        db.put_attached(
            "p",
            PutAttachedDocument::new().with_id(0).with_rev(1).field("n", 2i64),
        )
        .unwrap();
        assert_eq!(handle.get().attached.rev, 2);
    }

    #[test]
    fn test_failed_refresh_keeps_value_and_reports() {
        let db = db();
        db.put(PutDocument::new().with_id("d")).unwrap();
        let handle = db.reactive_get("d", &QueryOptions::default()).unwrap();

        let reported = Arc::new(PMutex::new(Vec::new()));
        let sink = reported.clone();
        set_error_hook(Some(Arc::new(move |e: &Error| {
            sink.lock().push(e.to_string());
        })));

        // Deleting the document makes the next fetch fail with NotFound;
        // the handle keeps the last good value.
        let stored = db.get("d").unwrap();
        db.put(PutDocument {
            id: Some("d".into()),
            rev: Some(stored.rev),
            deleted: true,
            ..PutDocument::default()
        })
        .unwrap();

        assert_eq!(handle.get().id, "d");
        assert_eq!(reported.lock().len(), 1);
        set_error_hook(None);
    }

    #[test]
    fn test_trigger_during_inflight_refresh_is_not_lost() {
        let db = db();
        let source = Arc::new(AtomicUsize::new(0));
        let block_once = Arc::new(AtomicBool::new(false));
        // Stages: 0 idle, 1 fetch entered, 2 released.
        let gate = Arc::new((PMutex::new(0u8), Condvar::new()));

        let inner = Arc::new(HandleInner {
            state: Mutex::new(HandleState {
                value: 0usize,
                loading: false,
                pending: false,
            }),
            stopped: AtomicBool::new(false),
            db: Arc::downgrade(&db),
            subscription: Mutex::new(None),
            timer: Mutex::new(None),
        });

        // Reads the source, then blocks once so a second trigger can
        // arrive while the fetch is still in flight.
        let fetch: Arc<dyn Fn(&Arc<Database>) -> Result<usize> + Send + Sync> = {
            let source = source.clone();
            let block_once = block_once.clone();
            let gate = gate.clone();
            Arc::new(move |_| {
                let value = source.load(Ordering::SeqCst);
                if block_once.swap(false, Ordering::SeqCst) {
                    let (stage, cvar) = &*gate;
                    let mut stage = stage.lock();
                    *stage = 1;
                    cvar.notify_all();
                    while *stage != 2 {
                        cvar.wait(&mut stage);
                    }
                }
                Ok(value)
            })
        };

        block_once.store(true, Ordering::SeqCst);
        let worker = {
            let db = db.clone();
            let inner = inner.clone();
            let fetch = fetch.clone();
            thread::spawn(move || refresh(&db, &inner, fetch.as_ref()))
        };
        {
            let (stage, cvar) = &*gate;
            let mut stage = stage.lock();
            while *stage != 1 {
                cvar.wait(&mut stage);
            }
        }

        // The source moves while the first fetch is in flight; the
        // refresh for it returns immediately but must not be lost.
        source.store(3, Ordering::SeqCst);
        refresh(&db, &inner, fetch.as_ref());
        assert!(inner.state.lock().loading);

        {
            let (stage, cvar) = &*gate;
            *stage.lock() = 2;
            cvar.notify_all();
        }
        worker.join().unwrap();

        let state = inner.state.lock();
        assert_eq!(state.value, 3);
        assert!(!state.loading);
    }

    #[test]
    fn test_timer_refreshes_without_matching_writes() {
        let db = db();
        let options = QueryOptions {
            // Gate out every change so only the timer can refresh.
            update: Some(Arc::new(|_: &Document| false)),
            update_interval: Some(Duration::from_millis(20)),
            ..QueryOptions::default()
        };
        let handle = db.reactive_count(Conditions::new(), &options).unwrap();
        assert_eq!(handle.get(), 0);

        db.put(PutDocument::new().with_id("d")).unwrap();
        assert_eq!(handle.get(), 0);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while handle.get() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.get(), 1);
        handle.unsubscribe();
    }
}
