//! Merge engine: one conflict-free replicated document per room.
//!
//! Wraps a Yrs [`Doc`]. Remote update fragments are merged with [`MergeEngine::apply`]
//! (commutative and idempotent), local edits go through [`MergeEngine::edit`].
//! Every committed change is published as an encoded delta on each
//! [`ChangeStream`] obtained from [`MergeEngine::observe_changes`]; that stream
//! is the only link between the engine and persistence.
//!
//! All document access is serialized behind one internal lock, so sessions
//! sharing an engine never race on the underlying transaction store.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures_util::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Subscription, Transact, TransactionMut, Update};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
    #[error("invalid state vector: {0}")]
    InvalidStateVector(String),
    #[error("document observer could not be registered")]
    ObserverUnavailable,
}

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>>;

/// In-memory CRDT document for one room.
pub struct MergeEngine {
    doc: Doc,
    /// Serializes every transaction on `doc`.
    access: Mutex<()>,
    subscribers: Subscribers,
    _subscription: Subscription,
}

impl MergeEngine {
    /// Create an empty engine.
    pub fn new() -> Result<Self, MergeError> {
        Self::with_doc(Doc::new())
    }

    /// Create an empty engine with a fixed client id (deterministic local edits).
    pub fn with_client_id(client_id: u64) -> Result<Self, MergeError> {
        Self::with_doc(Doc::with_client_id(client_id))
    }

    fn with_doc(doc: Doc) -> Result<Self, MergeError> {
        let subscribers: Subscribers = Arc::default();
        let sinks = subscribers.clone();
        let subscription = doc
            .observe_update_v1(move |_txn, event| {
                lock(&sinks).retain(|tx| tx.send(event.update.clone()).is_ok());
            })
            .map_err(|_| MergeError::ObserverUnavailable)?;

        Ok(Self {
            doc,
            access: Mutex::new(()),
            subscribers,
            _subscription: subscription,
        })
    }

    /// Merge a peer's update fragment into local state.
    ///
    /// Applying an already-known update is a no-op and emits no change.
    /// Updates whose dependencies have not arrived yet are held by the
    /// document and integrated once the missing pieces are applied.
    /// Bytes that do not decode are rejected before the document is touched.
    pub fn apply(&self, update: &[u8]) -> Result<(), MergeError> {
        let update =
            Update::decode_v1(update).map_err(|e| MergeError::InvalidUpdate(e.to_string()))?;

        let _access = lock(&self.access);
        let mut txn = self.doc.transact_mut();
        let result = txn.apply_update(update);
        drop(txn);

        result.map_err(|e| MergeError::InvalidUpdate(e.to_string()))
    }

    /// Run a local edit inside a write transaction.
    pub fn edit<R>(&self, f: impl FnOnce(&mut TransactionMut<'_>) -> R) -> R {
        let _access = lock(&self.access);
        let mut txn = self.doc.transact_mut();
        f(&mut txn)
    }

    /// Subscribe to encoded deltas of every change committed from now on.
    pub fn observe_changes(&self) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        ChangeStream { rx }
    }

    /// End every open change stream. Buffered deltas are still delivered.
    pub fn close_changes(&self) {
        lock(&self.subscribers).clear();
    }

    /// Number of live change subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    /// Serialize the whole document as a single update.
    pub fn encode_full_state(&self) -> Vec<u8> {
        self.encode_diff_from(&StateVector::default())
    }

    /// Current state vector.
    pub fn state_vector(&self) -> StateVector {
        let _access = lock(&self.access);
        let txn = self.doc.transact();
        txn.state_vector()
    }

    /// Encoded state vector, as sent in a sync step 1.
    pub fn encoded_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// Minimal update bringing a peer with state vector `remote` up to date.
    pub fn encode_diff_from(&self, remote: &StateVector) -> Vec<u8> {
        let _access = lock(&self.access);
        let txn = self.doc.transact();
        txn.encode_diff_v1(remote)
    }

    /// Like [`MergeEngine::encode_diff_from`] with an encoded state vector.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, MergeError> {
        let remote = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| MergeError::InvalidStateVector(e.to_string()))?;
        Ok(self.encode_diff_from(&remote))
    }

    /// Contents of a root-level text, if it exists.
    pub fn text(&self, name: &str) -> Option<String> {
        let _access = lock(&self.access);
        let txn = self.doc.transact();
        txn.get_text(name).map(|text| text.get_string(&txn))
    }
}

/// Lazy, unbounded sequence of encoded deltas from one engine.
///
/// Ends once the engine is dropped or [`MergeEngine::close_changes`] is called.
pub struct ChangeStream {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChangeStream {
    /// Take a buffered delta without waiting.
    pub fn try_next(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

impl Stream for ChangeStream {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fold a sequence of updates into one full-state update.
pub fn fold_updates<'a>(
    updates: impl IntoIterator<Item = &'a [u8]>,
) -> Result<Vec<u8>, MergeError> {
    let engine = MergeEngine::new()?;
    for update in updates {
        if !update.is_empty() {
            engine.apply(update)?;
        }
    }
    Ok(engine.encode_full_state())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use yrs::{Text, WriteTxn};

    /// Update from a fresh client inserting `s` at the start of "content".
    fn text_update(client_id: u64, s: &str) -> Vec<u8> {
        let doc = Doc::with_client_id(client_id);
        let text = doc.get_or_insert_text("content");
        {
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, 0, s);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn append(engine: &MergeEngine, s: &str) {
        engine.edit(|txn| {
            let text = txn.get_or_insert_text("content");
            let len = text.get_string(txn).len() as u32;
            text.insert(txn, len, s);
        });
    }

    #[test]
    fn test_engine_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MergeEngine>();
        assert_send_sync::<Arc<MergeEngine>>();

        let engine = Arc::new(MergeEngine::new().unwrap());
        let remote = engine.clone();
        std::thread::spawn(move || remote.apply(&text_update(3, "threaded")).unwrap())
            .join()
            .unwrap();
        assert_eq!(engine.text("content").as_deref(), Some("threaded"));
    }

    #[test]
    fn test_apply_and_read_text() {
        let engine = MergeEngine::new().unwrap();
        engine.apply(&text_update(1, "hello")).unwrap();
        assert_eq!(engine.text("content").as_deref(), Some("hello"));
    }

    #[test]
    fn test_convergence_all_orders() {
        let updates = [
            text_update(1, "alpha"),
            text_update(2, "beta"),
            text_update(3, "gamma"),
        ];
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        let states: Vec<(Vec<u8>, Option<String>)> = orders
            .iter()
            .map(|order| {
                let engine = MergeEngine::new().unwrap();
                for &i in order {
                    engine.apply(&updates[i]).unwrap();
                }
                (engine.encode_full_state(), engine.text("content"))
            })
            .collect();

        for state in &states[1..] {
            assert_eq!(state, &states[0]);
        }
    }

    #[test]
    fn test_apply_is_idempotent() {
        let update = text_update(7, "once");

        let once = MergeEngine::new().unwrap();
        once.apply(&update).unwrap();

        let twice = MergeEngine::new().unwrap();
        twice.apply(&update).unwrap();
        twice.apply(&update).unwrap();

        assert_eq!(once.encode_full_state(), twice.encode_full_state());
        assert_eq!(twice.text("content").as_deref(), Some("once"));
    }

    #[test]
    fn test_out_of_causal_order() {
        let source = MergeEngine::with_client_id(11).unwrap();
        let mut changes = source.observe_changes();
        append(&source, "a");
        append(&source, "b");
        let first = changes.try_next().unwrap();
        let second = changes.try_next().unwrap();

        let replica = MergeEngine::new().unwrap();
        replica.apply(&second).unwrap();
        replica.apply(&first).unwrap();

        assert_eq!(replica.text("content").as_deref(), Some("ab"));
        assert_eq!(replica.encode_full_state(), source.encode_full_state());
    }

    #[test]
    fn test_full_state_round_trip() {
        let engine = MergeEngine::with_client_id(5).unwrap();
        append(&engine, "round ");
        append(&engine, "trip");

        let restored = MergeEngine::new().unwrap();
        restored.apply(&engine.encode_full_state()).unwrap();

        assert_eq!(restored.encode_full_state(), engine.encode_full_state());
        assert_eq!(restored.text("content").as_deref(), Some("round trip"));
    }

    #[test]
    fn test_invalid_update_leaves_state_untouched() {
        let engine = MergeEngine::new().unwrap();
        engine.apply(&text_update(1, "keep")).unwrap();
        let before = engine.encode_full_state();

        let err = engine.apply(&[0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, MergeError::InvalidUpdate(_)));
        assert_eq!(engine.encode_full_state(), before);
    }

    #[test]
    fn test_invalid_state_vector() {
        let engine = MergeEngine::new().unwrap();
        assert!(matches!(
            engine.encode_diff(&[0xFF, 0xFF]),
            Err(MergeError::InvalidStateVector(_))
        ));
    }

    #[test]
    fn test_diff_is_minimal_catch_up() {
        let server = MergeEngine::new().unwrap();
        server.apply(&text_update(1, "shared")).unwrap();

        let peer = MergeEngine::new().unwrap();
        peer.apply(&text_update(1, "shared")).unwrap();
        let peer_sv = peer.encoded_state_vector();

        server.apply(&text_update(2, "new ")).unwrap();
        let diff = server.encode_diff(&peer_sv).unwrap();
        assert!(diff.len() < server.encode_full_state().len());

        peer.apply(&diff).unwrap();
        assert_eq!(peer.text("content"), server.text("content"));
    }

    #[tokio::test]
    async fn test_change_stream_emits_per_change() {
        let engine = MergeEngine::new().unwrap();
        let mut changes = engine.observe_changes();

        engine.apply(&text_update(1, "x")).unwrap();
        append(&engine, "y");

        let first = changes.next().await.unwrap();
        let second = changes.next().await.unwrap();
        assert!(!first.is_empty());
        assert!(!second.is_empty());

        // Replaying the emitted deltas reconstructs the document.
        let replica = MergeEngine::new().unwrap();
        replica.apply(&first).unwrap();
        replica.apply(&second).unwrap();
        assert_eq!(replica.text("content"), engine.text("content"));
    }

    #[test]
    fn test_duplicate_apply_emits_nothing() {
        let engine = MergeEngine::new().unwrap();
        let update = text_update(3, "dup");
        engine.apply(&update).unwrap();

        let mut changes = engine.observe_changes();
        engine.apply(&update).unwrap();
        assert!(changes.try_next().is_none());
    }

    #[test]
    fn test_fresh_subscriber_sees_only_new_changes() {
        let engine = MergeEngine::new().unwrap();
        engine.apply(&text_update(1, "old")).unwrap();

        let mut late = engine.observe_changes();
        assert!(late.try_next().is_none());

        engine.apply(&text_update(2, "new")).unwrap();
        assert!(late.try_next().is_some());
    }

    #[tokio::test]
    async fn test_close_changes_ends_stream_after_buffer() {
        let engine = MergeEngine::new().unwrap();
        let mut changes = engine.observe_changes();
        engine.apply(&text_update(1, "buffered")).unwrap();

        engine.close_changes();
        assert_eq!(engine.subscriber_count(), 0);
        assert!(changes.next().await.is_some());
        assert!(changes.next().await.is_none());
    }

    #[test]
    fn test_fold_updates() {
        let updates = [text_update(1, "a"), text_update(2, "b"), Vec::new()];
        let folded = fold_updates(updates.iter().map(Vec::as_slice)).unwrap();

        let direct = MergeEngine::new().unwrap();
        direct.apply(&updates[0]).unwrap();
        direct.apply(&updates[1]).unwrap();

        let replayed = MergeEngine::new().unwrap();
        replayed.apply(&folded).unwrap();
        assert_eq!(replayed.encode_full_state(), direct.encode_full_state());
    }
}
