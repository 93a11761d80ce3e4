//! Thread-safe registry fanning the latest JPEG and metadata of every
//! stream key out to HTTP consumers.
//!
//! Publishers are pipeline threads and must never block on clients; each
//! push replaces the previous frame, bumps a sequence counter and wakes
//! streaming handlers through a watch channel.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use tokio::sync::watch;

/// Latest published state of one stream key.
pub struct StreamState {
    inner: Mutex<StreamInner>,
    seq_tx: watch::Sender<u64>,
    // Keeps the channel alive while no client is connected.
    _seq_rx: watch::Receiver<u64>,
}

struct StreamInner {
    jpeg: Option<Arc<Vec<u8>>>,
    meta: String,
    seq: u64,
}

impl StreamState {
    fn new() -> Self {
        let (seq_tx, seq_rx) = watch::channel(0);
        Self {
            inner: Mutex::new(StreamInner {
                jpeg: None,
                meta: "{}".to_string(),
                seq: 0,
            }),
            seq_tx,
            _seq_rx: seq_rx,
        }
    }

    pub fn push_jpeg(&self, bytes: Vec<u8>) {
        let seq = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.jpeg = Some(Arc::new(bytes));
            inner.seq += 1;
            inner.seq
        };
        self.seq_tx.send_replace(seq);
    }

    pub fn push_meta(&self, json: String) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .meta = json;
    }

    /// Latest JPEG, if any frame has been published yet.
    pub fn snapshot(&self) -> Option<Arc<Vec<u8>>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .jpeg
            .clone()
    }

    /// Latest JPEG together with its sequence number, read atomically.
    pub fn snapshot_with_seq(&self) -> Option<(Arc<Vec<u8>>, u64)> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.jpeg.clone().map(|jpeg| (jpeg, inner.seq))
    }

    pub fn meta(&self) -> String {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .meta
            .clone()
    }

    pub fn seq(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .seq
    }

    /// Receiver observing sequence bumps; used by MJPEG handlers.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.seq_tx.subscribe()
    }
}

/// Registry of stream keys (`"{stream_id}/{profile}"`).
#[derive(Default)]
pub struct StreamHub {
    streams: RwLock<HashMap<String, Arc<StreamState>>>,
}

impl StreamHub {
    /// Idempotent create.
    pub fn register_stream(&self, key: &str) {
        let mut streams = self
            .streams
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        streams
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(StreamState::new()));
    }

    pub fn get(&self, key: &str) -> Option<Arc<StreamState>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn get_or_register(&self, key: &str) -> Arc<StreamState> {
        if let Some(state) = self.get(key) {
            return state;
        }
        self.register_stream(key);
        self.get(key).expect("state registered above")
    }

    pub fn push_jpeg(&self, key: &str, bytes: Vec<u8>) {
        self.get_or_register(key).push_jpeg(bytes);
    }

    pub fn push_meta(&self, key: &str, json: String) {
        self.get_or_register(key).push_meta(json);
    }

    pub fn list_streams(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_and_listing_is_sorted() {
        let hub = StreamHub::default();
        hub.register_stream("cam1/ui");
        hub.register_stream("cam0/ui");
        hub.register_stream("cam0/ui");
        hub.register_stream("cam0/inf");
        assert_eq!(hub.list_streams(), vec!["cam0/inf", "cam0/ui", "cam1/ui"]);
    }

    #[test]
    fn snapshot_observes_the_latest_push() {
        let hub = StreamHub::default();
        hub.register_stream("cam0/ui");
        let state = hub.get("cam0/ui").unwrap();
        assert!(state.snapshot().is_none());
        assert_eq!(state.seq(), 0);

        hub.push_jpeg("cam0/ui", vec![1, 2, 3]);
        assert_eq!(state.snapshot().unwrap().as_slice(), &[1, 2, 3]);
        assert_eq!(state.seq(), 1);

        hub.push_jpeg("cam0/ui", vec![4, 5]);
        let (jpeg, seq) = state.snapshot_with_seq().unwrap();
        assert_eq!(jpeg.as_slice(), &[4, 5]);
        assert_eq!(seq, 2);
    }

    #[test]
    fn meta_defaults_to_empty_object() {
        let hub = StreamHub::default();
        hub.register_stream("cam0/ui");
        let state = hub.get("cam0/ui").unwrap();
        assert_eq!(state.meta(), "{}");
        hub.push_meta("cam0/ui", r#"{"frame_id":7}"#.to_string());
        assert_eq!(state.meta(), r#"{"frame_id":7}"#);
    }

    #[test]
    fn unknown_keys_are_created_on_first_push() {
        let hub = StreamHub::default();
        hub.push_jpeg("late/ui", vec![9]);
        assert_eq!(hub.list_streams(), vec!["late/ui"]);
        assert!(hub.get("late/ui").unwrap().snapshot().is_some());
    }

    #[test]
    fn watchers_see_sequence_bumps() {
        let hub = StreamHub::default();
        hub.register_stream("cam0/ui");
        let state = hub.get("cam0/ui").unwrap();
        let rx = state.subscribe();
        assert_eq!(*rx.borrow(), 0);
        hub.push_jpeg("cam0/ui", vec![1]);
        assert_eq!(*rx.borrow(), 1);
        assert!(rx.has_changed().unwrap());
    }
}
