//! In-memory rule source shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};

use tagwatch_rules::{
    ChangeListener, ConnectionError, FetchError, Notification, RawRecord, RuleSnapshot, RuleSource,
    UpdateCallback,
};

pub const CHANNEL: &str = "postgraphile_watch";
pub const SOURCE_ID: &str = "mock://tags";

type Delivery = Result<Notification, ConnectionError>;

/// The single row every unscripted fetch returns.
pub fn users_record() -> RawRecord {
    RawRecord {
        kind: "class".to_string(),
        identifier: "app.users".to_string(),
        description: None,
        tags: json!({ "omit": true }),
    }
}

pub fn unreachable() -> FetchError {
    FetchError::Unreachable {
        source_id: SOURCE_ID.to_string(),
        operation: "fetch smart tags",
        message: "connection refused".to_string(),
    }
}

pub fn query_failed() -> FetchError {
    FetchError::Query {
        source_id: SOURCE_ID.to_string(),
        operation: "fetch smart tags",
        message: "relation \"smart_tags\" does not exist".to_string(),
    }
}

/// Source with counters, optional gates and a queue of scripted results.
///
/// Gated operations block until the test releases a permit, which is how
/// tests hold a fetch (or a connection acquisition) in flight.
#[derive(Default)]
pub struct MockSource {
    fetches: AtomicU32,
    fetch_gate: Option<Semaphore>,
    script: Mutex<VecDeque<Result<Vec<RawRecord>, FetchError>>>,
    listen_calls: AtomicU32,
    listens: AtomicU32,
    listen_gate: Option<Semaphore>,
    closes: Arc<AtomicU32>,
    connections: Mutex<Vec<mpsc::UnboundedSender<Delivery>>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gate_fetches(mut self) -> Self {
        self.fetch_gate = Some(Semaphore::new(0));
        self
    }

    pub fn gate_listens(mut self) -> Self {
        self.listen_gate = Some(Semaphore::new(0));
        self
    }

    /// Results returned by the next fetches, in order. Once the script runs
    /// out, fetches return `[users_record()]`.
    pub fn script(self, results: Vec<Result<Vec<RawRecord>, FetchError>>) -> Self {
        self.script.lock().unwrap().extend(results);
        self
    }

    pub fn release_fetches(&self, n: usize) {
        self.fetch_gate.as_ref().expect("fetches are not gated").add_permits(n);
    }

    pub fn release_listens(&self, n: usize) {
        self.listen_gate.as_ref().expect("listens are not gated").add_permits(n);
    }

    /// Fetches started, including ones still blocked on the gate.
    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Calls to `listen`, including ones still blocked on the gate.
    pub fn listen_calls(&self) -> u32 {
        self.listen_calls.load(Ordering::SeqCst)
    }

    /// Connections actually handed out.
    pub fn listens(&self) -> u32 {
        self.listens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> u32 {
        self.listens() - self.closes()
    }

    /// Deliver a notification on every connection handed out so far.
    pub fn notify(&self, channel: &str, payload: &str) {
        for tx in self.connections.lock().unwrap().iter() {
            let _ = tx.send(Ok(Notification {
                channel: channel.to_string(),
                payload: payload.to_string(),
            }));
        }
    }

    /// Make every dedicated connection fail its next receive.
    pub fn fail_connections(&self, message: &str) {
        for tx in self.connections.lock().unwrap().iter() {
            let _ = tx.send(Err(ConnectionError::Receive {
                source_id: SOURCE_ID.to_string(),
                message: message.to_string(),
            }));
        }
    }

    /// Simulate the server closing every dedicated connection.
    pub fn drop_connections(&self) {
        self.connections.lock().unwrap().clear();
    }
}

#[async_trait]
impl RuleSource for MockSource {
    fn describe(&self) -> String {
        SOURCE_ID.to_string()
    }

    async fn fetch_rules(&self) -> Result<Vec<RawRecord>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.fetch_gate {
            gate.acquire().await.expect("fetch gate closed").forget();
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(vec![users_record()]))
    }

    async fn listen(&self, _channel: &str) -> Result<Box<dyn ChangeListener>, ConnectionError> {
        self.listen_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.listen_gate {
            gate.acquire().await.expect("listen gate closed").forget();
        }
        self.listens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.lock().unwrap().push(tx);
        Ok(Box::new(MockListener {
            rx,
            closes: Arc::clone(&self.closes),
        }))
    }
}

struct MockListener {
    rx: mpsc::UnboundedReceiver<Delivery>,
    closes: Arc<AtomicU32>,
}

#[async_trait]
impl ChangeListener for MockListener {
    async fn recv(&mut self) -> Result<Option<Notification>, ConnectionError> {
        match self.rx.recv().await {
            Some(Ok(notification)) => Ok(Some(notification)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(self: Box<Self>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Callback that records the version of every snapshot it receives.
pub fn recorder() -> (UpdateCallback, Arc<Mutex<Vec<u64>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: UpdateCallback = Arc::new(move |snapshot: Arc<RuleSnapshot>| {
        sink.lock().unwrap().push(snapshot.version());
    });
    (callback, seen)
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Give spawned tasks a chance to run something they should not.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}
