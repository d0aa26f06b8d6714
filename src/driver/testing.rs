//! Scripted in-memory transport for tests.
//!
//! `StubConnector` hands out `StubIo` connections whose behavior is driven
//! by a shared [`StubBehavior`]: per-address connection refusal, queued
//! per-operation failures, canned result rows, generated bookmarks, and
//! call counters.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::bolt::{
    BeginRequest, BoltIo, BoltVersion, Connector, MessageError, PullBatch, RoutingInfo,
    RunResponse, ServerState, TransportError, TransportResult, Value,
};

#[derive(Default)]
pub(crate) struct StubBehavior {
    refused: Mutex<HashSet<String>>,
    begin_errors: Mutex<VecDeque<MessageError>>,
    run_errors: Mutex<VecDeque<MessageError>>,
    commit_errors: Mutex<VecDeque<MessageError>>,
    reset_errors: Mutex<VecDeque<MessageError>>,
    routing: Mutex<VecDeque<RoutingInfo>>,
    keys: Mutex<Vec<String>>,
    rows: Mutex<Vec<Vec<Value>>>,
    defunct: AtomicBool,
    bookmark_seq: AtomicU64,
    opens: AtomicUsize,
    begins: AtomicUsize,
    runs: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    resets: AtomicUsize,
    routes: AtomicUsize,
}

impl StubBehavior {
    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn refuse_address(&self, address: &str) {
        self.refused.lock().insert(address.to_string());
    }

    pub(crate) fn accept_address(&self, address: &str) {
        self.refused.lock().remove(address);
    }

    pub(crate) fn fail_next_begin(&self, code: &str, message: &str) {
        self.begin_errors
            .lock()
            .push_back(MessageError::new(code, message));
    }

    pub(crate) fn fail_next_run(&self, code: &str, message: &str) {
        self.run_errors
            .lock()
            .push_back(MessageError::new(code, message));
    }

    pub(crate) fn fail_next_commit(&self, code: &str, message: &str) {
        self.commit_errors
            .lock()
            .push_back(MessageError::new(code, message));
    }

    pub(crate) fn fail_commits(&self, n: usize, code: &str, message: &str) {
        for _ in 0..n {
            self.fail_next_commit(code, message);
        }
    }

    pub(crate) fn fail_next_reset(&self, code: &str, message: &str) {
        self.reset_errors
            .lock()
            .push_back(MessageError::new(code, message));
    }

    pub(crate) fn push_routing(&self, info: RoutingInfo) {
        self.routing.lock().push_back(info);
    }

    pub(crate) fn set_result(&self, keys: &[&str], rows: Vec<Vec<Value>>) {
        *self.keys.lock() = keys.iter().map(|k| k.to_string()).collect();
        *self.rows.lock() = rows;
    }

    pub(crate) fn mark_defunct(&self) {
        self.defunct.store(true, Ordering::SeqCst);
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub(crate) fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub(crate) fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub(crate) fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub(crate) fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub(crate) fn routes(&self) -> usize {
        self.routes.load(Ordering::SeqCst)
    }
}

/// A routing table where one address plays every role.
pub(crate) fn single_server_routing(address: &str, ttl_seconds: u64) -> RoutingInfo {
    RoutingInfo {
        ttl_seconds,
        routers: vec![address.to_string()],
        writers: vec![address.to_string()],
        readers: vec![address.to_string()],
        database: None,
    }
}

pub(crate) struct StubConnector {
    behavior: Arc<StubBehavior>,
}

impl StubConnector {
    pub(crate) fn new(behavior: Arc<StubBehavior>) -> Self {
        Self { behavior }
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn open(&self, address: &str, _timeout: Duration) -> TransportResult<Box<dyn BoltIo>> {
        if self.behavior.refused.lock().contains(address) {
            return Err(TransportError::Connection(format!(
                "connection to {address} refused"
            )));
        }
        self.behavior.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubIo {
            behavior: self.behavior.clone(),
            address: address.to_string(),
            state: ServerState::Ready,
        }))
    }
}

pub(crate) struct StubIo {
    behavior: Arc<StubBehavior>,
    address: String,
    state: ServerState,
}

impl StubIo {
    fn scripted(&mut self, queue: &Mutex<VecDeque<MessageError>>) -> TransportResult<()> {
        if let Some(err) = queue.lock().pop_front() {
            self.state = ServerState::Failed;
            return Err(TransportError::Message(err));
        }
        Ok(())
    }
}

#[async_trait]
impl BoltIo for StubIo {
    fn version(&self) -> BoltVersion {
        BoltVersion::V5_0
    }

    fn server_state(&self) -> ServerState {
        if self.behavior.defunct.load(Ordering::SeqCst) {
            ServerState::Defunct
        } else {
            self.state
        }
    }

    async fn begin(&mut self, _request: BeginRequest) -> TransportResult<()> {
        let behavior = self.behavior.clone();
        behavior.begins.fetch_add(1, Ordering::SeqCst);
        self.scripted(&behavior.begin_errors)?;
        self.state = ServerState::Ready;
        Ok(())
    }

    async fn run(
        &mut self,
        _text: &str,
        _parameters: HashMap<String, Value>,
    ) -> TransportResult<RunResponse> {
        let behavior = self.behavior.clone();
        behavior.runs.fetch_add(1, Ordering::SeqCst);
        self.scripted(&behavior.run_errors)?;
        self.state = ServerState::Streaming;
        Ok(RunResponse {
            keys: self.behavior.keys.lock().clone(),
            qid: 0,
        })
    }

    async fn pull(&mut self, _qid: i64, _n: i64) -> TransportResult<PullBatch> {
        self.state = ServerState::Ready;
        Ok(PullBatch {
            records: self.behavior.rows.lock().clone(),
            has_more: false,
            bookmark: None,
        })
    }

    async fn commit(&mut self) -> TransportResult<Option<String>> {
        let behavior = self.behavior.clone();
        behavior.commits.fetch_add(1, Ordering::SeqCst);
        self.scripted(&behavior.commit_errors)?;
        self.state = ServerState::Ready;
        let n = behavior.bookmark_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(format!("bm-{n}")))
    }

    async fn rollback(&mut self) -> TransportResult<()> {
        self.behavior.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.state = ServerState::Ready;
        Ok(())
    }

    async fn reset(&mut self) -> TransportResult<()> {
        let behavior = self.behavior.clone();
        behavior.resets.fetch_add(1, Ordering::SeqCst);
        self.scripted(&behavior.reset_errors)?;
        self.state = ServerState::Ready;
        Ok(())
    }

    async fn route(
        &mut self,
        _database: Option<&str>,
        _bookmarks: Vec<String>,
    ) -> TransportResult<RoutingInfo> {
        self.behavior.routes.fetch_add(1, Ordering::SeqCst);
        if let Some(info) = self.behavior.routing.lock().pop_front() {
            return Ok(info);
        }
        Ok(single_server_routing(&self.address, 300))
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.state = ServerState::Defunct;
        Ok(())
    }
}
