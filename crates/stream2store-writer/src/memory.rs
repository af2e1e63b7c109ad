//! In-process store used for dry runs and tests.
//!
//! Accepted puts are upserted by key. Responses can be scripted per call to
//! simulate throttling or partial rejections, and submissions can be held at
//! a gate to simulate a slow store.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use stream2store_core::{FieldValue, WriteRequest};
use tokio::sync::Notify;
use tracing::debug;

use crate::backend::WriteBackend;
use crate::error::{Result, StoreError};

/// Response for one scripted `submit_batch` call.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Accept,
    /// Reject the requests at these positions of the submitted batch.
    Reject(Vec<usize>),
    Fail(StoreError),
}

#[derive(Debug, Default)]
struct MemoryState {
    items: HashMap<BTreeMap<String, FieldValue>, WriteRequest>,
    submissions: Vec<Vec<WriteRequest>>,
    script: VecDeque<ScriptedResponse>,
}

#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    gate_open: AtomicBool,
    gate: Notify,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            gate_open: AtomicBool::new(true),
            gate: Notify::new(),
        }
    }

    /// A backend whose submissions block until [`MemoryBackend::open_gate`].
    pub fn gated() -> Self {
        let backend = Self::new();
        backend.gate_open.store(false, Ordering::SeqCst);
        backend
    }

    pub fn open_gate(&self) {
        self.gate_open.store(true, Ordering::SeqCst);
        self.gate.notify_waiters();
    }

    /// Queue a response for a future call; unscripted calls accept everything.
    pub fn push_response(&self, response: ScriptedResponse) {
        self.state.lock().script.push_back(response);
    }

    /// Every batch passed to `submit_batch`, in call order.
    pub fn submissions(&self) -> Vec<Vec<WriteRequest>> {
        self.state.lock().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    pub fn get(&self, key: &BTreeMap<String, FieldValue>) -> Option<WriteRequest> {
        self.state.lock().items.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    async fn wait_for_gate(&self) {
        loop {
            let notified = self.gate.notified();
            if self.gate_open.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl WriteBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn submit_batch(&self, requests: &[WriteRequest]) -> Result<Vec<WriteRequest>> {
        self.wait_for_gate().await;

        let mut state = self.state.lock();
        state.submissions.push(requests.to_vec());
        let response = state.script.pop_front().unwrap_or(ScriptedResponse::Accept);

        let rejected: Vec<usize> = match response {
            ScriptedResponse::Accept => Vec::new(),
            ScriptedResponse::Reject(indices) => indices,
            ScriptedResponse::Fail(err) => return Err(err),
        };

        for (i, request) in requests.iter().enumerate() {
            if !rejected.contains(&i) {
                state.items.insert(request.key.clone(), request.clone());
            }
        }

        debug!(
            submitted = requests.len(),
            rejected = rejected.len(),
            "Memory store applied batch"
        );

        Ok(rejected
            .into_iter()
            .filter_map(|i| requests.get(i).cloned())
            .collect())
    }
}
