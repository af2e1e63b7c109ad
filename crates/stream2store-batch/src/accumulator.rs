use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use stream2store_core::{FieldValue, WriteRequest};
use tracing::debug;

use crate::{Batch, BatchConfig, PendingRequest};

type DedupKey = Vec<FieldValue>;

#[derive(Debug)]
pub enum AddOutcome {
    Inserted,
    /// An older request with the same key fields was overwritten in place.
    Replaced,
    /// The buffer is at capacity; the request is handed back to the caller.
    Full(WriteRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    Requeued,
    /// A newer request for the same key is already buffered.
    Superseded,
}

#[derive(Debug)]
struct Entry {
    pending: PendingRequest,
    dedup: Option<DedupKey>,
}

/// Buffer of pending write requests, ordered by position.
///
/// Positions are signed: producer inserts take increasing positions at the
/// back, retries take decreasing negative positions so they are extracted
/// before anything else.
#[derive(Debug)]
pub struct Accumulator {
    config: BatchConfig,
    entries: BTreeMap<i64, Entry>,
    by_key: HashMap<DedupKey, i64>,
    next_back: i64,
    next_front: i64,
    next_sequence: u64,
    next_batch_id: u64,
}

impl Accumulator {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            entries: BTreeMap::new(),
            by_key: HashMap::new(),
            next_back: 0,
            next_front: -1,
            next_sequence: 0,
            next_batch_id: 0,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.config.max_buffered_requests
    }

    /// Age of the request at the head of the buffer.
    pub fn oldest_arrival_age(&self, now: Instant) -> Option<Duration> {
        self.entries
            .values()
            .next()
            .map(|entry| now.saturating_duration_since(entry.pending.arrived_at))
    }

    /// Buffer a request from a producer.
    ///
    /// A request whose key fields match a buffered one replaces it in place,
    /// keeping the original position and arrival time. This is allowed even at
    /// capacity because the buffer does not grow.
    pub fn try_add(&mut self, request: WriteRequest, now: Instant) -> AddOutcome {
        let dedup = self.dedup_key(&request);
        let sequence = self.next_sequence;

        if let Some(position) = dedup.as_ref().and_then(|key| self.by_key.get(key)) {
            if let Some(entry) = self.entries.get_mut(position) {
                entry.pending.request = request;
                entry.pending.attempts = 0;
                entry.pending.sequence = sequence;
                self.next_sequence += 1;
                return AddOutcome::Replaced;
            }
        }

        if self.is_full() {
            return AddOutcome::Full(request);
        }

        self.next_sequence += 1;
        let position = self.next_back;
        self.next_back += 1;
        self.insert(
            position,
            PendingRequest {
                request,
                attempts: 0,
                arrived_at: now,
                sequence,
            },
            dedup,
        );
        AddOutcome::Inserted
    }

    /// Put a rejected request back at the head of the buffer, ignoring capacity.
    ///
    /// If a newer request for the same key arrived while this one was in
    /// flight, the retry is discarded. If the buffered one is older, the retry
    /// overwrites it in place and keeps that slot's arrival time, so arrival
    /// times stay ordered by buffer position.
    pub fn requeue(&mut self, pending: PendingRequest) -> RequeueOutcome {
        let dedup = self.dedup_key(&pending.request);

        if let Some(position) = dedup.as_ref().and_then(|key| self.by_key.get(key)) {
            if let Some(entry) = self.entries.get_mut(position) {
                if entry.pending.sequence > pending.sequence {
                    debug!(
                        key = %pending.request.key_summary(),
                        "Dropping retry superseded by a newer request"
                    );
                    return RequeueOutcome::Superseded;
                }
                let arrived_at = entry.pending.arrived_at;
                entry.pending = pending;
                entry.pending.arrived_at = arrived_at;
                return RequeueOutcome::Requeued;
            }
        }

        let position = self.next_front;
        self.next_front -= 1;
        self.insert(position, pending, dedup);
        RequeueOutcome::Requeued
    }

    /// Remove up to `max_batch_size` requests from the head of the buffer.
    pub fn extract_batch(&mut self) -> Option<Batch> {
        if self.entries.is_empty() {
            return None;
        }

        let take = self.config.max_batch_size.min(self.entries.len());
        let mut requests = Vec::with_capacity(take);
        while requests.len() < take {
            let Some((_, entry)) = self.entries.pop_first() else {
                break;
            };
            requests.push(self.release(entry));
        }

        let id = self.next_batch_id;
        self.next_batch_id += 1;
        Some(Batch { id, requests })
    }

    /// Remove every buffered request, head first.
    pub fn take_all(&mut self) -> Vec<PendingRequest> {
        let entries = std::mem::take(&mut self.entries);
        self.by_key.clear();
        entries.into_values().map(|entry| entry.pending).collect()
    }

    fn insert(&mut self, position: i64, pending: PendingRequest, dedup: Option<DedupKey>) {
        if let Some(key) = dedup.clone() {
            self.by_key.insert(key, position);
        }
        self.entries.insert(position, Entry { pending, dedup });
    }

    fn release(&mut self, entry: Entry) -> PendingRequest {
        if let Some(key) = entry.dedup {
            self.by_key.remove(&key);
        }
        entry.pending
    }

    // Requests missing any configured field are never deduplicated.
    fn dedup_key(&self, request: &WriteRequest) -> Option<DedupKey> {
        if self.config.overwrite_by_key_fields.is_empty() {
            return None;
        }
        self.config
            .overwrite_by_key_fields
            .iter()
            .map(|name| request.field(name).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config(max_batch_size: usize, max_buffered_requests: usize) -> BatchConfig {
        BatchConfig {
            max_batch_size,
            max_buffered_requests,
            max_time_in_buffer: Duration::from_secs(5),
            overwrite_by_key_fields: vec!["ticker".to_string()],
        }
    }

    fn req(ticker: &str, price: &str) -> WriteRequest {
        let mut key = BTreeMap::new();
        key.insert("ticker".to_string(), FieldValue::Text(ticker.to_string()));
        let mut attributes = BTreeMap::new();
        attributes.insert("price".to_string(), FieldValue::Number(price.to_string()));
        WriteRequest::put(key, attributes)
    }

    fn price(pending: &PendingRequest) -> &str {
        pending.request.attributes["price"].as_str()
    }

    #[test]
    fn test_dedup_last_arrival_wins() {
        let now = Instant::now();
        let mut acc = Accumulator::new(config(25, 100));
        assert!(matches!(acc.try_add(req("A", "1"), now), AddOutcome::Inserted));
        assert!(matches!(acc.try_add(req("B", "5"), now), AddOutcome::Inserted));
        assert!(matches!(acc.try_add(req("A", "2"), now), AddOutcome::Replaced));
        assert_eq!(acc.len(), 2);

        let batch = acc.extract_batch().unwrap();
        assert_eq!(batch.len(), 2);
        // Replacement keeps the original position.
        assert_eq!(batch.requests[0].request.key_summary(), "ticker=A");
        assert_eq!(price(&batch.requests[0]), "2");
        assert_eq!(price(&batch.requests[1]), "5");
    }

    #[test]
    fn test_replacement_keeps_arrival_time() {
        let start = Instant::now();
        let mut acc = Accumulator::new(config(25, 100));
        acc.try_add(req("A", "1"), start);
        acc.try_add(req("A", "2"), start + Duration::from_secs(4));
        assert_eq!(
            acc.oldest_arrival_age(start + Duration::from_secs(5)),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_no_dedup_without_fields() {
        let now = Instant::now();
        let mut acc = Accumulator::new(BatchConfig {
            overwrite_by_key_fields: Vec::new(),
            ..config(25, 100)
        });
        acc.try_add(req("A", "1"), now);
        acc.try_add(req("A", "2"), now);
        assert_eq!(acc.len(), 2);
    }

    #[test]
    fn test_missing_dedup_field_is_not_deduplicated() {
        let now = Instant::now();
        let mut acc = Accumulator::new(BatchConfig {
            overwrite_by_key_fields: vec!["ticker".to_string(), "venue".to_string()],
            ..config(25, 100)
        });
        acc.try_add(req("A", "1"), now);
        acc.try_add(req("A", "2"), now);
        assert_eq!(acc.len(), 2);
    }

    #[test]
    fn test_capacity() {
        let now = Instant::now();
        let mut acc = Accumulator::new(config(25, 2));
        acc.try_add(req("A", "1"), now);
        acc.try_add(req("B", "1"), now);
        assert!(acc.is_full());
        match acc.try_add(req("C", "1"), now) {
            AddOutcome::Full(returned) => assert_eq!(returned.key_summary(), "ticker=C"),
            other => panic!("expected Full, got {:?}", other),
        }
        // Dedup hits never grow the buffer, so they are accepted at capacity.
        assert!(matches!(acc.try_add(req("B", "2"), now), AddOutcome::Replaced));
        assert_eq!(acc.len(), 2);
    }

    #[test]
    fn test_extract_is_bounded_and_ordered() {
        let now = Instant::now();
        let mut acc = Accumulator::new(config(3, 100));
        for t in ["A", "B", "C", "D", "E"] {
            acc.try_add(req(t, "1"), now);
        }
        let first = acc.extract_batch().unwrap();
        let second = acc.extract_batch().unwrap();
        assert_eq!(first.id, 0);
        assert_eq!(second.id, 1);
        let keys: Vec<_> = first
            .requests
            .iter()
            .chain(second.requests.iter())
            .map(|p| p.request.key_summary())
            .collect();
        assert_eq!(
            keys,
            ["ticker=A", "ticker=B", "ticker=C", "ticker=D", "ticker=E"]
        );
        assert!(acc.extract_batch().is_none());
    }

    #[test]
    fn test_extracted_keys_no_longer_dedup() {
        let now = Instant::now();
        let mut acc = Accumulator::new(config(25, 100));
        acc.try_add(req("A", "1"), now);
        let _ = acc.extract_batch();
        assert!(matches!(acc.try_add(req("A", "2"), now), AddOutcome::Inserted));
    }

    #[test]
    fn test_requeue_goes_to_front_and_bypasses_capacity() {
        let now = Instant::now();
        let mut acc = Accumulator::new(config(25, 1));
        acc.try_add(req("A", "1"), now);
        let mut batch = acc.extract_batch().unwrap();
        acc.try_add(req("B", "1"), now);
        assert!(acc.is_full());

        let mut retry = batch.requests.remove(0);
        retry.attempts += 1;
        assert_eq!(acc.requeue(retry), RequeueOutcome::Requeued);
        assert_eq!(acc.len(), 2);

        let next = acc.extract_batch().unwrap();
        assert_eq!(next.requests[0].request.key_summary(), "ticker=A");
        assert_eq!(next.requests[0].attempts, 1);
        assert_eq!(next.requests[1].request.key_summary(), "ticker=B");
    }

    #[test]
    fn test_requeue_superseded_by_newer_request() {
        let now = Instant::now();
        let mut acc = Accumulator::new(config(25, 100));
        acc.try_add(req("A", "1"), now);
        let mut batch = acc.extract_batch().unwrap();
        acc.try_add(req("A", "2"), now);

        assert_eq!(
            acc.requeue(batch.requests.remove(0)),
            RequeueOutcome::Superseded
        );
        let next = acc.extract_batch().unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(price(&next.requests[0]), "2");
    }

    #[test]
    fn test_requeue_newer_retry_overwrites_older_retry() {
        let now = Instant::now();
        let mut acc = Accumulator::new(config(1, 100));
        acc.try_add(req("A", "1"), now);
        let mut older = acc.extract_batch().unwrap();
        acc.try_add(req("A", "2"), now);
        let mut newer = acc.extract_batch().unwrap();

        assert_eq!(acc.requeue(older.requests.remove(0)), RequeueOutcome::Requeued);
        assert_eq!(acc.requeue(newer.requests.remove(0)), RequeueOutcome::Requeued);
        assert_eq!(acc.len(), 1);
        assert_eq!(price(&acc.extract_batch().unwrap().requests[0]), "2");
    }

    #[test]
    fn test_requeue_overwrite_keeps_slot_arrival_time() {
        let start = Instant::now();
        let mut acc = Accumulator::new(config(1, 100));
        acc.try_add(req("A", "1"), start);
        let mut older = acc.extract_batch().unwrap();
        acc.try_add(req("A", "2"), start + Duration::from_secs(3));
        let mut newer = acc.extract_batch().unwrap();

        acc.requeue(older.requests.remove(0));
        acc.requeue(newer.requests.remove(0));
        assert_eq!(
            acc.oldest_arrival_age(start + Duration::from_secs(5)),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_take_all() {
        let now = Instant::now();
        let mut acc = Accumulator::new(config(25, 100));
        acc.try_add(req("A", "1"), now);
        acc.try_add(req("B", "1"), now);
        let all = acc.take_all();
        assert_eq!(all.len(), 2);
        assert!(acc.is_empty());
        assert!(acc.oldest_arrival_age(now).is_none());
        assert!(matches!(acc.try_add(req("A", "3"), now), AddOutcome::Inserted));
    }
}
