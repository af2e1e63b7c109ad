// Accumulator benchmark - measure add/extract throughput with and without dedup
//
// Key cardinality controls how often an add replaces a buffered request.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use stream2store_batch::{Accumulator, AddOutcome, BatchConfig};
use stream2store_core::{FieldValue, WriteRequest};

const REQUESTS: usize = 10_000;

fn requests(distinct_keys: usize) -> Vec<WriteRequest> {
    (0..REQUESTS)
        .map(|i| {
            let mut key = BTreeMap::new();
            key.insert(
                "ticker".to_string(),
                FieldValue::Text(format!("T{:05}", i % distinct_keys)),
            );
            let mut attributes = BTreeMap::new();
            attributes.insert(
                "event_time".to_string(),
                FieldValue::Text("2024-03-01T10:00:00".to_string()),
            );
            attributes.insert(
                "price".to_string(),
                FieldValue::Number(format!("0.{}", i % 100)),
            );
            WriteRequest::put(key, attributes)
        })
        .collect()
}

fn config(dedup: bool) -> BatchConfig {
    BatchConfig {
        max_batch_size: 25,
        max_buffered_requests: REQUESTS,
        max_time_in_buffer: Duration::from_secs(5),
        overwrite_by_key_fields: if dedup {
            vec!["ticker".to_string()]
        } else {
            Vec::new()
        },
    }
}

/// Fill the buffer, then drain it in batches
fn bench_add_then_extract(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_then_extract");
    group.throughput(Throughput::Elements(REQUESTS as u64));

    for (label, dedup, distinct_keys) in [
        ("no_dedup", false, REQUESTS),
        ("dedup_unique_keys", true, REQUESTS),
        ("dedup_100_keys", true, 100),
    ] {
        let input = requests(distinct_keys);
        group.bench_with_input(BenchmarkId::from_parameter(label), &input, |b, input| {
            b.iter(|| {
                let mut accumulator = Accumulator::new(config(dedup));
                let now = Instant::now();
                for request in input {
                    let outcome = accumulator.try_add(request.clone(), now);
                    debug_assert!(!matches!(outcome, AddOutcome::Full(_)));
                }
                while let Some(batch) = accumulator.extract_batch() {
                    black_box(batch);
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_add_then_extract);
criterion_main!(benches);
