use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use vitalscope::aggregate::{compute_vitals, demographics, series};
use vitalscope::event::{EventType, Payload};
use vitalscope::ingest::parse_user_agent;
use vitalscope::store::StoredEvent;
use vitalscope::symbolicate::SourceMap;

const BASE_MS: i64 = 1_714_557_600_000;
const BROWSERS: [&str; 4] = ["Chrome", "Firefox", "Safari", "Edge"];
const COUNTRIES: [&str; 3] = ["US", "DE", "JP"];
const VITALS: [&str; 4] = ["LCP", "CLS", "INP", "TTFB"];

fn object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

fn vital_payloads(n: usize) -> Vec<Payload> {
    (0..n)
        .map(|i| {
            object(json!({
                "name": VITALS[i % VITALS.len()],
                "value": (i % 5_000) as f64 * 1.3,
            }))
        })
        .collect()
}

fn window_events(n: usize) -> Vec<StoredEvent> {
    (0..n)
        .map(|i| {
            let event_type = if i % 9 == 0 {
                EventType::Error
            } else {
                EventType::Vital
            };
            StoredEvent {
                id: format!("e{i}"),
                event_type,
                timestamp: BASE_MS - (i as i64) * 30_000,
                payload: object(json!({
                    "device": {"browser": BROWSERS[i % BROWSERS.len()]},
                    "geo": {"country": COUNTRIES[i % COUNTRIES.len()]},
                })),
            }
        })
        .collect()
}

/// A map with `lines` generated lines of 40 segments each.
fn large_source_map(lines: usize) -> String {
    let line = vec!["CAAC"; 40].join(",");
    let mappings = vec![line; lines].join(";");
    format!(r#"{{"version":3,"sources":["src/app.ts"],"names":[],"mappings":"{mappings}"}}"#)
}

fn bench_aggregate(c: &mut Criterion) {
    let payloads = vital_payloads(10_000);
    c.bench_function("aggregate/compute_vitals_10k", |b| {
        b.iter(|| black_box(compute_vitals(black_box(&payloads))).len())
    });

    let events = window_events(10_000);
    c.bench_function("aggregate/hourly_buckets_10k", |b| {
        b.iter(|| black_box(series::hourly_buckets(black_box(&events))).len())
    });

    c.bench_function("aggregate/demographics_10k", |b| {
        b.iter(|| black_box(demographics::tally(black_box(&events))).browsers.len())
    });
}

fn bench_sourcemap(c: &mut Criterion) {
    let text = large_source_map(2_000);

    c.bench_function("sourcemap/parse_80k_segments", |b| {
        b.iter(|| SourceMap::parse(black_box(&text)).expect("parse"))
    });

    let map = SourceMap::parse(&text).expect("parse");
    c.bench_function("sourcemap/lookup", |b| {
        b.iter(|| black_box(map.lookup(black_box(1_234), black_box(57))))
    });
}

fn bench_user_agent(c: &mut Criterion) {
    let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.2210.91";
    c.bench_function("ingest/parse_user_agent", |b| {
        b.iter(|| parse_user_agent(black_box(ua)))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_aggregate(c);
    bench_sourcemap(c);
    bench_user_agent(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
