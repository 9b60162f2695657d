// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

//! Streaming latency benchmarks.
//!
//! Measures:
//! - Tag guard escaping on clean and hostile text
//! - ThinkingML and JSON-sequence transcoding at various fragment sizes
//! - Broker fan-out to many subscribers
//! - End-to-end producer run from scripted upstream to `completed`
//!
//! Run: cargo bench --bench transcode_latency

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use parapet_relay::broker::Broker;
use parapet_relay::config::{protocol_profile, ProtocolConfig};
use parapet_relay::event::{Message, StreamEvent};
use parapet_relay::relay::{spawn_producer, ProducerSettings};
use parapet_relay::transcode::{new_transcoder, Dialect, TagGuard};
use parapet_relay::upstream::{RelayRequest, ScriptedUpstream};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn protocol() -> ProtocolConfig {
    protocol_profile("7.3").expect("built-in profile")
}

fn thinking_document(phases: usize) -> String {
    let mut doc = String::from("<serp>grounded on three sources</serp><thinking>");
    for id in 1..=phases {
        doc.push_str(&format!(
            "<phase id=\"{id}\"><title>Step {id}</title>Consider the case where a < b and \
             the parser sees <div> tags in running text.</phase>"
        ));
    }
    doc.push_str("</thinking><final>The answer, with <code>markup</code> escaped.");
    doc.push_str("<!-- <serp_queries>\n[\"rust streaming\",\"sse relay\"]\n</serp_queries> -->");
    doc.push_str("</final>");
    doc
}

fn json_document(phases: usize) -> String {
    let mut lines = vec![r#"{"event":"thinking_start"}"#.to_string()];
    for id in 1..=phases {
        lines.push(format!(r#"{{"event":"phase_start","id":{id},"title":"Step {id}"}}"#));
        lines.push(format!(r#"{{"event":"phase_delta","id":{id},"text":"working on it"}}"#));
    }
    lines.push(r#"{"event":"thinking_end"}"#.to_string());
    lines.push(r#"{"event":"final_delta","text":"done"}"#.to_string());
    lines.push(r#"{"event":"serp_queries","queries":["rust"]}"#.to_string());
    lines.push(r#"{"event":"final_end"}"#.to_string());
    lines.join("\n") + "\n"
}

fn fragments(doc: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = doc.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

fn run_transcoder(dialect: Dialect, protocol: &ProtocolConfig, parts: &[String]) -> usize {
    let mut transcoder = new_transcoder(dialect, protocol);
    let mut count = 0;
    for part in parts {
        count += transcoder.push(part).map_or(0, |events| events.len());
    }
    count + transcoder.finish().map_or(0, |events| events.len())
}

// ---------------------------------------------------------------------------
// Benchmark: tag guard
// ---------------------------------------------------------------------------

fn bench_tag_guard(c: &mut Criterion) {
    let mut group = c.benchmark_group("tag_guard");
    let protocol = protocol();

    group.bench_function("clean_text", |b| {
        let text = "Plain prose without any markup at all. ".repeat(50);
        b.iter(|| {
            let mut guard = TagGuard::new(&protocol);
            let mut out = guard.push(black_box(&text));
            out.push_str(&guard.finish());
            out
        });
    });

    group.bench_function("hostile_markup", |b| {
        let text = "<script>alert(1)</script><|parsing_failed|><img src=x> a<b ".repeat(50);
        b.iter(|| {
            let mut guard = TagGuard::new(&protocol);
            let mut out = guard.push(black_box(&text));
            out.push_str(&guard.finish());
            out
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: transcoders
// ---------------------------------------------------------------------------

fn bench_transcoders(c: &mut Criterion) {
    let mut group = c.benchmark_group("transcode");
    let protocol = protocol();
    let thinking = thinking_document(8);
    let json = json_document(8);

    // Scaling: smaller fragments mean more carried state per byte
    for size in [1, 8, 64, 4096] {
        let parts = fragments(&thinking, size);
        group.bench_with_input(BenchmarkId::new("thinkingml", size), &parts, |b, parts| {
            b.iter(|| run_transcoder(Dialect::ThinkingMl, &protocol, black_box(parts)));
        });

        let parts = fragments(&json, size);
        group.bench_with_input(BenchmarkId::new("jsonseq", size), &parts, |b, parts| {
            b.iter(|| run_transcoder(Dialect::JsonSeq, &protocol, black_box(parts)));
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: broker fan-out
// ---------------------------------------------------------------------------

fn bench_broker_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("broker_fanout");

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    for subscribers in [1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &n| {
                b.iter(|| {
                    rt.block_on(async {
                        let broker = Broker::new(std::time::Duration::ZERO);
                        let message = Message::new("bench", Uuid::new_v4());
                        let publisher = broker.create_channel(&message).unwrap();
                        let subs: Vec<_> = (0..n)
                            .map(|_| broker.subscribe(&message.message_id).unwrap())
                            .collect();
                        for i in 0..100 {
                            publisher.publish(StreamEvent::FinalDelta {
                                text: format!("token {i}"),
                            });
                        }
                        publisher.publish(StreamEvent::Completed {
                            reply: String::new(),
                            request_id: message.request_id.to_string(),
                            diagnostics: vec![],
                        });
                        let mut total = 0;
                        for sub in subs {
                            total += sub.count().await;
                        }
                        total
                    })
                });
            },
        );
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: end-to-end producer
// ---------------------------------------------------------------------------

fn bench_e2e_producer(c: &mut Criterion) {
    let mut group = c.benchmark_group("e2e_producer");

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let parts = fragments(&thinking_document(8), 16);
    let upstream = Arc::new(ScriptedUpstream::new(parts));

    group.bench_function("thinkingml_16b_fragments", |b| {
        b.iter(|| {
            rt.block_on(async {
                let broker = Broker::new(std::time::Duration::ZERO);
                let message = Message::new("bench", Uuid::new_v4());
                let publisher = broker.create_channel(&message).unwrap();
                let subscription = broker.subscribe(&message.message_id).unwrap();
                let request = RelayRequest {
                    message_id: message.message_id.clone(),
                    conversation_id: message.conversation_id,
                    user_id: message.user_id.clone(),
                    prompt: "bench".to_string(),
                    dialect: Dialect::ThinkingMl,
                };
                let settings = ProducerSettings {
                    protocol: protocol(),
                    idle_timeout: std::time::Duration::from_secs(5),
                };
                let producer = spawn_producer(
                    publisher,
                    upstream.clone(),
                    request,
                    settings,
                    CancellationToken::new(),
                );
                let events = subscription.count().await;
                let _ = producer.await;
                events
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_tag_guard,
    bench_transcoders,
    bench_broker_fanout,
    bench_e2e_producer
);
criterion_main!(benches);
