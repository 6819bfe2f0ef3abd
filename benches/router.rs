//! Benchmarks for the inbound routing hot path
//!
//! Target: <1us per routed frame, extraction included

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

use hft_stream::ws::{
    FeedSink, JsonFieldExtractor, MessageIdGenerator, RateLimiter, ResponseRouter, Response,
    RouterOptions, Signature, SignatureExtractor,
};

const MARK_PRICE: &[u8] = br#"{"e":"markPriceUpdate","E":1562305380000,"s":"BTCUSDT","p":"11794.15000000","i":"11784.62659091","P":"11784.25641265","r":"0.00038167","T":1562306400000}"#;

const ORDER_REPLY: &[u8] = br#"{"id":1719912345678,"status":200,"result":{"orderId":325078477,"symbol":"BTCUSDT","status":"NEW","price":"43187.00"}}"#;

/// Discards every frame
struct NullSink;

impl FeedSink for NullSink {
    fn deliver(&self, frame: Response) {
        black_box(frame);
    }
}

fn router() -> Arc<ResponseRouter> {
    Arc::new(ResponseRouter::new(
        Arc::new(JsonFieldExtractor::new("id")),
        Arc::new(NullSink),
        RouterOptions::default(),
    ))
}

fn bench_extract(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract");
    let extractor = JsonFieldExtractor::new("id");
    let reply = Response::text(Bytes::from_static(ORDER_REPLY));
    let push = Response::text(Bytes::from_static(MARK_PRICE));

    group.throughput(Throughput::Bytes(ORDER_REPLY.len() as u64));
    group.bench_function("reply_with_id", |b| {
        b.iter(|| black_box(extractor.extract(black_box(&reply))))
    });

    group.throughput(Throughput::Bytes(MARK_PRICE.len() as u64));
    group.bench_function("push_without_id", |b| {
        b.iter(|| black_box(extractor.extract(black_box(&push))))
    });

    group.finish();
}

fn bench_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("route");
    let router = router();

    group.throughput(Throughput::Elements(1));
    group.bench_function("unsolicited", |b| {
        let push = Response::text(Bytes::from_static(MARK_PRICE));
        b.iter(|| black_box(router.route(push.clone())))
    });

    group.bench_function("register_and_resolve", |b| {
        let reply = Response::text(Bytes::from_static(ORDER_REPLY));
        b.iter(|| {
            let handle = router
                .wait_for(Signature::Id(1719912345678), 1, Duration::from_secs(7))
                .unwrap_or_else(|e| panic!("register failed: {}", e));
            black_box(router.route(reply.clone()));
            drop(handle);
        })
    });

    group.finish();
}

fn bench_outbound(c: &mut Criterion) {
    let mut group = c.benchmark_group("outbound");
    let ids = MessageIdGenerator::new();
    let limiter = RateLimiter::unlimited();

    group.bench_function("message_id", |b| b.iter(|| black_box(ids.next(false))));
    group.bench_function("limiter_unlimited", |b| {
        b.iter(|| black_box(limiter.try_acquire()))
    });

    group.finish();
}

criterion_group!(benches, bench_extract, bench_route, bench_outbound);
criterion_main!(benches);
