use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use edu_cache::{
    generate_key, CacheConfig, CacheManager, CacheOptions, ContextTuple, HttpVerb, QueryParams,
};
use serde_json::{json, Value};
use std::hint::black_box;
use tokio::runtime::Runtime;

fn student_page(rows: usize) -> Value {
    let students: Vec<Value> = (0..rows)
        .map(|i| json!({"id": i, "name": format!("Student {}", i), "classId": 12}))
        .collect();
    json!({"data": students, "page": 1, "total": rows})
}

/// Key derivation with a full context tuple
fn bench_generate_key(c: &mut Criterion) {
    let params = QueryParams::new()
        .with("page", 3)
        .with("limit", 50)
        .with("search", "ana maría")
        .with("sort", "name");
    let ctx = ContextTuple::for_user("1042")
        .tenant("6")
        .class("12")
        .subject("88")
        .role("InstituteAdmin");

    c.bench_function("key/generate_full_context", |b| {
        b.iter(|| generate_key(black_box("/institute-classes/12/students"), Some(&params), Some(&ctx)))
    });
}

/// In-memory read path (hit), by payload size
fn bench_get_hit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("manager/get_hit");

    for rows in [10, 100, 1_000] {
        let cache = CacheManager::new(CacheConfig::in_memory()).unwrap();
        let options = CacheOptions::new().context(ContextTuple::for_tenant("6"));
        let params = QueryParams::new().with("page", 1);

        rt.block_on(async {
            cache
                .set_cache("/students", &student_page(rows), Some(&params), &options)
                .await;
        });

        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, _| {
            b.to_async(&rt).iter(|| async {
                let value: Option<Value> = cache.get_cache("/students", Some(&params), &options).await;
                black_box(value)
            });
        });
    }

    group.finish();
}

/// Prefix invalidation over a populated store
fn bench_invalidate(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let cache = CacheManager::new(CacheConfig::in_memory()).unwrap();
    let page = student_page(10);

    c.bench_function("manager/invalidate_500_entries", |b| {
        b.to_async(&rt).iter(|| async {
            for i in 0..500 {
                let options = CacheOptions::new().context(ContextTuple::for_tenant((i % 5).to_string()));
                let params = QueryParams::new().with("page", i);
                cache.set_cache("/students", &page, Some(&params), &options).await;
            }
            let event = cache
                .invalidate_on_mutation(HttpVerb::Post, "/institute-classes", None)
                .await;
            black_box(event.removed)
        });
    });
}

criterion_group!(benches, bench_generate_key, bench_get_hit, bench_invalidate);
criterion_main!(benches);
