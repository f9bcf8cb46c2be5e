//! Stage pipeline benchmarks.

use bson::doc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mongate_server::cursor::TtlCursorCache;
use mongate_server::{
    ClientConnection, Command, Context, GatewayHandler, Pipeline, PluginRegistry, Request,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn build_pipeline(stages: usize) -> Pipeline {
    let registry = PluginRegistry::with_builtins();
    let names = ["defaults", "filtercommand", "inlimit", "nohint", "slowlog", "writeconcernoverride"];
    let specs: Vec<_> = names
        .iter()
        .cycle()
        .take(stages)
        .map(|name| (name.to_string(), doc! {}))
        .collect();
    let plugins = registry.build(&specs).unwrap();
    Pipeline::new(plugins, Arc::new(GatewayHandler::default()))
}

fn bench_pipeline_depth(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("pipeline_ping");

    let client = Arc::new(ClientConnection::new(None));
    let cursors = Arc::new(TtlCursorCache::new(Duration::from_secs(600)));

    for stages in [0, 6, 12] {
        let pipeline = build_pipeline(stages);
        group.bench_with_input(BenchmarkId::from_parameter(stages), &pipeline, |b, pipeline| {
            b.to_async(&rt).iter(|| {
                let client = client.clone();
                let cursors = cursors.clone();
                async move {
                    let command = Command::from_document(doc! {"ping": 1, "$db": "admin"}).unwrap();
                    let mut request = Request::new(client, cursors, command);
                    black_box(
                        pipeline
                            .execute(&Context::default(), &mut request)
                            .await
                            .unwrap(),
                    )
                }
            });
        });
    }

    group.finish();
}

fn bench_cursor_cache(c: &mut Criterion) {
    use mongate_server::CursorCache;

    let mut group = c.benchmark_group("cursor_cache");
    let cache = TtlCursorCache::new(Duration::from_secs(600));
    for id in 1..=10_000i64 {
        cache.create(id);
    }

    group.bench_function("get_hit", |b| {
        let mut id = 0i64;
        b.iter(|| {
            id = id % 10_000 + 1;
            black_box(cache.get(id))
        });
    });

    group.bench_function("create_close", |b| {
        b.iter(|| {
            cache.create(1_000_000);
            cache.close(1_000_000);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_pipeline_depth, bench_cursor_cache);
criterion_main!(benches);
