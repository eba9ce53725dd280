//! Storage engine benchmarks.
//!
//! - create/destroy churn through a command buffer;
//! - structural modification (add and remove a component on every entity);
//! - cached versus from-scratch query evaluation.
//!
//! Run with: `cargo bench --bench storage_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use strata_ecs::prelude::*;

#[derive(Debug, Clone, PartialEq)]
struct Position {
    x: f64,
    y: f64,
}

#[derive(Debug, Clone, PartialEq)]
struct Velocity {
    dx: f64,
    dy: f64,
}

#[derive(Debug, Clone, PartialEq)]
struct Health(u32);

#[derive(Debug, Clone, PartialEq)]
struct Stunned;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Create `count` entities with Position, Velocity and Health.
fn populated_world(count: usize) -> (World, Vec<Entity>) {
    let mut world = World::new();
    let mut buffer = CommandBuffer::new(&world);
    let handles: Vec<_> = (0..count)
        .map(|i| {
            buffer
                .create()
                .set(Position { x: i as f64, y: 0.0 })
                .set(Velocity { dx: 1.0, dy: 0.5 })
                .set(Health(100))
                .entity()
        })
        .collect();
    let resolver = buffer.playback(&mut world).expect("playback");
    let entities = handles
        .into_iter()
        .map(|h| resolver.resolve(h).expect("resolve"))
        .collect();
    (world, entities)
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_create_destroy(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_destroy");
    for &count in &[1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let mut world = World::new();
            let mut buffer = CommandBuffer::new(&world);
            b.iter(|| {
                let handles: Vec<_> = (0..count)
                    .map(|i| buffer.create().set(Position { x: i as f64, y: 0.0 }).set(Health(1)).entity())
                    .collect();
                let resolver = buffer.playback(&mut world).expect("create");
                let entities: Vec<Entity> = handles
                    .into_iter()
                    .map(|h| resolver.resolve(h).expect("resolve"))
                    .collect();
                buffer.destroy_many(&entities).expect("destroy");
                black_box(buffer.playback(&mut world).expect("destroy playback").report().destroyed);
            });
        });
    }
    group.finish();
}

fn bench_structural_modification(c: &mut Criterion) {
    let mut group = c.benchmark_group("structural_modification");
    for &count in &[1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let (mut world, entities) = populated_world(count);
            let mut buffer = CommandBuffer::new(&world);
            b.iter(|| {
                for &e in &entities {
                    buffer.set(e, Stunned).expect("set");
                }
                buffer.playback(&mut world).expect("add");
                for &e in &entities {
                    buffer.remove::<Stunned>(e).expect("remove");
                }
                black_box(buffer.playback(&mut world).expect("remove").report().migrated);
            });
        });
    }
    group.finish();
}

fn bench_in_place_set(c: &mut Criterion) {
    let (mut world, entities) = populated_world(10_000);
    let mut buffer = CommandBuffer::new(&world);
    c.bench_function("in_place_set_10k", |b| {
        b.iter(|| {
            for (i, &e) in entities.iter().enumerate() {
                buffer.set(e, Health(i as u32)).expect("set");
            }
            black_box(buffer.playback(&mut world).expect("playback").report().modified);
        });
    });
}

fn bench_query(c: &mut Criterion) {
    let (mut world, entities) = populated_world(1_000);
    // Split the entities across three archetypes.
    let mut buffer = CommandBuffer::new(&world);
    for (i, &e) in entities.iter().enumerate() {
        match i % 4 {
            0 => {
                buffer.remove::<Velocity>(e).expect("remove");
            }
            1 => {
                buffer.set(e, Stunned).expect("set");
            }
            _ => {}
        }
    }
    buffer.playback(&mut world).expect("playback");

    let moving = QueryBuilder::new()
        .include::<Position>()
        .include::<Velocity>()
        .exclude::<Stunned>()
        .build(&world)
        .expect("build");

    let mut group = c.benchmark_group("query");
    group.bench_function("cached_count", |b| {
        b.iter(|| black_box(moving.count(&world)));
    });
    group.bench_function("fresh_count", |b| {
        b.iter(|| {
            let fresh = moving.to_builder().build(&world).expect("build");
            black_box(fresh.count(&world))
        });
    });
    group.bench_function("integrate_positions", |b| {
        b.iter(|| {
            moving.for_each_chunk_mut(&mut world, |chunk| {
                let velocities: Vec<(f64, f64)> = chunk
                    .column::<Velocity>()
                    .map(|v| v.iter().map(|v| (v.dx, v.dy)).collect())
                    .unwrap_or_default();
                if let Some(positions) = chunk.column_mut::<Position>() {
                    for (p, (dx, dy)) in positions.iter_mut().zip(velocities) {
                        p.x += dx;
                        p.y += dy;
                    }
                }
            });
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_create_destroy,
    bench_structural_modification,
    bench_in_place_set,
    bench_query,
);
criterion_main!(benches);
