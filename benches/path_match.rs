use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use sequencing::{
    ChangeEvent, ContentNode, EventTypes, FactoryRegistry, InMemoryContentStore, PathExpression, Sequencer,
    SequencerConfig, SequencerContext, SequencerError, SequencerRegistry, SequencingConfig, SequencingSystem, Session,
};

const PROBES: &[&str] = &[
    "/a/b/c",
    "/photos/2024/summer/cat.JPG[2]/jcr:content/@jcr:data",
    "/src/x/y",
    "/projects/files/readme",
    "/docs/reports/q1/data.csv",
    "/a/x/y/z/d",
];

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_expression");
    group.throughput(Throughput::Elements(1));

    group.bench_function("compile_with_criteria", |b| {
        b.iter(|| PathExpression::compile(black_box("//(*.jpg|*.png)[*]/jcr:content[@jcr:data]")).unwrap());
    });
    group.bench_function("compile_template", |b| {
        b.iter(|| PathExpression::compile(black_box("/meta/$2/$1[/(*)/files/(*)]")).unwrap());
    });
    group.finish();
}

fn bench_match(c: &mut Criterion) {
    let expressions: Vec<PathExpression> = [
        "/a/b/c",
        "/a//d",
        "//(*.jpg|*.png)[*]/jcr:content[@jcr:data]",
        "/out/$1[/src/(x/y)]",
        "/meta/$2/$1[/(*)/files/(*)]",
        "/reports[/docs//(*.csv)]",
    ]
    .iter()
    .map(|text| PathExpression::compile(text).unwrap())
    .collect();

    let mut group = c.benchmark_group("path_expression");
    group.throughput(Throughput::Elements((expressions.len() * PROBES.len()) as u64));
    group.bench_function("match_probe_corpus", |b| {
        b.iter(|| {
            let mut hits = 0usize;
            for e in &expressions {
                for probe in PROBES {
                    if e.matches(black_box(probe)).is_some() {
                        hits += 1;
                    }
                }
            }
            hits
        });
    });
    group.finish();
}

struct Noop(Option<SequencerConfig>);

impl Sequencer for Noop {
    fn configure(&mut self, config: SequencerConfig) -> Result<(), SequencerError> {
        self.0 = Some(config);
        Ok(())
    }

    fn configuration(&self) -> Option<&SequencerConfig> {
        self.0.as_ref()
    }

    fn execute(&self, _: &ContentNode, _: &mut dyn Session, _: &SequencerContext) -> Result<(), SequencerError> {
        Ok(())
    }
}

fn bench_ingress(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequencing");
    group.throughput(Throughput::Elements(64));

    group.bench_function("batch_ingress_dedup", |b| {
        b.iter_custom(|iters| {
            let factory = FactoryRegistry::new().with("noop", || Ok(Box::new(Noop(None)) as Box<dyn Sequencer>));
            let registry = Arc::new(SequencerRegistry::new(factory));
            let config = SequencerConfig::builder().name("noop").implementation("noop").build().unwrap();
            registry.add(config).unwrap();

            // Paths do not exist, so workers fail fast and the ingress path dominates.
            let system = SequencingSystem::new(registry, SequencingConfig::default());
            system.set_content_store(Arc::new(InMemoryContentStore::with_workspace("bench"))).unwrap();
            system.start().unwrap();

            let batch: Vec<ChangeEvent> = (0..64)
                .map(|i| ChangeEvent::new(EventTypes::PROPERTY_CHANGED, format!("/node-{}/prop-{i}", i % 8)))
                .collect();

            let start = Instant::now();
            for _ in 0..iters {
                system.on_change_batch("bench", black_box(&batch));
            }
            let elapsed = start.elapsed();
            system.shutdown();
            elapsed
        });
    });
    group.finish();
}

criterion_group!(path_match, bench_compile, bench_match, bench_ingress);
criterion_main!(path_match);
