use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tempfile::TempDir;

use sapt::{SuffixArray, SuffixArrayConfig, UpdateBatch};

const VOCABULARY: u32 = 2_000;

struct BenchEnv {
    _tmp: TempDir,
    sa: SuffixArray,
}

fn random_sentence(rng: &mut StdRng, len: usize) -> Vec<u32> {
    (0..len).map(|_| rng.gen_range(0..VOCABULARY)).collect()
}

fn make_batch(sa: &SuffixArray, rng: &mut StdRng, sentences: usize, domains: u32) -> UpdateBatch {
    let mut batch = sa.new_batch(0);
    for i in 0..sentences {
        let len = rng.gen_range(5..30);
        let source = random_sentence(rng, len);
        let target = random_sentence(rng, len);
        batch.push(i as u32 % domains, source, target, vec![]);
    }
    batch
}

fn build_env(sentences: usize) -> BenchEnv {
    let tmp = TempDir::new().unwrap();
    let config = SuffixArrayConfig::new(4).with_gc_timeout(Duration::from_secs(3600));
    let sa = SuffixArray::open(tmp.path(), config).unwrap();

    let mut rng = StdRng::seed_from_u64(42);
    let mut remaining = sentences;
    while remaining > 0 {
        let size = remaining.min(1_000);
        sa.put_batch(&make_batch(&sa, &mut rng, size, 16)).unwrap();
        remaining -= size;
    }

    BenchEnv { _tmp: tmp, sa }
}

fn bench_put_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_batch");
    group.sample_size(10);

    for &size in &[100usize, 1_000] {
        let env = build_env(0);
        let mut rng = StdRng::seed_from_u64(7);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || make_batch(&env.sa, &mut rng, size, 16),
                |batch| env.sa.put_batch(&batch).unwrap(),
                criterion::BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_count_occurrences(c: &mut Criterion) {
    let env = build_env(10_000);
    let mut rng = StdRng::seed_from_u64(1);
    let phrases: Vec<Vec<u32>> = (0..256)
        .map(|i| random_sentence(&mut rng, 1 + i % 3))
        .collect();

    let mut group = c.benchmark_group("count_occurrences");
    for (name, is_source) in [("source", true), ("target", false)] {
        group.bench_function(name, |b| {
            let mut i = 0;
            b.iter(|| {
                let phrase = &phrases[i % phrases.len()];
                i += 1;
                black_box(env.sa.count_occurrences(is_source, phrase).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_random_samples(c: &mut Criterion) {
    let env = build_env(10_000);
    let mut rng = StdRng::seed_from_u64(2);
    let words: Vec<u32> = random_sentence(&mut rng, 256);

    c.bench_function("get_random_samples_unigram_limit_100", |b| {
        let mut i = 0;
        b.iter(|| {
            let phrase = [words[i % words.len()]];
            i += 1;
            black_box(env.sa.get_random_samples(None, &phrase, 100, true).unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_put_batch,
    bench_count_occurrences,
    bench_random_samples
);
criterion_main!(benches);
