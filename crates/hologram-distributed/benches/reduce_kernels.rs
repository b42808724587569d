//! Benchmarks for the reduction kernels behind synthesized operators.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use half::{bf16, f16};
use hologram_distributed::reduce::{accumulate, accumulate_slice, Max, Sum};
use std::ffi::{c_int, c_void};

const SIZES: [usize; 3] = [1 << 10, 1 << 14, 1 << 18];

fn bench_half_sum(c: &mut Criterion) {
    let mut group = c.benchmark_group("accumulate_f16_sum");
    for &len in &SIZES {
        let input: Vec<f16> = (0..len).map(|i| f16::from_f32((i % 64) as f32 * 0.25)).collect();
        let mut acc = vec![f16::from_f32(1.0); len];
        group.throughput(Throughput::Bytes((len * 2) as u64));

        group.bench_with_input(BenchmarkId::new("slice", len), &len, |b, _| {
            b.iter(|| accumulate_slice::<f16, Sum>(black_box(&input), black_box(&mut acc)))
        });

        group.bench_with_input(BenchmarkId::new("callback", len), &len, |b, &len| {
            b.iter(|| {
                let mut count = len as c_int;
                unsafe {
                    accumulate::<f16, Sum>(
                        black_box(input.as_ptr() as *mut c_void),
                        black_box(acc.as_mut_ptr().cast()),
                        &mut count,
                        std::ptr::null_mut(),
                    )
                }
            })
        });
    }
    group.finish();
}

fn bench_bf16_max(c: &mut Criterion) {
    let mut group = c.benchmark_group("accumulate_bf16_max");
    for &len in &SIZES {
        let input: Vec<bf16> = (0..len).map(|i| bf16::from_f32((i % 97) as f32 - 48.0)).collect();
        let mut acc = vec![bf16::from_f32(0.0); len];
        group.throughput(Throughput::Bytes((len * 2) as u64));

        group.bench_with_input(BenchmarkId::new("callback", len), &len, |b, &len| {
            b.iter(|| {
                let mut count = len as c_int;
                unsafe {
                    accumulate::<bf16, Max>(
                        black_box(input.as_ptr() as *mut c_void),
                        black_box(acc.as_mut_ptr().cast()),
                        &mut count,
                        std::ptr::null_mut(),
                    )
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_half_sum, bench_bf16_max);
criterion_main!(benches);
