use criterion::{Criterion, criterion_group, criterion_main};
use tabletrace::layout::{TargetPosition, synthesize};

// Page offsets of the 16 ldr instructions in the reference
// mbedtls_internal_aes_encrypt disassembly.
const OFFSETS: [u64; 16] = [
    0x4bc, 0x4c4, 0x4cc, 0x4d0, 0x4f0, 0x4fc, 0x504, 0x508, 0x528, 0x534, 0x538, 0x550, 0x554,
    0x55c, 0x570, 0x578,
];

fn targets() -> Vec<TargetPosition> {
    OFFSETS
        .iter()
        .enumerate()
        .map(|(i, &offset)| TargetPosition::new(format!("FT{}_{}", i % 4, i / 4), offset))
        .collect()
}

fn bench_synthesize(c: &mut Criterion) {
    c.bench_function("synthesize", |b| {
        b.iter(|| synthesize(targets()).unwrap());
    });
}

criterion_group!(benches, bench_synthesize);
criterion_main!(benches);
