use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use mirrorbuf::{Allocator, BusyWait, CircularBuffer, Producers};

const BLOCK: usize = 512;

fn bench_publish_consume(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_consume");
    group.throughput(Throughput::Elements(BLOCK as u64));

    let mut allocators = vec![Allocator::Heap];
    if mirrorbuf::has_posix_mmap_interface() {
        allocators.push(Allocator::DoubleMapped);
    }

    for allocator in allocators {
        group.bench_with_input(
            BenchmarkId::new("spsc", format!("{:?}", allocator)),
            &allocator,
            |b, &allocator| {
                let buffer =
                    CircularBuffer::<f32>::with(4096, allocator, Producers::Single, BusyWait::new())
                        .unwrap();
                let mut writer = buffer.new_writer().unwrap();
                let mut reader = buffer.new_reader();
                b.iter(|| {
                    writer.publish(|span| span.fill(1.0), BLOCK);
                    let n = reader.get(BLOCK).len();
                    reader.consume(n);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_publish_consume);
criterion_main!(benches);
