//! End-to-end buffer and registry scenarios.

use std::collections::HashMap;
use std::thread::yield_now;

use crossbeam_utils::thread::scope;

use mirrorbuf::{
    downcast_sink, Allocator, BlockingWait, CircularBuffer, DefaultSignalRegistry, Producers,
    SignalInfo, SignalRegistry, SinkAdapter, YieldingWait,
};

use std::sync::Arc;

fn all_allocators() -> Vec<Allocator> {
    let mut allocators = vec![Allocator::Heap];
    if mirrorbuf::has_posix_mmap_interface() {
        allocators.push(Allocator::DoubleMapped);
    }
    allocators
}

#[test]
fn fill_drain_cycle() {
    for allocator in all_allocators() {
        let buffer =
            CircularBuffer::<i32>::with(1024, allocator, Producers::Single, BlockingWait::new())
                .unwrap();
        let size = buffer.size();
        assert!(size >= 1024);

        let mut writer = buffer.new_writer().unwrap();
        let mut reader = buffer.new_reader();
        assert_eq!(reader.available(), 0);
        assert_eq!(writer.available(), size);

        writer.publish(
            |span| {
                for (i, slot) in span.iter_mut().enumerate() {
                    *slot = i as i32 + 1;
                }
            },
            size,
        );

        assert_eq!(reader.available(), size);
        assert_eq!(writer.available(), 0);
        assert!(writer.try_publish(|_| {}, 1).is_err());

        let span = reader.get(0);
        assert_eq!(span.len(), size);
        assert_eq!(span[0], 1);
        assert_eq!(span[size - 1], size as i32);

        assert!(reader.consume(size));
        assert_eq!(reader.available(), 0);
        assert_eq!(writer.available(), size);
    }
}

#[test]
fn wrap_twice_integrity() {
    for allocator in all_allocators() {
        let buffer =
            CircularBuffer::<i64>::with(1024, allocator, Producers::Single, BlockingWait::new())
                .unwrap();
        let size = buffer.size();
        let mut writer = buffer.new_writer().unwrap();
        let mut reader = buffer.new_reader();

        let mut next: i64 = 0;
        for block in [1usize, 2, 3, 5, 7, 42] {
            for _ in 0..size {
                let base = next;
                assert!(writer
                    .try_publish(
                        |span| {
                            for (i, slot) in span.iter_mut().enumerate() {
                                *slot = base + i as i64;
                            }
                        },
                        block,
                    )
                    .is_ok());
                next += block as i64;

                let span = reader.get(0);
                assert_eq!(span.len(), block);
                assert_eq!(span[0], base);
                assert_eq!(span[block - 1], next - 1);
                assert!(reader.consume(block));
            }
        }
    }
}

#[test]
fn late_joiner_sees_nothing_old() {
    let buffer = CircularBuffer::<i32>::new(1024).unwrap();
    let mut writer = buffer.new_writer().unwrap();
    // A pilot reader keeps the early publishes from being no-ops.
    let mut pilot = buffer.new_reader();

    let mut value = 0;
    writer.publish(
        |span| {
            for slot in span.iter_mut() {
                value += 1;
                *slot = value;
            }
        },
        10,
    );

    let reader = buffer.new_reader();
    assert_eq!(reader.available(), 0);

    writer.publish(
        |span| {
            for slot in span.iter_mut() {
                value += 1;
                *slot = value;
            }
        },
        5,
    );

    assert_eq!(reader.available(), 5);
    assert_eq!(reader.get(0), &[11, 12, 13, 14, 15][..]);
    assert_eq!(pilot.available(), 15);
    assert!(pilot.consume(15));
}

#[test]
fn backpressure_under_stalled_reader() {
    let buffer = CircularBuffer::<u32>::new(64).unwrap();
    let size = buffer.size();
    let mut writer = buffer.new_writer().unwrap();
    let mut fast = buffer.new_reader();
    let mut stalled = buffer.new_reader();

    for _ in 0..size {
        assert!(writer.try_publish(|span| span.fill(1), 1).is_ok());
        assert!(fast.consume(1));
    }

    // The stalled reader now holds the whole window back.
    assert_eq!(writer.available(), 0);
    assert!(writer.try_publish(|span| span.fill(2), 1).is_err());

    assert!(stalled.consume(size));
    assert_eq!(writer.available(), size);
    assert!(writer.try_publish(|span| span.fill(2), 1).is_ok());
    assert!(fast.consume(1));
    assert!(stalled.consume(1));
}

#[test]
fn registry_lookup_and_removal() {
    let registry: Arc<dyn SignalRegistry> = Arc::new(DefaultSignalRegistry::new("scenario"));

    let sink_a = SinkAdapter::<f32>::register(
        vec![SignalInfo::of::<f32>("a", "V", 1.0)],
        false,
        registry.clone(),
    );
    let sink_b = SinkAdapter::<f32>::register(
        vec![SignalInfo::of::<f32>("b", "V", 1.0)],
        false,
        registry.clone(),
    );
    assert_eq!(registry.len(), 2);

    let found = registry.find("b").unwrap();
    assert_eq!(found.signal_infos()[0].name, "b");
    assert!(downcast_sink::<f32>(&found).is_some());

    drop(sink_a);
    assert!(registry.find("a").is_err());
    assert_eq!(registry.len(), 1);
    drop(sink_b);
    assert_eq!(registry.len(), 0);
}

#[test]
fn multi_producer_interleave() {
    const PER_PRODUCER: u64 = 10_000;

    let buffer =
        CircularBuffer::<u64>::with(1024, Allocator::Heap, Producers::Multi, YieldingWait::new())
            .unwrap();
    let mut reader = buffer.new_reader();

    let mut collected: Vec<u64> = Vec::with_capacity(2 * PER_PRODUCER as usize);
    scope(|scope| {
        for id in 0..2u64 {
            let mut writer = buffer.new_writer().unwrap();
            scope.spawn(move |_| {
                for k in 0..PER_PRODUCER {
                    let value = (id << 32) | k;
                    loop {
                        if writer.try_publish(|span| span[0] = value, 1).is_ok() {
                            break;
                        }
                        yield_now();
                    }
                }
            });
        }

        while collected.len() < 2 * PER_PRODUCER as usize {
            let n = {
                let span = reader.get(0);
                collected.extend_from_slice(span);
                span.len()
            };
            if n == 0 {
                yield_now();
                continue;
            }
            assert!(reader.consume(n));
        }
    })
    .unwrap();

    assert_eq!(collected.len(), 2 * PER_PRODUCER as usize);

    // Every tagged value appears exactly once...
    let mut counts: HashMap<u64, usize> = HashMap::new();
    for &value in &collected {
        *counts.entry(value).or_insert(0) += 1;
    }
    assert_eq!(counts.len(), 2 * PER_PRODUCER as usize);
    assert!(counts.values().all(|&count| count == 1));

    // ...and each producer's subsequence arrives in publication order.
    let mut last: HashMap<u64, u64> = HashMap::new();
    for &value in &collected {
        let id = value >> 32;
        let k = value & 0xffff_ffff;
        if let Some(&previous) = last.get(&id) {
            assert!(k > previous, "producer {} went backwards", id);
        }
        last.insert(id, k);
    }
    assert_eq!(last.len(), 2);
}
