//! Subscriber delivery through the broker.

use ordinal::{
    handler_fn, BoxError, Broker, Context, EngineConfig, EventStore, LocalTransport, MemoryStore,
    Message, Payload, Record, RecordInput, Registry, Snapshot, Store, StreamId,
    SubscriptionPosition, Transaction,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize, Deserialize)]
struct Ticked(u32);

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register::<Ticked>("Ticked").unwrap();
    registry
}

/// Store that records every read window it serves.
struct RecordingStore {
    inner: MemoryStore,
    reads: Mutex<Vec<(String, i64, Option<i64>)>>,
}

impl RecordingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            reads: Mutex::new(Vec::new()),
        }
    }

    fn take_reads(&self) -> Vec<(String, i64, Option<i64>)> {
        std::mem::take(&mut *self.reads.lock())
    }
}

impl Store for RecordingStore {
    fn begin(&self, ctx: &Context) -> ordinal::Result<Box<dyn Transaction>> {
        self.inner.begin(ctx)
    }

    fn write_records(
        &self,
        ctx: &Context,
        stream: &StreamId,
        records: Vec<RecordInput>,
    ) -> ordinal::Result<Vec<Record>> {
        self.inner.write_records(ctx, stream, records)
    }

    fn write_records_from(
        &self,
        ctx: &Context,
        stream: &StreamId,
        position: i64,
        records: Vec<RecordInput>,
    ) -> ordinal::Result<Vec<Record>> {
        self.inner.write_records_from(ctx, stream, position, records)
    }

    fn read_records(
        &self,
        ctx: &Context,
        stream: &StreamId,
        from: i64,
        to: Option<i64>,
        limit: usize,
    ) -> ordinal::Result<Vec<Record>> {
        self.reads.lock().push((stream.to_string(), from, to));
        self.inner.read_records(ctx, stream, from, to, limit)
    }

    fn read_snapshot(
        &self,
        ctx: &Context,
        stream: &StreamId,
        name: &str,
    ) -> ordinal::Result<Option<Snapshot>> {
        self.inner.read_snapshot(ctx, stream, name)
    }

    fn update_snapshot(
        &self,
        ctx: &Context,
        stream: &StreamId,
        name: &str,
        snapshot: Snapshot,
    ) -> ordinal::Result<()> {
        self.inner.update_snapshot(ctx, stream, name, snapshot)
    }

    fn assign_group(
        &self,
        ctx: &Context,
        stream: &StreamId,
        number: i64,
    ) -> ordinal::Result<Record> {
        self.inner.assign_group(ctx, stream, number)
    }
}

struct Fixture {
    store: Arc<RecordingStore>,
    registry: Arc<Registry>,
    broker: Broker,
    ctx: Context,
}

impl Fixture {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let store = Arc::new(RecordingStore::new());
        let registry = Arc::new(registry());
        let broker = Broker::new(
            store.clone(),
            Arc::new(LocalTransport::new(store.clone())),
            registry.clone(),
            EngineConfig::default(),
        );
        Self {
            store,
            registry,
            broker,
            ctx: Context::background(),
        }
    }

    /// Write and assign one record per entity, in order.
    fn write(&self, group: &str, entities: &[&str]) -> Vec<Record> {
        entities
            .iter()
            .enumerate()
            .map(|(i, entity)| {
                let stream = StreamId::new(group, *entity);
                let (data, ct) = self.registry.marshal(&Payload::new(Ticked(i as u32))).unwrap();
                let written = self
                    .store
                    .write_records(&self.ctx, &stream, vec![RecordInput::new(data, ct)])
                    .unwrap();
                self.store
                    .assign_group(&self.ctx, &stream, written[0].number)
                    .unwrap()
            })
            .collect()
    }

    fn subscribe(&self, id: &str, stream: StreamId) -> Arc<Mutex<Vec<i64>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        self.broker
            .register(
                &self.ctx,
                id,
                stream.clone(),
                Box::new(handler_fn(move |m: &Message| {
                    sink.lock().push(m.position_in(&stream));
                    Ok(())
                })),
            )
            .unwrap();
        seen
    }

    fn set_position(&self, stream: &StreamId, subscriber: &str, position: i64) {
        let tx = self.store.begin(&self.ctx).unwrap();
        tx.subscription_position_lock(&self.ctx, stream, &[subscriber.to_string()])
            .unwrap();
        tx.set_subscription_position(
            &self.ctx,
            stream,
            SubscriptionPosition::new(subscriber, position),
        )
        .unwrap();
        tx.commit().unwrap();
    }

    fn position(&self, stream: &StreamId, subscriber: &str) -> Option<i64> {
        self.store.inner.subscription_position(stream, subscriber)
    }
}

#[test]
fn test_notification_ahead_of_position_reads_missing_window() {
    let fx = Fixture::new();
    let group = StreamId::group("orders");
    let records = fx.write("orders", &["A", "B", "A", "C", "B", "A", "C", "B"]);
    let seen = fx.subscribe("S", group.clone());
    fx.set_position(&group, "S", 5);
    fx.store.take_reads();

    fx.broker.deliver(&fx.ctx, &records[7]).unwrap();

    assert_eq!(*seen.lock(), vec![6, 7, 8]);
    assert_eq!(fx.position(&group, "S"), Some(8));
    assert_eq!(fx.store.take_reads(), vec![("orders".to_string(), 5, Some(8))]);
}

#[test]
fn test_subscriber_behind_others_is_backfilled() {
    let fx = Fixture::new();
    let group = StreamId::group("orders");
    let records = fx.write("orders", &["A", "B", "A", "B", "A"]);
    let fast = fx.subscribe("fast", group.clone());
    let slow = fx.subscribe("slow", group.clone());
    fx.set_position(&group, "fast", 4);
    fx.set_position(&group, "slow", 1);

    fx.broker.deliver(&fx.ctx, &records[4]).unwrap();

    assert_eq!(*fast.lock(), vec![5]);
    assert_eq!(*slow.lock(), vec![2, 3, 4, 5]);
    assert_eq!(fx.position(&group, "fast"), Some(5));
    assert_eq!(fx.position(&group, "slow"), Some(5));
}

#[test]
fn test_redelivered_record_is_not_applied_again() {
    let fx = Fixture::new();
    let group = StreamId::group("orders");
    let records = fx.write("orders", &["A", "B", "C"]);
    let seen = fx.subscribe("S", group.clone());

    for record in &records {
        fx.broker.deliver(&fx.ctx, record).unwrap();
    }
    for record in records.iter().rev() {
        fx.broker.deliver(&fx.ctx, record).unwrap();
    }

    assert_eq!(*seen.lock(), vec![1, 2, 3]);
    assert_eq!(fx.position(&group, "S"), Some(3));
}

#[test]
fn test_entity_subscriber_counts_in_numbers() {
    let fx = Fixture::new();
    let a = StreamId::new("orders", "A");
    let records = fx.write("orders", &["A", "B", "A", "B", "A"]);
    let seen = fx.subscribe("S", a.clone());

    fx.broker.deliver(&fx.ctx, &records[1]).unwrap();
    assert!(seen.lock().is_empty());

    fx.broker.deliver(&fx.ctx, &records[4]).unwrap();
    assert_eq!(*seen.lock(), vec![1, 2, 3]);
    assert_eq!(fx.position(&a, "S"), Some(3));
}

#[test]
fn test_failed_subscriber_catches_up_on_next_notification() {
    let engine = EventStore::in_memory(registry(), EngineConfig::default()).unwrap();
    let ctx = Context::background();
    let group = StreamId::group("sensors");
    let failures = Arc::new(Mutex::new(1));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (fail, sink) = (failures.clone(), seen.clone());
    engine
        .subscribe(
            &ctx,
            "flaky",
            &group,
            handler_fn(move |m: &Message| -> Result<(), BoxError> {
                let mut remaining = fail.lock();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err("temporarily unavailable".into());
                }
                sink.lock().push(m.group_number);
                Ok(())
            }),
        )
        .unwrap();

    // Publish failures are logged, the append itself succeeds.
    let sensor = StreamId::new("sensors", "t1");
    engine
        .append(&ctx, &sensor, vec![Payload::new(Ticked(1))])
        .unwrap();
    assert!(seen.lock().is_empty());

    engine
        .append(&ctx, &sensor, vec![Payload::new(Ticked(2))])
        .unwrap();
    assert_eq!(*seen.lock(), vec![1, 2]);
}

#[test]
fn test_concurrent_publishers_deliver_every_record_once() {
    let engine = Arc::new(EventStore::in_memory(registry(), EngineConfig::default()).unwrap());
    let ctx = Context::background();
    let group = StreamId::group("clicks");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    engine
        .subscribe(
            &ctx,
            "counter",
            &group,
            handler_fn(move |m: &Message| {
                sink.lock().push(m.group_number);
                Ok(())
            }),
        )
        .unwrap();

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                let stream = StreamId::new("clicks", format!("user{}", w));
                for i in 0..10 {
                    engine
                        .append(&Context::background(), &stream, vec![Payload::new(Ticked(i))])
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    assert_eq!(*seen.lock(), (1..=40).collect::<Vec<i64>>());
}

#[test]
fn test_multi_record_append_numbers_every_record_despite_failure() {
    let engine = EventStore::in_memory(registry(), EngineConfig::default()).unwrap();
    let ctx = Context::background();
    let group = StreamId::group("sensors");
    let failures = Arc::new(Mutex::new(1));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (fail, sink) = (failures.clone(), seen.clone());
    engine
        .subscribe(
            &ctx,
            "flaky",
            &group,
            handler_fn(move |m: &Message| -> Result<(), BoxError> {
                let mut remaining = fail.lock();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err("temporarily unavailable".into());
                }
                sink.lock().push((m.number, m.group_number));
                Ok(())
            }),
        )
        .unwrap();

    let sensor = StreamId::new("sensors", "t1");
    engine
        .append(
            &ctx,
            &sensor,
            vec![Payload::new(Ticked(1)), Payload::new(Ticked(2))],
        )
        .unwrap();
    // The first round failed, the second one backfilled the first record.
    assert_eq!(*seen.lock(), vec![(1, 1), (2, 2)]);

    engine
        .append(&ctx, &sensor, vec![Payload::new(Ticked(3))])
        .unwrap();
    assert_eq!(*seen.lock(), vec![(1, 1), (2, 2), (3, 3)]);

    let grouped = engine
        .store()
        .read_records(&ctx, &group, -1, None, 10)
        .unwrap();
    let numbers: Vec<(i64, i64)> = grouped.iter().map(|r| (r.number, r.group_number)).collect();
    assert_eq!(numbers, vec![(1, 1), (2, 2), (3, 3)]);
}

#[test]
fn test_subscriber_writing_into_its_own_group_does_not_block() {
    let engine = Arc::new(EventStore::in_memory(registry(), EngineConfig::default()).unwrap());
    let ctx = Context::background();
    let follow = StreamId::new("orders", "follow");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (weak, sink, target) = (Arc::downgrade(&engine), seen.clone(), follow.clone());
    engine
        .subscribe(
            &ctx,
            "reactor",
            &StreamId::group("orders"),
            handler_fn(move |m: &Message| -> Result<(), BoxError> {
                sink.lock().push((m.stream.to_string(), m.group_number));
                if m.stream == target {
                    return Ok(());
                }
                let engine = weak.upgrade().ok_or("engine dropped")?;
                engine.append(&Context::background(), &target, vec![Payload::new(Ticked(0))])?;
                Ok(())
            }),
        )
        .unwrap();

    let (done, finished) = crossbeam_channel::bounded(1);
    let writer = {
        let engine = engine.clone();
        std::thread::spawn(move || {
            let result = engine.append(
                &Context::background(),
                &StreamId::new("orders", "A"),
                vec![Payload::new(Ticked(1))],
            );
            let _ = done.send(result.map_err(|e| e.to_string()));
        })
    };

    let result = finished
        .recv_timeout(std::time::Duration::from_secs(5))
        .expect("append blocked on its own delivery round");
    assert_eq!(result, Ok(1));
    writer.join().unwrap();

    assert_eq!(
        *seen.lock(),
        vec![("orders-A".to_string(), 1), ("orders-follow".to_string(), 2)]
    );
    assert_eq!(
        engine.store().read_records(&ctx, &follow, -1, None, 10).unwrap().len(),
        1
    );
}
