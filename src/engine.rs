//! Application-facing engine.

use crate::broker::Broker;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::id::StreamId;
use crate::memory::MemoryStore;
use crate::registry::{Payload, Registry};
use crate::store::Store;
use crate::stream::{Command, Handler, Stream};
use crate::transport::{LocalTransport, Transport};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::info;

/// Event store wiring a store, a transport, a registry and a broker.
///
/// Streams are kept in an LRU cache so their lock positions survive between
/// calls. Every record written through this type is published to its group,
/// which assigns its group number and notifies subscribers.
pub struct EventStore {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    config: EngineConfig,
    broker: Broker,
    streams: Mutex<LruCache<StreamId, Arc<Stream>>>,
}

impl EventStore {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        registry: Registry,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.stream_cache_size)
            .ok_or_else(|| Error::Configuration("stream_cache_size must be positive".into()))?;

        let registry = Arc::new(registry);
        let broker = Broker::new(
            Arc::clone(&store),
            transport,
            Arc::clone(&registry),
            config.clone(),
        );

        info!(
            encoding = ?registry.encoding(),
            stream_cache_size = config.stream_cache_size,
            "Event store ready"
        );

        Ok(Self {
            store,
            registry,
            config,
            broker,
            streams: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Event store over a fresh [`MemoryStore`] and [`LocalTransport`].
    pub fn in_memory(registry: Registry, config: EngineConfig) -> Result<Self> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let transport = Arc::new(LocalTransport::new(Arc::clone(&store)));
        Self::new(store, transport, registry, config)
    }

    /// Cached stream instance for `id`.
    pub fn stream(&self, id: &StreamId) -> Arc<Stream> {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get(id) {
            return Arc::clone(stream);
        }

        let stream = Arc::new(
            Stream::new(
                id.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.registry),
                self.config.clone(),
            )
            .with_publisher(Arc::new(self.broker.clone())),
        );
        streams.put(id.clone(), Arc::clone(&stream));
        stream
    }

    /// Append messages to an entity stream. Returns the new tail.
    pub fn append(&self, ctx: &Context, id: &StreamId, messages: Vec<Payload>) -> Result<i64> {
        self.stream(id).append(ctx, messages)
    }

    /// Replay a stream into `handler`. Returns the position reached.
    pub fn project(&self, ctx: &Context, id: &StreamId, handler: &mut dyn Handler) -> Result<i64> {
        self.stream(id).project(ctx, handler)
    }

    /// Run a command against an entity stream. Returns the new tail.
    pub fn execute<C: Command>(&self, ctx: &Context, id: &StreamId, cmd: &mut C) -> Result<i64> {
        self.stream(id).execute(ctx, cmd)
    }

    /// Register `handler` as subscriber `subscriber_id` of `id`.
    pub fn subscribe<H>(
        &self,
        ctx: &Context,
        subscriber_id: impl Into<String>,
        id: &StreamId,
        handler: H,
    ) -> Result<()>
    where
        H: Handler + 'static,
    {
        self.broker
            .register(ctx, subscriber_id, id.clone(), Box::new(handler))
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::handler_fn;
    use crate::types::Message;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Noted(String);

    fn engine(config: EngineConfig) -> EventStore {
        let mut registry = Registry::new();
        registry.register::<Noted>("Noted").unwrap();
        EventStore::in_memory(registry, config).unwrap()
    }

    fn note(text: &str) -> Payload {
        Payload::new(Noted(text.to_string()))
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            stream_cache_size: 0,
            ..Default::default()
        };
        let result = EventStore::in_memory(Registry::new(), config);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_streams_are_cached() {
        let engine = engine(EngineConfig::default());
        let id = StreamId::new("notes", "1");
        let first = engine.stream(&id);
        let second = engine.stream(&id);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_evicted_stream_recovers_lock_position() {
        let engine = engine(EngineConfig {
            stream_cache_size: 1,
            ..Default::default()
        });
        let ctx = Context::background();
        let one = StreamId::new("notes", "1");
        let two = StreamId::new("notes", "2");

        assert_eq!(engine.append(&ctx, &one, vec![note("a")]).unwrap(), 1);
        assert_eq!(engine.append(&ctx, &two, vec![note("b")]).unwrap(), 1);
        assert_eq!(engine.append(&ctx, &one, vec![note("c")]).unwrap(), 2);
    }

    #[test]
    fn test_append_publishes_to_subscribers() {
        let engine = engine(EngineConfig::default());
        let ctx = Context::background();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine
            .subscribe(
                &ctx,
                "log",
                &StreamId::group("notes"),
                handler_fn(move |m: &Message| {
                    let text = m.data::<Noted>().ok_or("unexpected message")?;
                    sink.lock().push(text.0.clone());
                    Ok(())
                }),
            )
            .unwrap();

        engine
            .append(&ctx, &StreamId::new("notes", "1"), vec![note("x"), note("y")])
            .unwrap();
        assert_eq!(*seen.lock(), vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_group_append_rejected() {
        let engine = engine(EngineConfig::default());
        let err = engine
            .append(&Context::background(), &StreamId::group("notes"), vec![note("x")])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }
}
