//! In-process transport.

use super::{MessageId, RecordHandler, Transport};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::Record;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Delivers notifications synchronously on the publishing thread.
///
/// The outbound side gives each record its group number before handing it to
/// the group's inbound handler, so subscribers always see assigned records.
pub struct LocalTransport {
    store: Arc<dyn Store>,
    groups: RwLock<HashMap<String, Arc<dyn RecordHandler>>>,
}

impl LocalTransport {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            groups: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_registered(&self, group: &str) -> bool {
        self.groups.read().contains_key(group)
    }
}

impl Transport for LocalTransport {
    fn register(
        &self,
        _ctx: &Context,
        group: &str,
        inbound: Arc<dyn RecordHandler>,
    ) -> Result<Arc<dyn RecordHandler>> {
        let mut groups = self.groups.write();
        if groups.contains_key(group) {
            return Err(Error::Configuration(format!(
                "group {} already registered",
                group
            )));
        }
        groups.insert(group.to_string(), Arc::clone(&inbound));
        debug!(group, "Registered local transport");

        Ok(Arc::new(Outbound {
            store: Arc::clone(&self.store),
            group: group.to_string(),
            inbound,
        }))
    }
}

struct Outbound {
    store: Arc<dyn Store>,
    group: String,
    inbound: Arc<dyn RecordHandler>,
}

impl RecordHandler for Outbound {
    fn handle(&self, ctx: &Context, record: &Record) -> Result<bool> {
        if record.group != self.group {
            return Err(Error::InvalidOperation(format!(
                "record of group {} published to {}",
                record.group, self.group
            )));
        }

        let assigned;
        let record = if record.is_assigned() {
            record
        } else {
            assigned = self.store.assign_group(ctx, &record.stream, record.number)?;
            &assigned
        };

        debug!(id = %MessageId::from(record), "Local delivery");
        self.inbound.handle(ctx, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::StreamId;
    use crate::memory::MemoryStore;
    use crate::types::RecordInput;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(i64, i64)>>);

    impl RecordHandler for Collect {
        fn handle(&self, _: &Context, record: &Record) -> Result<bool> {
            self.0.lock().push((record.number, record.group_number));
            Ok(true)
        }
    }

    #[test]
    fn test_outbound_assigns_then_delivers() {
        let store = Arc::new(MemoryStore::new());
        let ctx = Context::background();
        let transport = LocalTransport::new(store.clone());
        let inbound = Arc::new(Collect::default());
        let outbound = transport.register(&ctx, "orders", inbound.clone()).unwrap();
        assert!(transport.is_registered("orders"));

        let a = StreamId::new("orders", "A");
        let b = StreamId::new("orders", "B");
        let input = || vec![RecordInput::new(b"{}".to_vec(), "application/json;type=t")];
        let ra = store.write_records(&ctx, &a, input()).unwrap();
        let rb = store.write_records(&ctx, &b, input()).unwrap();

        assert!(outbound.handle(&ctx, &rb[0]).unwrap());
        assert!(outbound.handle(&ctx, &ra[0]).unwrap());
        assert_eq!(*inbound.0.lock(), vec![(1, 1), (1, 2)]);

        // Re-publishing a stale, unassigned copy is a double assignment.
        let err = outbound.handle(&ctx, &ra[0]).unwrap_err();
        assert!(matches!(err, Error::AssignmentConflict { .. }));
    }

    #[test]
    fn test_group_registers_once() {
        let transport = LocalTransport::new(Arc::new(MemoryStore::new()));
        let ctx = Context::background();
        transport
            .register(&ctx, "orders", Arc::new(Collect::default()))
            .unwrap();
        let err = transport
            .register(&ctx, "orders", Arc::new(Collect::default()))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
