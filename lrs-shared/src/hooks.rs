use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::stream::StreamPath;

/// Lifecycle events handed to the external hook client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    OnPublish,
    OnUnpublish,
    OnPlay,
    OnStop,
}

/// Receives lifecycle notifications; HTTP delivery is implemented outside
/// the core.
pub trait HookDispatcher: Send + Sync {
    fn dispatch(&self, event: HookEvent, context_id: u64, path: &StreamPath, client_ip: &str);
}

/// Statistics sink; Prometheus rendering is implemented outside the core.
pub trait StatsSink: Send + Sync {
    fn incr(&self, _name: &'static str, _delta: u64) {}
    fn gauge(&self, _name: &'static str, _value: i64) {}
}

/// Swallows everything. Default collaborator for tests and for vhosts with
/// hooks unconfigured.
#[derive(Default)]
pub struct Blackhole {
    pub dispatched: AtomicU64,
}

impl HookDispatcher for Blackhole {
    fn dispatch(&self, _event: HookEvent, _context_id: u64, _path: &StreamPath, _client_ip: &str) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }
}

impl StatsSink for Blackhole {}

pub type SharedHooks = Arc<dyn HookDispatcher>;
pub type SharedStats = Arc<dyn StatsSink>;
