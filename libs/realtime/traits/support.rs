use crate::traits::transport::TransportKind;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt::Debug;

/// Feature detection for transport kinds
///
/// Consulted when an orchestrator is built and again before every upgrade
/// attempt, so support may appear or disappear at runtime.
pub trait TransportSupport: Send + Sync + Debug {
    fn is_supported(&self, kind: TransportKind) -> bool;

    /// Supported kinds in priority order
    fn supported(&self) -> Vec<TransportKind> {
        TransportKind::PRIORITY
            .into_iter()
            .filter(|kind| self.is_supported(*kind))
            .collect()
    }
}

/// Every transport is available
#[derive(Debug, Default, Clone, Copy)]
pub struct AllSupported;

impl TransportSupport for AllSupported {
    fn is_supported(&self, _kind: TransportKind) -> bool {
        true
    }
}

/// Explicit, mutable set of available transports
#[derive(Debug, Default)]
pub struct StaticSupport {
    kinds: RwLock<HashSet<TransportKind>>,
}

impl StaticSupport {
    pub fn new(kinds: impl IntoIterator<Item = TransportKind>) -> Self {
        Self {
            kinds: RwLock::new(kinds.into_iter().collect()),
        }
    }

    pub fn enable(&self, kind: TransportKind) {
        self.kinds.write().insert(kind);
    }

    pub fn disable(&self, kind: TransportKind) {
        self.kinds.write().remove(&kind);
    }
}

impl TransportSupport for StaticSupport {
    fn is_supported(&self, kind: TransportKind) -> bool {
        self.kinds.read().contains(&kind)
    }
}
