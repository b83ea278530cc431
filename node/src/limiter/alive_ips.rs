use crate::panel::AliveIps;
use parking_lot::RwLock;
use std::sync::Arc;

/// The panel's latest belief of which addresses are online per uid.
///
/// Replaced wholesale by the alive-IP poll; readers take a cheap `Arc` snapshot and never block
/// the writer for longer than a pointer swap.
#[derive(Default)]
pub struct AliveIpSnapshot {
    current: RwLock<Arc<AliveIps>>,
}

impl AliveIpSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, alive: AliveIps) {
        *self.current.write() = Arc::new(alive);
    }

    pub fn snapshot(&self) -> Arc<AliveIps> {
        self.current.read().clone()
    }

    pub fn user_count(&self) -> usize {
        self.current.read().len()
    }
}
