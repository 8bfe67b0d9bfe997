// src/core/state.rs

//! Shared process-wide state (C10 support): the service-name → coordinator
//! registry, the failover manager handle, and the kernel table driver.
//! Built in that order at startup, since the failover manager's prefix
//! registry is populated as each coordinator is created.

use crate::core::coordinator::CoordinatorCommand;
use crate::core::failover::FailoverManager;
use crate::core::kernel::KernelTableDriver;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct GlobalState {
    pub coordinators: Arc<HashMap<String, mpsc::Sender<CoordinatorCommand>>>,
    pub failover: Option<Arc<FailoverManager>>,
    pub drivers: Arc<HashMap<String, Arc<KernelTableDriver>>>,
}

impl GlobalState {
    pub fn new(
        coordinators: HashMap<String, mpsc::Sender<CoordinatorCommand>>,
        failover: Option<Arc<FailoverManager>>,
        drivers: HashMap<String, Arc<KernelTableDriver>>,
    ) -> Self {
        Self {
            coordinators: Arc::new(coordinators),
            failover,
            drivers: Arc::new(drivers),
        }
    }
}
