//! Routing of dirty reads to a follower handler.

use super::{AccessType, HostHandler};
use crate::host::Host;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delegate {
    Master,
    Follower,
}

/// Sends [`AccessType::DirtyRead`] requests to the follower handler and
/// everything else to the master. Outcomes are reported to whichever
/// handler served the last `get`.
pub struct DirtyReadHostHandler {
    master: Arc<dyn HostHandler>,
    follower: Arc<dyn HostHandler>,
    last: Mutex<Delegate>,
}

impl DirtyReadHostHandler {
    pub fn new(master: Arc<dyn HostHandler>, follower: Arc<dyn HostHandler>) -> Self {
        Self {
            master,
            follower,
            last: Mutex::new(Delegate::Master),
        }
    }

    fn delegate(&self) -> &Arc<dyn HostHandler> {
        match *self.last.lock() {
            Delegate::Master => &self.master,
            Delegate::Follower => &self.follower,
        }
    }
}

#[async_trait]
impl HostHandler for DirtyReadHostHandler {
    async fn get(&self, access: AccessType) -> Option<Arc<Host>> {
        let delegate = if access == AccessType::DirtyRead {
            Delegate::Follower
        } else {
            Delegate::Master
        };
        *self.last.lock() = delegate;
        self.delegate().get(access).await
    }

    fn success(&self) {
        self.delegate().success();
    }

    fn fail(&self) {
        self.delegate().fail();
    }

    fn reset(&self) {
        self.delegate().reset();
    }

    async fn close(&self) {
        self.master.close().await;
        self.follower.close().await;
    }

    async fn close_current_on_error(&self) {
        self.delegate().close_current_on_error().await;
    }
}
