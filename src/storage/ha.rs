//! Replication seam
//!
//! The commit log only needs three things from the replication subsystem:
//! whether a follower is close enough to accept an offset, a place to
//! submit a wait request, and a way to nudge the transfer thread. Requests
//! are the same shape as group-commit requests; the producer parks on the
//! request latch.

use crate::storage::flush::GroupCommitRequest;

pub trait HaService: Send + Sync {
    /// Is some follower caught up enough to accept bytes up to
    /// `next_offset`?
    fn is_slave_ok(&self, next_offset: i64) -> bool;

    /// Submit a replication wait; the service completes the request latch
    /// once the follower acknowledged `next_offset`
    fn put_request(&self, request: GroupCommitRequest);

    /// Wake the replication transfer thread
    fn wakeup_transfer(&self);
}

/// Replication disabled: no follower is ever acceptable
#[derive(Debug, Default)]
pub struct NoHaService;

impl HaService for NoHaService {
    fn is_slave_ok(&self, _next_offset: i64) -> bool {
        false
    }

    fn put_request(&self, request: GroupCommitRequest) {
        request.wakeup_customer(false);
    }

    fn wakeup_transfer(&self) {}
}
