use crate::config::Role;
use crate::error::MuxError;
use crate::frame::{StreamId, MAX_STREAM_ID};
use std::sync::atomic::{AtomicU32, Ordering};

/// Hands out locally-initiated stream ids: odd for clients, even for servers.
///
/// Ids only grow; an id is never handed out twice on the same connection.
pub struct StreamIdAllocator {
    next: AtomicU32,
}

impl StreamIdAllocator {
    pub fn new(role: Role) -> Self {
        let first = match role {
            Role::Client => 1,
            Role::Server => 2,
        };
        Self {
            next: AtomicU32::new(first),
        }
    }

    pub fn next_stream_id(&self) -> Result<StreamId, MuxError> {
        loop {
            let current = self.next.load(Ordering::SeqCst);
            if current > MAX_STREAM_ID {
                return Err(MuxError::StreamIdsExhausted);
            }
            if self
                .next
                .compare_exchange(current, current + 2, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(current);
            }
        }
    }

    /// Highest id handed out so far, or 0 if none.
    pub fn last_allocated(&self) -> StreamId {
        self.next.load(Ordering::SeqCst).saturating_sub(2)
    }

    #[cfg(test)]
    pub(crate) fn starting_at(first: StreamId) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }
}

/// Whether `stream_id` was opened by the peer of a connection in `role`.
pub fn is_peer_initiated(role: Role, stream_id: StreamId) -> bool {
    match role {
        Role::Client => stream_id % 2 == 0,
        Role::Server => stream_id % 2 == 1,
    }
}
