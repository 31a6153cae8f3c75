//! In-flight operation tracking for the shared reactor.
//!
//! Each submitted operation gets a token that identifies the operation type
//! and the connection it belongs to. The token is freed when the operation's
//! completion handler has run, so an empty table means the reactor has no
//! pending work.

use slab::Slab;

/// Type of in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// Accept operation on the listening socket.
    Accept,
    /// Read operation on a connection.
    Read {
        /// Connection identifier in the registry.
        conn_id: usize,
    },
    /// Write operation on a connection.
    Write {
        /// Connection identifier in the registry.
        conn_id: usize,
    },
    /// Health-check timer for a connection.
    Timer {
        /// Connection identifier in the registry.
        conn_id: usize,
    },
}

impl OpType {
    /// Connection the operation belongs to, if any.
    pub fn conn_id(&self) -> Option<usize> {
        match *self {
            OpType::Accept => None,
            OpType::Read { conn_id } | OpType::Write { conn_id } | OpType::Timer { conn_id } => {
                Some(conn_id)
            }
        }
    }
}

/// Allocator for operation tokens with O(1) lookup.
///
/// Uses a slab to efficiently allocate and deallocate tokens,
/// providing stable identifiers for in-flight operations.
pub struct TokenAllocator {
    ops: Slab<OpType>,
}

impl TokenAllocator {
    /// Create a new token allocator with specified capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
        }
    }

    /// Allocate a new token for an operation.
    pub fn alloc(&mut self, op: OpType) -> u64 {
        self.ops.insert(op) as u64
    }

    /// Get the operation type for a token.
    ///
    /// Returns None if the token is invalid or already freed.
    #[cfg(test)]
    pub fn get(&self, token: u64) -> Option<OpType> {
        self.ops.get(token as usize).copied()
    }

    /// Free a token, making it available for reuse.
    ///
    /// Returns the operation type that was associated with the token.
    pub fn free(&mut self, token: u64) -> Option<OpType> {
        self.ops.try_remove(token as usize)
    }

    /// Count the in-flight operations matching a predicate.
    pub fn count(&self, pred: impl Fn(&OpType) -> bool) -> usize {
        self.ops.iter().filter(|(_, op)| pred(op)).count()
    }

    /// Number of currently allocated tokens.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check if there are no allocated tokens.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
