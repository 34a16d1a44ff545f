//! Node-ID encoding for the three node groups.
//!
//! A training cluster has one scheduler, a group of servers and a group of
//! workers. Group masks are single bits so they can be OR-combined when a
//! message addresses several groups at once, e.g.
//! `SERVER_GROUP + WORKER_GROUP` reaches every server and worker node.

/// A node ID: either a group mask (broadcast) or an encoded single node.
pub type NodeId = i32;

/// Node ID of the scheduler.
pub const SCHEDULER: NodeId = 1;

/// Group mask for all server nodes.
pub const SERVER_GROUP: NodeId = 2;

/// Group mask for all worker nodes.
pub const WORKER_GROUP: NodeId = 4;

/// Encodes a single node from its group mask and 0-based rank.
#[inline]
pub fn encode(group: NodeId, rank: i32) -> NodeId {
    group + (rank + 1) * 8
}

/// Returns the group mask of a node ID.
#[inline]
pub fn group_of(id: NodeId) -> NodeId {
    id % 8
}

/// Returns the 0-based rank of an encoded single-node ID.
#[inline]
pub fn rank_of(id: NodeId) -> i32 {
    id / 8 - 1
}

/// Returns true when `id` is a group mask rather than a single node.
#[inline]
pub fn is_group(id: NodeId) -> bool {
    id < 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_roundtrip() {
        for group in [SCHEDULER, SERVER_GROUP, WORKER_GROUP] {
            for rank in 0..5 {
                let id = encode(group, rank);
                assert_eq!(group_of(id), group);
                assert_eq!(rank_of(id), rank);
                assert!(!is_group(id));
            }
        }
    }

    #[test]
    fn test_group_masks_combine() {
        let both = SERVER_GROUP + WORKER_GROUP;
        assert!(is_group(both));
        assert_ne!(both & SERVER_GROUP, 0);
        assert_ne!(both & WORKER_GROUP, 0);
        assert_eq!(both & SCHEDULER, 0);
    }
}
