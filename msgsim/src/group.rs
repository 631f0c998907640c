//! Communicator groups: rank to node mapping.

use std::collections::HashMap;

use crate::nic::NodeId;
use crate::request::{Communicator, RankId, COMM_WORLD};

/// Members of one communicator, as seen from one rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    my_rank: RankId,
    nodes: Vec<NodeId>,
}

impl Group {
    /// Creates a group where rank `i` runs on `nodes[i]`.
    pub fn new(my_rank: RankId, nodes: Vec<NodeId>) -> Self {
        Self { my_rank, nodes }
    }

    /// Rank of the local process.
    pub fn my_rank(&self) -> RankId {
        self.my_rank
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Node hosting `rank`.
    pub fn node_of(&self, rank: RankId) -> Option<NodeId> {
        self.nodes.get(rank as usize).copied()
    }
}

/// All communicators known to an engine.
#[derive(Clone, Debug, Default)]
pub struct Groups {
    groups: HashMap<Communicator, Group>,
}

impl Groups {
    /// Creates a set holding only the world communicator.
    pub fn world(my_rank: RankId, nodes: Vec<NodeId>) -> Self {
        let mut groups = Self::default();
        groups.insert(COMM_WORLD, Group::new(my_rank, nodes));

        groups
    }

    /// Adds or replaces a communicator.
    pub fn insert(&mut self, comm: Communicator, group: Group) {
        self.groups.insert(comm, group);
    }

    /// Looks a communicator up.
    pub fn get(&self, comm: Communicator) -> Option<&Group> {
        self.groups.get(&comm)
    }

    /// Rank of the local process in the world communicator.
    pub fn world_rank(&self) -> Option<RankId> {
        self.get(COMM_WORLD).map(Group::my_rank)
    }
}
