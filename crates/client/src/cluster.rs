use std::collections::{BTreeMap, HashMap};

use kiln_storage::TopicPartition;

/// The producer's view of partition leadership.
///
/// Immutable lookups only; an updated view replaces the whole value, the
/// way broker metadata refreshes arrive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cluster {
    leaders: HashMap<TopicPartition, i32>,
    partitions_by_node: BTreeMap<i32, Vec<TopicPartition>>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_leader(&mut self, partition: TopicPartition, node_id: i32) {
        if let Some(previous) = self.leaders.insert(partition.clone(), node_id) {
            if let Some(list) = self.partitions_by_node.get_mut(&previous) {
                list.retain(|tp| *tp != partition);
            }
        }
        self.partitions_by_node
            .entry(node_id)
            .or_default()
            .push(partition);
    }

    pub fn remove_leader(&mut self, partition: &TopicPartition) {
        if let Some(node_id) = self.leaders.remove(partition) {
            if let Some(list) = self.partitions_by_node.get_mut(&node_id) {
                list.retain(|tp| tp != partition);
            }
        }
    }

    pub fn leader_for(&self, partition: &TopicPartition) -> Option<i32> {
        self.leaders.get(partition).copied()
    }

    pub fn partitions_for_node(&self, node_id: i32) -> &[TopicPartition] {
        self.partitions_by_node
            .get(&node_id)
            .map_or(&[], Vec::as_slice)
    }

    pub fn nodes(&self) -> Vec<i32> {
        self.partitions_by_node.keys().copied().collect()
    }
}
