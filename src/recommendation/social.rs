//! Social graph
//!
//! Per-user adjacency over accepted connections, plus a log-scaled influence
//! score used as a broadcast feature by the candidate generators.

use std::collections::{HashMap, HashSet};

use crate::catalog::Connection;

/// Directed adjacency over accepted connections.
#[derive(Debug, Default)]
pub struct SocialGraph {
    adjacency: HashMap<i64, HashSet<i64>>,
    influence: HashMap<i64, f64>,
}

impl SocialGraph {
    pub fn build(connections: &[Connection]) -> Self {
        let mut adjacency: HashMap<i64, HashSet<i64>> = HashMap::new();
        for connection in connections {
            adjacency
                .entry(connection.from_user_id)
                .or_default()
                .insert(connection.to_user_id);
        }

        let influence = adjacency
            .iter()
            .map(|(&user_id, neighbors)| {
                (user_id, (1.0 + neighbors.len() as f64).ln() / 10.0)
            })
            .collect();

        Self {
            adjacency,
            influence,
        }
    }

    /// Users directly connected from `user_id`.
    pub fn neighborhood(&self, user_id: i64) -> Option<&HashSet<i64>> {
        self.adjacency.get(&user_id)
    }

    /// log(1 + degree) / 10, or 0 for unknown users.
    pub fn influence(&self, user_id: i64) -> f64 {
        self.influence.get(&user_id).copied().unwrap_or(0.0)
    }

    pub fn user_count(&self) -> usize {
        self.adjacency.len()
    }
}
