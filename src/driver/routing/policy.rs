//! Server selection among the addresses of one role.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::driver::config::ServerAddress;

/// How to pick one address out of a role's list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingPolicy {
    /// Cycle through the addresses in order.
    #[default]
    RoundRobin,
    /// Pick the address with the fewest connections in use, position as
    /// tie-break.
    LeastUsed,
}

/// Stateful selector implementing a [`RoutingPolicy`].
pub struct ServerSelector {
    policy: RoutingPolicy,
    round_robin: AtomicUsize,
}

impl ServerSelector {
    /// Selector for `policy`.
    pub fn new(policy: RoutingPolicy) -> Self {
        Self {
            policy,
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Pick one address. `load` reports connections currently in use per
    /// address and is only consulted by [`RoutingPolicy::LeastUsed`].
    pub fn select<'a, F>(&self, servers: &'a [ServerAddress], load: F) -> Option<&'a ServerAddress>
    where
        F: Fn(&ServerAddress) -> usize,
    {
        if servers.is_empty() {
            return None;
        }

        match self.policy {
            RoutingPolicy::RoundRobin => {
                let index = self.round_robin.fetch_add(1, Ordering::Relaxed);
                Some(&servers[index % servers.len()])
            }
            RoutingPolicy::LeastUsed => servers.iter().min_by_key(|s| load(s)),
        }
    }

    /// The active policy.
    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }
}

impl Default for ServerSelector {
    fn default() -> Self {
        Self::new(RoutingPolicy::RoundRobin)
    }
}

impl std::fmt::Debug for ServerSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSelector")
            .field("policy", &self.policy)
            .finish()
    }
}
