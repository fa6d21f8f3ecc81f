use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

/// The flush role of an aggregator instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Writes flushed windows and publishes flush times.
    Leader,
    /// Discards windows the leader has written.
    Follower,
}

impl Role {
    /// Returns the name of the role, used as tag value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Leader => "leader",
            Self::Follower => "follower",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides which role an aggregator instance should take.
///
/// Implementations typically campaign for leadership in an external coordination service. The
/// flush manager polls the role before every flush.
pub trait ElectionManager: Send + Sync + fmt::Debug {
    /// Returns the role this instance was elected for.
    fn role(&self) -> Role;
}

/// An [`ElectionManager`] whose role is set explicitly.
#[derive(Debug)]
pub struct ManualElection {
    leader: AtomicBool,
}

impl ManualElection {
    /// Creates an election that starts with the given role.
    pub fn new(role: Role) -> Self {
        Self {
            leader: AtomicBool::new(role == Role::Leader),
        }
    }

    /// Changes the elected role.
    pub fn set_role(&self, role: Role) {
        self.leader.store(role == Role::Leader, Ordering::Relaxed);
    }
}

impl ElectionManager for ManualElection {
    fn role(&self) -> Role {
        if self.leader.load(Ordering::Relaxed) {
            Role::Leader
        } else {
            Role::Follower
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_election() {
        let election = ManualElection::new(Role::Follower);
        assert_eq!(election.role(), Role::Follower);

        election.set_role(Role::Leader);
        assert_eq!(election.role(), Role::Leader);
        assert_eq!(election.role().to_string(), "leader");
    }
}
