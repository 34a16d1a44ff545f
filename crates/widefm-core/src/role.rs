//! Process role discovery.
//!
//! The role is read from the `WIDEFM_ROLE` environment variable exactly once
//! at start-up and passed through construction contexts; nothing else in the
//! system queries the environment. An absent variable selects local mode, in
//! which a single process combines the scheduler, server and worker roles.

use crate::error::{CoreError, Result};

/// Environment variable naming this process's role.
pub const ROLE_ENV: &str = "WIDEFM_ROLE";

/// The role of a training process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Single-process mode combining all three roles.
    Local,
    /// The coordinating scheduler node.
    Scheduler,
    /// A parameter-server node.
    Server,
    /// A gradient-computing worker node.
    Worker,
}

impl Role {
    /// Reads the role from the environment.
    pub fn from_env() -> Result<Role> {
        match std::env::var(ROLE_ENV) {
            Err(_) => Ok(Role::Local),
            Ok(s) => s.parse(),
        }
    }

    /// True for the scheduler, or in local mode.
    pub fn is_scheduler(self) -> bool {
        matches!(self, Role::Local | Role::Scheduler)
    }

    /// True for a server, or in local mode.
    pub fn is_server(self) -> bool {
        matches!(self, Role::Local | Role::Server)
    }

    /// True for a worker, or in local mode.
    pub fn is_worker(self) -> bool {
        matches!(self, Role::Local | Role::Worker)
    }
}

impl std::str::FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Role> {
        match s {
            "scheduler" => Ok(Role::Scheduler),
            "server" => Ok(Role::Server),
            "worker" => Ok(Role::Worker),
            other => Err(CoreError::UnknownRole(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roles() {
        assert_eq!("scheduler".parse::<Role>().unwrap(), Role::Scheduler);
        assert_eq!("server".parse::<Role>().unwrap(), Role::Server);
        assert_eq!("worker".parse::<Role>().unwrap(), Role::Worker);
        assert!("driver".parse::<Role>().is_err());
    }

    #[test]
    fn test_local_combines_all() {
        assert!(Role::Local.is_scheduler());
        assert!(Role::Local.is_server());
        assert!(Role::Local.is_worker());
        assert!(!Role::Worker.is_scheduler());
    }
}
