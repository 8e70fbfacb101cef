use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{Result, SchedulerError};
use crate::scheduler::registry::{DEFAULT_MAX_JOBS, MAX_JOB_ID};

/// TCP port the scheduler listens on when none is given.
pub const DEFAULT_PORT: u16 = 4337;

/// Well-known UDP port answered by the discovery responder.
pub const DISCOVERY_PORT: u16 = 31337;

/// Lowest TCP port an operator may choose.
pub const MIN_PORT: u16 = 1024;

pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Check an operator-supplied TCP port.
///
/// Privileged ports and the discovery port are refused.
pub fn validate_port(port: u16) -> Result<u16> {
    if port < MIN_PORT {
        return Err(SchedulerError::InvalidConfig(format!(
            "port {} is below {}",
            port, MIN_PORT
        )));
    }
    if port == DISCOVERY_PORT {
        return Err(SchedulerError::InvalidConfig(format!(
            "port {} is reserved for discovery",
            DISCOVERY_PORT
        )));
    }
    Ok(port)
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub listen_addr: SocketAddr,
    /// `None` disables the UDP discovery responder.
    pub discovery_addr: Option<SocketAddr>,
    pub max_jobs: usize,
    pub max_connections: usize,
    /// How long a completed job stays queryable before its slot may be reused.
    pub completed_job_retention: Duration,
    /// Grace period for open connections once shutdown begins.
    pub drain_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            discovery_addr: Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT))),
            max_jobs: DEFAULT_MAX_JOBS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            completed_job_retention: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_discovery(mut self, addr: Option<SocketAddr>) -> Self {
        self.discovery_addr = addr;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_completed_job_retention(mut self, retention: Duration) -> Self {
        self.completed_job_retention = retention;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        validate_port(self.listen_addr.port())?;
        if self.max_jobs == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_jobs must be at least 1".to_string(),
            ));
        }
        // every live job needs its own id
        if self.max_jobs > MAX_JOB_ID as usize {
            return Err(SchedulerError::InvalidConfig(format!(
                "max_jobs {} exceeds the {} available job ids",
                self.max_jobs, MAX_JOB_ID
            )));
        }
        if self.max_connections == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:4337");
        assert_eq!(cfg.discovery_addr.map(|a| a.port()), Some(31337));
        assert_eq!(cfg.max_jobs, 50);
        assert_eq!(cfg.max_connections, 100);
        assert_eq!(cfg.completed_job_retention, Duration::from_secs(300));
        assert_eq!(cfg.drain_timeout, Duration::from_secs(5));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn scheduler_config_builders() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let cfg = SchedulerConfig::new(addr)
            .with_discovery(None)
            .with_max_jobs(3)
            .with_max_connections(7)
            .with_completed_job_retention(Duration::from_secs(1))
            .with_drain_timeout(Duration::from_millis(10));
        assert_eq!(cfg.listen_addr, addr);
        assert!(cfg.discovery_addr.is_none());
        assert_eq!(cfg.max_jobs, 3);
        assert_eq!(cfg.max_connections, 7);
        assert_eq!(cfg.completed_job_retention, Duration::from_secs(1));
        assert_eq!(cfg.drain_timeout, Duration::from_millis(10));
    }

    #[test]
    fn port_range_is_enforced() {
        assert!(validate_port(1024).is_ok());
        assert!(validate_port(65535).is_ok());
        assert!(validate_port(4337).is_ok());
        assert!(matches!(
            validate_port(1023),
            Err(SchedulerError::InvalidConfig(_))
        ));
        assert!(validate_port(0).is_err());
        assert!(validate_port(DISCOVERY_PORT).is_err());
    }

    #[test]
    fn validate_rejects_bad_limits() {
        assert!(SchedulerConfig::default().with_max_jobs(0).validate().is_err());
        assert!(SchedulerConfig::default()
            .with_max_connections(0)
            .validate()
            .is_err());
        assert!(SchedulerConfig::default()
            .with_max_jobs(MAX_JOB_ID as usize)
            .validate()
            .is_ok());
        assert!(matches!(
            SchedulerConfig::default()
                .with_max_jobs(MAX_JOB_ID as usize + 1)
                .validate(),
            Err(SchedulerError::InvalidConfig(_))
        ));
        let reserved =
            SchedulerConfig::new(SocketAddr::from((Ipv4Addr::LOCALHOST, DISCOVERY_PORT)));
        assert!(reserved.validate().is_err());
    }
}
