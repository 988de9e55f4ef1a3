//! Port allocation policies.

use std::collections::VecDeque;
use std::net::TcpListener;

use crate::{Error, Result};

/// Default first port for servers.
pub const DEFAULT_SERVER_PORT: u16 = 6379;

/// Default first port for sentinels.
pub const DEFAULT_SENTINEL_PORT: u16 = 26379;

/// Hands out TCP ports for instances as a topology is built.
#[derive(Debug, Clone)]
pub enum PortAllocator {
    /// Ask the OS for a free port each time.
    Ephemeral,

    /// Count upwards from a starting port.
    Sequential { next: u16 },

    /// Use a fixed list, in order.
    Predefined(VecDeque<u16>),
}

impl PortAllocator {
    /// Counts upwards from `start`.
    pub fn sequential(start: u16) -> Self {
        Self::Sequential { next: start }
    }

    /// Uses exactly these ports, in order.
    pub fn predefined(ports: impl IntoIterator<Item = u16>) -> Self {
        Self::Predefined(ports.into_iter().collect())
    }

    /// Returns the next port.
    pub fn next_port(&mut self) -> Result<u16> {
        match self {
            Self::Ephemeral => {
                // Bind and immediately release; the port stays free until
                // the instance claims it, which is racy but adequate for tests.
                let listener = TcpListener::bind(("127.0.0.1", 0))?;
                Ok(listener.local_addr()?.port())
            }
            Self::Sequential { next } => {
                let port = *next;
                *next = next.checked_add(1).ok_or(Error::PortsExhausted)?;
                Ok(port)
            }
            Self::Predefined(ports) => ports.pop_front().ok_or(Error::PortsExhausted),
        }
    }

    /// Takes `count` ports.
    pub fn take(&mut self, count: usize) -> Result<Vec<u16>> {
        (0..count).map(|_| self.next_port()).collect()
    }

    /// Number of ports left, if the policy is bounded.
    pub fn remaining(&self) -> Option<usize> {
        match self {
            Self::Predefined(ports) => Some(ports.len()),
            _ => None,
        }
    }
}

/// Formats ports as `localhost:<port>` host strings for client libraries.
pub fn host_strings(ports: &[u16]) -> Vec<String> {
    ports.iter().map(|p| format!("localhost:{p}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn sequential_counts_up() {
        let mut ports = PortAllocator::sequential(6379);
        assert_eq!(ports.take(3).unwrap(), vec![6379, 6380, 6381]);
        assert_eq!(ports.remaining(), None);
    }

    #[test]
    fn sequential_stops_at_top_of_range() {
        let mut ports = PortAllocator::sequential(u16::MAX);
        assert!(matches!(ports.next_port(), Err(Error::PortsExhausted)));
    }

    #[test]
    fn predefined_hands_out_in_order_then_fails() {
        let mut ports = PortAllocator::predefined([3000, 3001, 3002]);
        assert_eq!(ports.remaining(), Some(3));
        assert_eq!(ports.take(3).unwrap(), vec![3000, 3001, 3002]);

        let err = ports.next_port().unwrap_err();
        assert!(matches!(err, Error::PortsExhausted));
        assert_eq!(err.to_string(), "Run out of Redis ports!");
    }

    #[test]
    fn ephemeral_ports_are_usable() {
        let mut ports = PortAllocator::Ephemeral;
        let taken: HashSet<u16> = ports.take(5).unwrap().into_iter().collect();
        assert!(!taken.is_empty());
        for port in taken {
            assert!(port > 0);
            // Released on return, so it can be bound again.
            TcpListener::bind(("127.0.0.1", port)).unwrap();
        }
    }

    #[test]
    fn host_strings_format() {
        assert_eq!(
            host_strings(&[6379, 6380]),
            vec!["localhost:6379".to_string(), "localhost:6380".to_string()]
        );
    }
}
