//! Localhost TCP port occupancy checks.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinSet;

/// Default connect timeout for a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Checks whether something accepts TCP connections on a local port.
#[derive(Debug, Clone, Copy)]
pub struct PortProbe {
    timeout: Duration,
}

impl Default for PortProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl PortProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Returns true only if a connection to `127.0.0.1:port` is established
    /// within the timeout. Refusals, errors and timeouts all read as closed.
    pub async fn is_open(&self, port: u16) -> bool {
        let addr = format!("127.0.0.1:{}", port);
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        )
    }

    /// Probes all `ports` concurrently and returns the open ones in the
    /// order they were given.
    pub async fn open_ports(&self, ports: &[u16]) -> Vec<u16> {
        let mut probes = JoinSet::new();
        for (index, &port) in ports.iter().enumerate() {
            let probe = *self;
            probes.spawn(async move { (index, port, probe.is_open(port).await) });
        }
        let mut open = Vec::new();
        while let Some(result) = probes.join_next().await {
            if let Ok((index, port, true)) = result {
                open.push((index, port));
            }
        }
        open.sort_unstable_by_key(|(index, _)| *index);
        open.into_iter().map(|(_, port)| port).collect()
    }

    pub async fn any_open(&self, ports: &[u16]) -> bool {
        !self.open_ports(ports).await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn listening_port_is_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(PortProbe::default().is_open(port).await);
    }

    #[tokio::test]
    async fn unbound_port_is_closed() {
        let port = closed_port().await;
        assert!(!PortProbe::default().is_open(port).await);
    }

    #[tokio::test]
    async fn open_ports_keeps_declared_order() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let a = first.local_addr().unwrap().port();
        let b = second.local_addr().unwrap().port();
        let closed = closed_port().await;

        let probe = PortProbe::default();
        assert_eq!(probe.open_ports(&[b, closed, a]).await, vec![b, a]);
        assert!(probe.any_open(&[closed, a]).await);
        assert!(!probe.any_open(&[closed]).await);
        assert!(!probe.any_open(&[]).await);
    }
}
