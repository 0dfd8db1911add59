//! Endpoint discovery.
//!
//! The manager asks an [`EndpointDiscoverer`] where to connect every time it establishes
//! a physical connection. Discoverers also remember the redirect target a node hands out
//! when it is not the leader.
use std::{
    fmt,
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use log::{debug, info};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("invalid endpoint '{0}', expected host:port")]
    InvalidEndpoint(String),

    #[error("could not resolve '{0}'")]
    Unresolvable(String),

    #[error("no endpoints configured")]
    NoEndpoints,
}

/// A host and port, resolved to socket addresses only when connecting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn resolve(&self) -> Result<Vec<SocketAddr>, DiscoveryError> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| DiscoveryError::Unresolvable(self.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(DiscoveryError::Unresolvable(self.to_string()));
        }
        Ok(addrs)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(value: SocketAddr) -> Self {
        Self::new(value.ip().to_string(), value.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| DiscoveryError::InvalidEndpoint(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| DiscoveryError::InvalidEndpoint(s.to_string()))?;
        if host.is_empty() {
            return Err(DiscoveryError::InvalidEndpoint(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

/// Decides which node the next physical connection goes to.
pub trait EndpointDiscoverer: Send {
    /// `failed` is the endpoint the previous attempt or connection used, if it failed.
    fn resolve(&mut self, failed: Option<&Endpoint>) -> Result<Endpoint, DiscoveryError>;

    /// A node reported that `endpoint` is the current leader.
    fn redirect(&mut self, endpoint: Endpoint);
}

/// Always connects to one node, unless redirected.
#[derive(Debug, Clone)]
pub struct StaticEndpointDiscoverer {
    endpoint: Endpoint,
    redirected: Option<Endpoint>,
}

impl StaticEndpointDiscoverer {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            redirected: None,
        }
    }
}

impl EndpointDiscoverer for StaticEndpointDiscoverer {
    fn resolve(&mut self, failed: Option<&Endpoint>) -> Result<Endpoint, DiscoveryError> {
        if failed.is_some() && failed == self.redirected.as_ref() {
            debug!("redirect target {failed:?} failed, falling back to {}", self.endpoint);
            self.redirected = None;
        }
        Ok(self.redirected.clone().unwrap_or_else(|| self.endpoint.clone()))
    }

    fn redirect(&mut self, endpoint: Endpoint) {
        info!("redirecting to leader at {endpoint}");
        self.redirected = Some(endpoint);
    }
}

/// Rotates through a fixed list of seed nodes, moving on whenever the current one fails.
#[derive(Debug, Clone)]
pub struct SeedListDiscoverer {
    seeds: Vec<Endpoint>,
    next: usize,
    redirected: Option<Endpoint>,
}

impl SeedListDiscoverer {
    pub fn new(seeds: Vec<Endpoint>) -> Self {
        Self {
            seeds,
            next: 0,
            redirected: None,
        }
    }
}

impl EndpointDiscoverer for SeedListDiscoverer {
    fn resolve(&mut self, failed: Option<&Endpoint>) -> Result<Endpoint, DiscoveryError> {
        if self.seeds.is_empty() {
            return Err(DiscoveryError::NoEndpoints);
        }

        if let Some(redirected) = self.redirected.take() {
            if failed != Some(&redirected) {
                self.redirected = Some(redirected.clone());
                return Ok(redirected);
            }
        }

        if failed.is_some_and(|f| *f == self.seeds[self.next]) {
            self.next = (self.next + 1) % self.seeds.len();
        }
        Ok(self.seeds[self.next].clone())
    }

    fn redirect(&mut self, endpoint: Endpoint) {
        info!("redirecting to leader at {endpoint}");
        self.redirected = Some(endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_from_string() {
        let inputs = vec![
            ("node2:1113", Ok(Endpoint::new("node2", 1113))),
            ("127.0.0.1:2113", Ok(Endpoint::new("127.0.0.1", 2113))),
            ("node2", Err(DiscoveryError::InvalidEndpoint("node2".into()))),
            (":1113", Err(DiscoveryError::InvalidEndpoint(":1113".into()))),
            ("node2:http", Err(DiscoveryError::InvalidEndpoint("node2:http".into()))),
        ];

        for (input, expected) in inputs {
            assert_eq!(input.parse::<Endpoint>(), expected);
        }
    }

    #[test]
    fn static_discoverer_follows_redirect() {
        let mut discoverer = StaticEndpointDiscoverer::new(Endpoint::new("node1", 1113));
        assert_eq!(discoverer.resolve(None).unwrap(), Endpoint::new("node1", 1113));

        discoverer.redirect(Endpoint::new("node2", 1113));
        let node1 = Endpoint::new("node1", 1113);
        assert_eq!(
            discoverer.resolve(Some(&node1)).unwrap(),
            Endpoint::new("node2", 1113)
        );
    }

    #[test]
    fn static_discoverer_forgets_failed_redirect() {
        let mut discoverer = StaticEndpointDiscoverer::new(Endpoint::new("node1", 1113));
        let node2 = Endpoint::new("node2", 1113);
        discoverer.redirect(node2.clone());

        assert_eq!(
            discoverer.resolve(Some(&node2)).unwrap(),
            Endpoint::new("node1", 1113)
        );
    }

    #[test]
    fn seed_list_rotates_on_failure() {
        let seeds = vec![
            Endpoint::new("a", 1),
            Endpoint::new("b", 2),
            Endpoint::new("c", 3),
        ];
        let mut discoverer = SeedListDiscoverer::new(seeds.clone());

        assert_eq!(discoverer.resolve(None).unwrap(), seeds[0]);
        assert_eq!(discoverer.resolve(Some(&seeds[0])).unwrap(), seeds[1]);
        assert_eq!(discoverer.resolve(Some(&seeds[1])).unwrap(), seeds[2]);
        assert_eq!(discoverer.resolve(Some(&seeds[2])).unwrap(), seeds[0]);
        // A failure elsewhere does not move the cursor.
        assert_eq!(discoverer.resolve(Some(&seeds[2])).unwrap(), seeds[0]);
    }

    #[test]
    fn seed_list_prefers_redirect_until_it_fails() {
        let seeds = vec![Endpoint::new("a", 1), Endpoint::new("b", 2)];
        let mut discoverer = SeedListDiscoverer::new(seeds.clone());
        let leader = Endpoint::new("leader", 1113);

        discoverer.redirect(leader.clone());
        assert_eq!(discoverer.resolve(Some(&seeds[0])).unwrap(), leader);
        assert_eq!(discoverer.resolve(None).unwrap(), leader);
        assert_eq!(discoverer.resolve(Some(&leader)).unwrap(), seeds[0]);
    }

    #[test]
    fn empty_seed_list_fails() {
        let mut discoverer = SeedListDiscoverer::new(vec![]);
        assert_eq!(discoverer.resolve(None), Err(DiscoveryError::NoEndpoints));
    }
}
