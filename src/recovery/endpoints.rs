//! Candidate endpoint selection for connect attempts.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::config::EndpointSelection;
use crate::domain::Endpoint;
use crate::error::{Error, Result};

/// Strategy choosing which endpoint index to try next.
pub trait EndpointSelector: Send + Sync {
    fn select(&self, count: usize) -> usize;
}

/// Walks the endpoint list in order, wrapping around.
#[derive(Default)]
pub struct RoundRobinSelector {
    cursor: AtomicUsize,
}

impl EndpointSelector for RoundRobinSelector {
    fn select(&self, count: usize) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % count
    }
}

/// Picks a uniformly random endpoint per attempt.
pub struct RandomSelector;

impl EndpointSelector for RandomSelector {
    fn select(&self, count: usize) -> usize {
        rand::thread_rng().gen_range(0..count)
    }
}

/// Immutable endpoint list plus a pluggable selection strategy.
pub struct EndpointCycler {
    endpoints: Vec<Endpoint>,
    selector: Box<dyn EndpointSelector>,
}

impl EndpointCycler {
    /// # Errors
    ///
    /// Returns [`Error::NoEndpoints`] for an empty list.
    pub fn new(endpoints: Vec<Endpoint>, selector: Box<dyn EndpointSelector>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::NoEndpoints);
        }
        Ok(Self {
            endpoints,
            selector,
        })
    }

    /// Build a cycler from a configured built-in strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoEndpoints`] for an empty list.
    pub fn from_selection(endpoints: Vec<Endpoint>, selection: EndpointSelection) -> Result<Self> {
        let selector: Box<dyn EndpointSelector> = match selection {
            EndpointSelection::RoundRobin => Box::new(RoundRobinSelector::default()),
            EndpointSelection::Random => Box::new(RandomSelector),
        };
        Self::new(endpoints, selector)
    }

    /// The endpoint the selector picks for this attempt.
    pub fn next(&self) -> Endpoint {
        let index = self.selector.select(self.endpoints.len()) % self.endpoints.len();
        self.endpoints[index].clone()
    }

    /// Pick one endpoint and run `connect` against it.
    ///
    /// # Errors
    ///
    /// Construction failures propagate so the caller can schedule the next
    /// attempt against another candidate.
    pub async fn select_one<T, F, Fut>(&self, connect: F) -> Result<T>
    where
        F: FnOnce(Endpoint) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        connect(self.next()).await
    }

    #[must_use]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<Endpoint> {
        vec![
            Endpoint::new("a", 5672),
            Endpoint::new("b", 5672),
            Endpoint::new("c", 5672),
        ]
    }

    #[test]
    fn empty_list_is_rejected() {
        assert!(matches!(
            EndpointCycler::from_selection(Vec::new(), EndpointSelection::RoundRobin),
            Err(Error::NoEndpoints)
        ));
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let cycler =
            EndpointCycler::from_selection(endpoints(), EndpointSelection::RoundRobin).unwrap();
        let hosts: Vec<String> = (0..6).map(|_| cycler.next().host().to_string()).collect();
        assert_eq!(hosts, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn random_selection_stays_in_range() {
        let cycler = EndpointCycler::from_selection(endpoints(), EndpointSelection::Random).unwrap();
        for _ in 0..50 {
            let ep = cycler.next();
            assert!(["a", "b", "c"].contains(&ep.host()));
        }
    }

    #[tokio::test]
    async fn select_one_propagates_connect_errors() {
        let cycler =
            EndpointCycler::from_selection(endpoints(), EndpointSelection::RoundRobin).unwrap();
        let result: Result<()> = cycler
            .select_one(|ep| async move { Err(Error::transport(format!("refused by {ep}"))) })
            .await;
        assert!(matches!(result, Err(Error::Transport { .. })));
    }

    #[tokio::test]
    async fn select_one_returns_connect_value() {
        let cycler =
            EndpointCycler::from_selection(endpoints(), EndpointSelection::RoundRobin).unwrap();
        let host = cycler
            .select_one(|ep| async move { Ok(ep.host().to_string()) })
            .await
            .unwrap();
        assert_eq!(host, "a");
    }
}
