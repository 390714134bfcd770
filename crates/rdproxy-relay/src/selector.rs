//! Agent selection with bounded retry

use rand::seq::SliceRandom;
use rand::Rng;
use rdproxy_transport::{AgentId, AgentPool, TransportError};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How long to wait for an agent to show up before giving up on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Empty-pool observations tolerated before giving up
    pub max_attempts: u32,
    /// Fixed delay between observations
    pub delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);

    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ATTEMPTS, Self::DEFAULT_DELAY)
    }
}

/// Where a virtual connection should end up on the agent's side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTarget {
    pub protocol: String,
    pub address: String,
}

impl PeerTarget {
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            protocol: "tcp".to_string(),
            address: address.into(),
        }
    }
}

impl std::fmt::Display for PeerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)
    }
}

/// Reasons a selection attempt ends without a virtual connection
#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no agents available after {attempts} attempts")]
    NoAgents { attempts: u32 },

    #[error("dialing {target} through agent {agent} failed: {source}")]
    Dial {
        agent: AgentId,
        target: PeerTarget,
        #[source]
        source: TransportError,
    },

    #[error("shutdown requested while waiting for an agent")]
    Cancelled,
}

/// Pick one agent uniformly at random from a snapshot
///
/// Every call is independent: nothing is remembered between calls, so a
/// retry may land on the same agent again.
pub fn choose_agent<'a, R>(snapshot: &'a [AgentId], rng: &mut R) -> Option<&'a AgentId>
where
    R: Rng + ?Sized,
{
    snapshot.choose(rng)
}

/// Select a live agent and dial `target` through it
///
/// While the pool is empty the pool is polled again every `policy.delay`,
/// giving up once more than `policy.max_attempts` empty snapshots were seen.
/// The wait is abandoned as soon as `cancel` fires. A failed dial is final:
/// no other agent is tried for this connection.
pub async fn dial_any_agent<P>(
    pool: &P,
    target: &PeerTarget,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<(AgentId, P::Conn), SelectError>
where
    P: AgentPool + ?Sized,
{
    let mut retries = 0u32;

    loop {
        let snapshot = pool.list_agents();

        // The rng is not Send, keep it out of any await point.
        let chosen = choose_agent(&snapshot, &mut rand::thread_rng()).cloned();

        let Some(agent) = chosen else {
            retries += 1;
            if retries > policy.max_attempts {
                return Err(SelectError::NoAgents {
                    attempts: policy.max_attempts,
                });
            }

            info!(
                attempt = retries,
                max_attempts = policy.max_attempts,
                "No agents connected, retrying in {:?}",
                policy.delay
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(SelectError::Cancelled),
                _ = tokio::time::sleep(policy.delay) => {}
            }
            continue;
        };

        debug!(
            agent_id = %agent,
            pool_size = snapshot.len(),
            peer_target = %target,
            "Selected agent"
        );

        return match pool.dial(&agent, &target.protocol, &target.address).await {
            Ok(conn) => Ok((agent, conn)),
            Err(source) => Err(SelectError::Dial {
                agent,
                target: target.clone(),
                source,
            }),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    #[test]
    fn test_choose_agent_empty_snapshot() {
        let mut rng = StdRng::seed_from_u64(7);
        assert!(choose_agent(&[], &mut rng).is_none());
    }

    #[test]
    fn test_choose_agent_single() {
        let mut rng = StdRng::seed_from_u64(7);
        let snapshot = vec![AgentId::from("only")];
        for _ in 0..10 {
            assert_eq!(choose_agent(&snapshot, &mut rng), Some(&snapshot[0]));
        }
    }

    #[test]
    fn test_choose_agent_is_uniform() {
        let mut rng = StdRng::seed_from_u64(42);
        let snapshot: Vec<AgentId> = (0..4).map(|i| AgentId::new(format!("agent-{i}"))).collect();
        let trials = 40_000;

        let mut counts: HashMap<&AgentId, u32> = HashMap::new();
        for _ in 0..trials {
            let agent = choose_agent(&snapshot, &mut rng).unwrap();
            *counts.entry(agent).or_default() += 1;
        }

        let expected = trials as f64 / snapshot.len() as f64;
        for agent in &snapshot {
            let count = counts.get(agent).copied().unwrap_or(0) as f64;
            let deviation = (count - expected).abs() / expected;
            assert!(
                deviation < 0.05,
                "{} picked {} times, expected about {}",
                agent,
                count,
                expected
            );
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.delay, Duration::from_secs(1));
    }

    #[test]
    fn test_peer_target_display() {
        assert_eq!(
            PeerTarget::tcp("127.0.0.1:6666").to_string(),
            "tcp://127.0.0.1:6666"
        );
    }
}
