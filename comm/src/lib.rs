//! Messaging port of the distributed planner.
//!
//! The search core talks to its peers exclusively through the [`Transport`]
//! abstraction: ordered point-to-point and broadcast delivery of tagged
//! values, plus bookkeeping for the *baton*, the token designating the one
//! agent allowed to drive the current synchronization phase. The only
//! ordering guarantee the core relies on is FIFO per sender/receiver pair;
//! delivery is reliable (every protocol message of the planner requires it,
//! so the trait does not model a best-effort mode).
//!
//! [`channel::Network`] provides the in-process implementation used by tests,
//! the demo binary and single-machine deployments. Process- or host-spanning
//! transports can implement the same trait without touching the core.

pub mod channel;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

concord_collections::ref_type!(AgentId);

/// Marker for payloads that can travel between agents. Everything is exchanged
/// by value; a transport may serialize but must never introspect the payload.
pub trait Wire: Clone + Send + Serialize + DeserializeOwned + 'static {}

impl<M> Wire for M where M: Clone + Send + Serialize + DeserializeOwned + 'static {}

/// A received payload together with its origin.
#[derive(Clone, Debug)]
pub struct Envelope<M> {
    pub sender: AgentId,
    pub payload: M,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    #[error("timed out waiting for a message")]
    Timeout,
    #[error("peer disconnected")]
    Disconnected,
    #[error("message addressed to unknown agent")]
    UnknownAgent,
}

/// Point-to-point + broadcast messaging with baton semantics.
///
/// The baton never moves on its own: every agent must call [`pass_baton`]
/// the same number of times per phase. This is a cooperative invariant of
/// the protocol above, not something the transport enforces.
///
/// [`pass_baton`]: Transport::pass_baton
pub trait Transport<M: Wire> {
    fn this_agent(&self) -> AgentId;

    /// All agents, in the fixed permutation agreed at start-up. Identical on
    /// every participant; the baton rotates along this order.
    fn agents(&self) -> &[AgentId];

    fn agent_name(&self, agent: AgentId) -> &str;

    fn num_agents(&self) -> usize {
        self.agents().len()
    }

    fn others(&self) -> Vec<AgentId> {
        let me = self.this_agent();
        self.agents().iter().copied().filter(|&a| a != me).collect()
    }

    /// True iff this agent currently holds the baton.
    fn is_baton(&self) -> bool {
        self.baton_agent() == self.this_agent()
    }

    fn baton_agent(&self) -> AgentId;

    /// Rotates the baton to the next agent in the agreed permutation.
    fn pass_baton(&mut self);

    /// Non-blocking send to a single recipient.
    fn send(&mut self, to: AgentId, payload: M) -> Result<(), CommError>;

    /// Non-blocking send to every other agent. A no-op on single-agent networks.
    fn broadcast(&mut self, payload: M) -> Result<(), CommError>;

    /// Blocks until any message arrives.
    fn recv(&mut self) -> Result<Envelope<M>, CommError>;

    /// Blocks until a message from `from` arrives; messages from other senders
    /// are stashed and handed out by later receives, preserving per-sender order.
    fn recv_from(&mut self, from: AgentId) -> Result<M, CommError>;

    /// Blocks until a message matching `pred` arrives, stashing everything else.
    fn recv_matching(&mut self, pred: &mut dyn FnMut(&Envelope<M>) -> bool)
        -> Result<Envelope<M>, CommError>;

    /// Upper bound on how long a blocking receive may wait. `None` blocks forever.
    fn set_recv_timeout(&mut self, timeout: Option<Duration>);
}
