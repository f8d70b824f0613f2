//! In-process transport over crossbeam channels.
//!
//! Every agent owns one unbounded receiving channel; all peers hold a sender
//! to it. Crossbeam channels are FIFO per sender, which is exactly the
//! ordering guarantee the port promises.

use crate::{AgentId, CommError, Envelope, Transport, Wire};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Builder for a fully connected in-process mesh.
pub struct Network;

impl Network {
    /// Creates one endpoint per agent name. The order of `names` is the agreed
    /// permutation: agent ids, baton rotation and broadcasts all follow it.
    pub fn in_process<M: Wire>(names: &[&str]) -> Vec<ChannelTransport<M>> {
        assert!(!names.is_empty(), "a network needs at least one agent");
        let names: Arc<Vec<String>> = Arc::new(names.iter().map(|s| s.to_string()).collect());
        let agents: Vec<AgentId> = (0..names.len()).map(AgentId::from).collect();

        let channels: Vec<(Sender<Envelope<M>>, Receiver<Envelope<M>>)> =
            names.iter().map(|_| crossbeam_channel::unbounded()).collect();
        let senders: Vec<Sender<Envelope<M>>> = channels.iter().map(|(s, _)| s.clone()).collect();

        channels
            .into_iter()
            .enumerate()
            .map(|(i, (_, incoming))| ChannelTransport {
                me: agents[i],
                agents: agents.clone(),
                names: names.clone(),
                senders: senders.clone(),
                incoming,
                stash: VecDeque::new(),
                baton: 0,
                timeout: None,
            })
            .collect()
    }
}

pub struct ChannelTransport<M> {
    me: AgentId,
    agents: Vec<AgentId>,
    names: Arc<Vec<String>>,
    senders: Vec<Sender<Envelope<M>>>,
    incoming: Receiver<Envelope<M>>,
    /// Messages pulled while looking for a specific sender or payload kind.
    stash: VecDeque<Envelope<M>>,
    /// Index into `agents` of the current baton holder.
    baton: usize,
    timeout: Option<Duration>,
}

impl<M: Wire> ChannelTransport<M> {
    fn pull(&mut self) -> Result<Envelope<M>, CommError> {
        match self.timeout {
            Some(t) => self.incoming.recv_timeout(t).map_err(|e| match e {
                RecvTimeoutError::Timeout => CommError::Timeout,
                RecvTimeoutError::Disconnected => CommError::Disconnected,
            }),
            None => self.incoming.recv().map_err(|_| CommError::Disconnected),
        }
    }
}

impl<M: Wire> Transport<M> for ChannelTransport<M> {
    fn this_agent(&self) -> AgentId {
        self.me
    }

    fn agents(&self) -> &[AgentId] {
        &self.agents
    }

    fn agent_name(&self, agent: AgentId) -> &str {
        &self.names[usize::from(agent)]
    }

    fn baton_agent(&self) -> AgentId {
        self.agents[self.baton]
    }

    fn pass_baton(&mut self) {
        self.baton = (self.baton + 1) % self.agents.len();
    }

    fn send(&mut self, to: AgentId, payload: M) -> Result<(), CommError> {
        let i: usize = to.into();
        let sender = self.senders.get(i).ok_or(CommError::UnknownAgent)?;
        sender
            .send(Envelope {
                sender: self.me,
                payload,
            })
            .map_err(|_| CommError::Disconnected)
    }

    fn broadcast(&mut self, payload: M) -> Result<(), CommError> {
        for to in self.others() {
            self.send(to, payload.clone())?;
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<Envelope<M>, CommError> {
        if let Some(env) = self.stash.pop_front() {
            return Ok(env);
        }
        self.pull()
    }

    fn recv_from(&mut self, from: AgentId) -> Result<M, CommError> {
        self.recv_matching(&mut |env| env.sender == from).map(|env| env.payload)
    }

    fn recv_matching(
        &mut self,
        pred: &mut dyn FnMut(&Envelope<M>) -> bool,
    ) -> Result<Envelope<M>, CommError> {
        if let Some(i) = self.stash.iter().position(|env| pred(env)) {
            return Ok(self.stash.remove(i).unwrap());
        }
        loop {
            let env = self.pull()?;
            if pred(&env) {
                return Ok(env);
            }
            self.stash.push_back(env);
        }
    }

    fn set_recv_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_per_pair_and_filtered_recv() {
        let mut net = Network::in_process::<u32>(&["a", "b", "c"]);
        let mut c = net.pop().unwrap();
        let mut b = net.pop().unwrap();
        let mut a = net.pop().unwrap();

        b.send(a.this_agent(), 1).unwrap();
        b.send(a.this_agent(), 2).unwrap();
        c.send(a.this_agent(), 9).unwrap();

        // Filtered receive skips b's messages without reordering them.
        let from_c = a.recv_matching(&mut |env| env.sender == c.this_agent()).unwrap();
        assert_eq!(from_c.payload, 9);
        assert_eq!(a.recv_from(b.this_agent()).unwrap(), 1);
        assert_eq!(a.recv_from(b.this_agent()).unwrap(), 2);
    }

    #[test]
    fn baton_rotates_in_agent_order() {
        let mut net = Network::in_process::<u32>(&["a", "b"]);
        let mut a = net.remove(0);
        assert!(a.is_baton());
        a.pass_baton();
        assert!(!a.is_baton());
        a.pass_baton();
        assert!(a.is_baton());
    }

    #[test]
    fn single_agent_broadcast_is_noop() {
        let mut net = Network::in_process::<u32>(&["solo"]);
        let mut solo = net.pop().unwrap();
        solo.broadcast(42).unwrap();
        assert!(solo.is_baton());
    }
}
