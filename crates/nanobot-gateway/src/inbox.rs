use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use nanobot_common::Envelope;
use tokio::sync::{OwnedMutexGuard, mpsc};

/// The agent runtime's inbox: ordered inbound envelopes waiting for the agent.
///
/// Only one agent can be attached at a time. Envelopes that were taken but
/// could not be handed over are put back and go out first on the next attach.
#[derive(Clone)]
pub struct AgentInbox {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
    returned: Arc<Mutex<VecDeque<Envelope>>>,
}

impl AgentInbox {
    /// Create the inbox and the sender the inbound router delivers into.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Envelope>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let inbox = Self {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            returned: Arc::new(Mutex::new(VecDeque::new())),
        };
        (tx, inbox)
    }

    /// Claim the inbox. `None` while another agent holds it.
    pub fn attach(&self) -> Option<InboxLease> {
        let rx = Arc::clone(&self.rx).try_lock_owned().ok()?;
        Some(InboxLease {
            rx,
            returned: Arc::clone(&self.returned),
        })
    }

    pub fn is_attached(&self) -> bool {
        self.rx.try_lock().is_err()
    }
}

/// Exclusive access to the inbox, released on drop.
pub struct InboxLease {
    rx: OwnedMutexGuard<mpsc::Receiver<Envelope>>,
    returned: Arc<Mutex<VecDeque<Envelope>>>,
}

impl InboxLease {
    /// Next envelope for the agent. `None` once the router has shut down.
    pub async fn recv(&mut self) -> Option<Envelope> {
        if let Some(envelope) = self.take_returned() {
            return Some(envelope);
        }
        self.rx.recv().await
    }

    /// Put back an envelope the agent never received.
    pub fn give_back(&self, envelope: Envelope) {
        let mut returned = match self.returned.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        returned.push_front(envelope);
    }

    fn take_returned(&self) -> Option<Envelope> {
        let mut returned = match self.returned.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        returned.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(sequence: u64) -> Envelope {
        Envelope::inbound("wa1".into(), "c1".into(), sequence, serde_json::json!({}))
    }

    #[tokio::test]
    async fn only_one_agent_can_attach() {
        let (_tx, inbox) = AgentInbox::channel(4);
        let lease = inbox.attach().expect("first attach");
        assert!(inbox.is_attached());
        assert!(inbox.attach().is_none());
        drop(lease);
        assert!(!inbox.is_attached());
        assert!(inbox.attach().is_some());
    }

    #[tokio::test]
    async fn returned_envelopes_are_redelivered_first() {
        let (tx, inbox) = AgentInbox::channel(4);
        tx.send(env(1)).await.unwrap();
        tx.send(env(2)).await.unwrap();

        let mut lease = inbox.attach().unwrap();
        let first = lease.recv().await.unwrap();
        lease.give_back(first);
        drop(lease);

        let mut lease = inbox.attach().unwrap();
        assert_eq!(lease.recv().await.unwrap().sequence, 1);
        assert_eq!(lease.recv().await.unwrap().sequence, 2);
    }
}
