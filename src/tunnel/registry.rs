//! The tunnel table.
//!
//! [`TunnelRegistry`] is plain data: it has no lock of its own. The
//! [`super::TunnelSupervisor`] owns the only instance behind a single
//! `tokio::sync::Mutex`, and every read-modify-write goes through that lock.

use std::collections::HashMap;
use std::io;
use std::time::Instant;

use tokio::sync::watch;
use tracing::warn;

use super::process::{Liveness, TunnelProcess};
use super::{TunnelKey, TunnelState};
use crate::error::BrokerError;

/// Final result of one tunnel creation attempt: the local port, or why not.
pub type Outcome = Result<u16, BrokerError>;

/// One tunnel instance.
pub struct Tunnel {
    pub key: TunnelKey,
    pub vm_id: u32,
    /// Fixed at creation.
    pub local_port: u16,
    /// Registry-wide instance number; a re-created tunnel gets a new one.
    pub generation: u64,
    pub created_at: Instant,
    state: TunnelState,
    /// Attached right after spawn, while still `Starting`, so cleanup can
    /// reach it at any point of the lifecycle.
    process: Option<TunnelProcess>,
    /// Resolves once a `Starting` tunnel settles.
    outcome: watch::Receiver<Option<Outcome>>,
}

impl Tunnel {
    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Apply a state transition. Illegal transitions are refused and logged.
    pub fn transition(&mut self, next: TunnelState) -> bool {
        if self.state.can_become(next) {
            self.state = next;
            true
        } else {
            warn!(
                "Tunnel {} (gen {}): refused transition {} -> {}",
                self.key,
                self.generation,
                self.state.as_str(),
                next.as_str()
            );
            false
        }
    }

    /// Take ownership of a freshly spawned process.
    pub fn attach(&mut self, process: TunnelProcess) {
        self.process = Some(process);
    }

    /// Mark `Alive`. Only meaningful once a process is attached.
    pub fn promote(&mut self) -> bool {
        self.process.is_some() && self.transition(TunnelState::Alive)
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(TunnelProcess::pid)
    }

    /// Non-blocking liveness probe; an entry without a process is an error.
    pub fn liveness(&mut self) -> io::Result<Liveness> {
        match self.process.as_mut() {
            Some(process) => process.liveness(),
            None => Err(io::Error::other("no process attached")),
        }
    }

    /// Non-blocking liveness probe of the owned process.
    pub fn process_running(&mut self) -> bool {
        self.process.as_mut().is_some_and(TunnelProcess::is_running)
    }

    /// `Alive` and its process is still running.
    pub fn is_usable(&mut self) -> bool {
        self.state == TunnelState::Alive && self.process_running()
    }

    /// Mark `Dead` and hand back the process (if any) for teardown.
    pub fn retire(&mut self) -> Option<TunnelProcess> {
        if self.state != TunnelState::Dead {
            self.state = TunnelState::Dead;
        }
        self.process.take()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Outcome>> {
        self.outcome.clone()
    }
}

/// Mapping of [`TunnelKey`] to its current [`Tunnel`].
#[derive(Default)]
pub struct TunnelRegistry {
    entries: HashMap<TunnelKey, Tunnel>,
    next_generation: u64,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &TunnelKey) -> Option<&Tunnel> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &TunnelKey) -> Option<&mut Tunnel> {
        self.entries.get_mut(key)
    }

    /// The entry for `key`, only if it is the given instance.
    pub fn get_generation_mut(&mut self, key: &TunnelKey, generation: u64) -> Option<&mut Tunnel> {
        self.entries
            .get_mut(key)
            .filter(|t| t.generation == generation)
    }

    pub fn remove(&mut self, key: &TunnelKey) -> Option<Tunnel> {
        self.entries.remove(key)
    }

    /// Remove the entry for `key` only if it is the given instance.
    pub fn remove_generation(&mut self, key: &TunnelKey, generation: u64) -> Option<Tunnel> {
        if self.entries.get(key)?.generation == generation {
            self.entries.remove(key)
        } else {
            None
        }
    }

    /// Insert a `Starting` placeholder and return its generation plus the
    /// sender used to publish the creation outcome.
    ///
    /// The caller must already hold the registry lock and have checked that no
    /// usable entry exists for `key`.
    pub fn insert_placeholder(
        &mut self,
        key: TunnelKey,
        vm_id: u32,
        local_port: u16,
    ) -> (u64, watch::Sender<Option<Outcome>>) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let (tx, rx) = watch::channel(None);
        self.entries.insert(
            key.clone(),
            Tunnel {
                key,
                vm_id,
                local_port,
                generation,
                created_at: Instant::now(),
                state: TunnelState::Starting,
                process: None,
                outcome: rx,
            },
        );
        (generation, tx)
    }

    /// Another live entry that already forwards `local_port`, if any.
    pub fn port_holder(&self, local_port: u16, except: &TunnelKey) -> Option<TunnelKey> {
        self.entries
            .values()
            .find(|t| {
                &t.key != except && t.local_port == local_port && t.state != TunnelState::Dead
            })
            .map(|t| t.key.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tunnel> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Tunnel> {
        self.entries.values_mut()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Tunnel> + '_ {
        self.entries.drain().map(|(_, t)| t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(port: u16) -> TunnelKey {
        TunnelKey::new("10.0.0.5".into(), port)
    }

    #[test]
    fn test_placeholder_generations_increase() {
        let mut reg = TunnelRegistry::new();
        let (g1, _tx1) = reg.insert_placeholder(key(5901), 101, 15101);
        assert_eq!(reg.get(&key(5901)).unwrap().state(), TunnelState::Starting);

        reg.remove(&key(5901));
        let (g2, _tx2) = reg.insert_placeholder(key(5901), 101, 15101);
        assert!(g2 > g1);
        assert!(reg.remove_generation(&key(5901), g1).is_none());
        assert!(reg.remove_generation(&key(5901), g2).is_some());
        assert!(reg.iter().next().is_none());
    }

    #[test]
    fn test_port_holder_ignores_self() {
        let mut reg = TunnelRegistry::new();
        reg.insert_placeholder(key(5901), 101, 15101);
        assert_eq!(reg.port_holder(15101, &key(5901)), None);
        assert_eq!(reg.port_holder(15101, &key(5902)), Some(key(5901)));
        assert_eq!(reg.port_holder(15102, &key(5902)), None);
    }

    #[test]
    fn test_dead_is_terminal() {
        let mut reg = TunnelRegistry::new();
        let (generation, _tx) = reg.insert_placeholder(key(5901), 101, 15101);
        let tunnel = reg.get_generation_mut(&key(5901), generation).unwrap();
        assert!(tunnel.retire().is_none());
        assert_eq!(tunnel.state(), TunnelState::Dead);
        assert!(!tunnel.transition(TunnelState::Alive));
        assert!(!tunnel.promote());
        assert!(!tunnel.is_usable());
        assert!(tunnel.liveness().is_err());
        assert_eq!(reg.port_holder(15101, &key(5902)), None);
    }

    #[tokio::test]
    async fn test_outcome_fans_out() {
        let mut reg = TunnelRegistry::new();
        let (_, tx) = reg.insert_placeholder(key(5901), 101, 15101);
        let mut a = reg.get(&key(5901)).unwrap().subscribe();
        let mut b = reg.get(&key(5901)).unwrap().subscribe();
        tx.send(Some(Ok(15101))).unwrap();
        assert_eq!(a.wait_for(Option::is_some).await.unwrap().clone().unwrap().unwrap(), 15101);
        assert_eq!(b.wait_for(Option::is_some).await.unwrap().clone().unwrap().unwrap(), 15101);
    }
}
