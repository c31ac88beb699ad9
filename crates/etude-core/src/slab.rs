// src/slab.rs
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use crate::conn::Connection;

pub type ConnHandle = Arc<Mutex<Connection>>;

#[derive(Default)]
struct Slot {
    generation: u64,
    conn: Option<ConnHandle>,
}

/// Live connections indexed directly by file descriptor.
///
/// Descriptors are reused by the kernel, so every insert stamps the slot with
/// a fresh generation. Anything that outlives the reactor's borrow (timer
/// callbacks, queued tasks) carries `(fd, generation)` and is ignored once
/// the slot has moved on.
pub struct ConnectionTable {
    slots: Vec<Slot>,
    active: usize,
    next_generation: u64,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::default);
        Self {
            slots,
            active: 0,
            next_generation: 1,
        }
    }

    /// Store `conn` under `fd`, replacing whatever a previous owner of the
    /// descriptor left behind. Returns the new generation.
    pub fn insert(&mut self, fd: RawFd, conn: ConnHandle) -> u64 {
        let idx = fd as usize;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, Slot::default);
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let slot = &mut self.slots[idx];
        if slot.conn.is_none() {
            self.active += 1;
        }
        slot.generation = generation;
        slot.conn = Some(conn);
        generation
    }

    /// Current occupant of `fd` with its generation.
    pub fn get(&self, fd: RawFd) -> Option<(u64, ConnHandle)> {
        let slot = self.slots.get(fd as usize)?;
        slot.conn.as_ref().map(|c| (slot.generation, Arc::clone(c)))
    }

    /// The occupant of `fd`, only if it is still the one stamped `generation`.
    pub fn get_if(&self, fd: RawFd, generation: u64) -> Option<ConnHandle> {
        match self.slots.get(fd as usize) {
            Some(slot) if slot.generation == generation => slot.conn.clone(),
            _ => None,
        }
    }

    pub fn remove(&mut self, fd: RawFd, generation: u64) -> Option<ConnHandle> {
        let slot = self.slots.get_mut(fd as usize)?;
        if slot.generation != generation {
            return None;
        }
        let conn = slot.conn.take();
        if conn.is_some() {
            self.active -= 1;
        }
        conn
    }

    /// Empty every slot, handing back the connections.
    pub fn drain(&mut self) -> Vec<ConnHandle> {
        self.active = 0;
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.conn.take())
            .collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.active
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;

    fn conn() -> (ConnHandle, RawFd, UnixStream) {
        let (ours, peer) = UnixStream::pair().unwrap();
        let fd = ours.into_raw_fd();
        let conn = Connection::new(
            fd,
            "127.0.0.1:1".parse().unwrap(),
            Arc::new(ServerConfig::default()),
            Arc::new(AtomicUsize::new(0)),
        );
        (Arc::new(Mutex::new(conn)), fd, peer)
    }

    #[test]
    fn test_table_operations() {
        let mut table = ConnectionTable::new(4);
        assert!(table.is_empty());

        let (a, fd, _peer) = conn();
        let first = table.insert(fd, a);
        assert_eq!(table.len(), 1);
        assert!(table.get_if(fd, first).is_some());

        // descriptor reused by a new client
        let (b, _, _peer_b) = conn();
        let second = table.insert(fd, b);
        assert_ne!(first, second);
        assert_eq!(table.len(), 1);
        assert!(table.get_if(fd, first).is_none());
        assert_eq!(table.get(fd).map(|(g, _)| g), Some(second));

        assert!(table.remove(fd, first).is_none());
        assert!(table.remove(fd, second).is_some());
        assert!(table.is_empty());
        assert!(table.get(fd).is_none());
    }

    #[test]
    fn test_grows_past_capacity() {
        let mut table = ConnectionTable::new(0);
        let (a, fd, _peer) = conn();
        table.insert(fd, a);
        assert!(table.get(fd).is_some());
        assert_eq!(table.drain().len(), 1);
        assert!(table.is_empty());
    }
}
