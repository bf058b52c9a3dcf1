//! Link registry
//!
//! Four views over the live connections: `links` (locally initiated, keyed
//! by peer url), `remote_links` (accepted, keyed by peer url once learned),
//! `all_remote_links` (every accepted connection), and `http_remote_links`
//! (accepted connections classified as HTTP, eligible for idle recycling).
//! `linkers` holds the per-connection subscribers that receive an exit
//! notification when the connection dies.
//!
//! The registry is plain data behind the transport's single mutex. Closing
//! returns the removed entry plus the exit notifications to deliver; the
//! caller aborts I/O tasks and emits the exits after dropping the lock.

use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::aid::Aid;
use crate::net::conn::{ConnId, ConnStat, Connection, LinkPriority};

/// One exit notification: `from` is the dead peer, `to` the subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExitNotice {
    pub from: Aid,
    pub to: Aid,
}

/// A subscriber on a connection, registered through `link`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Linker {
    pub from: Aid,
    pub to: Aid,
}

/// A closed connection: the detached entry and the exits it owes.
pub(crate) struct ClosedConn {
    pub entry: Connection,
    pub exits: Vec<ExitNotice>,
}

pub(crate) struct LinkRegistry {
    double_link: bool,
    conns: HashMap<ConnId, Connection>,
    links: HashMap<String, ConnId>,
    remote_links: HashMap<String, ConnId>,
    all_remote_links: HashSet<ConnId>,
    http_remote_links: HashSet<ConnId>,
    linkers: HashMap<ConnId, Vec<Linker>>,
}

impl LinkRegistry {
    pub fn new(double_link: bool) -> Self {
        Self {
            double_link,
            conns: HashMap::new(),
            links: HashMap::new(),
            remote_links: HashMap::new(),
            all_remote_links: HashSet::new(),
            http_remote_links: HashSet::new(),
            linkers: HashMap::new(),
        }
    }

    pub fn conn(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    pub fn conn_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    /// Looks a link up by peer url.
    ///
    /// `exact_not_remote` restricts the search to locally initiated links;
    /// otherwise `remote_preferred` decides which map is consulted first.
    pub fn find_link(&self, to: &str, remote_preferred: bool, exact_not_remote: bool) -> Option<ConnId> {
        if exact_not_remote {
            return self.links.get(to).copied();
        }
        if remote_preferred {
            self.remote_links.get(to).or_else(|| self.links.get(to)).copied()
        } else {
            self.links.get(to).or_else(|| self.remote_links.get(to)).copied()
        }
    }

    pub fn exact_find(&self, to: &str, remote: bool) -> Option<ConnId> {
        let map = if remote { &self.remote_links } else { &self.links };
        map.get(to).copied()
    }

    /// Publishes a connection under its peer url, closing any predecessor
    /// registered under the same `(to, is_remote)` key.
    pub fn add_link(&mut self, entry: Connection) -> Option<ClosedConn> {
        let closed = self
            .exact_find(&entry.to, entry.is_remote)
            .filter(|old| *old != entry.id)
            .and_then(|old| self.close_connection(old));
        if let Some(ClosedConn { entry: old, .. }) = &closed {
            info!(conn = %old.id, to = %old.to, "evicted link with same key");
        }
        let map = if entry.is_remote {
            &mut self.remote_links
        } else {
            &mut self.links
        };
        map.insert(entry.to.clone(), entry.id);
        self.conns.insert(entry.id, entry);
        closed
    }

    /// Registers a freshly accepted connection; its peer url is unknown
    /// until the first message arrives.
    pub fn add_accepted(&mut self, entry: Connection) {
        self.all_remote_links.insert(entry.id);
        self.conns.insert(entry.id, entry);
    }

    /// First message on an accepted connection revealed the peer url:
    /// demote any local link to that peer and publish the accepted one.
    pub fn bind_remote_url(&mut self, id: ConnId, to_url: &str) -> Option<ClosedConn> {
        self.set_link_priority(to_url, false, LinkPriority::Low);
        let closed = self
            .exact_find(to_url, true)
            .filter(|old| *old != id)
            .and_then(|old| self.close_connection(old));
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.to = to_url.to_string();
            conn.state = crate::net::conn::ConnState::Connected;
        }
        self.remote_links.insert(to_url.to_string(), id);
        closed
    }

    pub fn remote_link_count(&self) -> usize {
        self.all_remote_links.len()
    }

    pub fn add_http_remote(&mut self, id: ConnId) {
        self.http_remote_links.insert(id);
    }

    pub fn remove_http_remote(&mut self, id: ConnId) {
        self.http_remote_links.remove(&id);
    }

    pub fn http_remote_ids(&self) -> Vec<ConnId> {
        self.http_remote_links.iter().copied().collect()
    }

    pub fn set_link_priority(&mut self, to: &str, remote: bool, priority: LinkPriority) {
        if let Some(id) = self.exact_find(to, remote) {
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.priority = priority;
            }
        }
    }

    /// Records a subscriber on a connection; duplicates are ignored.
    pub fn add_linker(&mut self, id: ConnId, from: Aid, to: Aid) {
        let linkers = self.linkers.entry(id).or_default();
        let linker = Linker { from, to };
        if !linkers.contains(&linker) {
            debug!(conn = %id, "add linker");
            linkers.push(linker);
        }
    }

    pub fn linker_count(&self, id: ConnId) -> usize {
        self.linkers.get(&id).map(Vec::len).unwrap_or(0)
    }

    /// Moves every subscriber from one connection to another; used by
    /// reconnect so subscribers survive the socket swap.
    pub fn swap_linkers(&mut self, from_id: ConnId, to_id: ConnId) -> bool {
        match self.linkers.remove(&from_id) {
            Some(linkers) => {
                self.linkers.insert(to_id, linkers);
                true
            }
            None => false,
        }
    }

    /// Drains a connection's subscribers into exit notices without touching
    /// the rest of the registry. Reconnect uses this when the replacement
    /// connection cannot even be created.
    pub fn take_linker_exits(&mut self, id: ConnId) -> Vec<ExitNotice> {
        let mut exits = Vec::new();
        self.drain_linkers_into(id, &mut exits);
        exits
    }

    /// Tears a connection down. Ordering mirrors the close contract:
    /// synthesize exits first (unless already exited), then unregister from
    /// every view, then hand the entry back for I/O teardown.
    pub fn close_connection(&mut self, id: ConnId) -> Option<ClosedConn> {
        let (to, is_remote, is_exited) = {
            let conn = self.conns.get(&id)?;
            (conn.to.clone(), conn.is_remote, conn.is_exited)
        };
        let mut exits = Vec::new();
        if !is_exited {
            self.delete_linker(&to, id, &mut exits);
        }
        let mut entry = self.conns.remove(&id)?;
        entry.is_exited = true;
        self.all_remote_links.remove(&id);
        self.http_remote_links.remove(&id);
        if !to.is_empty() {
            let map = if is_remote {
                &mut self.remote_links
            } else {
                &mut self.links
            };
            if map.get(&to) == Some(&id) {
                map.remove(&to);
            }
        }
        self.linkers.remove(&id);
        debug!(conn = %id, %to, is_remote, exits = exits.len(), "close connection");
        Some(ClosedConn { entry, exits })
    }

    /// Detaches a connection without notifying its subscribers; the caller
    /// is about to swap them onto a replacement.
    pub fn remove_preserving_linkers(&mut self, id: ConnId) -> Option<Connection> {
        let entry = self.conns.remove(&id)?;
        self.all_remote_links.remove(&id);
        self.http_remote_links.remove(&id);
        if !entry.to.is_empty() {
            let map = if entry.is_remote {
                &mut self.remote_links
            } else {
                &mut self.links
            };
            if map.get(&entry.to) == Some(&id) {
                map.remove(&entry.to);
            }
        }
        Some(entry)
    }

    /// In double-link mode the exit binds to the dying connection alone. In
    /// single-link mode local and accepted links to the peer are one logical
    /// link: both sides are marked exited (suppressing re-entry) and both
    /// subscriber sets fire.
    fn delete_linker(&mut self, to: &str, closing: ConnId, exits: &mut Vec<ExitNotice>) {
        if self.double_link {
            self.drain_linkers_into(closing, exits);
            return;
        }
        for remote in [false, true] {
            if let Some(id) = self.exact_find(to, remote) {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.is_exited = true;
                }
                if id != closing {
                    debug!(conn = %id, closing = %closing, "exit bound to twin link");
                }
                self.drain_linkers_into(id, exits);
            }
        }
    }

    fn drain_linkers_into(&mut self, id: ConnId, exits: &mut Vec<ExitNotice>) {
        for linker in self.linkers.remove(&id).unwrap_or_default() {
            exits.push(ExitNotice {
                from: linker.to,
                to: linker.from,
            });
        }
    }

    /// Connection with the highest send count since the last refresh.
    pub fn find_max_link(&self) -> Option<ConnId> {
        self.url_mapped_ids()
            .filter(|id| {
                self.conns
                    .get(id)
                    .map(|c| c.shared.metrics.send_sum() > 0)
                    .unwrap_or(false)
            })
            .max_by_key(|id| self.conns[id].shared.metrics.send_sum())
    }

    /// Connection with the largest single send since the last refresh.
    pub fn find_fast_link(&self) -> Option<ConnId> {
        self.url_mapped_ids()
            .filter(|id| {
                self.conns
                    .get(id)
                    .map(|c| c.shared.metrics.send_max_size() > 0)
                    .unwrap_or(false)
            })
            .max_by_key(|id| self.conns[id].shared.metrics.send_max_size())
    }

    pub fn refresh_metrics(&self) {
        for id in self.url_mapped_ids() {
            if let Some(conn) = self.conns.get(&id) {
                conn.shared.metrics.refresh();
            }
        }
    }

    fn url_mapped_ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.links
            .values()
            .chain(self.remote_links.values())
            .copied()
    }

    pub fn stats(&self) -> Vec<ConnStat> {
        let mut stats: Vec<ConnStat> = self
            .conns
            .values()
            .map(|conn| ConnStat {
                id: conn.id.0,
                to: conn.to.clone(),
                peer: conn.peer,
                is_remote: conn.is_remote,
                kind: conn.kind,
                state: conn.state,
                protocol: conn.shared.protocol(),
                queued: conn.queued(),
                send_sum: conn.shared.metrics.send_sum(),
                send_max_size: conn.shared.metrics.send_max_size(),
            })
            .collect();
        stats.sort_by_key(|stat| stat.id);
        stats
    }

    /// Final teardown: every entry detached, no exits synthesized.
    pub fn drain_all(&mut self) -> Vec<Connection> {
        self.links.clear();
        self.remote_links.clear();
        self.all_remote_links.clear();
        self.http_remote_links.clear();
        self.linkers.clear();
        self.conns.drain().map(|(_, conn)| conn).collect()
    }
}
