use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::record::{Record, UserInfo};

/// Stable handle to a roster slot. A handle outlives its connection safely:
/// once the slot is reused the old handle simply stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    index: usize,
    generation: u64,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket open, no credentials yet.
    Connected,
    /// Credentials received, checks running.
    PendingValidation,
    /// Visible to broadcasts.
    Validated,
    Closed,
}

/// Write side of a live peer: the queue drained by its writer task and the
/// signal that stops its receive worker.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Record>,
    shutdown: Arc<Notify>,
}

impl Outbound {
    pub fn new(tx: mpsc::UnboundedSender<Record>, shutdown: Arc<Notify>) -> Self {
        Self { tx, shutdown }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Record>, Arc<Notify>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        (Self::new(tx, Arc::clone(&shutdown)), rx, shutdown)
    }
}

#[derive(Debug)]
pub struct Connection {
    state: SessionState,
    user: Option<UserInfo>,
    pending_removal: bool,
    addr: Option<SocketAddr>,
    outbound: Option<Outbound>,
}

impl Connection {
    pub fn remote(addr: Option<SocketAddr>, outbound: Outbound) -> Self {
        Self {
            state: SessionState::Connected,
            user: None,
            pending_removal: false,
            addr,
            outbound: Some(outbound),
        }
    }

    /// A member known only through roster sync; nothing can be sent to it.
    pub fn mirror(user: UserInfo) -> Self {
        Self {
            state: SessionState::Validated,
            user: Some(user),
            pending_removal: false,
            addr: None,
            outbound: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_validated(&self) -> bool {
        self.state == SessionState::Validated
    }

    pub fn user(&self) -> Option<&UserInfo> {
        self.user.as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.user.as_ref().map(|user| user.name.as_str())
    }

    pub fn peer_label(&self) -> String {
        peer_label(self.addr)
    }

    pub fn begin_validation(&mut self, user: UserInfo) {
        self.user = Some(user);
        self.state = SessionState::PendingValidation;
    }

    pub fn mark_validated(&mut self) {
        self.state = SessionState::Validated;
    }

    pub fn mark_for_removal(&mut self) {
        self.pending_removal = true;
    }

    /// Queue a record for the peer. Returns false if the peer is gone or is a
    /// mirror entry.
    pub fn send(&self, record: Record) -> bool {
        self.outbound
            .as_ref()
            .is_some_and(|out| out.tx.send(record).is_ok())
    }

    // Dropping the sender lets the writer flush what is queued and then shut
    // the socket; the notify stops the receive worker.
    fn close(&mut self) {
        self.state = SessionState::Closed;
        if let Some(out) = self.outbound.take() {
            out.shutdown.notify_one();
        }
    }
}

/// What is left of a connection after teardown, for logging and announcing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub user: Option<UserInfo>,
    pub was_validated: bool,
    pub rejected: bool,
    pub addr: Option<SocketAddr>,
}

impl Departure {
    pub fn peer_label(&self) -> String {
        peer_label(self.addr)
    }
}

/// Address for log lines.
fn peer_label(addr: Option<SocketAddr>) -> String {
    addr.map_or_else(|| "local".to_string(), |addr| addr.ip().to_string())
}

#[derive(Debug)]
struct Node {
    conn: Connection,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    node: Option<Node>,
}

/// Ordered set of connections.
///
/// Connections live in an arena of slots addressed by [`ConnectionId`]; link
/// order is kept by `prev`/`next` slot indices so both append and removal
/// are O(1).
#[derive(Debug, Default)]
pub struct Roster {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append at the tail.
    pub fn link(&mut self, conn: Connection) -> ConnectionId {
        let node = Node {
            conn,
            prev: self.tail,
            next: None,
        };
        let index = if let Some(index) = self.free.pop() {
            self.slots[index].node = Some(node);
            index
        } else {
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            self.slots.len() - 1
        };

        match self.tail.and_then(|tail| self.node_mut(tail)) {
            Some(tail) => tail.next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;

        ConnectionId {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Remove from the list without closing anything.
    pub fn unlink(&mut self, id: ConnectionId) -> Option<Connection> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);

        match node.prev.and_then(|prev| self.node_mut(prev)) {
            Some(prev) => prev.next = node.next,
            None => self.head = node.next,
        }
        match node.next.and_then(|next| self.node_mut(next)) {
            Some(next) => next.prev = node.prev,
            None => self.tail = node.prev,
        }
        self.len -= 1;

        Some(node.conn)
    }

    /// Unlink and close in one step: when this returns the connection is out
    /// of the list, its queue is closed and its worker has been told to stop.
    pub fn disconnect(&mut self, id: ConnectionId) -> Option<Departure> {
        let mut conn = self.unlink(id)?;
        let departure = Departure {
            was_validated: conn.is_validated(),
            rejected: conn.pending_removal,
            addr: conn.addr,
            user: conn.user.take(),
        };
        conn.close();
        Some(departure)
    }

    /// Close every connection. Nothing is announced.
    pub fn disconnect_all(&mut self) -> usize {
        let ids: Vec<ConnectionId> = self.iter().map(|(id, _)| id).collect();
        ids.into_iter()
            .filter_map(|id| self.disconnect(id))
            .count()
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
            .map(|node| &node.conn)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
            .map(|node| &mut node.conn)
    }

    /// Every connection, validated or not, in link order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            roster: self,
            cursor: self.head,
        }
    }

    /// Validated connections other than `except`, in link order.
    pub fn members(
        &self,
        except: Option<ConnectionId>,
    ) -> impl Iterator<Item = (ConnectionId, &Connection)> + '_ {
        self.iter()
            .filter(move |(id, conn)| Some(*id) != except && conn.is_validated())
    }

    /// Apply `f` to every member other than `except` that also satisfies
    /// `predicate`.
    pub fn broadcast_with<P, F>(&self, except: Option<ConnectionId>, mut predicate: P, mut f: F)
    where
        P: FnMut(&Connection) -> bool,
        F: FnMut(ConnectionId, &Connection),
    {
        for (id, conn) in self.members(except) {
            if predicate(conn) {
                f(id, conn);
            }
        }
    }

    /// Queue `record` for every member other than `except`. Returns how many
    /// peers accepted it.
    pub fn broadcast(&self, except: Option<ConnectionId>, record: &Record) -> usize {
        let mut delivered = 0;
        self.broadcast_with(except, |_| true, |_, conn| {
            if conn.send(record.clone()) {
                delivered += 1;
            }
        });
        delivered
    }

    pub fn find_member(&self, name: &str, except: Option<ConnectionId>) -> Option<ConnectionId> {
        self.members(except)
            .find(|(_, conn)| conn.name() == Some(name))
            .map(|(id, _)| id)
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members(None)
            .filter_map(|(_, conn)| conn.name().map(str::to_string))
            .collect()
    }

    fn node(&self, index: usize) -> Option<&Node> {
        self.slots.get(index).and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.slots.get_mut(index).and_then(|slot| slot.node.as_mut())
    }
}

pub struct Iter<'a> {
    roster: &'a Roster,
    cursor: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (ConnectionId, &'a Connection);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = self.roster.node(index)?;
        self.cursor = node.next;
        let id = ConnectionId {
            index,
            generation: self.roster.slots[index].generation,
        };
        Some((id, &node.conn))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::record::ProtocolVersion;

    fn member(name: &str) -> Connection {
        Connection::mirror(UserInfo::new(name, ProtocolVersion::CURRENT))
    }

    fn pending() -> (Connection, mpsc::UnboundedReceiver<Record>) {
        let (outbound, rx, _) = Outbound::channel();
        (Connection::remote(None, outbound), rx)
    }

    fn live(name: &str) -> (Connection, mpsc::UnboundedReceiver<Record>) {
        let (mut conn, rx) = pending();
        conn.begin_validation(UserInfo::new(name, ProtocolVersion::CURRENT));
        conn.mark_validated();
        (conn, rx)
    }

    fn names(roster: &Roster) -> Vec<String> {
        roster.iter().filter_map(|(_, c)| c.name().map(str::to_string)).collect()
    }

    #[test]
    fn link_appends_in_order() {
        let mut roster = Roster::new();
        for name in ["a", "b", "c"] {
            roster.link(member(name));
        }
        assert_eq!(names(&roster), ["a", "b", "c"]);
        assert_eq!(roster.len(), 3);
    }

    #[test]
    fn unlink_repairs_head_middle_and_tail() {
        let mut roster = Roster::new();
        let ids: Vec<_> = ["a", "b", "c", "d"].map(|n| roster.link(member(n))).into();

        roster.unlink(ids[1]).unwrap();
        assert_eq!(names(&roster), ["a", "c", "d"]);
        roster.unlink(ids[0]).unwrap();
        assert_eq!(names(&roster), ["c", "d"]);
        roster.unlink(ids[3]).unwrap();
        assert_eq!(names(&roster), ["c"]);

        roster.link(member("e"));
        assert_eq!(names(&roster), ["c", "e"]);
        roster.unlink(ids[2]).unwrap();
        assert_eq!(names(&roster), ["e"]);
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn stale_handles_do_not_resolve_after_reuse() {
        let mut roster = Roster::new();
        let old = roster.link(member("a"));
        roster.unlink(old).unwrap();
        let new = roster.link(member("b"));

        assert_ne!(old, new);
        assert!(roster.get(old).is_none());
        assert!(roster.unlink(old).is_none());
        assert_eq!(roster.get(new).and_then(Connection::name), Some("b"));
    }

    #[test]
    fn broadcast_skips_unvalidated_and_except() {
        let mut roster = Roster::new();
        let (a, mut rx_a) = live("a");
        let (half, mut rx_half) = pending();
        let (b, mut rx_b) = live("b");
        let a = roster.link(a);
        roster.link(half);
        roster.link(b);

        let delivered = roster.broadcast(Some(a), &Record::stdout("hello"));
        assert_eq!(delivered, 1);
        assert_eq!(rx_b.try_recv().unwrap(), Record::stdout("hello"));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_half.try_recv().is_err());
    }

    #[test]
    fn broadcast_with_applies_predicate() {
        let mut roster = Roster::new();
        for name in ["ann", "bob", "amy"] {
            roster.link(member(name));
        }
        let mut seen = Vec::new();
        roster.broadcast_with(
            None,
            |c| c.name().is_some_and(|n| n.starts_with('a')),
            |_, c| seen.push(c.name().unwrap().to_string()),
        );
        assert_eq!(seen, ["ann", "amy"]);
    }

    #[test]
    fn find_member_ignores_pending_and_except() {
        let mut roster = Roster::new();
        let (mut half, _rx) = pending();
        half.begin_validation(UserInfo::new("carol", ProtocolVersion::CURRENT));
        roster.link(half);
        let dave = roster.link(member("dave"));

        assert_eq!(roster.find_member("carol", None), None);
        assert_eq!(roster.find_member("dave", None), Some(dave));
        assert_eq!(roster.find_member("dave", Some(dave)), None);
        assert_eq!(roster.member_names(), ["dave"]);
    }

    #[tokio::test]
    async fn disconnect_closes_queue_and_signals_worker() {
        let mut roster = Roster::new();
        let (outbound, mut rx, shutdown) = Outbound::channel();
        let mut conn = Connection::remote(None, outbound);
        conn.begin_validation(UserInfo::new("erin", ProtocolVersion::CURRENT));
        conn.mark_validated();
        let id = roster.link(conn);
        roster.get(id).unwrap().send(Record::stdout("bye"));

        let departure = roster.disconnect(id).unwrap();
        assert!(departure.was_validated);
        assert!(!departure.rejected);
        assert_eq!(departure.user.unwrap().name, "erin");
        assert!(roster.is_empty());

        // Queued records are still delivered, then the channel ends.
        assert_eq!(rx.recv().await, Some(Record::stdout("bye")));
        assert_eq!(rx.recv().await, None);
        shutdown.notified().await;
    }

    #[test]
    fn departures_are_labelled_like_connections() {
        let mut roster = Roster::new();
        let (outbound, _rx, _) = Outbound::channel();
        let conn = Connection::remote("10.1.2.3:9000".parse().ok(), outbound);
        let label = conn.peer_label();
        let id = roster.link(conn);
        assert_eq!(label, "10.1.2.3");
        assert_eq!(roster.disconnect(id).unwrap().peer_label(), label);
        assert_eq!(Connection::mirror(UserInfo::new("m", ProtocolVersion::CURRENT)).peer_label(), "local");
    }

    #[test]
    fn disconnect_all_empties_the_roster() {
        let mut roster = Roster::new();
        for name in ["a", "b", "c"] {
            roster.link(member(name));
        }
        assert_eq!(roster.disconnect_all(), 3);
        assert!(roster.is_empty());
        assert_eq!(roster.iter().count(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Link { validated: bool },
        Unlink(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<bool>().prop_map(|validated| Op::Link { validated }),
            any::<usize>().prop_map(Op::Unlink),
        ]
    }

    proptest! {
        #[test]
        fn broadcast_visits_exactly_the_validated_set_in_link_order(
            ops in proptest::collection::vec(op(), 1..64),
            except_pick in any::<usize>(),
        ) {
            let mut roster = Roster::new();
            let mut model: Vec<(ConnectionId, String, bool)> = Vec::new();
            let mut counter = 0;

            for op in ops {
                match op {
                    Op::Link { validated } => {
                        counter += 1;
                        let name = format!("m{counter}");
                        let (mut conn, _rx) = pending();
                        conn.begin_validation(UserInfo::new(&name, ProtocolVersion::CURRENT));
                        if validated {
                            conn.mark_validated();
                        }
                        let id = roster.link(conn);
                        model.push((id, name, validated));
                    }
                    Op::Unlink(pick) if !model.is_empty() => {
                        let (id, _, _) = model.remove(pick % model.len());
                        prop_assert!(roster.unlink(id).is_some());
                    }
                    Op::Unlink(_) => {}
                }
            }

            let except = (!model.is_empty()).then(|| model[except_pick % model.len()].0);
            let expected: Vec<String> = model
                .iter()
                .filter(|(id, _, validated)| *validated && Some(*id) != except)
                .map(|(_, name, _)| name.clone())
                .collect();
            let mut visited = Vec::new();
            roster.broadcast_with(except, |_| true, |_, c| visited.push(c.name().unwrap().to_string()));

            prop_assert_eq!(visited, expected);
            prop_assert_eq!(roster.len(), model.len());
        }
    }
}
