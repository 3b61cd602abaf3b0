//! Fleet membership.
//!
//! Each node registers an ephemeral entry `root/<node-id>` with the
//! coordination service and watches `root` for children coming and going.
//! The resulting [`ClusterView`] is what the rebalancer and the reporter
//! read to learn the fleet size; each node's entry doubles as the slot for
//! its latest [`StatusSnapshot`].

use crate::metrics::StatusSnapshot;
use crate::CrawlError;
use crossbeam_channel::{Receiver, Sender};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{info, warn};
use uuid::Uuid;

pub type ChildrenWatcher = Arc<dyn Fn(Vec<String>) + Send + Sync>;

type Fire = (ChildrenWatcher, Vec<String>);

/// What the node needs from the coordination service.
pub trait Coordinator: Send + Sync {
    /// Creates `path` and any missing ancestors as persistent entries.
    fn ensure_path(&self, path: &str) -> Result<(), CrawlError>;
    fn exists(&self, path: &str) -> Result<bool, CrawlError>;
    /// Creates an entry removed automatically when this session ends.
    fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<(), CrawlError>;
    fn delete(&self, path: &str) -> Result<(), CrawlError>;
    fn children(&self, path: &str) -> Result<Vec<String>, CrawlError>;
    /// `None` when the entry does not exist.
    fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, CrawlError>;
    fn set_data(&self, path: &str, data: Vec<u8>) -> Result<(), CrawlError>;
    /// Calls `watcher` with the current children now and again after every
    /// change to the children of `path`.
    fn watch_children(&self, path: &str, watcher: ChildrenWatcher) -> Result<(), CrawlError>;
}

struct Entry {
    data: Vec<u8>,
    owner: Option<u64>,
}

struct Watch {
    session: u64,
    path: String,
    watcher: ChildrenWatcher,
}

#[derive(Default)]
struct EnsembleState {
    entries: BTreeMap<String, Entry>,
    watches: Vec<Watch>,
    next_session: u64,
    expired: Vec<u64>,
}

impl EnsembleState {
    fn children(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn pending_fires(&self, parent: &str) -> Vec<Fire> {
        let children = self.children(parent);
        self.watches
            .iter()
            .filter(|w| w.path == parent)
            .map(|w| (Arc::clone(&w.watcher), children.clone()))
            .collect()
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// An in-process coordination service. Every [`MemoryEnsemble::session`]
/// behaves like one client connection; expiring a session removes its
/// ephemeral entries and notifies the remaining watchers, as a crashed
/// node's liveness timeout would.
///
/// Watchers run on the thread that made the change, one notification at a
/// time. They must not modify the ensemble.
#[derive(Clone, Default)]
pub struct MemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
    dispatch: Arc<Mutex<()>>,
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> MemoryCoordinator {
        let session = match self.state.lock() {
            Ok(mut state) => {
                state.next_session += 1;
                state.next_session
            }
            Err(poisoned) => {
                let mut state = poisoned.into_inner();
                state.next_session += 1;
                state.next_session
            }
        };
        MemoryCoordinator {
            ensemble: self.clone(),
            session,
        }
    }

    fn mutate<T>(
        &self,
        session: u64,
        f: impl FnOnce(&mut EnsembleState) -> Result<(T, Vec<Fire>), CrawlError>,
    ) -> Result<T, CrawlError> {
        // Held across delivery so every watcher sees changes in order.
        let _dispatch = self
            .dispatch
            .lock()
            .map_err(|_| CrawlError::poisoned("ensemble dispatch"))?;
        let (value, fires) = {
            let mut state = self.state.lock().map_err(|_| CrawlError::poisoned("ensemble"))?;
            if state.expired.contains(&session) {
                return Err(CrawlError::Coordination("session expired".into()));
            }
            f(&mut state)?
        };
        for (watcher, children) in fires {
            watcher(children);
        }
        Ok(value)
    }

    fn read<T>(&self, session: u64, f: impl FnOnce(&EnsembleState) -> T) -> Result<T, CrawlError> {
        let state = self.state.lock().map_err(|_| CrawlError::poisoned("ensemble"))?;
        if state.expired.contains(&session) {
            return Err(CrawlError::Coordination("session expired".into()));
        }
        Ok(f(&state))
    }
}

/// One session against a [`MemoryEnsemble`].
pub struct MemoryCoordinator {
    ensemble: MemoryEnsemble,
    session: u64,
}

impl MemoryCoordinator {
    /// Simulates a crash: the session's ephemeral entries disappear and its
    /// watches stop firing. Every later call on this session fails.
    pub fn expire(&self) -> Result<(), CrawlError> {
        let session = self.session;
        self.ensemble.mutate(session, |state| {
            state.expired.push(session);
            state.watches.retain(|w| w.session != session);
            let owned: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| e.owner == Some(session))
                .map(|(k, _)| k.clone())
                .collect();
            let mut parents = BTreeSet::new();
            for path in owned {
                state.entries.remove(&path);
                parents.insert(parent_of(&path).to_string());
            }
            let fires = parents.iter().flat_map(|p| state.pending_fires(p)).collect();
            Ok(((), fires))
        })
    }

    pub fn session_id(&self) -> u64 {
        self.session
    }
}

impl Coordinator for MemoryCoordinator {
    fn ensure_path(&self, path: &str) -> Result<(), CrawlError> {
        self.ensemble.mutate(self.session, |state| {
            let mut created_under = None;
            let mut current = String::new();
            for part in path.split('/').filter(|p| !p.is_empty()) {
                let parent = if current.is_empty() { "/".to_string() } else { current.clone() };
                current.push('/');
                current.push_str(part);
                if !state.entries.contains_key(&current) {
                    state.entries.insert(current.clone(), Entry { data: Vec::new(), owner: None });
                    created_under.get_or_insert(parent);
                }
            }
            let fires = created_under
                .map(|parent| state.pending_fires(&parent))
                .unwrap_or_default();
            Ok(((), fires))
        })
    }

    fn exists(&self, path: &str) -> Result<bool, CrawlError> {
        self.ensemble.read(self.session, |state| state.entries.contains_key(path))
    }

    fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<(), CrawlError> {
        let session = self.session;
        self.ensemble.mutate(session, |state| {
            let parent = parent_of(path).to_string();
            if parent != "/" && !state.entries.contains_key(&parent) {
                return Err(CrawlError::Coordination(format!("no parent for {}", path)));
            }
            if state.entries.contains_key(path) {
                return Err(CrawlError::Coordination(format!("{} already exists", path)));
            }
            state.entries.insert(path.to_string(), Entry { data, owner: Some(session) });
            Ok(((), state.pending_fires(&parent)))
        })
    }

    fn delete(&self, path: &str) -> Result<(), CrawlError> {
        self.ensemble.mutate(self.session, |state| {
            if !state.children(path).is_empty() {
                return Err(CrawlError::Coordination(format!("{} has children", path)));
            }
            if state.entries.remove(path).is_none() {
                return Err(CrawlError::Coordination(format!("no node {}", path)));
            }
            Ok(((), state.pending_fires(parent_of(path))))
        })
    }

    fn children(&self, path: &str) -> Result<Vec<String>, CrawlError> {
        self.ensemble.read(self.session, |state| state.children(path))
    }

    fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, CrawlError> {
        self.ensemble
            .read(self.session, |state| state.entries.get(path).map(|e| e.data.clone()))
    }

    fn set_data(&self, path: &str, data: Vec<u8>) -> Result<(), CrawlError> {
        self.ensemble.mutate(self.session, |state| match state.entries.get_mut(path) {
            Some(entry) => {
                entry.data = data;
                Ok(((), Vec::new()))
            }
            None => Err(CrawlError::Coordination(format!("no node {}", path))),
        })
    }

    fn watch_children(&self, path: &str, watcher: ChildrenWatcher) -> Result<(), CrawlError> {
        let session = self.session;
        self.ensemble.mutate(session, |state| {
            state.watches.push(Watch {
                session,
                path: path.to_string(),
                watcher: Arc::clone(&watcher),
            });
            Ok(((), vec![(watcher, state.children(path))]))
        })
    }
}

/// Globally unique per node process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    pub fn generate() -> Self {
        NodeId(Uuid::new_v4().to_string())
    }

    pub fn from_name(name: &str) -> Self {
        NodeId(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(Vec<NodeId>),
    Lost(Vec<NodeId>),
}

/// The set of registered nodes as last reported by the watch.
#[derive(Default)]
pub struct ClusterView {
    members: Mutex<BTreeSet<NodeId>>,
    size: AtomicUsize,
}

impl ClusterView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero until the first notification arrives.
    pub fn fleet_size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn members(&self) -> Vec<NodeId> {
        match self.members.lock() {
            Ok(members) => members.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.lock().map(|m| m.contains(node)).unwrap_or(false)
    }

    /// Swaps in a new member set, returning (joined, lost).
    pub fn replace(&self, next: BTreeSet<NodeId>) -> (Vec<NodeId>, Vec<NodeId>) {
        let mut members = match self.members.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let joined = next.difference(&members).cloned().collect();
        let lost = members.difference(&next).cloned().collect();
        self.size.store(next.len(), Ordering::Release);
        *members = next;
        (joined, lost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Unregistered,
    Registered,
}

struct TrackerShared {
    view: Arc<ClusterView>,
    subscribers: Mutex<Vec<Sender<MembershipEvent>>>,
}

impl TrackerShared {
    fn apply_children(&self, children: Vec<String>) {
        let next: BTreeSet<NodeId> = children.iter().map(|c| NodeId::from_name(c)).collect();
        let (joined, lost) = self.view.replace(next);
        if joined.is_empty() && lost.is_empty() {
            return;
        }
        warn!(fleet_size = self.view.fleet_size(), "fleet size changed");
        if !lost.is_empty() {
            info!(lost = ?lost, "members lost");
        }
        self.publish(joined, lost);
    }

    fn publish(&self, joined: Vec<NodeId>, lost: Vec<NodeId>) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        let mut events = Vec::with_capacity(2);
        if !joined.is_empty() {
            events.push(MembershipEvent::Joined(joined));
        }
        if !lost.is_empty() {
            events.push(MembershipEvent::Lost(lost));
        }
        subscribers.retain(|tx| events.iter().all(|e| tx.send(e.clone()).is_ok()));
    }
}

/// This node's registration plus its live view of the fleet.
pub struct MembershipTracker {
    coordinator: Arc<dyn Coordinator>,
    node_id: NodeId,
    root: String,
    registration: Mutex<Registration>,
    shared: Arc<TrackerShared>,
    watching: AtomicBool,
}

impl MembershipTracker {
    pub fn new(coordinator: Arc<dyn Coordinator>, root: &str) -> Self {
        Self::with_node_id(coordinator, root, NodeId::generate())
    }

    pub fn with_node_id(coordinator: Arc<dyn Coordinator>, root: &str, node_id: NodeId) -> Self {
        Self {
            coordinator,
            node_id,
            root: root.trim_end_matches('/').to_string(),
            registration: Mutex::new(Registration::Unregistered),
            shared: Arc::new(TrackerShared {
                view: Arc::new(ClusterView::new()),
                subscribers: Mutex::new(Vec::new()),
            }),
            watching: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn node_path(&self) -> String {
        self.path_of(&self.node_id)
    }

    fn path_of(&self, node: &NodeId) -> String {
        format!("{}/{}", self.root, node)
    }

    pub fn view(&self) -> Arc<ClusterView> {
        Arc::clone(&self.shared.view)
    }

    pub fn fleet_size(&self) -> usize {
        self.shared.view.fleet_size()
    }

    pub fn registration(&self) -> Registration {
        self.registration
            .lock()
            .map(|r| *r)
            .unwrap_or(Registration::Unregistered)
    }

    pub fn subscribe(&self) -> Receiver<MembershipEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        if let Ok(mut subscribers) = self.shared.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Unregistered -> Registered. Idempotent.
    pub fn start(&self) -> Result<(), CrawlError> {
        let mut registration = self
            .registration
            .lock()
            .map_err(|_| CrawlError::poisoned("registration"))?;
        if *registration == Registration::Registered {
            return Ok(());
        }

        self.coordinator.ensure_path(&self.root)?;
        let path = self.node_path();
        if !self.coordinator.exists(&path)? {
            self.coordinator.create_ephemeral(&path, Vec::new())?;
        }
        *registration = Registration::Registered;
        drop(registration);

        if !self.watching.swap(true, Ordering::AcqRel) {
            let weak: Weak<TrackerShared> = Arc::downgrade(&self.shared);
            let watcher: ChildrenWatcher = Arc::new(move |children| {
                if let Some(shared) = weak.upgrade() {
                    shared.apply_children(children);
                }
            });
            if let Err(e) = self.coordinator.watch_children(&self.root, watcher) {
                self.watching.store(false, Ordering::Release);
                return Err(e);
            }
        }

        info!(node = %self.node_id, "has connected to cluster");
        Ok(())
    }

    /// Registered -> Unregistered. Idempotent.
    pub fn stop(&self) -> Result<(), CrawlError> {
        let mut registration = self
            .registration
            .lock()
            .map_err(|_| CrawlError::poisoned("registration"))?;
        if *registration == Registration::Unregistered {
            return Ok(());
        }
        let path = self.node_path();
        if self.coordinator.exists(&path)? {
            self.coordinator.delete(&path)?;
        }
        *registration = Registration::Unregistered;
        info!(node = %self.node_id, "has disconnected from cluster");
        Ok(())
    }

    /// Overwrites this node's slot with `status`.
    pub fn submit_status(&self, status: &StatusSnapshot) -> Result<(), CrawlError> {
        if self.registration() != Registration::Registered {
            return Err(CrawlError::Coordination(format!(
                "node {} is not registered",
                self.node_id
            )));
        }
        self.coordinator.set_data(&self.node_path(), status.to_bytes()?)
    }

    /// `None` if the node is gone or has not reported yet.
    pub fn read_status(&self, node: &NodeId) -> Result<Option<StatusSnapshot>, CrawlError> {
        match self.coordinator.get_data(&self.path_of(node))? {
            Some(bytes) if !bytes.is_empty() => Ok(Some(StatusSnapshot::from_bytes(&bytes)?)),
            _ => Ok(None),
        }
    }

    /// Every registered node with its latest status, read fresh.
    pub fn fleet_status(&self) -> Result<Vec<(NodeId, Option<StatusSnapshot>)>, CrawlError> {
        let mut statuses = Vec::new();
        for child in self.coordinator.children(&self.root)? {
            let node = NodeId::from_name(&child);
            let status = self.read_status(&node)?;
            statuses.push((node, status));
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(ensemble: &MemoryEnsemble, name: &str) -> (Arc<MemoryCoordinator>, MembershipTracker) {
        let session = Arc::new(ensemble.session());
        let tracker = MembershipTracker::with_node_id(session.clone(), "/node/host", NodeId::from_name(name));
        (session, tracker)
    }

    #[test]
    fn test_start_registers_and_counts_self() {
        let ensemble = MemoryEnsemble::new();
        let (_session, a) = tracker(&ensemble, "a");
        assert_eq!(a.registration(), Registration::Unregistered);
        a.start().unwrap();
        assert_eq!(a.registration(), Registration::Registered);
        assert_eq!(a.fleet_size(), 1);
        assert!(a.view().contains(a.node_id()));
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let ensemble = MemoryEnsemble::new();
        let (_session, a) = tracker(&ensemble, "a");
        a.start().unwrap();
        a.start().unwrap();
        assert_eq!(a.fleet_size(), 1);
        a.stop().unwrap();
        a.stop().unwrap();
        assert_eq!(a.registration(), Registration::Unregistered);
    }

    #[test]
    fn test_peers_see_each_other() {
        let ensemble = MemoryEnsemble::new();
        let (_sa, a) = tracker(&ensemble, "a");
        let (_sb, b) = tracker(&ensemble, "b");
        a.start().unwrap();
        b.start().unwrap();
        assert_eq!(a.fleet_size(), 2);
        assert_eq!(b.fleet_size(), 2);

        b.stop().unwrap();
        assert_eq!(a.fleet_size(), 1);
    }

    #[test]
    fn test_submit_requires_registration() {
        let ensemble = MemoryEnsemble::new();
        let (_session, a) = tracker(&ensemble, "a");
        let err = a.submit_status(&StatusSnapshot::default()).unwrap_err();
        assert!(matches!(err, CrawlError::Coordination(_)));
    }

    #[test]
    fn test_status_is_overwritten_not_appended() {
        let ensemble = MemoryEnsemble::new();
        let (_sa, a) = tracker(&ensemble, "a");
        let (_sb, b) = tracker(&ensemble, "b");
        a.start().unwrap();
        b.start().unwrap();

        assert_eq!(b.read_status(a.node_id()).unwrap(), None);
        for pages in [1, 2] {
            a.submit_status(&StatusSnapshot { count_pages: pages, ..Default::default() })
                .unwrap();
        }
        let seen = b.read_status(a.node_id()).unwrap().unwrap();
        assert_eq!(seen.count_pages, 2);
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/node/host/a"), "/node/host");
        assert_eq!(parent_of("/node"), "/");
    }
}
