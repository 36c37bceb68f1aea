//! In-process demo cluster
//!
//! A small stand-in for the real consensus store: every member reserves its
//! client and peer ports with bound listeners and owns a data directory,
//! members share one replicated key/value map, and the leader is the
//! lowest-index running member while a majority is up. Good enough to drive
//! the dashboard and to exercise the control plane end to end.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    ClientOp, ClusterConfig, ClusterError, ClusterHandle, ClusterLauncher, MemberInfo,
    MemberStatus, OpOutcome,
};

/// Launcher for [`LocalCluster`]
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalLauncher;

#[async_trait]
impl ClusterLauncher for LocalLauncher {
    async fn start(&self, config: ClusterConfig) -> Result<Arc<dyn ClusterHandle>, ClusterError> {
        let cluster = LocalCluster::start(config)?;
        Ok(Arc::new(cluster))
    }
}

/// Listeners holding a member's ports while it runs
struct MemberPorts {
    _client: TcpListener,
    _peer: TcpListener,
}

struct MemberSlot {
    info: MemberInfo,
    client_port: u16,
    peer_port: u16,
    ports: Option<MemberPorts>,
    applied_revision: u64,
}

impl MemberSlot {
    fn is_running(&self) -> bool {
        self.ports.is_some()
    }
}

struct ClusterState {
    members: Vec<MemberSlot>,
    store: BTreeMap<String, String>,
    revision: u64,
    shut_down: bool,
}

impl ClusterState {
    fn running(&self) -> usize {
        self.members.iter().filter(|m| m.is_running()).count()
    }

    fn has_quorum(&self) -> bool {
        self.running() * 2 > self.members.len()
    }

    fn leader(&self) -> Option<usize> {
        if !self.has_quorum() {
            return None;
        }
        self.members.iter().position(|m| m.is_running())
    }

    fn member(&self, node: usize) -> Result<&MemberSlot, ClusterError> {
        self.members.get(node).ok_or(ClusterError::UnknownMember(node))
    }

    /// Member `node` must be up and the cluster must have quorum
    fn serving_member(&self, node: usize) -> Result<&MemberSlot, ClusterError> {
        let member = self.member(node)?;
        if !member.is_running() {
            return Err(ClusterError::MemberStopped(member.info.name.clone()));
        }
        if !self.has_quorum() {
            return Err(ClusterError::NoQuorum {
                running: self.running(),
                size: self.members.len(),
            });
        }
        Ok(member)
    }

    /// Advance the revision and replicate it to every running member
    fn commit(&mut self) -> u64 {
        self.revision += 1;
        let revision = self.revision;
        for member in self.members.iter_mut().filter(|m| m.is_running()) {
            member.applied_revision = revision;
        }
        revision
    }
}

/// In-process multi-member cluster
pub struct LocalCluster {
    scheme: &'static str,
    state: Mutex<ClusterState>,
}

impl LocalCluster {
    /// Create data directories and bind every member's ports.
    ///
    /// Fails on the first member that cannot start; ports already bound by
    /// earlier members are released when the partial state is dropped.
    pub fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        if config.size == 0 {
            return Err(ClusterError::Bootstrap("cluster size must be positive".to_string()));
        }

        let scheme = config.scheme();
        let mut members = Vec::with_capacity(config.size);

        for index in 0..config.size {
            let name = format!("node{}", index + 1);
            let client_port = config.client_port(index);
            let peer_port = config.peer_port(index);

            let data_dir: PathBuf = config.root_dir.join(format!("{name}.data"));
            std::fs::create_dir_all(&data_dir)?;

            let ports = bind_ports(client_port, peer_port)?;
            info!(target: "cluster", member = %name, client_port, peer_port, "Member started");

            members.push(MemberSlot {
                info: MemberInfo {
                    client_url: format!("{scheme}://localhost:{client_port}"),
                    peer_url: format!("{scheme}://localhost:{peer_port}"),
                    name,
                },
                client_port,
                peer_port,
                ports: Some(ports),
                applied_revision: 0,
            });
        }

        Ok(Self {
            scheme,
            state: Mutex::new(ClusterState {
                members,
                store: BTreeMap::new(),
                revision: 0,
                shut_down: false,
            }),
        })
    }

    /// Index of the current leader, if any
    pub fn leader(&self) -> Option<usize> {
        self.state.lock().leader()
    }

    fn apply(&self, op: ClientOp) -> Result<OpOutcome, ClusterError> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(ClusterError::ShutDown);
        }

        match op {
            ClientOp::Put { node, key, value } => {
                let name = state.serving_member(node)?.info.name.clone();
                state.store.insert(key.clone(), value.clone());
                let revision = state.commit();
                Ok(OpOutcome {
                    message: format!("{name}: put {key:?} = {value:?}"),
                    node: name,
                    value: None,
                    revision,
                })
            }
            ClientOp::Get { node, key } => {
                let name = state.serving_member(node)?.info.name.clone();
                let value = state.store.get(&key).cloned();
                let message = match &value {
                    Some(v) => format!("{name}: get {key:?} = {v:?}"),
                    None => format!("{name}: get {key:?} not found"),
                };
                Ok(OpOutcome {
                    message,
                    node: name,
                    value,
                    revision: state.revision,
                })
            }
            ClientOp::Delete { node, key } => {
                let name = state.serving_member(node)?.info.name.clone();
                let existed = state.store.remove(&key).is_some();
                let revision = if existed { state.commit() } else { state.revision };
                Ok(OpOutcome {
                    message: format!("{name}: delete {key:?} ({} key removed)", u8::from(existed)),
                    node: name,
                    value: None,
                    revision,
                })
            }
            ClientOp::StopMember { node } => {
                let revision = state.revision;
                let member = state
                    .members
                    .get_mut(node)
                    .ok_or(ClusterError::UnknownMember(node))?;
                if member.ports.take().is_none() {
                    return Err(ClusterError::MemberStopped(member.info.name.clone()));
                }
                warn!(target: "cluster", member = %member.info.name, "Member stopped");
                Ok(OpOutcome {
                    message: format!("{} stopped", member.info.name),
                    node: member.info.name.clone(),
                    value: None,
                    revision,
                })
            }
            ClientOp::RestartMember { node } => {
                let revision = state.revision;
                let member = state
                    .members
                    .get_mut(node)
                    .ok_or(ClusterError::UnknownMember(node))?;
                if member.is_running() {
                    return Err(ClusterError::MemberRunning(member.info.name.clone()));
                }
                member.ports = Some(bind_ports(member.client_port, member.peer_port)?);
                // catches up with the log on rejoin
                member.applied_revision = revision;
                info!(target: "cluster", member = %member.info.name, "Member restarted");
                Ok(OpOutcome {
                    message: format!("{} restarted", member.info.name),
                    node: member.info.name.clone(),
                    value: None,
                    revision,
                })
            }
        }
    }
}

#[async_trait]
impl ClusterHandle for LocalCluster {
    fn members(&self) -> Vec<MemberInfo> {
        self.state.lock().members.iter().map(|m| m.info.clone()).collect()
    }

    fn scheme(&self) -> &'static str {
        self.scheme
    }

    async fn status(&self) -> Result<Vec<MemberStatus>, ClusterError> {
        let state = self.state.lock();
        if state.shut_down {
            return Err(ClusterError::ShutDown);
        }
        let leader = state.leader();
        Ok(state
            .members
            .iter()
            .enumerate()
            .map(|(index, m)| MemberStatus {
                name: m.info.name.clone(),
                endpoint: m.info.client_url.clone(),
                running: m.is_running(),
                is_leader: leader == Some(index),
                revision: m.applied_revision,
            })
            .collect())
    }

    async fn execute(&self, op: ClientOp) -> Result<OpOutcome, ClusterError> {
        self.apply(op)
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        for member in state.members.iter_mut() {
            member.ports = None;
        }
        info!(target: "cluster", members = state.members.len(), "Local cluster shut down");
    }
}

fn bind_ports(client_port: u16, peer_port: u16) -> Result<MemberPorts, ClusterError> {
    let bind = |port: u16| {
        TcpListener::bind(("127.0.0.1", port))
            .map_err(|source| ClusterError::PortUnavailable { port, source })
    };
    Ok(MemberPorts {
        _client: bind(client_port)?,
        _peer: bind(peer_port)?,
    })
}
