//! Target resolution against cluster topology

use dashmap::DashMap;
use std::collections::HashSet;

use super::{ChannelMessageTarget, ServiceEnvironment};
use crate::network::NetworkChannel;

/// Service selection passed to a resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceSelector<'a> {
    All,
    Name(&'a str),
    Task(&'a str),
    Group(&'a str),
    Environment(ServiceEnvironment),
}

/// Topology lookup used to turn targets into channels
pub trait TargetResolver: Send + Sync {
    /// Channels of the named node, or of every node for `None`
    fn resolve_nodes(&self, name: Option<&str>) -> Vec<NetworkChannel>;

    fn resolve_services(&self, selector: ServiceSelector<'_>) -> Vec<NetworkChannel>;
}

/// Resolve every target, each destination channel at most once
pub fn resolve_targets(resolver: &dyn TargetResolver, targets: &[ChannelMessageTarget]) -> Vec<NetworkChannel> {
    let mut seen = HashSet::new();
    let mut channels = Vec::new();

    for target in targets {
        let resolved = match target {
            ChannelMessageTarget::All => {
                let mut all = resolver.resolve_nodes(None);
                all.extend(resolver.resolve_services(ServiceSelector::All));
                all
            }
            ChannelMessageTarget::Node(name) => resolver.resolve_nodes(name.as_deref()),
            ChannelMessageTarget::Service(None) => resolver.resolve_services(ServiceSelector::All),
            ChannelMessageTarget::Service(Some(name)) => resolver.resolve_services(ServiceSelector::Name(name)),
            ChannelMessageTarget::Task(task) => resolver.resolve_services(ServiceSelector::Task(task)),
            ChannelMessageTarget::Group(group) => resolver.resolve_services(ServiceSelector::Group(group)),
            ChannelMessageTarget::Environment(env) => {
                resolver.resolve_services(ServiceSelector::Environment(*env))
            }
        };

        for channel in resolved {
            if channel.is_active() && seen.insert(channel.id()) {
                channels.push(channel);
            }
        }
    }

    channels
}

/// Description of a service reachable through a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub task: String,
    pub groups: Vec<String>,
    pub environment: ServiceEnvironment,
}

impl ServiceInfo {
    fn matches(&self, selector: ServiceSelector<'_>) -> bool {
        match selector {
            ServiceSelector::All => true,
            ServiceSelector::Name(name) => self.name.eq_ignore_ascii_case(name),
            ServiceSelector::Task(task) => self.task.eq_ignore_ascii_case(task),
            ServiceSelector::Group(group) => self.groups.iter().any(|g| g.eq_ignore_ascii_case(group)),
            ServiceSelector::Environment(env) => self.environment == env,
        }
    }
}

/// In-memory topology, kept current from channel lifecycle events
#[derive(Default)]
pub struct StaticTopology {
    /// Lowercased name to announced name and channel
    nodes: DashMap<String, (String, NetworkChannel)>,
    services: DashMap<String, (ServiceInfo, NetworkChannel)>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node, replacing an older channel with the same name
    pub fn register_node(&self, name: impl Into<String>, channel: NetworkChannel) {
        let name = name.into();
        tracing::debug!(node = %name, channel = channel.id(), "node registered");
        self.nodes.insert(name.to_ascii_lowercase(), (name, channel));
    }

    pub fn register_service(&self, info: ServiceInfo, channel: NetworkChannel) {
        tracing::debug!(service = %info.name, task = %info.task, channel = channel.id(), "service registered");
        self.services.insert(info.name.to_ascii_lowercase(), (info, channel));
    }

    /// Forget every node and service reached through this channel
    pub fn unregister_channel(&self, channel_id: u64) -> usize {
        let before = self.nodes.len() + self.services.len();
        self.nodes.retain(|_, (_, channel)| channel.id() != channel_id);
        self.services.retain(|_, (_, channel)| channel.id() != channel_id);
        before - (self.nodes.len() + self.services.len())
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|entry| entry.value().0.clone()).collect()
    }

    pub fn services(&self) -> Vec<ServiceInfo> {
        self.services.iter().map(|entry| entry.value().0.clone()).collect()
    }
}

impl TargetResolver for StaticTopology {
    fn resolve_nodes(&self, name: Option<&str>) -> Vec<NetworkChannel> {
        match name {
            Some(name) => self
                .nodes
                .get(&name.to_ascii_lowercase())
                .map(|entry| vec![entry.value().1.clone()])
                .unwrap_or_default(),
            None => self.nodes.iter().map(|entry| entry.value().1.clone()).collect(),
        }
    }

    fn resolve_services(&self, selector: ServiceSelector<'_>) -> Vec<NetworkChannel> {
        self.services
            .iter()
            .filter(|entry| entry.value().0.matches(selector))
            .map(|entry| entry.value().1.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Watermarks;

    fn channel() -> NetworkChannel {
        let addr = "127.0.0.1:1410".parse().unwrap();
        NetworkChannel::new(addr, addr, false, Watermarks::default()).0
    }

    fn service(name: &str, task: &str, env: ServiceEnvironment) -> ServiceInfo {
        ServiceInfo {
            name: name.to_string(),
            task: task.to_string(),
            groups: vec!["Global".to_string()],
            environment: env,
        }
    }

    fn ids(channels: &[NetworkChannel]) -> Vec<u64> {
        let mut ids: Vec<u64> = channels.iter().map(NetworkChannel::id).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_resolution() {
        let topology = StaticTopology::new();
        let (node_2, lobby, proxy) = (channel(), channel(), channel());
        topology.register_node("Node-2", node_2.clone());
        topology.register_service(service("Lobby-1", "Lobby", ServiceEnvironment::MinecraftServer), lobby.clone());
        topology.register_service(service("Proxy-1", "Proxy", ServiceEnvironment::Velocity), proxy.clone());

        let all = resolve_targets(&topology, &[ChannelMessageTarget::ALL]);
        assert_eq!(ids(&all), ids(&[node_2.clone(), lobby.clone(), proxy.clone()]));

        let nodes = resolve_targets(&topology, &[ChannelMessageTarget::node("node-2")]);
        assert_eq!(ids(&nodes), vec![node_2.id()]);

        let velocity = resolve_targets(
            &topology,
            &[ChannelMessageTarget::Environment(ServiceEnvironment::Velocity)],
        );
        assert_eq!(ids(&velocity), vec![proxy.id()]);

        let lobby_task = resolve_targets(&topology, &[ChannelMessageTarget::Task("Lobby".to_string())]);
        assert_eq!(ids(&lobby_task), vec![lobby.id()]);

        assert!(resolve_targets(&topology, &[ChannelMessageTarget::node("Node-3")]).is_empty());
    }

    #[test]
    fn test_overlapping_targets_deduplicated() {
        let topology = StaticTopology::new();
        let lobby = channel();
        topology.register_service(service("Lobby-1", "Lobby", ServiceEnvironment::MinecraftServer), lobby.clone());

        let resolved = resolve_targets(
            &topology,
            &[
                ChannelMessageTarget::ALL_SERVICES,
                ChannelMessageTarget::Group("Global".to_string()),
                ChannelMessageTarget::service("Lobby-1"),
            ],
        );
        assert_eq!(ids(&resolved), vec![lobby.id()]);
    }

    #[test]
    fn test_closed_and_unregistered_channels() {
        let topology = StaticTopology::new();
        let (node_2, node_3) = (channel(), channel());
        topology.register_node("Node-2", node_2.clone());
        topology.register_node("Node-3", node_3.clone());

        node_3.close();
        assert_eq!(ids(&resolve_targets(&topology, &[ChannelMessageTarget::ALL_NODES])), vec![node_2.id()]);

        assert_eq!(topology.unregister_channel(node_2.id()), 1);
        assert_eq!(topology.node_names(), vec!["Node-3".to_string()]);
    }

    #[test]
    fn test_node_lookup_ignores_case_but_keeps_name() {
        let topology = StaticTopology::new();
        let node_1 = channel();
        topology.register_node("Node-1", node_1.clone());

        assert_eq!(ids(&topology.resolve_nodes(Some("NODE-1"))), vec![node_1.id()]);
        assert_eq!(topology.node_names(), vec!["Node-1".to_string()]);
    }
}
