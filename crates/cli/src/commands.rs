//! Subcommands.

use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Subcommand;
use tracing::info;

use corelib::message::NetworkRequest;
use corelib::{CommConfig, CommContext, NodeId, NodeIdentity, Result as CommResult};
use registry::{DirectNeighborRouting, MessageChannelService};
use transport::MemoryBrokerRegistry;

const ECHO: &str = "echo";

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a mesh of nodes in this process over the in-memory broker and
    /// exchange echo requests
    Demo {
        /// Number of nodes
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Echo requests sent to every target
        #[arg(long, default_value = "5")]
        requests: usize,

        /// Connect the nodes as a chain and route requests through relays
        #[arg(long)]
        relay: bool,
    },

    /// Print the effective configuration as JSON
    Config,
}

/// Text produced by a command.
#[derive(Debug, Default)]
pub struct CommandResult {
    pub lines: Vec<String>,
}

impl CommandResult {
    fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

impl Command {
    pub fn execute(self, config: CommConfig) -> anyhow::Result<CommandResult> {
        match self {
            Command::Demo { nodes, requests, relay } => run_demo(config, nodes, requests, relay),
            Command::Config => {
                let mut result = CommandResult::default();
                result.push(serde_json::to_string_pretty(&config)?);
                Ok(result)
            }
        }
    }
}

struct DemoNode {
    service: Arc<MessageChannelService>,
    address: String,
}

impl DemoNode {
    fn id(&self) -> NodeId {
        self.service.local_identity().node_id
    }

    fn name(&self) -> &str {
        &self.service.local_identity().display_name
    }
}

fn start_node(brokers: &MemoryBrokerRegistry, index: usize, config: &CommConfig) -> anyhow::Result<DemoNode> {
    let name = format!("node-{}", index);
    let address = format!("mem://{}", name);
    brokers.create_broker(&address);
    let context = CommContext::with_pool_name(config.clone(), &name)?;
    let service = MessageChannelService::new(context, NodeIdentity::new(NodeId::random(), name), Arc::new(brokers.clone()));
    service.request_endpoint().register_handler(
        ECHO,
        Arc::new(|request: &NetworkRequest| -> CommResult<Vec<u8>> { Ok(request.content().to_vec()) }),
    );
    if config.is_relay {
        service.set_routing_service(Arc::new(DirectNeighborRouting::new(Arc::downgrade(&service))));
    }
    service.start_server(&address)?;
    Ok(DemoNode { service, address })
}

fn run_demo(mut config: CommConfig, node_count: usize, requests: usize, relay: bool) -> anyhow::Result<CommandResult> {
    if node_count < 2 {
        bail!("a demo needs at least two nodes, got {}", node_count);
    }
    if relay && node_count < 3 {
        bail!("relaying needs at least three nodes, got {}", node_count);
    }
    config.is_relay = relay;

    let brokers = MemoryBrokerRegistry::new();
    let nodes = (0..node_count)
        .map(|i| start_node(&brokers, i, &config))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let outcome = exchange(&nodes, &config, requests, relay);

    for node in &nodes {
        node.service.shutdown();
        node.service.context().shutdown();
    }
    outcome
}

fn exchange(nodes: &[DemoNode], config: &CommConfig, requests: usize, relay: bool) -> anyhow::Result<CommandResult> {
    let mut result = CommandResult::default();
    if relay {
        for pair in nodes.windows(2) {
            pair[0]
                .service
                .connect(&pair[1].address)
                .with_context(|| format!("connecting {} to {}", pair[0].name(), pair[1].name()))?;
        }
    } else {
        for (i, from) in nodes.iter().enumerate() {
            for to in &nodes[i + 1..] {
                from.service
                    .connect(&to.address)
                    .with_context(|| format!("connecting {} to {}", from.name(), to.name()))?;
            }
        }
    }
    info!(nodes = nodes.len(), relay, "Demo mesh connected");

    let origin = &nodes[0];
    let timeout = config.request_timeout();
    let targets: Vec<&DemoNode> = if relay { nodes[2..].iter().take(1).collect() } else { nodes[1..].iter().collect() };
    for target in targets {
        let channel = origin
            .service
            .channels()
            .into_iter()
            .find(|c| {
                let next_hop = if relay { nodes[1].id() } else { target.id() };
                c.remote_node().node_id == next_hop
            })
            .with_context(|| format!("no channel from {} towards {}", origin.name(), target.name()))?;
        let mut succeeded = 0;
        for n in 0..requests {
            let content = format!("{} -> {} #{}", origin.name(), target.name(), n).into_bytes();
            let final_recipient = relay.then(|| target.id());
            let request = NetworkRequest::new(ECHO, content.clone(), origin.id(), final_recipient);
            let response = origin.service.send_request_sync_by_channel_id(channel.id(), request, timeout);
            if response.is_success() && response.content() == content.as_slice() {
                succeeded += 1;
            } else {
                result.push(format!("request {} to {} failed: {}", n, target.name(), response.result_code()));
            }
        }
        result.push(format!(
            "{} -> {} via channel {}: {}/{} echoed",
            origin.name(),
            target.name(),
            channel.id(),
            succeeded,
            requests
        ));
    }

    for channel in origin.service.channels() {
        let outcome = origin.service.perform_health_check(channel.id());
        result.push(format!("health check {}: {:?}", channel.id(), outcome));
    }
    for node in nodes {
        result.push(format!("{}:", node.name()));
        for snapshot in node.service.health_snapshot() {
            result.push(format!(
                "  {} {:?} {} to {} (failures: {})",
                snapshot.channel_id,
                snapshot.direction,
                snapshot.state,
                snapshot.remote_node,
                snapshot.consecutive_failures
            ));
        }
    }
    result.push(origin.service.context().pool().statistics_report());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> CommConfig {
        CommConfig {
            handshake_timeout_ms: 2_000,
            request_timeout_ms: 2_000,
            health_check_timeout_ms: 1_000,
            ..CommConfig::default()
        }
    }

    #[test]
    fn test_demo_mesh_echoes_every_request() {
        let result = run_demo(quick_config(), 3, 2, false).unwrap();
        let echoed: Vec<&String> = result.lines.iter().filter(|l| l.contains("echoed")).collect();
        assert_eq!(echoed.len(), 2);
        assert!(echoed.iter().all(|l| l.ends_with("2/2 echoed")));
        assert!(!result.lines.iter().any(|l| l.contains("failed")));
    }

    #[test]
    fn test_relay_demo_reaches_node_behind_relay() {
        let result = run_demo(quick_config(), 3, 2, true).unwrap();
        assert!(result.lines.iter().any(|l| l.starts_with("node-0 -> node-2") && l.ends_with("2/2 echoed")));
    }

    #[test]
    fn test_demo_rejects_single_node() {
        assert!(run_demo(quick_config(), 1, 1, false).is_err());
        assert!(run_demo(quick_config(), 2, 1, true).is_err());
    }

    #[test]
    fn test_config_command_prints_json() {
        let result = Command::Config.execute(CommConfig::default()).unwrap();
        let parsed: CommConfig = serde_json::from_str(&result.lines[0]).unwrap();
        assert_eq!(parsed, CommConfig::default());
    }
}
