//! Cluster administration through `redis-cli`.
//!
//! Every call spawns one `redis-cli` process and is bounded by a timeout; a
//! process still running when the timeout fires is killed on drop.

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use redis_operator::provider::{ClusterAdmin, CommandOutput, NodeTopology, PeerInfo};
use redis_operator::resilience::with_timeout;
use redis_operator::{OperatorError, Result, Role, SlotRange};

/// `ClusterAdmin` backed by the `redis-cli` binary.
#[derive(Debug, Clone)]
pub struct RedisCli {
    binary: String,
    /// Bound on single-node commands.
    command_timeout: Duration,
    /// Bound on `--cluster` commands that move slots.
    migration_timeout: Duration,
}

impl RedisCli {
    pub fn new(binary: impl Into<String>, command_timeout: Duration, migration_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            command_timeout,
            migration_timeout,
        }
    }

    /// Run one command against the node listening on `address`.
    async fn node_command(&self, address: &str, args: &[&str]) -> Result<String> {
        let (host, port) = split_address(address)?;
        let mut full = vec!["-h", host, "-p", port];
        full.extend_from_slice(args);
        let output = self.run(&full, self.command_timeout).await?;
        if !output.ok {
            return Err(OperatorError::Command(format!("{}: {}", args.join(" "), output.output)));
        }
        Ok(output.output)
    }

    /// Run a `--cluster` subcommand through the node listening on `address`.
    async fn cluster_command(&self, subcommand: &str, address: &str, extra: &[String]) -> Result<CommandOutput> {
        let mut args = vec!["--cluster", subcommand, address];
        args.extend(extra.iter().map(String::as_str));
        args.push("--cluster-yes");
        self.run(&args, self.migration_timeout).await
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        debug!(args = ?args, "Running redis-cli");
        let mut command = Command::new(&self.binary);
        command.args(args).kill_on_drop(true);

        let output = with_timeout("redis-cli", timeout, async {
            command.output().await.map_err(OperatorError::from)
        })
        .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            warn!(args = ?args, status = ?output.status.code(), stderr = %stderr, "redis-cli failed");
            return Ok(CommandOutput::failed(if stderr.is_empty() { stdout } else { stderr }));
        }
        if is_error_reply(&stdout) {
            return Ok(CommandOutput::failed(stdout));
        }
        Ok(CommandOutput::ok(stdout))
    }
}

fn split_address(address: &str) -> Result<(&str, &str)> {
    address
        .rsplit_once(':')
        .ok_or_else(|| OperatorError::Command(format!("malformed address '{}'", address)))
}

/// Error replies print as `ERR ...` (or `(error) ERR ...` on a terminal).
fn is_error_reply(stdout: &str) -> bool {
    let first = stdout.lines().next().unwrap_or_default();
    let first = first.strip_prefix("(error) ").unwrap_or(first);
    ["ERR", "WRONGTYPE", "MOVED", "CLUSTERDOWN", "LOADING", "NOAUTH"]
        .iter()
        .any(|prefix| first.starts_with(prefix))
}

#[async_trait]
impl ClusterAdmin for RedisCli {
    async fn join(&self, target: &str, existing: &str) -> Result<()> {
        let (host, port) = split_address(existing)?;
        self.node_command(target, &["cluster", "meet", host, port]).await?;
        Ok(())
    }

    async fn forget(&self, target: &str, node_id: &str) -> Result<()> {
        self.node_command(target, &["cluster", "forget", node_id]).await?;
        Ok(())
    }

    async fn assign_replica_of(&self, target: &str, leader: &str) -> Result<()> {
        let leader_id = self.query_topology(leader).await?.id;
        self.node_command(target, &["cluster", "replicate", &leader_id]).await?;
        Ok(())
    }

    async fn rebalance_slots(&self, any_healthy: &str) -> Result<CommandOutput> {
        self.cluster_command("rebalance", any_healthy, &["--cluster-use-empty-masters".to_string()])
            .await
    }

    async fn fix_cluster(&self, any_healthy: &str) -> Result<CommandOutput> {
        self.cluster_command("fix", any_healthy, &[]).await
    }

    async fn query_topology(&self, target: &str) -> Result<NodeTopology> {
        let output = self.node_command(target, &["cluster", "nodes"]).await?;
        parse_cluster_nodes(&output)
    }

    async fn assign_slots(&self, target: &str, ranges: &[SlotRange]) -> Result<()> {
        let bounds: Vec<String> = ranges
            .iter()
            .flat_map(|r| [r.start.to_string(), r.end.to_string()])
            .collect();
        let mut args = vec!["cluster", "addslotsrange"];
        args.extend(bounds.iter().map(String::as_str));
        self.node_command(target, &args).await?;
        Ok(())
    }

    async fn drain_slots(&self, any_healthy: &str, departing: &[String]) -> Result<CommandOutput> {
        let mut extra = vec!["--cluster-use-empty-masters".to_string()];
        if !departing.is_empty() {
            extra.push("--cluster-weight".to_string());
            extra.extend(departing.iter().map(|id| format!("{}=0", id)));
        }
        self.cluster_command("rebalance", any_healthy, &extra).await
    }

    async fn failover(&self, replica: &str) -> Result<()> {
        self.node_command(replica, &["cluster", "failover"]).await?;
        Ok(())
    }
}

/// Parse `CLUSTER NODES` output as seen by the node flagged `myself`.
///
/// Slot entries in brackets (migrating or importing) are not ownership and
/// are skipped.
pub fn parse_cluster_nodes(output: &str) -> Result<NodeTopology> {
    let mut myself = None;
    let mut peers = Vec::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(OperatorError::Command(format!("malformed CLUSTER NODES line: {}", line)));
        }
        let flags: Vec<&str> = fields[2].split(',').collect();
        let role = if flags.contains(&"slave") {
            Role::Replica
        } else {
            Role::Leader
        };
        let leader_id = match fields[3] {
            "-" => None,
            id => Some(id.to_string()),
        };
        let slots = fields[8..]
            .iter()
            .filter(|s| !s.starts_with('['))
            .map(|s| parse_slot_range(s))
            .collect::<Result<Vec<_>>>()?;

        if flags.contains(&"myself") {
            myself = Some(NodeTopology {
                id: fields[0].to_string(),
                role,
                leader_id,
                slots,
                peers: Vec::new(),
            });
        } else {
            peers.push(PeerInfo {
                id: fields[0].to_string(),
                address: peer_address(fields[1]),
                role,
                leader_id,
                failed: flags.iter().any(|f| matches!(*f, "fail" | "fail?" | "noaddr")),
                slots,
            });
        }
    }

    let mut topology =
        myself.ok_or_else(|| OperatorError::Command("CLUSTER NODES output has no myself entry".into()))?;
    topology.peers = peers;
    Ok(topology)
}

/// `ip:port@cport[,hostname]` to `ip:port`.
fn peer_address(field: &str) -> String {
    let field = field.split(',').next().unwrap_or(field);
    field.split('@').next().unwrap_or(field).to_string()
}

fn parse_slot_range(field: &str) -> Result<SlotRange> {
    let parse = |s: &str| {
        s.parse::<u16>()
            .map_err(|_| OperatorError::Command(format!("bad slot '{}'", field)))
    };
    match field.split_once('-') {
        Some((start, end)) => Ok(SlotRange::new(parse(start)?, parse(end)?)),
        None => Ok(SlotRange::single(parse(field)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEADER_VIEW: &str = "\
07c37dfeb235213a872192d90877d0cd55635b91 10.0.0.12:6379@16379 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1700000000000 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 10.0.0.11:6379@16379,leader-1 master - 0 1700000000000 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 10.0.0.13:6379@16379 master,fail - 1700000000000 1700000000000 3 disconnected 10923-16383
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 10.0.0.10:6379@16379 myself,master - 0 0 1 connected 0-5460 [5461->-67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1]
";

    #[test]
    fn test_parse_leader_view() {
        let topology = parse_cluster_nodes(LEADER_VIEW).unwrap();
        assert_eq!(topology.id, "e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca");
        assert_eq!(topology.role, Role::Leader);
        assert_eq!(topology.leader_id, None);
        assert_eq!(topology.slots, vec![SlotRange::new(0, 5460)]);
        assert_eq!(topology.owned_slots(), 5461);
        assert_eq!(topology.peers.len(), 3);

        let replica = &topology.peers[0];
        assert_eq!(replica.role, Role::Replica);
        assert_eq!(replica.leader_id.as_deref(), Some(topology.id.as_str()));
        assert_eq!(replica.address, "10.0.0.12:6379");

        assert_eq!(topology.peers[1].address, "10.0.0.11:6379");
        assert!(!topology.peers[1].failed);
        assert!(topology.peers[2].failed);
    }

    #[test]
    fn test_parse_replica_view() {
        let output = "\
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 10.0.0.10:6379@16379 master - 0 0 1 connected 0-5460 7000
07c37dfeb235213a872192d90877d0cd55635b91 10.0.0.12:6379@16379 myself,slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 0 4 connected
";
        let topology = parse_cluster_nodes(output).unwrap();
        assert_eq!(topology.role, Role::Replica);
        assert_eq!(
            topology.leader_id.as_deref(),
            Some("e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca")
        );
        assert!(topology.slots.is_empty());
        assert_eq!(
            topology.peers[0].slots,
            vec![SlotRange::new(0, 5460), SlotRange::single(7000)]
        );
    }

    #[test]
    fn test_parse_requires_myself() {
        let output = "e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 10.0.0.10:6379@16379 master - 0 0 1 connected";
        assert!(parse_cluster_nodes(output).is_err());
        assert!(parse_cluster_nodes("garbage").is_err());
    }

    #[test]
    fn test_error_replies_detected() {
        assert!(is_error_reply("ERR Unknown node abc"));
        assert!(is_error_reply("(error) ERR I tried hard but I can't forget myself"));
        assert!(!is_error_reply("OK"));
        assert!(!is_error_reply(""));
    }

    #[test]
    fn test_split_address() {
        assert_eq!(split_address("10.0.0.10:6379").unwrap(), ("10.0.0.10", "6379"));
        assert!(split_address("10.0.0.10").is_err());
    }
}
