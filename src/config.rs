//! Cluster configuration: file dialect and validated model.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::ConfigError;
use crate::types::{NodeId, OpKind, Operation};

/// Network location of one cluster node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddr {
    /// Unique node identifier.
    pub id: NodeId,
    /// Host name or address.
    pub host: String,
    /// TCP port the node listens on.
    pub port: u16,
}

impl NodeAddr {
    /// `host:port` form accepted by connectors.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Immutable cluster description.
///
/// Parsed once at startup, validated, then shared via `Arc`. Node ids
/// are dense indices `0..num_nodes`; `nodes` and `neighbors` are indexed
/// by id.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of nodes in the cluster.
    pub num_nodes: usize,
    /// Pause between consecutive schedule operations.
    pub min_delay: Duration,
    /// Network location of every node, indexed by id.
    pub nodes: Vec<NodeAddr>,
    /// Undirected neighbor lists, indexed by id. Messages flow only
    /// along these edges.
    pub neighbors: Vec<Vec<NodeId>>,
    /// The shared operation schedule, identical on every node.
    pub operations: Vec<Operation>,
    /// Directory checkpoint artifacts are written to.
    pub snapshot_dir: PathBuf,
}

impl ClusterConfig {
    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse the line-oriented cluster file dialect.
    ///
    /// `#` starts a comment, blank lines are skipped. The first
    /// digit-initial line is `<node-count> <min-delay-ms>`; the next
    /// `node-count` digit-initial lines are `<id> <host> <port>`; the
    /// `node-count` digit-initial lines after that are
    /// whitespace-separated neighbor ids, the k-th line belonging to
    /// node k. Every remaining line may carry one `(<id>,<kind>)`
    /// operation tuple, members in either order, kind `c` or `r`; lines
    /// without a recognizable tuple are ignored. Non-digit-initial
    /// lines inside the first three sections are treated as headers and
    /// skipped.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut header: Option<(usize, u64)> = None;
        let mut nodes: Vec<NodeAddr> = Vec::new();
        let mut neighbors: Vec<Vec<NodeId>> = Vec::new();
        let mut operations: Vec<Operation> = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let digit_initial = line.chars().next().is_some_and(|c| c.is_ascii_digit());

            let (num_nodes, _) = match header {
                None => {
                    if digit_initial {
                        header = Some(parse_header(line, line_no)?);
                    }
                    continue;
                }
                Some(h) => h,
            };

            if nodes.len() < num_nodes {
                if digit_initial {
                    nodes.push(parse_node_line(line, line_no)?);
                }
                continue;
            }

            if neighbors.len() < num_nodes {
                if digit_initial {
                    neighbors.push(parse_neighbor_line(line, line_no)?);
                }
                continue;
            }

            if let Some(op) = parse_operation_tuple(line) {
                operations.push(op);
            } else {
                debug!(line_no, content = line, "skipping non-operation line");
            }
        }

        let (num_nodes, min_delay_ms) = header.ok_or(ConfigError::Missing("global parameters"))?;
        if nodes.len() < num_nodes {
            return Err(ConfigError::Missing("node definitions"));
        }
        if neighbors.len() < num_nodes {
            return Err(ConfigError::Missing("neighbor lists"));
        }

        let config = Self {
            num_nodes,
            min_delay: Duration::from_millis(min_delay_ms),
            nodes,
            neighbors,
            operations,
            snapshot_dir: PathBuf::from("checkpoints"),
        };
        config.validate()
    }

    /// Set the directory checkpoint artifacts are written to.
    pub fn with_snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = dir.into();
        self
    }

    /// Neighbor list of `id`.
    pub fn neighbors_of(&self, id: NodeId) -> &[NodeId] {
        &self.neighbors[id as usize]
    }

    /// Network location of `id`.
    pub fn node_addr(&self, id: NodeId) -> &NodeAddr {
        &self.nodes[id as usize]
    }

    fn validate(mut self) -> Result<Self, ConfigError> {
        if self.num_nodes == 0 {
            return Err(ConfigError::Malformed {
                line: 0,
                reason: "node count must be positive".into(),
            });
        }

        // Node definitions carry their own ids; order them by id and
        // reject duplicates or out-of-range ids so positional lookups
        // hold afterwards.
        let mut by_id: Vec<Option<NodeAddr>> = vec![None; self.num_nodes];
        for node in self.nodes.drain(..) {
            let id = node.id;
            if id as usize >= self.num_nodes {
                return Err(ConfigError::NodeOutOfRange {
                    id,
                    num_nodes: self.num_nodes,
                });
            }
            if by_id[id as usize].replace(node).is_some() {
                return Err(ConfigError::Malformed {
                    line: 0,
                    reason: format!("duplicate definition for node {id}"),
                });
            }
        }
        self.nodes = by_id
            .into_iter()
            .map(|n| n.ok_or(ConfigError::Missing("node definitions")))
            .collect::<Result<_, _>>()?;

        for list in &self.neighbors {
            for &id in list {
                if id as usize >= self.num_nodes {
                    return Err(ConfigError::NodeOutOfRange {
                        id,
                        num_nodes: self.num_nodes,
                    });
                }
            }
        }

        for op in &self.operations {
            if op.owner as usize >= self.num_nodes {
                return Err(ConfigError::NodeOutOfRange {
                    id: op.owner,
                    num_nodes: self.num_nodes,
                });
            }
        }

        Ok(self)
    }
}

fn parse_header(line: &str, line_no: usize) -> Result<(usize, u64), ConfigError> {
    let mut tokens = line.split_whitespace();
    let num_nodes = next_token(&mut tokens, line_no, "node count")?;
    let min_delay = next_token(&mut tokens, line_no, "min delay")?;
    Ok((num_nodes, min_delay))
}

fn parse_node_line(line: &str, line_no: usize) -> Result<NodeAddr, ConfigError> {
    let mut tokens = line.split_whitespace();
    let id = next_token(&mut tokens, line_no, "node id")?;
    let host = tokens.next().ok_or(ConfigError::Malformed {
        line: line_no,
        reason: "missing host".into(),
    })?;
    let port = next_token(&mut tokens, line_no, "port")?;
    Ok(NodeAddr {
        id,
        host: host.to_string(),
        port,
    })
}

fn parse_neighbor_line(line: &str, line_no: usize) -> Result<Vec<NodeId>, ConfigError> {
    line.split_whitespace()
        .map(|tok| {
            tok.parse().map_err(|_| ConfigError::Malformed {
                line: line_no,
                reason: format!("invalid neighbor id '{tok}'"),
            })
        })
        .collect()
}

/// Extract one `(a,b)` operation tuple from a line, members in either
/// order. Returns `None` when the line carries no recognizable tuple.
fn parse_operation_tuple(line: &str) -> Option<Operation> {
    let start = line.find('(')?;
    let rest = &line[start + 1..];
    let end = rest.find(')')?;
    let inner = &rest[..end];

    let (first, second) = inner.split_once(',')?;
    let (first, second) = (first.trim(), second.trim());

    let (id, kind) = if let Ok(id) = first.parse::<NodeId>() {
        (id, second)
    } else if let Ok(id) = second.parse::<NodeId>() {
        (id, first)
    } else {
        return None;
    };

    let kind = match kind {
        "c" => OpKind::Checkpoint,
        "r" => OpKind::Recovery,
        other => {
            debug!(kind = other, "ignoring operation tuple with unknown kind");
            return None;
        }
    };

    Some(Operation { owner: id, kind })
}

fn next_token<T: std::str::FromStr>(
    tokens: &mut std::str::SplitWhitespace<'_>,
    line_no: usize,
    what: &str,
) -> Result<T, ConfigError> {
    let tok = tokens.next().ok_or_else(|| ConfigError::Malformed {
        line: line_no,
        reason: format!("missing {what}"),
    })?;
    tok.parse().map_err(|_| ConfigError::Malformed {
        line: line_no,
        reason: format!("invalid {what} '{tok}'"),
    })
}
