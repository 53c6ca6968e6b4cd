//! Cluster configuration persistence
//!
//! Serializer and parser for the store's textual, section-based
//! configuration format. The format is sparse: boolean and optional keys
//! (`readonly`, `preferred_master`, `master`, `quorum`, `witness`, ...) are
//! only written when set, and their absence means false/unset. The harness
//! must reproduce this convention exactly; the in-memory representation is
//! the typed [`ClusterTopology`].
//!
//! Layout:
//!
//! ```text
//! [global]
//! cluster = sturdy_0,sturdy_1
//! cluster_id = sturdy
//!
//! [sturdy_0]
//! client_port = 7080
//! home = /var/db/sturdy/sturdy_0
//! ...
//! ```
//!
//! Keys within a section are written alphabetically; node sections follow
//! join order. The local-nodes file is a single `[global]` section with one
//! sparse `cluster` key listing local node names in insertion order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::topology::{ClusterTopology, LocalNodeSet, Node, TopologyError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("line {line_no}: expected `key = value` or `[section]`, got {line:?}")]
    Syntax { line_no: usize, line: String },
    #[error("line {line_no}: key {key:?} outside any section")]
    KeyOutsideSection { line_no: usize, key: String },
    #[error("section {section:?} is missing key {key:?}")]
    MissingKey { section: String, key: String },
    #[error("section {section:?}: bad value {value:?} for key {key:?}")]
    BadValue {
        section: String,
        key: String,
        value: String,
    },
    #[error("node {0:?} is listed in `cluster` but has no section")]
    MissingSection(String),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Serialize a topology to the cluster configuration text.
pub fn to_config_text(topology: &ClusterTopology) -> String {
    let mut out = String::new();
    out.push_str("[global]\n");
    push_kv(
        &mut out,
        "cluster",
        &topology.list_nodes().join(","),
    );
    push_kv(&mut out, "cluster_id", topology.cluster_id());
    if let Some(lease) = topology.lease_period() {
        push_kv(&mut out, "lease_period", &lease.to_string());
    }
    if let Some(master) = topology.forced_master() {
        push_kv(&mut out, "master", master);
        if topology.preferred_master() {
            push_kv(&mut out, "preferred_master", "true");
        }
    }
    if let Some(quorum) = topology.quorum() {
        push_kv(&mut out, "quorum", &quorum.to_string());
    }
    if topology.read_only() {
        push_kv(&mut out, "readonly", "true");
    }

    for node in topology.nodes() {
        out.push('\n');
        out.push_str(&format!("[{}]\n", node.name));
        push_kv(&mut out, "client_port", &node.client_port.to_string());
        if let Some(slowdown) = node.collapse_slowdown {
            push_kv(&mut out, "collapse_slowdown", &slowdown.to_string());
        }
        if let Some(dir) = &node.head_dir {
            push_kv(&mut out, "head_dir", &dir.display().to_string());
        }
        push_kv(&mut out, "home", &node.home.display().to_string());
        push_kv(&mut out, "ip", &node.ip);
        push_kv(&mut out, "log_dir", &node.log_dir.display().to_string());
        push_kv(&mut out, "log_level", node.log_level.as_str());
        push_kv(
            &mut out,
            "messaging_port",
            &node.messaging_port.to_string(),
        );
        push_kv(&mut out, "name", &node.name);
        if let Some(dir) = &node.tlf_dir {
            push_kv(&mut out, "tlf_dir", &dir.display().to_string());
        }
        if node.is_witness {
            push_kv(&mut out, "witness", "true");
        }
    }
    out
}

/// Serialize the local-nodes list.
pub fn to_local_nodes_text(local: &LocalNodeSet) -> String {
    let mut out = String::new();
    out.push_str("[global]\n");
    if !local.is_empty() {
        push_kv(&mut out, "cluster", &local.list().join(","));
    }
    out
}

fn push_kv(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push_str(" = ");
    out.push_str(value);
    out.push('\n');
}

/// Raw parsed sections: section name -> key -> value. Insertion order of
/// sections is irrelevant to callers; node order comes from the `cluster`
/// key.
fn parse_sections(text: &str) -> Result<HashMap<String, HashMap<String, String>>, ConfigError> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current: Option<String> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::Syntax {
                line_no,
                line: raw.to_string(),
            });
        };
        let key = key.trim().to_string();
        let value = value.trim().to_string();
        match &current {
            Some(section) => {
                sections.entry(section.clone()).or_default().insert(key, value);
            }
            None => return Err(ConfigError::KeyOutsideSection { line_no, key }),
        }
    }
    Ok(sections)
}

fn get_required<'a>(
    section: &'a HashMap<String, String>,
    section_name: &str,
    key: &str,
) -> Result<&'a str, ConfigError> {
    section
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::MissingKey {
            section: section_name.to_string(),
            key: key.to_string(),
        })
}

fn parse_num<T: std::str::FromStr>(
    section_name: &str,
    key: &str,
    value: &str,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::BadValue {
        section: section_name.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Parse the cluster configuration text back into a topology.
///
/// `base_dir` seeds the directory defaults of the resulting topology for
/// nodes added later; all parsed nodes carry their explicit directories.
pub fn parse_config_text(text: &str, base_dir: &Path) -> Result<ClusterTopology, ConfigError> {
    let sections = parse_sections(text)?;
    let global = sections
        .get("global")
        .ok_or_else(|| ConfigError::MissingKey {
            section: "global".to_string(),
            key: "cluster".to_string(),
        })?;

    let cluster_id = get_required(global, "global", "cluster_id")?.to_string();
    let members = get_required(global, "global", "cluster")?;
    let member_names: Vec<&str> = if members.is_empty() {
        Vec::new()
    } else {
        members.split(',').map(str::trim).collect()
    };

    let mut nodes = Vec::with_capacity(member_names.len());
    for name in &member_names {
        let section = sections
            .get(*name)
            .ok_or_else(|| ConfigError::MissingSection(name.to_string()))?;
        nodes.push(parse_node(name, section)?);
    }

    let quorum = match global.get("quorum") {
        Some(v) => Some(parse_num("global", "quorum", v)?),
        None => None,
    };
    let lease_period = match global.get("lease_period") {
        Some(v) => Some(parse_num("global", "lease_period", v)?),
        None => None,
    };
    let forced_master = global.get("master").cloned();
    let preferred_master = global.get("preferred_master").map(String::as_str) == Some("true");
    let read_only = global.get("readonly").map(String::as_str) == Some("true");

    if let Some(master) = &forced_master {
        if !member_names.contains(&master.as_str()) {
            return Err(ConfigError::BadValue {
                section: "global".to_string(),
                key: "master".to_string(),
                value: master.clone(),
            });
        }
    }

    if preferred_master {
        if let Some(master) = &forced_master {
            for node in &mut nodes {
                node.is_preferred_master = &node.name == master;
            }
        }
    }

    Ok(ClusterTopology::restore(
        cluster_id,
        base_dir.to_path_buf(),
        nodes,
        quorum,
        forced_master,
        preferred_master,
        read_only,
        lease_period,
    ))
}

fn parse_node(name: &str, section: &HashMap<String, String>) -> Result<Node, ConfigError> {
    let client_port = parse_num(name, "client_port", get_required(section, name, "client_port")?)?;
    let messaging_port = parse_num(
        name,
        "messaging_port",
        get_required(section, name, "messaging_port")?,
    )?;
    let log_level = get_required(section, name, "log_level")?
        .parse()
        .map_err(ConfigError::Topology)?;
    let collapse_slowdown = match section.get("collapse_slowdown") {
        Some(v) => Some(parse_num(name, "collapse_slowdown", v)?),
        None => None,
    };
    Ok(Node {
        name: get_required(section, name, "name")?.to_string(),
        ip: get_required(section, name, "ip")?.to_string(),
        client_port,
        messaging_port,
        log_level,
        log_dir: PathBuf::from(get_required(section, name, "log_dir")?),
        home: PathBuf::from(get_required(section, name, "home")?),
        tlf_dir: section.get("tlf_dir").map(PathBuf::from),
        head_dir: section.get("head_dir").map(PathBuf::from),
        is_witness: section.get("witness").map(String::as_str) == Some("true"),
        is_preferred_master: false,
        collapse_slowdown,
    })
}

/// Parse the local-nodes file into the ordered name list.
pub fn parse_local_nodes_text(text: &str) -> Result<LocalNodeSet, ConfigError> {
    let sections = parse_sections(text)?;
    let names = match sections.get("global").and_then(|g| g.get("cluster")) {
        Some(joined) if !joined.is_empty() => joined
            .split(',')
            .map(|n| n.trim().to_string())
            .collect(),
        _ => Vec::new(),
    };
    Ok(LocalNodeSet::restore(names))
}
