//! Cluster configuration behavior
//!
//! Exercises the controller's topology mutations end to end against the
//! persisted configuration files: every mutation must land in the textual
//! sparse key=value format exactly, and invalid mutations must leave the
//! files untouched.

use std::sync::Arc;

use sturdy_harness::config::parse_config_text;
use sturdy_harness::testing::CannedProcessHost;
use sturdy_harness::topology::{ClusterTopology, LogLevel, NodeSpec, TopologyError};
use sturdy_harness::{ClusterController, ControllerError};

struct Fixture {
    controller: ClusterController,
    dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let topology = ClusterTopology::new("sturdy", dir.path());
    let controller = ClusterController::new(
        topology,
        Arc::new(CannedProcessHost::new()),
        dir.path().join("cfg"),
    )
    .unwrap();
    Fixture { controller, dir }
}

fn fixture_with(n: usize) -> Fixture {
    let mut fx = fixture();
    for i in 0..n {
        fx.controller
            .add_node(NodeSpec::new(format!("sturdy_{i}")))
            .unwrap();
    }
    fx
}

fn config_text(fx: &Fixture) -> String {
    std::fs::read_to_string(fx.controller.config_path()).unwrap()
}

fn local_nodes_text(fx: &Fixture) -> String {
    std::fs::read_to_string(fx.controller.local_nodes_path()).unwrap()
}

#[test]
fn add_node_persists_defaults() {
    let fx = fixture_with(1);
    let text = config_text(&fx);
    assert!(text.contains("cluster = sturdy_0"));
    assert!(text.contains("cluster_id = sturdy"));
    assert!(text.contains("[sturdy_0]"));
    assert!(text.contains("client_port = 7080"));
    assert!(text.contains("ip = 127.0.0.1"));
    assert!(text.contains("log_level = info"));
    assert!(text.contains("messaging_port = 10000"));

    let parsed = parse_config_text(&text, fx.dir.path()).unwrap();
    let node = parsed.node("sturdy_0").unwrap();
    assert_eq!(node.home, fx.dir.path().join("db/sturdy/sturdy_0"));
    assert_eq!(node.log_dir, fx.dir.path().join("log/sturdy/sturdy_0"));
}

#[test]
fn add_node_persists_explicit_attributes() {
    let mut fx = fixture_with(1);
    fx.controller
        .add_node(
            NodeSpec::new("sturdy_1")
                .ip("192.168.0.1")
                .client_port(7081)
                .messaging_port(12345)
                .log_level("debug")
                .unwrap()
                .log_dir("/tmp")
                .home("/tmp/joe"),
        )
        .unwrap();

    let text = config_text(&fx);
    assert!(text.contains("cluster = sturdy_0,sturdy_1"));

    let parsed = parse_config_text(&text, fx.dir.path()).unwrap();
    let node = parsed.node("sturdy_1").unwrap();
    assert_eq!(node.ip, "192.168.0.1");
    assert_eq!(node.client_port, 7081);
    assert_eq!(node.messaging_port, 12345);
    assert_eq!(node.log_level, LogLevel::Debug);
    assert_eq!(node.log_dir, std::path::Path::new("/tmp"));
    assert_eq!(node.home, std::path::Path::new("/tmp/joe"));
}

#[test]
fn add_node_rejects_invalid_names() {
    let mut fx = fixture();
    for bad in ["arak oon", "arak#oon", "arako,on"] {
        let err = fx.controller.add_node(NodeSpec::new(bad)).unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Topology(TopologyError::InvalidName(_))
        ));
    }
    assert!(fx.controller.list_nodes().is_empty());
}

#[test]
fn add_node_rejects_duplicate_name() {
    let mut fx = fixture_with(1);
    let before = config_text(&fx);
    let err = fx
        .controller
        .add_node(NodeSpec::new("sturdy_0"))
        .unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Topology(TopologyError::DuplicateNode(_))
    ));
    assert_eq!(config_text(&fx), before);
}

#[test]
fn add_node_rejects_bad_log_level() {
    let err = NodeSpec::new("sturdy_0").log_level("depug").unwrap_err();
    assert!(matches!(err, TopologyError::InvalidLogLevel(level) if level == "depug"));
}

#[test]
fn remove_node_drops_its_section() {
    let mut fx = fixture_with(2);
    fx.controller.remove_node("sturdy_0").unwrap();
    let text = config_text(&fx);
    assert!(text.contains("cluster = sturdy_1"));
    assert!(!text.contains("[sturdy_0]"));
}

#[test]
fn remove_unknown_node_fails() {
    let mut fx = fixture_with(3);
    let err = fx.controller.remove_node("sturdy_9").unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Topology(TopologyError::UnknownNode(_))
    ));
}

#[test]
fn force_master_round_trips_and_clears() {
    let mut fx = fixture_with(3);

    fx.controller.force_master(Some("sturdy_0"), false).unwrap();
    assert!(config_text(&fx).contains("master = sturdy_0"));

    fx.controller.force_master(Some("sturdy_1"), false).unwrap();
    assert!(config_text(&fx).contains("master = sturdy_1"));

    fx.controller.force_master(None, false).unwrap();
    assert!(!config_text(&fx).contains("master ="));
}

#[test]
fn force_unknown_master_fails() {
    let mut fx = fixture_with(3);
    let err = fx
        .controller
        .force_master(Some("sturdy_9"), false)
        .unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Topology(TopologyError::UnknownNode(_))
    ));
}

#[test]
fn preferred_master_is_a_sparse_flag() {
    let mut fx = fixture_with(3);
    fx.controller.force_master(Some("sturdy_0"), true).unwrap();
    let text = config_text(&fx);
    assert!(text.contains("master = sturdy_0"));
    assert!(text.contains("preferred_master = true"));
}

#[test]
fn quorum_round_trips() {
    let mut fx = fixture_with(3);
    fx.controller.set_quorum(1).unwrap();
    assert!(config_text(&fx).contains("quorum = 1"));
    fx.controller.set_quorum(2).unwrap();
    assert!(config_text(&fx).contains("quorum = 2"));
}

#[test]
fn illegal_quorum_is_rejected() {
    let mut fx = fixture_with(3);
    for bad in [0, 4] {
        let err = fx.controller.set_quorum(bad).unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Topology(TopologyError::InvalidQuorum { .. })
        ));
    }
    assert!(!config_text(&fx).contains("quorum"));
}

#[test]
fn readonly_flag_is_sparse() {
    let mut fx = fixture_with(1);
    fx.controller.set_read_only(true).unwrap();
    assert!(config_text(&fx).contains("readonly = true"));
    fx.controller.set_read_only(false).unwrap();
    assert!(!config_text(&fx).contains("readonly"));
}

#[test]
fn client_config_lists_members_in_join_order() {
    let fx = fixture_with(3);
    assert_eq!(
        fx.controller.client_config(),
        vec![
            ("sturdy_0", "127.0.0.1", 7080),
            ("sturdy_1", "127.0.0.1", 7081),
            ("sturdy_2", "127.0.0.1", 7082),
        ]
    );
}

#[test]
fn node_config_returns_supplied_attributes() {
    let fx = fixture_with(3);
    let node = fx.controller.node_config("sturdy_0").unwrap();
    assert_eq!(node.name, "sturdy_0");
    assert_eq!(node.client_port, 7080);

    let err = fx.controller.node_config("sturdy_x").unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Topology(TopologyError::UnknownNode(_))
    ));
}

#[test]
fn local_nodes_persist_in_insertion_order() {
    let mut fx = fixture_with(3);
    fx.controller.add_local_node("sturdy_1").unwrap();
    assert!(local_nodes_text(&fx).contains("cluster = sturdy_1"));

    fx.controller.add_local_node("sturdy_0").unwrap();
    assert!(local_nodes_text(&fx).contains("cluster = sturdy_1,sturdy_0"));
    assert_eq!(fx.controller.list_local_nodes(), ["sturdy_1", "sturdy_0"]);
}

#[test]
fn local_nodes_require_membership_and_uniqueness() {
    let mut fx = fixture();
    let err = fx.controller.add_local_node("sturdy_0").unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Topology(TopologyError::UnknownNode(_))
    ));

    fx.controller.add_node(NodeSpec::new("sturdy_0")).unwrap();
    fx.controller.add_local_node("sturdy_0").unwrap();
    let err = fx.controller.add_local_node("sturdy_0").unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Topology(TopologyError::DuplicateLocalNode(_))
    ));
}

#[test]
fn remove_local_node_round_trips() {
    let mut fx = fixture_with(3);
    fx.controller.add_local_node("sturdy_1").unwrap();
    fx.controller.remove_local_node("sturdy_1").unwrap();
    assert!(fx.controller.list_local_nodes().is_empty());
    assert!(!local_nodes_text(&fx).contains("sturdy_1"));
}
