// Compile-phase behavior: connection realization, activation and loss
// insertion, and failure atomicity.

use marten_core::{ComputeContext, Device, Error};
use marten_graph::{
    ActivationType, FullyConnectedLayer, GraphPhase, InputLayer, LayerNode, LossType, NetworkGraph,
};

fn engine() -> NetworkGraph {
    NetworkGraph::new(ComputeContext::acquire(Device::Cpu).unwrap())
}

fn input(name: &str, dim: (usize, usize)) -> LayerNode {
    LayerNode::new(name, Box::new(InputLayer::new(dim)))
}

fn fc(name: &str, units: usize) -> LayerNode {
    LayerNode::new(name, Box::new(FullyConnectedLayer::new(units)))
}

#[test]
fn test_empty_graph_rejected() {
    let mut net = engine();
    assert!(net.compile(None).is_err());
    assert_eq!(net.phase(), GraphPhase::Uninitialized);
}

#[test]
fn test_implicit_previous_node_connection() {
    let mut net = engine();
    net.add_layer(input("in", (1, 4))).unwrap();
    net.add_layer(fc("fc", 2)).unwrap();
    net.compile(None).unwrap();

    assert_eq!(net.phase(), GraphPhase::Compiled);
    assert_eq!(net.sorted_names(), vec!["in", "fc"]);
    let node = net.node("fc").unwrap();
    let node = node.borrow();
    assert_eq!(node.input_connections().to_vec(), vec!["in".to_string()]);
}

#[test]
fn test_fused_activation_splits_into_node() {
    let mut net = engine();
    net.add_layer(input("in", (1, 4))).unwrap();
    net.add_layer(fc("fc", 2).with_activation(ActivationType::Relu))
        .unwrap();
    net.compile(Some(LossType::Mse)).unwrap();

    assert_eq!(
        net.sorted_names(),
        vec!["in", "fc", "fc/activation", "loss"]
    );
    // The loss consumes the activation, not the host node.
    let loss = net.node("loss").unwrap();
    let loss = loss.borrow();
    assert_eq!(
        loss.input_connections().to_vec(),
        vec!["fc/activation".to_string()]
    );
    let fc_node = net.node("fc").unwrap();
    assert_eq!(
        fc_node.borrow().fused_activation(),
        ActivationType::None
    );
}

#[test]
fn test_loss_appended_behind_terminal() {
    let mut net = engine();
    net.add_layer(input("in", (1, 4))).unwrap();
    net.add_layer(fc("fc", 2)).unwrap();
    net.compile(Some(LossType::CrossEntropy)).unwrap();

    let names = net.sorted_names();
    assert_eq!(names.last().map(String::as_str), Some("loss"));
    let loss = net.node("loss").unwrap();
    let loss = loss.borrow();
    assert_eq!(loss.input_connections().to_vec(), vec!["fc".to_string()]);
    assert!(loss.requires_label());
}

#[test]
fn test_dangling_connection_fails_and_is_recoverable() {
    let mut net = engine();
    net.add_layer(input("in", (1, 4))).unwrap();
    net.add_layer(fc("fc", 2).with_inputs(&["ghost"])).unwrap();

    match net.compile(None) {
        Err(Error::InvalidParameter { node, .. }) => assert_eq!(node, "fc"),
        other => panic!("expected InvalidParameter, got {:?}", other.map(|_| ())),
    }
    // Nothing committed: the graph is still editable and compilable.
    assert_eq!(net.phase(), GraphPhase::Uninitialized);
    net.add_layer(input("ghost", (1, 4))).unwrap();
    net.compile(None).unwrap();
    assert_eq!(net.phase(), GraphPhase::Compiled);
}

#[test]
fn test_failed_compile_commits_no_realization() {
    let mut net = engine();
    net.add_layer(input("in", (1, 4))).unwrap();
    net.add_layer(fc("a", 2).with_activation(ActivationType::Relu))
        .unwrap();
    net.add_layer(fc("b", 2).with_inputs(&["ghost"])).unwrap();

    // The dangling connection fails the compile after activation and
    // loss realization already ran on the working copy.
    assert!(net.compile(Some(LossType::Mse)).is_err());
    assert_eq!(net.phase(), GraphPhase::Uninitialized);
    assert!(net.node("loss").is_err());
    assert!(net.node("a/activation").is_err());
    assert_eq!(
        net.node("a").unwrap().borrow().fused_activation(),
        ActivationType::Relu
    );

    // Satisfying the connection makes the same node set compile.
    net.add_layer(input("ghost", (1, 4))).unwrap();
    net.compile(Some(LossType::Mse)).unwrap();
    assert_eq!(net.phase(), GraphPhase::Compiled);
}

#[test]
fn test_loss_per_terminal_on_fanout() {
    let mut net = engine();
    net.add_layer(input("in", (1, 4))).unwrap();
    net.add_layer(fc("head_a", 2).with_inputs(&["in"])).unwrap();
    net.add_layer(fc("head_b", 3).with_inputs(&["in"])).unwrap();
    net.compile(Some(LossType::Mse)).unwrap();

    // Every head gets its own numbered loss, in declaration order.
    let names = net.sorted_names();
    assert!(names.contains(&"loss0".to_string()));
    assert!(names.contains(&"loss1".to_string()));
    let loss0 = net.node("loss0").unwrap();
    assert_eq!(
        loss0.borrow().input_connections().to_vec(),
        vec!["head_a".to_string()]
    );
    let loss1 = net.node("loss1").unwrap();
    assert_eq!(
        loss1.borrow().input_connections().to_vec(),
        vec!["head_b".to_string()]
    );
}

#[test]
fn test_cycle_rejected() {
    let mut net = engine();
    net.add_layer(fc("a", 2).with_inputs(&["b"])).unwrap();
    net.add_layer(fc("b", 2).with_inputs(&["a"])).unwrap();
    match net.compile(None) {
        Err(Error::Cycle(_)) => {}
        other => panic!("expected Cycle, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_double_compile_rejected() {
    let mut net = engine();
    net.add_layer(input("in", (1, 4))).unwrap();
    net.compile(None).unwrap();
    assert!(net.compile(None).is_err());
}

#[test]
fn test_extend_graph_prefixes_and_splices() {
    let mut net = engine();
    net.add_layer(input("in", (1, 4))).unwrap();
    net.add_layer(fc("trunk", 4)).unwrap();

    let ext = vec![fc("head", 2), fc("tail", 1).with_inputs(&["head"])];
    net.extend_graph(ext, "sub").unwrap();
    net.compile(None).unwrap();

    assert_eq!(
        net.sorted_names(),
        vec!["in", "trunk", "sub/head", "sub/tail"]
    );
    // The entry node splices onto the pre-extension tail; internal
    // references pick up the prefix.
    let head = net.node("sub/head").unwrap();
    assert_eq!(
        head.borrow().input_connections().to_vec(),
        vec!["trunk".to_string()]
    );
    let tail = net.node("sub/tail").unwrap();
    assert_eq!(
        tail.borrow().input_connections().to_vec(),
        vec!["sub/head".to_string()]
    );
}

#[test]
fn test_extend_graph_name_collision() {
    let mut net = engine();
    net.add_layer(input("in", (1, 4))).unwrap();
    net.add_layer(fc("x/head", 2)).unwrap();

    match net.extend_graph(vec![fc("head", 2)], "x") {
        Err(Error::DuplicateName(name)) => assert_eq!(name, "x/head"),
        other => panic!("expected DuplicateName, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_frozen_prefix_excluded_from_backward_set() {
    let mut net = engine();
    net.add_layer(input("in", (1, 2))).unwrap();
    net.add_layer(fc("frozen", 2).with_trainable(false)).unwrap();
    net.add_layer(fc("train", 2)).unwrap();
    net.compile(Some(LossType::Mse)).unwrap();

    assert!(!net.node("frozen").unwrap().borrow().needs_backwarding());
    assert!(net.node("train").unwrap().borrow().needs_backwarding());
    assert!(net.node("loss").unwrap().borrow().needs_backwarding());

    // Forward orders are topological indices; backward events follow
    // all forward events, innermost node last.
    let n = 4;
    let loss_order = net.node("loss").unwrap().borrow().exec_order();
    assert_eq!(loss_order.calc_gradient, n);
    assert_eq!(loss_order.calc_derivative, n + 1);
    assert_eq!(loss_order.apply_gradient, n + 2);
    let train_order = net.node("train").unwrap().borrow().exec_order();
    assert_eq!(train_order.calc_gradient, n + 3);
    let frozen_order = net.node("frozen").unwrap().borrow().exec_order();
    assert_eq!(frozen_order.calc_gradient, frozen_order.forward);
}
