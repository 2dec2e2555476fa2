// End-to-end engine behavior: forward/backward numerics, in-place
// aliasing, gradient application, batch-size changes, execution modes.

use marten_core::{ComputeContext, Device, Error};
use marten_graph::{
    ActivationLayer, ActivationType, ExecMode, FullyConnectedLayer, GraphPhase, IdentityLayer,
    InputLayer, LayerNode, LossType, MultiOutLayer, NetworkGraph,
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

fn identity(name: &str, inputs: &[&str]) -> LayerNode {
    LayerNode::new(name, Box::new(IdentityLayer::new())).with_inputs(inputs)
}

/// Overwrite a fully connected node's weight and bias with constants.
fn set_fc_params(net: &NetworkGraph, name: &str, w: f32, b: f32) {
    let node = net.node(name).unwrap();
    let node = node.borrow();
    let rc = node.run_context().unwrap();
    rc.weight(0).unwrap().fill(w);
    rc.weight(1).unwrap().fill(b);
}

#[test]
fn test_forward_values_through_fc_and_loss() {
    let mut net = engine();
    net.add_layer(input("in", (1, 2))).unwrap();
    net.add_layer(fc("fc", 3)).unwrap();
    net.compile(Some(LossType::Mse)).unwrap();
    net.initialize(&[], &[]).unwrap();
    net.allocate_tensors(ExecMode::Train).unwrap();
    set_fc_params(&net, "fc", 1.0, 0.5);

    net.set_inputs(&[&[1.0, 2.0]]).unwrap();
    net.set_labels(&[&[3.5, 3.5, 3.5]]).unwrap();
    net.forwarding(true).unwrap();

    let fc_node = net.node("fc").unwrap();
    let fc_node = fc_node.borrow();
    let out = fc_node.run_context().unwrap().output(0).unwrap();
    assert_eq!(out.to_vec(), vec![3.5, 3.5, 3.5]);
    assert!(net.loss().unwrap().abs() < 1e-6);
}

#[test]
fn test_backward_gradients_and_single_apply() {
    let mut net = engine();
    net.add_layer(input("in", (1, 1))).unwrap();
    net.add_layer(fc("fc", 1)).unwrap();
    net.compile(Some(LossType::Mse)).unwrap();
    net.initialize(&[], &[]).unwrap();
    net.allocate_tensors(ExecMode::Train).unwrap();
    set_fc_params(&net, "fc", 1.0, 0.0);

    net.set_inputs(&[&[2.0]]).unwrap();
    net.set_labels(&[&[0.0]]).unwrap();
    net.forwarding(true).unwrap();
    assert!((net.loss().unwrap() - 4.0).abs() < 1e-6);

    // dL/dpred = 2 * (2 - 0) = 4, so dW = x * 4 = 8 and db = 4.
    let mut applied = Vec::new();
    net.backwarding(0, |w, g, _| {
        applied.push((w.name().to_string(), g.to_vec()));
        Ok(())
    })
    .unwrap();

    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0].0, "fc:weight");
    assert_eq!(applied[0].1, vec![8.0]);
    assert_eq!(applied[1].0, "fc:bias");
    assert_eq!(applied[1].1, vec![4.0]);

    // Buffers are zeroed each pass: a second identical iteration
    // reproduces the gradients instead of doubling them.
    net.forwarding(true).unwrap();
    let mut second = Vec::new();
    net.backwarding(1, |_, g, _| {
        second.push(g.to_vec());
        Ok(())
    })
    .unwrap();
    assert_eq!(second, vec![vec![8.0], vec![4.0]]);
}

#[test]
fn test_sgd_step_reduces_loss() {
    let mut net = engine();
    net.add_layer(input("in", (1, 1))).unwrap();
    net.add_layer(fc("fc", 1)).unwrap();
    net.compile(Some(LossType::Mse)).unwrap();
    net.initialize(&[], &[]).unwrap();
    net.allocate_tensors(ExecMode::Train).unwrap();
    set_fc_params(&net, "fc", 1.0, 0.0);

    net.set_inputs(&[&[2.0]]).unwrap();
    net.set_labels(&[&[0.0]]).unwrap();

    net.forwarding(true).unwrap();
    let before = net.loss().unwrap();
    net.backwarding(0, |w, g, _| {
        let grad = g.to_vec();
        let mut view = w.write();
        for (x, d) in view.iter_mut().zip(grad) {
            *x -= 0.05 * d;
        }
        Ok(())
    })
    .unwrap();
    net.forwarding(true).unwrap();
    assert!(net.loss().unwrap() < before);
}

#[test]
fn test_frozen_prefix_skipped_in_backward() {
    let mut net = engine();
    net.add_layer(input("in", (1, 2))).unwrap();
    net.add_layer(fc("frozen", 2).with_trainable(false)).unwrap();
    net.add_layer(fc("train", 1)).unwrap();
    net.compile(Some(LossType::Mse)).unwrap();
    net.initialize(&[], &[]).unwrap();
    net.allocate_tensors(ExecMode::Train).unwrap();
    set_fc_params(&net, "frozen", 1.0, 0.0);
    set_fc_params(&net, "train", 1.0, 0.0);

    // Frozen nodes register no gradient tensors at all.
    {
        let frozen = net.node("frozen").unwrap();
        let frozen = frozen.borrow();
        assert!(frozen.run_context().unwrap().weight_grad(0).is_err());
    }

    net.set_inputs(&[&[1.0, 1.0]]).unwrap();
    net.set_labels(&[&[0.0]]).unwrap();
    net.forwarding(true).unwrap();

    let mut applied = Vec::new();
    net.backwarding(0, |w, _, _| {
        applied.push(w.name().to_string());
        Ok(())
    })
    .unwrap();
    assert_eq!(applied, vec!["train:weight".to_string(), "train:bias".to_string()]);
}

#[test]
fn test_restricted_in_place_on_single_chain() {
    let mut net = engine();
    net.add_layer(input("in", (1, 4))).unwrap();
    net.add_layer(
        LayerNode::new("act", Box::new(ActivationLayer::new(ActivationType::Relu)))
            .with_inputs(&["in"]),
    )
    .unwrap();
    net.compile(None).unwrap();
    net.initialize(&[], &[]).unwrap();
    net.allocate_tensors(ExecMode::Train).unwrap();

    let act = net.node("act").unwrap();
    let act = act.borrow();
    let rc = act.run_context().unwrap();
    assert!(rc.output(0).unwrap().aliases(&rc.input(0).unwrap()));

    drop(act);
    net.set_inputs(&[&[-1.0, 2.0, -3.0, 4.0]]).unwrap();
    net.forwarding(true).unwrap();
    let outputs = net.output_tensors().unwrap();
    assert_eq!(outputs[0].to_vec(), vec![0.0, 2.0, 0.0, 4.0]);
}

#[test]
fn test_fan_out_blocks_in_place() {
    let mut net = engine();
    net.add_layer(input("in", (1, 4))).unwrap();
    net.add_layer(
        LayerNode::new("act", Box::new(ActivationLayer::new(ActivationType::Relu)))
            .with_inputs(&["in"]),
    )
    .unwrap();
    net.add_layer(identity("id", &["in"])).unwrap();
    net.compile(None).unwrap();
    net.initialize(&[], &[]).unwrap();
    net.allocate_tensors(ExecMode::Train).unwrap();

    // "in" feeds two consumers, so neither may overwrite it.
    let act = net.node("act").unwrap();
    let act = act.borrow();
    let rc = act.run_context().unwrap();
    assert!(!rc.output(0).unwrap().aliases(&rc.input(0).unwrap()));
}

#[test]
fn test_non_restricted_in_place_aliases_derivatives() {
    let mut net = engine();
    net.add_layer(input("in", (1, 2))).unwrap();
    net.add_layer(identity("id", &["in"])).unwrap();
    net.compile(Some(LossType::Mse)).unwrap();
    net.initialize(&[], &[]).unwrap();
    net.allocate_tensors(ExecMode::Train).unwrap();

    {
        let id = net.node("id").unwrap();
        let id = id.borrow();
        let rc = id.run_context().unwrap();
        assert!(rc.output(0).unwrap().aliases(&rc.input(0).unwrap()));
        assert!(rc
            .outgoing_derivative(0)
            .unwrap()
            .aliases(&rc.incoming_derivative(0).unwrap()));
    }

    net.set_inputs(&[&[1.0, 2.0]]).unwrap();
    net.set_labels(&[&[0.0, 0.0]]).unwrap();
    net.forwarding(true).unwrap();
    net.backwarding(0, |_, _, _| Ok(())).unwrap();

    // dL/dpred = 2 * pred / n flows through the aliased pair untouched.
    let id = net.node("id").unwrap();
    let id = id.borrow();
    let grad = id.run_context().unwrap().outgoing_derivative(0).unwrap();
    assert_eq!(grad.to_vec(), vec![1.0, 2.0]);
}

#[test]
fn test_multiout_gives_each_consumer_its_own_copy() {
    let mut net = engine();
    net.add_layer(input("in", (1, 3))).unwrap();
    net.add_layer(
        LayerNode::new("mo", Box::new(MultiOutLayer::new(2))).with_inputs(&["in"]),
    )
    .unwrap();
    net.add_layer(identity("c1", &["mo"])).unwrap();
    net.add_layer(identity("c2", &["mo"])).unwrap();
    net.compile(None).unwrap();
    net.initialize(&[], &[]).unwrap();
    net.allocate_tensors(ExecMode::Train).unwrap();

    {
        let c1 = net.node("c1").unwrap();
        let c1 = c1.borrow();
        let c2 = net.node("c2").unwrap();
        let c2 = c2.borrow();
        let in1 = c1.run_context().unwrap().input(0).unwrap();
        let in2 = c2.run_context().unwrap().input(0).unwrap();
        assert_eq!(in1.dim().dims(), &[1, 3]);
        assert!(!in1.aliases(&in2));
    }

    net.set_inputs(&[&[1.0, 2.0, 3.0]]).unwrap();
    net.forwarding(true).unwrap();
    let outputs = net.output_tensors().unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].to_vec(), vec![1.0, 2.0, 3.0]);
    assert_eq!(outputs[1].to_vec(), vec![1.0, 2.0, 3.0]);
}

#[test]
fn test_multiout_rejects_excess_consumers() {
    let mut net = engine();
    net.add_layer(input("in", (1, 3))).unwrap();
    net.add_layer(
        LayerNode::new("mo", Box::new(MultiOutLayer::new(2))).with_inputs(&["in"]),
    )
    .unwrap();
    net.add_layer(identity("c1", &["mo"])).unwrap();
    net.add_layer(identity("c2", &["mo"])).unwrap();
    net.add_layer(identity("c3", &["mo"])).unwrap();
    net.compile(None).unwrap();

    // Three consumers for two declared outputs: no silent sharing.
    match net.initialize(&[], &[]) {
        Err(Error::InvalidParameter { node, .. }) => assert_eq!(node, "mo"),
        other => panic!("expected InvalidParameter, got {:?}", other),
    }
}

#[test]
fn test_memory_reuse_matches_unoptimized_gradients() {
    // Equal-width chain so packed regions line up across activation
    // and gradient buffers of different nodes.
    let run = |optimize: bool| -> Vec<(String, Vec<f32>)> {
        let mut net = engine();
        net.set_memory_optimizations(optimize).unwrap();
        net.add_layer(input("in", (1, 4))).unwrap();
        net.add_layer(fc("fc1", 4)).unwrap();
        net.add_layer(fc("fc2", 4)).unwrap();
        net.add_layer(fc("fc3", 4)).unwrap();
        net.compile(Some(LossType::Mse)).unwrap();
        net.initialize(&[], &[]).unwrap();
        net.allocate_tensors(ExecMode::Train).unwrap();
        for name in ["fc1", "fc2", "fc3"] {
            set_fc_params(&net, name, 0.1, 0.0);
        }

        net.set_inputs(&[&[1.0; 4]]).unwrap();
        net.set_labels(&[&[0.0; 4]]).unwrap();
        net.forwarding(true).unwrap();

        let mut applied = Vec::new();
        net.backwarding(0, |w, g, _| {
            applied.push((w.name().to_string(), g.to_vec()));
            Ok(())
        })
        .unwrap();
        applied
    };

    let reference = run(false);
    let optimized = run(true);

    // fc3 sees activations of 0.16 and a loss derivative of 0.032 per
    // element, so its weight gradient is 0.16 * 0.032 everywhere.
    let (_, fc3_w) = reference
        .iter()
        .find(|(n, _)| n == "fc3:weight")
        .unwrap();
    for g in fc3_w {
        assert!((g - 0.00512).abs() < 1e-6);
    }

    // Packing tensors into shared regions must not change a single
    // gradient value.
    assert_eq!(reference.len(), optimized.len());
    for ((rn, rg), (on, og)) in reference.iter().zip(&optimized) {
        assert_eq!(rn, on);
        assert_eq!(rg.len(), og.len());
        for (a, b) in rg.iter().zip(og) {
            assert!((a - b).abs() < 1e-6, "{}: {} vs {}", rn, a, b);
        }
    }
}

#[test]
fn test_cross_entropy_uniform_logits() {
    let mut net = engine();
    net.add_layer(input("in", (1, 3))).unwrap();
    net.compile(Some(LossType::CrossEntropy)).unwrap();
    net.initialize(&[], &[]).unwrap();
    net.allocate_tensors(ExecMode::Train).unwrap();

    net.set_inputs(&[&[0.0, 0.0, 0.0]]).unwrap();
    net.set_labels(&[&[1.0, 0.0, 0.0]]).unwrap();
    net.forwarding(true).unwrap();
    assert!((net.loss().unwrap() - 3.0f32.ln()).abs() < 1e-5);
}

#[test]
fn test_inference_mode_skips_gradient_state() {
    let mut net = engine();
    net.add_layer(input("in", (1, 2))).unwrap();
    net.add_layer(fc("fc", 2)).unwrap();
    net.compile(Some(LossType::Mse)).unwrap();
    net.initialize(&[], &[]).unwrap();
    net.allocate_tensors(ExecMode::Inference).unwrap();
    set_fc_params(&net, "fc", 0.5, 0.0);

    net.set_inputs(&[&[1.0, 1.0]]).unwrap();
    net.forwarding(false).unwrap();

    // Derivative buffers were never materialized.
    let fc_node = net.node("fc").unwrap();
    let fc_node = fc_node.borrow();
    assert!(fc_node
        .run_context()
        .unwrap()
        .incoming_derivative(0)
        .is_err());
    drop(fc_node);

    assert!(net.backwarding(0, |_, _, _| Ok(())).is_err());
}

#[test]
fn test_set_batch_size_keeps_weights() {
    let mut net = engine();
    net.add_layer(input("in", (2, 2))).unwrap();
    net.add_layer(fc("fc", 2)).unwrap();
    net.compile(Some(LossType::Mse)).unwrap();
    net.initialize(&[], &[]).unwrap();
    net.allocate_tensors(ExecMode::Train).unwrap();
    set_fc_params(&net, "fc", 1.0, 0.0);
    assert_eq!(net.batch_size(), 2);

    net.set_batch_size(4).unwrap();
    assert_eq!(net.phase(), GraphPhase::Initialized);
    net.allocate_tensors(ExecMode::Train).unwrap();

    assert_eq!(net.input_dimensions().unwrap()[0].batch(), 4);
    {
        let fc_node = net.node("fc").unwrap();
        let fc_node = fc_node.borrow();
        let w = fc_node.run_context().unwrap().weight(0).unwrap();
        assert_eq!(w.to_vec(), vec![1.0; 4]);
    }

    net.set_inputs(&[&[1.0; 8]]).unwrap();
    net.forwarding(true).unwrap();
    let fc_node = net.node("fc").unwrap();
    let fc_node = fc_node.borrow();
    let out = fc_node.run_context().unwrap().output(0).unwrap();
    assert_eq!(out.to_vec(), vec![2.0; 8]);
}

#[test]
fn test_phase_guards() {
    let mut net = engine();
    net.add_layer(input("in", (1, 2))).unwrap();
    assert!(net.initialize(&[], &[]).is_err());
    assert!(net.forwarding(true).is_err());

    net.compile(None).unwrap();
    assert!(net.add_layer(fc("late", 2)).is_err());
    assert!(net.forwarding(true).is_err());

    net.initialize(&[], &[]).unwrap();
    assert!(net.forwarding(true).is_err());
    net.allocate_tensors(ExecMode::Train).unwrap();
    net.set_inputs(&[&[0.0, 0.0]]).unwrap();
    net.forwarding(true).unwrap();
}
