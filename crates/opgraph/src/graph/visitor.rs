use std::fmt::Write as _;

use super::node::{Node, NodeKind};
use super::store::{Graph, TensorBinding};

/// Per-node-type callbacks; every method defaults to [`NodeVisitor::default_visit`].
pub trait NodeVisitor {
    fn visit_input(&mut self, node: &Node) {
        self.default_visit(node)
    }
    fn visit_const(&mut self, node: &Node) {
        self.default_visit(node)
    }
    fn visit_output(&mut self, node: &Node) {
        self.default_visit(node)
    }
    fn visit_flatten(&mut self, node: &Node) {
        self.default_visit(node)
    }
    fn visit_strided_slice(&mut self, node: &Node) {
        self.default_visit(node)
    }
    fn visit_depth_concatenate(&mut self, node: &Node) {
        self.default_visit(node)
    }
    fn visit_activation(&mut self, node: &Node) {
        self.default_visit(node)
    }
    fn visit_elementwise(&mut self, node: &Node) {
        self.default_visit(node)
    }
    fn visit_matmul(&mut self, node: &Node) {
        self.default_visit(node)
    }
    fn visit_convolution(&mut self, node: &Node) {
        self.default_visit(node)
    }
    fn visit_reverse(&mut self, node: &Node) {
        self.default_visit(node)
    }
    fn visit_dequantize(&mut self, node: &Node) {
        self.default_visit(node)
    }

    fn default_visit(&mut self, _node: &Node) {}
}

/// Renders one line per node in topological order.
///
/// ```text
/// n2 = depth_concatenate(t0, t1) -> t2: tensor<F32, 1x8x4x4, Nchw> [disabled]
/// ```
pub struct GraphPrinter<'g> {
    graph: &'g Graph,
    out: String,
}

impl<'g> GraphPrinter<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        GraphPrinter {
            graph,
            out: String::new(),
        }
    }

    pub fn render(graph: &Graph) -> String {
        let mut printer = GraphPrinter::new(graph);
        let order = match graph.topological_order() {
            Ok(order) => order,
            Err(err) => return format!("<invalid graph: {err}>"),
        };
        for id in order {
            if let Ok(node) = graph.node(id) {
                node.accept(&mut printer);
            }
        }
        printer.out
    }

    fn line(&mut self, node: &Node, detail: Option<String>) {
        let inputs: Vec<String> = node
            .inputs()
            .iter()
            .map(|slot| slot.map_or_else(|| "_".to_string(), |t| t.to_string()))
            .collect();
        let _ = write!(self.out, "{} = {}", node.id(), node.node_type());
        if let Some(detail) = detail {
            let _ = write!(self.out, "[{detail}]");
        }
        let _ = write!(self.out, "({})", inputs.join(", "));
        for tensor in node.outputs() {
            let _ = write!(self.out, " -> {tensor}");
            if let Some(desc) = self.graph.descriptor(*tensor) {
                let _ = write!(self.out, ": {desc}");
            }
            if let Ok(entry) = self.graph.tensor(*tensor) {
                match entry.binding() {
                    TensorBinding::Owned => {}
                    TensorBinding::SubTensor { parent, origin } => {
                        let _ = write!(self.out, " @{parent}{:?}", origin.as_slice());
                    }
                    TensorBinding::Alias { of } => {
                        let _ = write!(self.out, " ={of}");
                    }
                }
            }
        }
        if !node.is_enabled() {
            self.out.push_str(" [disabled]");
        }
        if let Some(name) = node.name() {
            let _ = write!(self.out, " \"{name}\"");
        }
        self.out.push('\n');
    }
}

impl NodeVisitor for GraphPrinter<'_> {
    fn visit_activation(&mut self, node: &Node) {
        let detail = match node.kind() {
            NodeKind::Activation(function) => Some(function.name().to_string()),
            _ => None,
        };
        self.line(node, detail);
    }

    fn visit_elementwise(&mut self, node: &Node) {
        let detail = match node.kind() {
            NodeKind::Elementwise { op, activation } => Some(match activation {
                Some(act) => format!("{op:?}+{}", act.name()),
                None => format!("{op:?}"),
            }),
            _ => None,
        };
        self.line(node, detail);
    }

    fn visit_convolution(&mut self, node: &Node) {
        let detail = match node.kind() {
            NodeKind::Convolution(info) => {
                let mut detail = format!("s{}x{}", info.stride_x, info.stride_y);
                if let Some(act) = info.activation {
                    detail.push('+');
                    detail.push_str(act.name());
                }
                Some(detail)
            }
            _ => None,
        };
        self.line(node, detail);
    }

    fn default_visit(&mut self, node: &Node) {
        let detail = node.kind().fused_activation().map(|act| act.name().to_string());
        self.line(node, detail);
    }
}
