// Copyright 2025 The Minsky Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::common::Ident;
use crate::ports::{Port, PortGraph, PortId};
use crate::variable::{VariableId, VariableKind, VariableRegistry};

pub type OperationId = usize;
pub type Operations = BTreeMap<OperationId, Operation>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Constant,
    Time,
    Copy,
    Integrate,
    Exp,
    Sqrt,
    Ln,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Add,
    Subtract,
    Multiply,
    Divide,
    Pow,
    Log,
}

impl OperationType {
    /// number of value arguments taken by the evaluator
    pub fn arity(self) -> usize {
        use OperationType::*;
        match self {
            Constant | Time => 0,
            Copy | Integrate | Exp | Sqrt | Ln | Sin | Cos | Tan | Asin | Acos | Atan | Sinh
            | Cosh | Tanh => 1,
            Add | Subtract | Multiply | Divide | Pow | Log => 2,
        }
    }

    pub fn is_binary_arithmetic(self) -> bool {
        use OperationType::*;
        matches!(self, Add | Subtract | Multiply | Divide)
    }

    pub fn type_name(self) -> &'static str {
        use OperationType::*;
        match self {
            Constant => "constant",
            Time => "time",
            Copy => "copy",
            Integrate => "integrate",
            Exp => "exp",
            Sqrt => "sqrt",
            Ln => "ln",
            Sin => "sin",
            Cos => "cos",
            Tan => "tan",
            Asin => "asin",
            Acos => "acos",
            Atan => "atan",
            Sinh => "sinh",
            Cosh => "cosh",
            Tanh => "tanh",
            Add => "add",
            Subtract => "subtract",
            Multiply => "multiply",
            Divide => "divide",
            Pow => "pow",
            Log => "log",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        use OperationType::*;
        let t = match name {
            "constant" => Constant,
            "time" => Time,
            "copy" => Copy,
            "integrate" => Integrate,
            "exp" => Exp,
            "sqrt" => Sqrt,
            "ln" => Ln,
            "sin" => Sin,
            "cos" => Cos,
            "tan" => Tan,
            "asin" => Asin,
            "acos" => Acos,
            "atan" => Atan,
            "sinh" => Sinh,
            "cosh" => Cosh,
            "tanh" => Tanh,
            "add" => Add,
            "subtract" => Subtract,
            "multiply" => Multiply,
            "divide" => Divide,
            "pow" => Pow,
            "log" => Log,
            _ => return None,
        };
        Some(t)
    }

    /// evaluate the operation on its arguments. Constants are resolved
    /// by the caller (they carry state); integrate never evaluates, the
    /// driver advances its stock.
    pub fn evaluate(self, x1: f64, x2: f64, t: f64) -> f64 {
        use OperationType::*;
        match self {
            Constant | Integrate => 0.0,
            Time => t,
            Copy => x1,
            Exp => x1.exp(),
            Sqrt => x1.sqrt(),
            Ln => x1.ln(),
            Sin => x1.sin(),
            Cos => x1.cos(),
            Tan => x1.tan(),
            Asin => x1.asin(),
            Acos => x1.acos(),
            Atan => x1.atan(),
            Sinh => x1.sinh(),
            Cosh => x1.cosh(),
            Tanh => x1.tanh(),
            Add => x1 + x2,
            Subtract => x1 - x2,
            Multiply => x1 * x2,
            Divide => x1 / x2,
            Pow => x1.powf(x2),
            Log => x1.ln() / x2.ln(),
        }
    }

    /// partial derivative with respect to the first argument
    pub fn d1(self, x1: f64, x2: f64) -> f64 {
        use OperationType::*;
        match self {
            Constant | Time | Integrate => 0.0,
            Copy => 1.0,
            Exp => x1.exp(),
            Sqrt => 0.5 / x1.sqrt(),
            Ln => 1.0 / x1,
            Sin => x1.cos(),
            Cos => -x1.sin(),
            Tan => 1.0 / (x1.cos() * x1.cos()),
            Asin => 1.0 / (1.0 - x1 * x1).sqrt(),
            Acos => -1.0 / (1.0 - x1 * x1).sqrt(),
            Atan => 1.0 / (1.0 + x1 * x1),
            Sinh => x1.cosh(),
            Cosh => x1.sinh(),
            Tanh => 1.0 / (x1.cosh() * x1.cosh()),
            Add | Subtract => 1.0,
            Multiply => x2,
            Divide => 1.0 / x2,
            Pow => x2 * x1.powf(x2 - 1.0),
            Log => 1.0 / (x1 * x2.ln()),
        }
    }

    /// partial derivative with respect to the second argument
    pub fn d2(self, x1: f64, x2: f64) -> f64 {
        use OperationType::*;
        match self {
            Add => 1.0,
            Subtract => -1.0,
            Multiply => x1,
            Divide => -x1 / (x2 * x2),
            Pow => x1.powf(x2) * x1.ln(),
            Log => -x1.ln() / (x2 * x2.ln() * x2.ln()),
            _ => 0.0,
        }
    }
}

/// An operator node on the canvas, owning its ports (output first).
#[derive(Clone, Debug)]
pub struct Operation {
    pub kind: OperationType,
    pub x: f64,
    pub y: f64,
    /// constant value (constants only)
    pub value: f64,
    /// display name of a constant, or the name of the integration
    /// variable of an integrate operation
    pub description: Ident,
    pub(crate) ports: SmallVec<[PortId; 4]>,
    /// the stock variable owned by an integrate operation
    pub(crate) int_var: Option<VariableId>,
}

impl Operation {
    /// create an operation, allocating its ports. An integrate
    /// operation also allocates its integration variable, whose output
    /// port doubles as the operation's (the coupled state).
    pub fn new(
        kind: OperationType,
        graph: &mut PortGraph,
        registry: &mut VariableRegistry,
    ) -> Self {
        let mut op = Operation {
            kind,
            x: 0.0,
            y: 0.0,
            value: 0.0,
            description: Ident::new(),
            ports: SmallVec::new(),
            int_var: None,
        };
        op.add_ports(graph, registry);
        op
    }

    fn add_ports(&mut self, graph: &mut PortGraph, registry: &mut VariableRegistry) {
        if self.kind == OperationType::Integrate {
            self.allocate_integral_variable(graph, registry);
            self.ports.push(graph.add_port(Port::new(0.0, 0.0, true)));
            return;
        }
        self.ports.push(graph.add_port(Port::new(0.0, 0.0, false)));
        let multi = self.kind.is_binary_arithmetic();
        for _ in 0..self.kind.arity() {
            let p = if multi {
                Port::multi_input(0.0, 0.0)
            } else {
                Port::new(0.0, 0.0, true)
            };
            self.ports.push(graph.add_port(p));
        }
    }

    /// bind (or rebind) the integration variable, uniquifying its name,
    /// and make its output port this operation's output port
    fn allocate_integral_variable(
        &mut self,
        graph: &mut PortGraph,
        registry: &mut VariableRegistry,
    ) {
        if self.description.is_empty() {
            self.description = "int".to_string();
        }
        if registry.values.contains_key(&self.description) {
            let mut i = 1;
            loop {
                let trial = format!("{}{}", self.description, i);
                if !registry.values.contains_key(&trial) {
                    self.description = trial;
                    break;
                }
                i += 1;
            }
        }
        let id = registry.add_variable(graph, VariableKind::Integral, &self.description);
        self.int_var = Some(id);
        let out = registry.get(id).unwrap().out_port().unwrap();
        if self.ports.is_empty() {
            self.ports.push(out);
        } else {
            self.ports[0] = out;
        }
    }

    pub fn ports(&self) -> &[PortId] {
        &self.ports
    }

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    pub fn int_var(&self) -> Option<VariableId> {
        self.int_var
    }

    /// true when the output port is the integration variable's own
    pub fn coupled(&self, registry: &VariableRegistry) -> bool {
        match self.int_var {
            Some(id) => {
                !self.ports.is_empty()
                    && registry.get(id).and_then(|v| v.out_port()) == Some(self.ports[0])
            }
            None => false,
        }
    }

    /// true if `from` is the output port and `to` one of the inputs
    pub fn self_wire(&self, from: PortId, to: PortId) -> bool {
        self.num_ports() > 1 && from == self.ports[0] && self.ports[1..].contains(&to)
    }

    pub fn move_to(&mut self, graph: &mut PortGraph, x: f64, y: f64) {
        let (dx, dy) = (x - self.x, y - self.y);
        self.x = x;
        self.y = y;
        for p in self.ports.iter() {
            graph.move_port(*p, dx, dy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_layout() {
        let mut graph = PortGraph::default();
        let mut reg = VariableRegistry::default();
        let c = Operation::new(OperationType::Constant, &mut graph, &mut reg);
        assert_eq!(1, c.num_ports());
        let e = Operation::new(OperationType::Exp, &mut graph, &mut reg);
        assert_eq!(2, e.num_ports());
        assert!(!graph.ports[&e.ports()[0]].input);
        assert!(graph.ports[&e.ports()[1]].input);
        let a = Operation::new(OperationType::Add, &mut graph, &mut reg);
        assert_eq!(3, a.num_ports());
        assert!(graph.ports[&a.ports()[1]].multi_wire_allowed);
        assert!(graph.ports[&a.ports()[2]].multi_wire_allowed);
    }

    #[test]
    fn test_integrate_owns_variable() {
        let mut graph = PortGraph::default();
        let mut reg = VariableRegistry::default();
        let i1 = Operation::new(OperationType::Integrate, &mut graph, &mut reg);
        assert_eq!("int", i1.description);
        assert!(i1.coupled(&reg));
        assert_eq!(2, i1.num_ports());
        // a second integral gets a uniquified name
        let i2 = Operation::new(OperationType::Integrate, &mut graph, &mut reg);
        assert_eq!("int1", i2.description);
        assert_eq!(
            VariableKind::Integral,
            reg.get(i2.int_var().unwrap()).unwrap().kind
        );
    }

    #[test]
    fn test_self_wire() {
        let mut graph = PortGraph::default();
        let mut reg = VariableRegistry::default();
        let a = Operation::new(OperationType::Add, &mut graph, &mut reg);
        assert!(a.self_wire(a.ports()[0], a.ports()[1]));
        assert!(!a.self_wire(a.ports()[1], a.ports()[0]));
    }

    #[test]
    fn test_derivatives_match_finite_differences() {
        use OperationType::*;
        let eps = 1e-7;
        let cases = [
            (Exp, 0.5, 0.0),
            (Sqrt, 2.0, 0.0),
            (Ln, 1.5, 0.0),
            (Sin, 0.7, 0.0),
            (Cos, 0.7, 0.0),
            (Tan, 0.4, 0.0),
            (Asin, 0.3, 0.0),
            (Acos, 0.3, 0.0),
            (Atan, 0.9, 0.0),
            (Sinh, 0.6, 0.0),
            (Cosh, 0.6, 0.0),
            (Tanh, 0.6, 0.0),
            (Add, 1.0, 2.0),
            (Subtract, 1.0, 2.0),
            (Multiply, 1.5, 2.5),
            (Divide, 1.5, 2.5),
            (Pow, 1.5, 2.5),
            (Log, 1.5, 2.5),
        ];
        for (op, x1, x2) in cases {
            let f0 = op.evaluate(x1, x2, 0.0);
            let d1 = (op.evaluate(x1 + eps, x2, 0.0) - f0) / eps;
            assert!(
                (d1 - op.d1(x1, x2)).abs() < 1e-4,
                "{} d1: {} vs {}",
                op.type_name(),
                d1,
                op.d1(x1, x2)
            );
            if op.arity() == 2 {
                let d2 = (op.evaluate(x1, x2 + eps, 0.0) - f0) / eps;
                assert!(
                    (d2 - op.d2(x1, x2)).abs() < 1e-4,
                    "{} d2: {} vs {}",
                    op.type_name(),
                    d2,
                    op.d2(x1, x2)
                );
            }
        }
    }
}
