// Copyright 2025 The Minsky Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Re-materialises the wired graph as an expression tree and renders
//! it as a LaTeX eqnarray, one line per computed variable and one
//! d/dt line per integral and Godley stock. Parenthesisation follows
//! BODMAS levels: a child is wrapped when its level exceeds the
//! parent's, with two deliberate quirks around subtraction and
//! division covered by golden tests below.

use std::collections::{BTreeMap, HashMap};

use crate::common::Ident;
use crate::model::Model;
use crate::operation::{OperationId, OperationType};
use crate::ports::{PortId, WireId};
use crate::variable::VariableKind;

#[derive(Clone, Debug)]
pub enum Node {
    Zero,
    One,
    Variable(Ident),
    Operation(OperationNode),
    /// a Godley column: signed variable names, "-" prefixed when the
    /// flow leaves the stock
    GodleyColumn(Vec<Ident>),
}

#[derive(Clone, Debug)]
pub struct OperationNode {
    pub kind: OperationType,
    pub name: Ident,
    /// one list of feeding expressions per input port
    pub args: Vec<Vec<Node>>,
}

impl Node {
    /// algebraic hierarchy level, used for working out whether
    /// brackets are necessary; lower binds tighter
    pub fn bodmas_level(&self) -> i32 {
        match self {
            Node::Zero | Node::One | Node::Variable(_) => 0,
            Node::GodleyColumn(_) => 2,
            Node::Operation(op) => match op.kind {
                OperationType::Multiply | OperationType::Divide => 1,
                OperationType::Add | OperationType::Subtract => 2,
                // varies, depending on what's in it
                OperationType::Constant => {
                    if op.name.contains(['+', '-']) {
                        2
                    } else {
                        1
                    }
                }
                _ => 0,
            },
        }
    }

    pub fn latex(&self) -> String {
        match self {
            Node::Zero => "0".to_string(),
            Node::One => "1".to_string(),
            Node::Variable(name) => mathrm(name),
            Node::GodleyColumn(terms) => {
                let mut o = String::new();
                for (i, term) in terms.iter().enumerate() {
                    match term.strip_prefix('-') {
                        Some(rest) => {
                            o.push('-');
                            o.push_str(&mathrm(rest));
                        }
                        None => {
                            if i > 0 {
                                o.push('+');
                            }
                            o.push_str(&mathrm(term));
                        }
                    }
                }
                o
            }
            Node::Operation(op) => op.latex(self.bodmas_level()),
        }
    }
}

impl OperationNode {
    fn latex(&self, level: i32) -> String {
        use OperationType::*;
        match self.kind {
            Constant => mathrm(&self.name),
            Time => " t ".to_string(),
            // integration is rendered through its stock variable
            Integrate => mathrm(&self.name),
            Copy => self.first_arg().map(|n| n.latex()).unwrap_or_default(),
            Sqrt => format!("\\sqrt{{{}}}", self.first_arg_latex()),
            Exp | Ln | Sin | Cos | Tan | Asin | Acos | Atan | Sinh | Cosh | Tanh => {
                let f = match self.kind {
                    Exp => "\\exp",
                    Ln => "\\ln",
                    Sin => "\\sin",
                    Cos => "\\cos",
                    Tan => "\\tan",
                    Asin => "\\arcsin",
                    Acos => "\\arccos",
                    Atan => "\\arctan",
                    Sinh => "\\sinh",
                    Cosh => "\\cosh",
                    Tanh => "\\tanh",
                    _ => unreachable!(),
                };
                format!("{}\\left({}\\right)", f, self.first_arg_latex())
            }
            Add => {
                let mut o = String::new();
                o.push_str(&join_plus(self.arg(0)));
                if !self.arg(0).is_empty() && !self.arg(1).is_empty() {
                    o.push('+');
                }
                o.push_str(&join_plus(self.arg(1)));
                o
            }
            Subtract => {
                let mut o = String::new();
                o.push_str(&join_plus(self.arg(0)));
                let rhs = self.arg(1);
                if !rhs.is_empty() {
                    o.push('-');
                    // parenthesise a multi-term subtrahend, and also on
                    // level equality (not just excess)
                    let wrap = rhs.len() > 1 || level == rhs[0].bodmas_level();
                    o.push_str(&paren_if(join_plus(rhs), wrap));
                }
                o
            }
            Multiply => {
                let mut o = String::new();
                let mut first = true;
                for arg in [self.arg(0), self.arg(1)] {
                    for n in arg {
                        if !first {
                            o.push_str("\\times ");
                        }
                        first = false;
                        o.push_str(&paren_if(n.latex(), n.bodmas_level() > level));
                    }
                }
                o
            }
            Divide => {
                // \frac never parenthesises its direct children;
                // interior products test the numerator's levels in
                // both halves
                let numerator = self.arg(0);
                let mut o = "\\frac{".to_string();
                o.push_str(&join_times_against(numerator, numerator, level));
                o.push_str("}{");
                o.push_str(&join_times_against(self.arg(1), numerator, level));
                o.push('}');
                o
            }
            Pow => {
                let base = match self.first_arg() {
                    Some(n) => paren_if(n.latex(), n.bodmas_level() > 0),
                    None => "1".to_string(),
                };
                let exponent = self
                    .arg(1)
                    .first()
                    .map(|n| n.latex())
                    .unwrap_or_else(|| "1".to_string());
                format!("{{{}}}^{{{}}}", base, exponent)
            }
            Log => {
                let base = self
                    .arg(1)
                    .first()
                    .map(|n| n.latex())
                    .unwrap_or_else(|| "e".to_string());
                format!("\\log_{{{}}}\\left({}\\right)", base, self.first_arg_latex())
            }
        }
    }

    fn arg(&self, i: usize) -> &[Node] {
        self.args.get(i).map(|v| v.as_slice()).unwrap_or(&[])
    }

    fn first_arg(&self) -> Option<&Node> {
        self.arg(0).first()
    }

    fn first_arg_latex(&self) -> String {
        self.first_arg().map(|n| n.latex()).unwrap_or_default()
    }
}

fn paren_if(s: String, wrap: bool) -> String {
    if wrap {
        format!("\\left({}\\right)", s)
    } else {
        s
    }
}

fn join_plus(nodes: &[Node]) -> String {
    nodes
        .iter()
        .map(|n| n.latex())
        .collect::<Vec<_>>()
        .join("+")
}

/// join a product, wrapping interior factors by the paired argument
/// list's levels; an empty product renders as 1
fn join_times_against(nodes: &[Node], against: &[Node], level: i32) -> String {
    if nodes.is_empty() {
        return "1".to_string();
    }
    let mut o = String::new();
    for (i, n) in nodes.iter().enumerate() {
        if i > 0 {
            o.push_str("\\times ");
        }
        let wrap = i > 0
            && against
                .get(i)
                .map(|a| a.bodmas_level() > level)
                .unwrap_or(false);
        o.push_str(&paren_if(n.latex(), wrap));
    }
    o
}

/// wraps in \mathrm if the name has more than one letter, splitting
/// LaTeX sub/superscripts into recursively rendered halves
pub fn mathrm(nm: &str) -> String {
    if let Some(ss) = nm.find(['_', '^']) {
        return format!(
            "{}{}{}",
            mathrm(&nm[..ss]),
            &nm[ss..=ss],
            mathrm(&nm[ss + 1..])
        );
    }
    if nm.chars().count() == 1 || nm.contains('\\') {
        nm.to_string()
    } else {
        format!("\\mathrm{{{}}}", nm)
    }
}

/// The system of equations implied by the graph, rebuilt as a tree
/// (not fed to the solver) for rendering.
pub struct SystemOfEquations {
    variables: Vec<(Ident, Option<Node>)>,
    integration_variables: Vec<(Ident, Option<Node>)>,
}

impl SystemOfEquations {
    pub fn new(model: &Model) -> Self {
        let mut port_to_operation: HashMap<PortId, OperationId> = HashMap::new();
        for (id, op) in &model.operations {
            for p in op.ports() {
                port_to_operation.insert(*p, *id);
            }
        }

        let mut sys = SystemOfEquations {
            variables: Vec::new(),
            integration_variables: Vec::new(),
        };

        // integrals defined by integrate operations
        for op in model.operations.values() {
            if op.kind == OperationType::Integrate {
                let rhs = model
                    .graph
                    .wires_attached_to(op.ports()[1])
                    .first()
                    .and_then(|w| node_from_wire(model, &port_to_operation, *w));
                sys.integration_variables
                    .push((op.description.clone(), rhs));
            }
        }

        // stocks defined by Godley columns
        let mut godley_vars: BTreeMap<Ident, Vec<Ident>> = BTreeMap::new();
        for item in model.godleys.values() {
            process_godley_table(&mut godley_vars, item);
        }
        for (name, terms) in godley_vars {
            sys.integration_variables
                .push((name, Some(Node::GodleyColumn(terms))));
        }

        // computed variables, traced back to how they are defined
        for (name, v) in &model.variables.values {
            if v.is_lhs() {
                let rhs = model
                    .variables
                    .wire_to_variable(&model.graph, name)
                    .and_then(|w| node_from_wire(model, &port_to_operation, w));
                sys.variables.push((name.clone(), rhs));
            }
        }

        sys
    }

    /// render as a LaTeX eqnarray
    pub fn latex(&self) -> String {
        let mut o = String::from("\\begin{eqnarray*}\n");
        for (name, rhs) in &self.variables {
            o.push_str(&mathrm(name));
            o.push_str("&=&");
            if let Some(rhs) = rhs {
                o.push_str(&rhs.latex());
            }
            o.push_str("\\\\\n");
        }
        for (name, rhs) in &self.integration_variables {
            o.push_str(&format!("\\frac{{ d {}}}{{dt}} &=&", mathrm(name)));
            if let Some(rhs) = rhs {
                o.push_str(&rhs.latex());
            }
            o.push_str("\\\\\n");
        }
        o.push_str("\\end{eqnarray*}\n");
        o
    }
}

/// a node representing whatever feeds the wire
fn node_from_wire(
    model: &Model,
    port_to_operation: &HashMap<PortId, OperationId>,
    wire: WireId,
) -> Option<Node> {
    let w = model.graph.wires.get(&wire)?;
    if let Some(v) = model.variables.variable_from_port(w.from) {
        if v.kind != VariableKind::Undefined {
            return Some(Node::Variable(v.name.clone()));
        }
    }
    if let Some(&opid) = port_to_operation.get(&w.from) {
        let op = &model.operations[&opid];
        if op.kind == OperationType::Integrate {
            // a decoupled integral reads as its stock variable
            return Some(Node::Variable(op.description.clone()));
        }
        return Some(Node::Operation(make_op_dag(model, port_to_operation, opid)));
    }
    None
}

fn make_op_dag(
    model: &Model,
    port_to_operation: &HashMap<PortId, OperationId>,
    opid: OperationId,
) -> OperationNode {
    let op = &model.operations[&opid];
    let mut args: Vec<Vec<Node>> = vec![Vec::new(); op.num_ports().saturating_sub(1)];
    for (i, p) in op.ports().iter().enumerate().skip(1) {
        let is_input = model.graph.ports.get(p).map(|pp| pp.input).unwrap_or(false);
        if !is_input {
            continue;
        }
        for w in model.graph.wires_attached_to(*p) {
            if model.graph.wires[&w].to == *p {
                if let Some(n) = node_from_wire(model, port_to_operation, w) {
                    args[i - 1].push(n);
                }
            }
        }
    }
    OperationNode {
        kind: op.kind,
        name: op.description.clone(),
        args,
    }
}

fn process_godley_table(godley_vars: &mut BTreeMap<Ident, Vec<Ident>>, item: &crate::godley::GodleyItem) {
    use crate::common::strip_non_alnum;
    let table = &item.table;
    for c in 1..table.cols() {
        let name = strip_non_alnum(table.cell(0, c));
        if name.is_empty() {
            continue;
        }
        let gd = godley_vars.entry(name).or_default();
        for r in 1..table.rows() {
            if table.initial_condition_row(r) {
                continue;
            }
            let formula = table.cell(r, c);
            let trimmed = formula.trim_start();
            if trimmed.is_empty() {
                continue;
            }
            let var = strip_non_alnum(formula);
            let negative = trimmed.starts_with('-') != table.sign_convention_reversed(c);
            if negative {
                gd.push(format!("-{}", var));
            } else {
                gd.push(var);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Node {
        Node::Variable(name.to_string())
    }

    fn op(kind: OperationType, args: Vec<Vec<Node>>) -> Node {
        Node::Operation(OperationNode {
            kind,
            name: String::new(),
            args,
        })
    }

    #[test]
    fn test_mathrm() {
        assert_eq!("a", mathrm("a"));
        assert_eq!("\\mathrm{foo}", mathrm("foo"));
        assert_eq!("\\mathrm{foo}_1", mathrm("foo_1"));
        assert_eq!("a^\\mathrm{bc}", mathrm("a^bc"));
        assert_eq!("\\alpha", mathrm("\\alpha"));
    }

    #[test]
    fn test_add_never_parenthesises() {
        let n = op(
            OperationType::Add,
            vec![
                vec![op(OperationType::Add, vec![vec![var("a")], vec![var("b")]])],
                vec![var("c")],
            ],
        );
        assert_eq!("a+b+c", n.latex());
    }

    #[test]
    fn test_subtract_parenthesises_on_equal_level() {
        // a - (b + c): the subtrahend's level equals subtract's
        let n = op(
            OperationType::Subtract,
            vec![
                vec![var("a")],
                vec![op(OperationType::Add, vec![vec![var("b")], vec![var("c")]])],
            ],
        );
        assert_eq!("a-\\left(b+c\\right)", n.latex());
        // a - b stays bare
        let n = op(
            OperationType::Subtract,
            vec![vec![var("a")], vec![var("b")]],
        );
        assert_eq!("a-b", n.latex());
        // multi-term subtrahend wraps regardless of level
        let n = op(
            OperationType::Subtract,
            vec![vec![var("a")], vec![var("b"), var("c")]],
        );
        assert_eq!("a-\\left(b+c\\right)", n.latex());
    }

    #[test]
    fn test_multiply_wraps_looser_children() {
        let n = op(
            OperationType::Multiply,
            vec![
                vec![op(OperationType::Add, vec![vec![var("a")], vec![var("b")]])],
                vec![var("c")],
            ],
        );
        assert_eq!("\\left(a+b\\right)\\times c", n.latex());
    }

    #[test]
    fn test_divide_uses_frac_without_parens() {
        let n = op(
            OperationType::Divide,
            vec![
                vec![op(OperationType::Add, vec![vec![var("a")], vec![var("b")]])],
                vec![var("c")],
            ],
        );
        // \frac never parenthesises its direct children
        assert_eq!("\\frac{a+b}{c}", n.latex());
        // empty numerator reads as 1
        let n = op(OperationType::Divide, vec![vec![], vec![var("c")]]);
        assert_eq!("\\frac{1}{c}", n.latex());
    }

    #[test]
    fn test_divide_interior_products_test_numerator_levels() {
        // interior factors of both halves consult the numerator's
        // levels: the denominator's second factor wraps because the
        // numerator's second factor is a sum
        let n = op(
            OperationType::Divide,
            vec![
                vec![
                    var("a"),
                    op(OperationType::Add, vec![vec![var("b")], vec![var("c")]]),
                ],
                vec![var("d"), var("e")],
            ],
        );
        assert_eq!(
            "\\frac{a\\times \\left(b+c\\right)}{d\\times \\left(e\\right)}",
            n.latex()
        );
    }

    #[test]
    fn test_unary_functions() {
        let n = op(OperationType::Exp, vec![vec![var("x")]]);
        assert_eq!("\\exp\\left(x\\right)", n.latex());
        let n = op(OperationType::Sqrt, vec![vec![var("x")]]);
        assert_eq!("\\sqrt{x}", n.latex());
    }

    #[test]
    fn test_signed_constant_parenthesised_in_product() {
        let c = Node::Operation(OperationNode {
            kind: OperationType::Constant,
            name: "-10".to_string(),
            args: vec![],
        });
        assert_eq!(2, c.bodmas_level());
        let n = op(OperationType::Multiply, vec![vec![var("a")], vec![c]]);
        assert_eq!("a\\times \\left(\\mathrm{-10}\\right)", n.latex());
    }

    #[test]
    fn test_godley_column() {
        let n = Node::GodleyColumn(vec!["a".to_string(), "-b".to_string(), "c".to_string()]);
        assert_eq!("a-b+c", n.latex());
    }

    #[test]
    fn test_time() {
        let n = op(OperationType::Time, vec![]);
        assert_eq!(" t ", n.latex());
    }

    #[test]
    fn test_full_system() {
        use crate::model::Model;

        let mut m = Model::new();
        let a = m.new_variable("a");
        let b = m.new_variable("b");
        let c = m.new_variable("c");
        let add = m.add_operation(OperationType::Add);
        let a_out = m.variables.get(a).unwrap().out_port().unwrap();
        let b_out = m.variables.get(b).unwrap().out_port().unwrap();
        let c_in = m.variables.get(c).unwrap().in_port().unwrap();
        let (add_out, add_in1, add_in2) = {
            let o = &m.operations[&add];
            (o.ports()[0], o.ports()[1], o.ports()[2])
        };
        m.add_wire(a_out, add_in1).unwrap();
        m.add_wire(b_out, add_in2).unwrap();
        m.add_wire(add_out, c_in).unwrap();

        let latex = SystemOfEquations::new(&m).latex();
        assert!(latex.starts_with("\\begin{eqnarray*}"));
        assert!(latex.contains("c&=&a+b\\\\"), "latex was: {}", latex);
        assert!(latex.ends_with("\\end{eqnarray*}\n"));
    }

    #[test]
    fn test_integral_renders_as_derivative() {
        use crate::model::Model;

        let mut m = Model::new();
        let k = m.add_operation(OperationType::Constant);
        m.operations.get_mut(&k).unwrap().description = "g".to_string();
        let int = m.add_operation(OperationType::Integrate);
        let k_out = m.operations[&k].ports()[0];
        let int_in = m.operations[&int].ports()[1];
        m.add_wire(k_out, int_in).unwrap();

        let latex = SystemOfEquations::new(&m).latex();
        assert!(
            latex.contains("\\frac{ d \\mathrm{int}}{dt} &=&g\\\\"),
            "latex was: {}",
            latex
        );
    }
}
