// Copyright 2025 The Minsky Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};

use crate::common::{strip_non_alnum, ErrorReporter, Ident, Result};
use crate::evalop::{EvalOp, Integral};
use crate::godley::GodleyItem;
use crate::operation::{Operation, OperationId, OperationType, Operations};
use crate::ports::{next_id, Port, PortGraph, PortId, Wire, WireId};
use crate::rk::{RungeKuttaFehlberg, Status};
use crate::sim_err;
use crate::variable::{ValueArrays, VariableId, VariableRegistry};

pub type GodleyId = usize;

/// convenience for accessing matrix elements from a flat data array
pub struct Matrix<'a> {
    n: usize,
    data: &'a mut [f64],
}

impl<'a> Matrix<'a> {
    pub fn new(n: usize, data: &'a mut [f64]) -> Self {
        assert_eq!(n * n, data.len());
        Matrix { n, data }
    }
}

impl Index<(usize, usize)> for Matrix<'_> {
    type Output = f64;
    fn index(&self, (i, j): (usize, usize)) -> &f64 {
        &self.data[i * self.n + j]
    }
}

impl IndexMut<(usize, usize)> for Matrix<'_> {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut f64 {
        &mut self.data[i * self.n + j]
    }
}

/// The orchestrator: owns the wired graph, the variable registry, the
/// Godley tables, the compiled program and the value arrays, and
/// drives integration. One instance per model; instances own disjoint
/// arrays and may coexist.
#[derive(Debug)]
pub struct Model {
    pub graph: PortGraph,
    pub operations: Operations,
    pub variables: VariableRegistry,
    pub godleys: BTreeMap<GodleyId, GodleyItem>,
    pub arrays: ValueArrays,

    pub(crate) equations: Vec<EvalOp>,
    pub(crate) integrals: Vec<Integral>,
    rk: Option<RungeKuttaFehlberg>,

    // Runge-Kutta parameters
    pub step_min: f64,
    pub step_max: f64,
    /// number of driver steps per `step()` call
    pub n_steps: usize,
    pub eps_abs: f64,
    pub eps_rel: f64,

    /// simulation time
    pub t: f64,
    pub zoom_factor: f64,
    reset_needed: bool,
    edited: bool,
    pub reporter: ErrorReporter,
}

impl Default for Model {
    fn default() -> Self {
        Model {
            graph: PortGraph::default(),
            operations: Operations::new(),
            variables: VariableRegistry::default(),
            godleys: BTreeMap::new(),
            arrays: ValueArrays::default(),
            equations: Vec::new(),
            integrals: Vec::new(),
            rk: None,
            step_min: 0.0,
            step_max: 0.1,
            n_steps: 1,
            eps_abs: 1e-3,
            eps_rel: 1e-2,
            t: 0.0,
            zoom_factor: 1.0,
            reset_needed: true,
            edited: false,
            reporter: ErrorReporter::default(),
        }
    }
}

impl Model {
    pub fn new() -> Self {
        Model::default()
    }

    /// whether the model has been changed since the last save
    pub fn edited(&self) -> bool {
        self.edited
    }

    pub fn mark_edited(&mut self) {
        self.edited = true;
        self.reset_needed = true;
    }

    pub(crate) fn set_saved(&mut self) {
        self.edited = false;
    }

    pub fn reset_needed(&self) -> bool {
        self.reset_needed
    }

    pub(crate) fn set_reset_needed(&mut self) {
        self.reset_needed = true;
    }

    pub fn clear_all(&mut self) {
        self.graph = PortGraph::default();
        self.operations.clear();
        self.variables.clear();
        self.godleys.clear();
        self.arrays.clear();
        self.equations.clear();
        self.integrals.clear();
        self.rk = None;
        self.t = 0.0;
        self.reset_needed = true;
    }

    pub fn equations(&self) -> &[EvalOp] {
        &self.equations
    }

    pub fn integrals(&self) -> &[Integral] {
        &self.integrals
    }

    /// current value of a named variable
    pub fn value(&self, name: &str) -> f64 {
        match self.variables.get_value(name) {
            Some(v) => v.value(&self.arrays),
            None => f64::NAN,
        }
    }

    pub fn set_init(&mut self, name: &str, init: f64) {
        self.variables.set_init(name, init);
        self.mark_edited();
    }

    // ---- edit API --------------------------------------------------

    pub fn add_operation(&mut self, kind: OperationType) -> OperationId {
        let op = Operation::new(kind, &mut self.graph, &mut self.variables);
        let id = next_id(&self.operations);
        self.operations.insert(id, op);
        self.mark_edited();
        id
    }

    pub fn delete_operation(&mut self, id: OperationId) {
        let op = match self.operations.remove(&id) {
            Some(op) => op,
            None => return,
        };
        for p in op.ports() {
            for w in self.graph.wires_attached_to(*p) {
                let to = self.graph.wires[&w].to;
                self.variables.delete_wire(to);
                self.graph.delete_wire(w);
            }
        }
        if let Some(var_id) = op.int_var() {
            self.variables.erase(&mut self.graph, var_id);
        }
        for p in op.ports() {
            if self.variables.variable_from_port(*p).is_none() {
                self.graph.del_port(*p);
            }
        }
        self.mark_edited();
    }

    pub fn new_variable(&mut self, name: &str) -> VariableId {
        let id = self.variables.new_variable(&mut self.graph, name);
        self.mark_edited();
        id
    }

    pub fn delete_variable(&mut self, id: VariableId) {
        let ports = match self.variables.get(id) {
            Some(v) => v.ports(),
            None => return,
        };
        for p in ports {
            for w in self.graph.wires_attached_to(p) {
                let to = self.graph.wires[&w].to;
                self.variables.delete_wire(to);
                self.graph.delete_wire(w);
            }
        }
        self.variables.erase(&mut self.graph, id);
        self.mark_edited();
    }

    /// add a new wire connecting `from` to `to`. Wiring is a user
    /// action: policy violations return None rather than raising.
    pub fn add_wire(&mut self, from: PortId, to: PortId) -> Option<WireId> {
        let pfrom = *self.graph.ports.get(&from)?;
        let pto = *self.graph.ports.get(&to)?;
        // wire must go from an output port to an input port
        if pfrom.input || !pto.input {
            return None;
        }
        // check we're not wiring an operation to its own input
        if self.operations.values().any(|o| o.self_wire(from, to)) {
            return None;
        }
        // multiple input wires are only allowed where the port says so
        if !self.graph.wires_attached_to(to).is_empty() && !pto.multi_wire_allowed {
            return None;
        }
        // no duplicate wire between the same two ports
        if self
            .graph
            .wires
            .values()
            .any(|w| w.from == from && w.to == to)
        {
            return None;
        }
        // check whether the variable registry will allow the connection
        if !self.variables.add_wire(from, to) {
            return None;
        }
        let id = self.graph.add_wire(Wire::new(from, to));
        self.mark_edited();
        Some(id)
    }

    pub fn delete_wire(&mut self, id: WireId) {
        if let Some(w) = self.graph.wires.get(&id).copied() {
            self.variables.delete_wire(w.to);
            self.graph.delete_wire(id);
            self.mark_edited();
        }
    }

    pub fn add_godley_table(&mut self) -> Result<GodleyId> {
        let id = next_id(&self.godleys);
        let mut item = GodleyItem::new();
        item.table.double_entry_compliant = true;
        item.update(&mut self.variables, &mut self.graph)?;
        self.godleys.insert(id, item);
        self.mark_edited();
        Ok(id)
    }

    pub fn delete_godley_table(&mut self, id: GodleyId) {
        let item = match self.godleys.remove(&id) {
            Some(g) => g,
            None => return,
        };
        for var in item.flow_vars.iter().chain(item.stock_vars.iter()) {
            self.delete_variable(*var);
        }
        self.mark_edited();
    }

    /// toggles the coupled state of an integrate operation's stock
    /// variable; returns the new coupled state
    pub fn toggle_coupled(&mut self, id: OperationId) -> bool {
        let (var_id, coupled, x, y) = match self.operations.get(&id) {
            Some(op) if op.kind == OperationType::Integrate => match op.int_var() {
                Some(v) => (v, op.coupled(&self.variables), op.x, op.y),
                None => return false,
            },
            _ => return false,
        };
        if coupled {
            // decouple: the operation gets its own output port, with an
            // internal wire feeding the variable
            self.variables.toggle_in_port(&mut self.graph, var_id);
            let new_out = self.graph.add_port(Port::new(x, y, false));
            let in_port = self
                .variables
                .get(var_id)
                .and_then(|v| v.in_port())
                .expect("decoupled integral variable has an input port");
            self.operations.get_mut(&id).unwrap().ports[0] = new_out;
            self.variables.add_wire(new_out, in_port);
            self.graph.add_wire(Wire::new(new_out, in_port));
        } else {
            // couple: drop the internal wire and the operation's own
            // output port, the variable's output port takes over
            let own = self.operations[&id].ports()[0];
            for w in self.graph.wires_attached_to(own) {
                let to = self.graph.wires[&w].to;
                self.variables.delete_wire(to);
                self.graph.delete_wire(w);
            }
            self.graph.del_port(own);
            self.variables.toggle_in_port(&mut self.graph, var_id);
            let out = self
                .variables
                .get(var_id)
                .and_then(|v| v.out_port())
                .expect("integral variable has an output port");
            self.operations.get_mut(&id).unwrap().ports[0] = out;
        }
        self.mark_edited();
        self.operations[&id].coupled(&self.variables)
    }

    /// render the system of equations as LaTeX
    pub fn latex(&self) -> String {
        crate::latex::SystemOfEquations::new(self).latex()
    }

    /// operations with at least one unwired port, useful for debugging
    /// wiring diagrams
    pub fn unwired_operations(&self) -> Vec<OperationId> {
        self.operations
            .iter()
            .filter(|(_, op)| {
                op.ports()
                    .iter()
                    .any(|p| self.graph.wires_attached_to(*p).is_empty())
            })
            .map(|(id, _)| *id)
            .collect()
    }

    // ---- evaluation ------------------------------------------------

    /// evaluate the flow variables in place from the current stocks
    pub fn eval_flows(&mut self) {
        let ValueArrays { flow, stock } = &mut self.arrays;
        for e in &self.equations {
            e.eval(self.t, flow, &*stock, &self.operations);
        }
    }

    /// evaluate the Godley tables: update the stock derivatives from
    /// the current flow values. `sv` is assumed zeroed on entry; this
    /// is the only place stocks are written during flow evaluation.
    pub fn godley_eval(&self, sv: &mut [f64], fv: &[f64]) {
        for item in self.godleys.values() {
            let table = &item.table;
            for c in 1..table.cols() {
                let name = strip_non_alnum(table.cell(0, c));
                let stock_idx = match self.variables.get_value(&name) {
                    Some(v) if !v.is_lhs() => match v.idx() {
                        Some(i) => i,
                        None => continue, // variable undefined
                    },
                    _ => continue,
                };

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
                    let flow_idx = match self.variables.get_value(&var) {
                        Some(v) if v.is_lhs() => match v.idx() {
                            Some(i) => i,
                            None => continue,
                        },
                        _ => continue,
                    };
                    let mut negative = trimmed.starts_with('-');
                    if table.sign_convention_reversed(c) {
                        negative = !negative;
                    }
                    if negative {
                        sv[stock_idx] -= fv[flow_idx];
                    } else {
                        sv[stock_idx] += fv[flow_idx];
                    }
                }
            }
        }
    }

    /// evaluate the stock derivatives at state `vars`: flows first,
    /// then the Godley tables, then the integrals (which copy their
    /// input flow through)
    pub fn eval_equations(&self, result: &mut [f64], vars: &[f64]) -> Result<()> {
        // evaluate the flow variables on a scratch copy, so unwired
        // flow variables keep their initial values
        let mut flow = self.arrays.flow.clone();
        for e in &self.equations {
            e.eval(self.t, &mut flow, vars, &self.operations);
        }

        for r in result.iter_mut() {
            *r = 0.0;
        }
        self.godley_eval(result, &flow);

        for integral in &self.integrals {
            let input_idx = match integral.input.idx() {
                Some(i) => i,
                None => {
                    if let Some(op) = integral.operation.and_then(|id| self.operations.get(&id)) {
                        self.reporter.display_error_item(op.x, op.y);
                    }
                    return sim_err!(IntegralNotWired, "integral not wired");
                }
            };
            if let Some(stock_idx) = integral.stock.idx() {
                result[stock_idx] = if integral.input.is_lhs() {
                    flow[input_idx]
                } else {
                    vars[input_idx]
                };
            }
        }
        Ok(())
    }

    /// the analytic Jacobian d(stock derivative)/d(stock) at state `sv`
    pub fn jacobian(&self, jac: &mut Matrix, sv: &[f64]) {
        let mut flow = self.arrays.flow.clone();
        for e in &self.equations {
            e.eval(self.t, &mut flow, sv, &self.operations);
        }

        let n = sv.len();
        for j in 0..n {
            let mut ds = vec![0.0; n];
            let mut df = vec![0.0; flow.len()];
            ds[j] = 1.0;
            for e in &self.equations {
                e.deriv(&mut df, &ds, sv, &flow);
            }
            let mut d = vec![0.0; n];
            self.godley_eval(&mut d, &df);
            for integral in &self.integrals {
                if let (Some(s), Some(i)) = (integral.stock.idx(), integral.input.idx()) {
                    d[s] = if integral.input.is_lhs() { df[i] } else { ds[i] };
                }
            }
            for (i, di) in d.iter().enumerate() {
                jac[(i, j)] = *di;
            }
        }
    }

    /// the first variable holding a non-finite value, else the first
    /// operation producing one; empty if everything is finite
    pub fn diagnose_non_finite(&self) -> Ident {
        for (name, v) in self.variables.values.iter() {
            if !v.value(&self.arrays).is_finite() {
                return name.clone();
            }
        }
        for e in &self.equations {
            if !self.arrays.flow[e.out].is_finite() {
                return e.op.type_name().to_string();
            }
        }
        Ident::new()
    }

    // ---- integration -----------------------------------------------

    /// resets the variables back to their initial values and rebuilds
    /// the program
    pub fn reset(&mut self) -> Result<()> {
        self.construct_equations()?;
        // if there are no stock variables, add a dummy stock so the
        // driver has something to integrate
        if self.arrays.stock.is_empty() {
            self.arrays.stock.resize(1, 0.0);
        }
        self.t = 0.0;
        self.rk = Some(RungeKuttaFehlberg::new(
            self.step_min,
            self.step_max,
            self.eps_abs,
            self.eps_rel,
        ));
        Ok(())
    }

    /// advance the model by up to `n_steps` driver steps. Any raised
    /// error leaves the model needing a reset, so the next attempt
    /// recompiles from scratch.
    pub fn step(&mut self) -> Result<()> {
        let r = self.try_step();
        if r.is_err() {
            self.reset_needed = true;
        }
        r
    }

    fn try_step(&mut self) -> Result<()> {
        if self.reset_needed {
            self.reset()?;
            self.reset_needed = false;
            self.eval_flows();
        }

        if self.rk.is_some() {
            let mut rk = self.rk.take().unwrap();
            let mut y = std::mem::take(&mut self.arrays.stock);
            let mut t = self.t;
            let mut inner: Option<crate::common::Error> = None;
            let status = rk.apply(&mut t, f64::INFINITY, self.n_steps, &mut y, |_, y, dydt| {
                self.eval_equations(dydt, y).map_err(|e| {
                    inner = Some(e.clone());
                    e
                })
            });
            self.arrays.stock = y;
            self.t = t;
            match status {
                Status::Success | Status::MaxIter => {
                    self.rk = Some(rk);
                }
                Status::BadFunc => {
                    rk.reset();
                    self.rk = Some(rk);
                    if let Some(e) = inner {
                        return Err(e);
                    }
                    let offender = self.diagnose_non_finite();
                    let msg = if offender.is_empty() {
                        "invalid arithmetic operation detected".to_string()
                    } else {
                        format!("invalid arithmetic operation detected in {}", offender)
                    };
                    return sim_err!(NonFiniteValue, msg);
                }
                Status::Failure => {
                    self.rk = Some(rk);
                    return sim_err!(DriverFailure, "requested accuracy not achievable");
                }
            }
        }

        // update flow variables so observers see post-step values
        self.eval_flows();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationType;

    #[test]
    fn test_add_wire_policy() {
        let mut m = Model::new();
        let add = m.add_operation(OperationType::Add);
        let exp = m.add_operation(OperationType::Exp);
        let (add_out, add_in1) = {
            let op = &m.operations[&add];
            (op.ports()[0], op.ports()[1])
        };
        let (exp_out, exp_in) = {
            let op = &m.operations[&exp];
            (op.ports()[0], op.ports()[1])
        };

        // input as source, output as sink
        assert_eq!(None, m.add_wire(add_in1, exp_in));
        assert_eq!(None, m.add_wire(add_out, exp_out));
        // self wire
        assert_eq!(None, m.add_wire(add_out, add_in1));
        // ok
        let w = m.add_wire(exp_out, add_in1);
        assert!(w.is_some());
        // duplicate
        assert_eq!(None, m.add_wire(exp_out, add_in1));
        // multi-wire allowed on add's input
        let c = m.add_operation(OperationType::Constant);
        let c_out = m.operations[&c].ports()[0];
        assert!(m.add_wire(c_out, add_in1).is_some());
        // but not on exp's input
        assert!(m.add_wire(add_out, exp_in).is_some());
        assert_eq!(None, m.add_wire(c_out, exp_in));
    }

    #[test]
    fn test_wire_to_variable_clears_flag() {
        let mut m = Model::new();
        let a = m.new_variable("a");
        let b = m.new_variable("b");
        let a_out = m.variables.get(a).unwrap().out_port().unwrap();
        let b_in = m.variables.get(b).unwrap().in_port().unwrap();
        let w = m.add_wire(a_out, b_in).unwrap();
        assert!(m.variables.input_wired("b"));
        m.delete_wire(w);
        assert!(!m.variables.input_wired("b"));
    }

    #[test]
    fn test_toggle_coupled() {
        let mut m = Model::new();
        let i = m.add_operation(OperationType::Integrate);
        assert!(m.operations[&i].coupled(&m.variables));
        let n_wires = m.graph.wires.len();

        assert!(!m.toggle_coupled(i));
        // decoupled: operation has its own port, plus an internal wire
        assert_eq!(n_wires + 1, m.graph.wires.len());
        let var = m.operations[&i].int_var().unwrap();
        assert!(m.variables.get(var).unwrap().in_port().is_some());
        assert!(m.variables.input_wired("int"));

        assert!(m.toggle_coupled(i));
        assert_eq!(n_wires, m.graph.wires.len());
        assert!(m.variables.get(var).unwrap().in_port().is_none());
    }

    #[test]
    fn test_unwired_operations() {
        let mut m = Model::new();
        let c = m.add_operation(OperationType::Constant);
        let e = m.add_operation(OperationType::Exp);
        assert_eq!(vec![c, e], m.unwired_operations());
        let c_out = m.operations[&c].ports()[0];
        let e_in = m.operations[&e].ports()[1];
        m.add_wire(c_out, e_in).unwrap();
        assert_eq!(vec![e], m.unwired_operations());
    }
}
