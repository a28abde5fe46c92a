// Copyright 2025 The Minsky Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Translates the wired graph into the ordered program of eval ops
//! consumed by the driver: cycle checking, slot garbage collection,
//! operation ordering, and program emission.

use std::collections::{HashMap, HashSet};

use crate::evalop::{EvalOp, Integral};
use crate::model::Model;
use crate::model_err;
use crate::operation::{Operation, OperationId, OperationType};
use crate::ports::{PortId, WireId};
use crate::variable::{VariableKind, VariableValue};

/// port-level connectivity walk used to reject cycles that do not pass
/// through an integrate operation
struct Network<'a> {
    links: HashMap<PortId, Vec<PortId>>,
    visited: HashSet<PortId>,
    stack: Vec<PortId>,
    model: &'a Model,
}

impl Network<'_> {
    // depth-first walk; true if this branch re-enters its own stack
    fn follow_wire(&mut self, p: PortId) -> bool {
        if !self.visited.insert(p) {
            if self.stack.contains(&p) {
                if let Some(port) = self.model.graph.ports.get(&p) {
                    self.model.reporter.display_error_item(port.x, port.y);
                }
                return true;
            }
            return false;
        }
        self.stack.push(p);
        let next = self.links.get(&p).cloned().unwrap_or_default();
        for q in next {
            if self.follow_wire(q) {
                return true;
            }
        }
        self.stack.pop();
        false
    }
}

/// depth-first ranking of operations by level; the graph is assumed
/// acyclic by the time this runs, but re-entry is still an error
#[derive(Default)]
struct OperationOrderer {
    op_order: HashMap<OperationId, i32>,
    links: HashMap<OperationId, Vec<OperationId>>,
    visited: HashSet<OperationId>,
}

impl OperationOrderer {
    fn order(&mut self, node: OperationId, level: i32) -> crate::common::Result<()> {
        let current = self.op_order.entry(node).or_insert(0);
        if *current < level {
            *current = level;
        }
        if !self.visited.insert(node) {
            return model_err!(CyclicNetwork, "cyclic network detected");
        }
        let next = self.links.get(&node).cloned().unwrap_or_default();
        for l in next {
            self.order(l, level + 1)?;
        }
        self.visited.remove(&node);
        Ok(())
    }
}

impl Model {
    /// true if the graph contains a cycle not broken by an integrate
    /// operation. The offending port's coordinates are reported.
    pub fn cycle_check(&self) -> bool {
        let mut links: HashMap<PortId, Vec<PortId>> = HashMap::new();
        for w in self.graph.wires.values() {
            links.entry(w.from).or_default().push(w.to);
        }
        for op in self.operations.values() {
            // integrate legitimately closes feedback loops through its
            // stock, so it contributes no internal edge
            if op.kind != OperationType::Integrate {
                for p in &op.ports()[1..] {
                    links.entry(*p).or_default().push(op.ports()[0]);
                }
            }
        }
        for (_, v) in self.variables.iter() {
            if let (Some(in_port), Some(out_port)) = (v.in_port(), v.out_port()) {
                links.entry(in_port).or_default().push(out_port);
            }
        }

        let mut net = Network {
            links,
            visited: HashSet::new(),
            stack: Vec::new(),
            model: self,
        };
        for (id, p) in self.graph.ports.iter() {
            if !p.input && !net.visited.contains(id) && net.follow_wire(*id) {
                return true;
            }
        }
        false
    }

    /// drop temporary slots and orphaned ports, then reallocate the
    /// value arrays densely in registry order
    pub fn garbage_collect(&mut self) {
        self.arrays.clear();
        self.variables.drop_temporaries();

        let mut live: HashSet<PortId> = HashSet::new();
        for (_, v) in self.variables.iter() {
            live.extend(v.ports());
        }
        for op in self.operations.values() {
            live.extend(op.ports().iter().copied());
        }
        self.graph.ports.retain(|id, _| live.contains(id));
        self.graph
            .wires
            .retain(|_, w| live.contains(&w.from) && live.contains(&w.to));

        self.variables.make_consistent(&self.graph);
        self.variables.reset_values(&mut self.arrays);
    }

    /// construct the equations based on the wired graph, the variable
    /// registry and the Godley tables
    pub fn construct_equations(&mut self) -> crate::common::Result<()> {
        if self.cycle_check() {
            return model_err!(CyclicNetwork, "cyclic network detected");
        }
        self.garbage_collect();
        self.equations.clear();
        self.integrals.clear();

        let mut op_from_port: HashMap<PortId, OperationId> = HashMap::new();
        let mut source_ops: Vec<OperationId> = Vec::new();
        for (id, op) in &self.operations {
            for p in op.ports() {
                op_from_port.insert(*p, *id);
            }
            if op.num_ports() == 1 || op.kind == OperationType::Integrate {
                source_ops.push(*id);
            }
        }

        // work out the operation order
        let mut orderer = OperationOrderer::default();
        for w in self.graph.wires.values() {
            if let (Some(&from), Some(&to)) =
                (op_from_port.get(&w.from), op_from_port.get(&w.to))
            {
                // integrate breaks the dependency, except between
                // integrate operations themselves
                if self.operations[&from].kind != OperationType::Integrate
                    || self.operations[&to].kind == OperationType::Integrate
                {
                    orderer.links.entry(from).or_default().push(to);
                }
            }
        }

        // connect operations joined through chains of variables
        let names: Vec<_> = self.variables.values.keys().cloned().collect();
        for name in names {
            if let Some(w) = self.variables.wire_to_variable(&self.graph, &name) {
                let from = op_from_port.get(&self.graph.wires[&w].from).copied();
                self.connect_variable_chains(&name, from, &op_from_port, &mut orderer.links);
            }
        }

        // roots: variables without a wired input, and integrals, feed
        // their consumers at level 1
        let mut root_ports: Vec<PortId> = Vec::new();
        for (_, v) in self.variables.iter() {
            if !self.variables.input_wired(&v.name) || v.kind == VariableKind::Integral {
                if let Some(out) = v.out_port() {
                    root_ports.push(out);
                }
            }
        }
        for out in root_ports {
            for w in self.graph.wires_attached_to(out) {
                if let Some(&op) = op_from_port.get(&self.graph.wires[&w].to) {
                    orderer.order(op, 1)?;
                }
            }
        }
        for id in source_ops {
            orderer.order(id, 1)?;
        }

        let mut ordered: Vec<(OperationId, i32)> =
            orderer.op_order.iter().map(|(k, v)| (*k, *v)).collect();
        ordered.sort_by_key(|(id, _)| *id);
        ordered.sort_by_key(|(_, level)| *level);

        debug_assert!(ordered.len() <= self.operations.len());
        if ordered.len() < self.operations.len() {
            let ordered_set: HashSet<OperationId> = ordered.iter().map(|(id, _)| *id).collect();
            for (id, op) in &self.operations {
                if !ordered_set.contains(id) {
                    self.reporter.display_error_item(op.x, op.y);
                }
            }
            return model_err!(NotAllWired, "not all operations are wired");
        }

        // maps each input port to the slot that feeds it
        let mut input_from: HashMap<PortId, VariableValue> = HashMap::new();
        // copies to insert at the program head (stock-sourced)
        let mut initial_copies: Vec<EvalOp> = Vec::new();
        // copies to insert the moment the keyed flow slot is produced
        let mut extra_copies: HashMap<usize, Vec<EvalOp>> = HashMap::new();
        // fold ops supporting multiple wires into one input port
        let mut extra_ops: HashMap<OperationId, Vec<EvalOp>> = HashMap::new();

        // wires sourced at variables fill the inputFrom table; wires
        // directly linking two variables become copy operations
        let wire_ids: Vec<WireId> = self.graph.wires.keys().copied().collect();
        for wid in wire_ids {
            let w = self.graph.wires[&wid];
            let rhs = match self.variables.value_from_port(w.from) {
                Some(v) if v.kind != VariableKind::Undefined => v.clone(),
                _ => continue,
            };
            self.record_input_from(&mut input_from, w.to, &rhs, &op_from_port, &mut extra_ops)?;
            if let Some(lhs) = self.variables.value_from_port(w.to) {
                if lhs.kind != VariableKind::Undefined
                    && (rhs.kind != lhs.kind || rhs.idx() != lhs.idx())
                {
                    let copy = EvalOp::copy(&rhs, lhs);
                    if rhs.is_lhs() {
                        extra_copies.entry(rhs.idx().unwrap()).or_default().push(copy);
                    } else {
                        initial_copies.push(copy);
                    }
                }
            }
        }

        // prepopulate the integrals: they are often evaluated late in
        // the chain but feed earlier operations through their stocks
        for (id, _) in &ordered {
            let op = &self.operations[id];
            if op.kind == OperationType::Integrate {
                let stock = self
                    .variables
                    .get_value(&op.description)
                    .cloned()
                    .unwrap_or_default();
                self.integrals.push(Integral {
                    stock,
                    input: VariableValue::default(),
                    operation: Some(*id),
                });
            }
        }

        for copy in initial_copies {
            let out = copy.out;
            self.equations.push(copy);
            self.drain_extra_copies(&mut extra_copies, out);
        }

        // copy the operations, in order, to the program
        let mut integral_idx = 0;
        for (opid, _) in &ordered {
            if let Some(folds) = extra_ops.remove(opid) {
                for e in folds {
                    self.equations.push(e);
                }
            }

            let op = self.operations[opid].clone();
            debug_assert!(op.num_ports() > 0);

            // state integration is performed by the driver through the
            // Integral record, so integrate emits no evaluator; an
            // unwired input surfaces as "integral not wired" at
            // evaluation time
            if op.kind == OperationType::Integrate {
                let input = input_from
                    .get(&op.ports()[1])
                    .cloned()
                    .unwrap_or_default();
                self.integrals[integral_idx].input = input;
                integral_idx += 1;
                continue;
            }

            // if any outgoing wire ends at an lhs variable use that as
            // the output slot, otherwise make a temporary; additional
            // lhs sinks become copies
            let outgoing = self.graph.wires_attached_to(op.ports()[0]);
            let mut v = VariableValue::default();
            for w in &outgoing {
                let to = self.graph.wires[w].to;
                if let Some(lhs) = self.variables.value_from_port(to) {
                    if lhs.kind != VariableKind::Undefined {
                        if v.kind == VariableKind::Undefined {
                            v = lhs.clone();
                        } else {
                            let copy = EvalOp::copy(&v, lhs);
                            extra_copies
                                .entry(v.idx().unwrap())
                                .or_default()
                                .push(copy);
                        }
                    }
                }
            }
            if v.kind == VariableKind::Undefined {
                v = VariableValue::new(VariableKind::TempFlow, 0.0);
                v.alloc(&mut self.arrays);
            }

            let mut e = EvalOp::new(op.kind, v.idx().unwrap());
            e.state = Some(*opid);
            if op.num_ports() > 1 {
                let v1 = self.input_value(&input_from, op.ports()[1], &op)?;
                e.in1 = v1.idx().unwrap();
                e.flow1 = v1.is_lhs();
            }
            if op.num_ports() > 2 {
                let v2 = self.input_value(&input_from, op.ports()[2], &op)?;
                e.in2 = v2.idx().unwrap();
                e.flow2 = v2.is_lhs();
            }

            let out = e.out;
            self.equations.push(e);
            self.drain_extra_copies(&mut extra_copies, out);
            for w in &outgoing {
                let to = self.graph.wires[w].to;
                self.record_input_from(&mut input_from, to, &v, &op_from_port, &mut extra_ops)?;
            }
        }

        for e in &self.equations {
            e.reset(&mut self.arrays.flow, &self.operations);
        }
        Ok(())
    }

    /// follow links from a variable through a chain of variables until
    /// landing on an operation, adding the dependency edge
    fn connect_variable_chains(
        &self,
        name: &str,
        from: Option<OperationId>,
        op_from_port: &HashMap<PortId, OperationId>,
        links: &mut HashMap<OperationId, Vec<OperationId>>,
    ) {
        for w in self.variables.wires_from_variable(&self.graph, name) {
            let to_port = self.graph.wires[&w].to;
            if let Some(v) = self.variables.variable_from_port(to_port) {
                if v.kind != VariableKind::Undefined {
                    let next = v.name.clone();
                    self.connect_variable_chains(&next, from, op_from_port, links);
                    continue;
                }
            }
            if let (Some(from), Some(&to)) = (from, op_from_port.get(&to_port)) {
                if self.operations[&from].kind != OperationType::Integrate {
                    links.entry(from).or_default().push(to);
                }
            }
        }
    }

    /// update the inputFrom table, folding multiple wires into a port
    /// through the port's commutative binary operation
    fn record_input_from(
        &mut self,
        input_from: &mut HashMap<PortId, VariableValue>,
        port: PortId,
        v: &VariableValue,
        op_from_port: &HashMap<PortId, OperationId>,
        extra_ops: &mut HashMap<OperationId, Vec<EvalOp>>,
    ) -> crate::common::Result<()> {
        if !input_from.contains_key(&port) {
            input_from.insert(port, v.clone());
            return Ok(());
        }

        // a second wire already feeds this port: only the commutative
        // binary operations admit that, folding pairwise
        let next_op_id = match op_from_port.get(&port) {
            Some(id) => *id,
            None => {
                // can only possibly be a variable
                if let Some(var) = self.variables.variable_from_port(port) {
                    self.reporter.display_error_item(var.x, var.y);
                }
                return model_err!(TooManyInputs, "too many inputs");
            }
        };
        let insert_type = match self.operations[&next_op_id].kind {
            OperationType::Add | OperationType::Subtract => OperationType::Add,
            OperationType::Multiply | OperationType::Divide => OperationType::Multiply,
            _ => {
                let op = &self.operations[&next_op_id];
                self.reporter.display_error_item(op.x, op.y);
                return model_err!(TooManyInputs, "too many inputs");
            }
        };

        let v1 = input_from[&port].clone();
        let mut new_v = VariableValue::new(VariableKind::TempFlow, 0.0);
        new_v.alloc(&mut self.arrays);
        let mut fold = EvalOp::new(insert_type, new_v.idx().unwrap());
        fold.in1 = v1.idx().unwrap();
        fold.in2 = v.idx().unwrap();
        fold.flow1 = v1.is_lhs();
        fold.flow2 = v.is_lhs();
        extra_ops.entry(next_op_id).or_default().push(fold);
        input_from.insert(port, new_v);
        Ok(())
    }

    /// the slot feeding an input port; unwired inputs of the
    /// commutative binary operations read the group identity
    fn input_value(
        &mut self,
        input_from: &HashMap<PortId, VariableValue>,
        port: PortId,
        op: &Operation,
    ) -> crate::common::Result<VariableValue> {
        if let Some(v) = input_from.get(&port) {
            return Ok(v.clone());
        }
        let identity = match op.kind {
            OperationType::Add | OperationType::Subtract => 0.0,
            OperationType::Multiply | OperationType::Divide => 1.0,
            _ => {
                self.reporter.display_error_item(op.x, op.y);
                return model_err!(InputNotWired, format!("no input for port {}", port));
            }
        };
        let mut v = VariableValue::new(VariableKind::TempFlow, identity);
        v.alloc(&mut self.arrays);
        Ok(v)
    }

    /// insert the copy operations registered against an updated slot,
    /// transitively
    fn drain_extra_copies(&mut self, extra_copies: &mut HashMap<usize, Vec<EvalOp>>, idx: usize) {
        let copies = match extra_copies.remove(&idx) {
            Some(c) => c,
            None => return,
        };
        for c in copies {
            debug_assert_ne!(idx, c.out);
            let out = c.out;
            self.equations.push(c);
            self.drain_extra_copies(extra_copies, out);
        }
    }

    /// the order in which operations are applied, for debugging
    pub fn op_order(&self) -> Vec<Option<OperationId>> {
        self.equations.iter().map(|e| e.state).collect()
    }

    /// sanity check that every equation's inputs are produced before
    /// they are consumed
    pub fn check_equation_order(&self) -> bool {
        let mut fv_init = vec![false; self.arrays.flow.len()];
        // flow variables without a wired input hold their initial value
        for (name, v) in &self.variables.values {
            if !self.variables.input_wired(name) && v.is_lhs() {
                if let Some(idx) = v.idx() {
                    fv_init[idx] = true;
                }
            }
        }

        let mut ok = true;
        for e in &self.equations {
            match e.num_args() {
                0 => fv_init[e.out] = true,
                1 => fv_init[e.out] = !e.flow1 || fv_init[e.in1],
                _ => {
                    // an unwired input of a commutative binary
                    // operation was pre-initialised to its identity
                    if let Some(op) = e.state.and_then(|id| self.operations.get(&id)) {
                        if op.kind.is_binary_arithmetic() {
                            if self.graph.wires_attached_to(op.ports()[1]).is_empty() {
                                fv_init[e.in1] = true;
                            }
                            if self.graph.wires_attached_to(op.ports()[2]).is_empty() {
                                fv_init[e.in2] = true;
                            }
                        }
                    }
                    fv_init[e.out] =
                        (!e.flow1 || fv_init[e.in1]) && (!e.flow2 || fv_init[e.in2]);
                }
            }
            if !fv_init[e.out] {
                eprintln!("operation {:?} out of order", e.state);
                ok = false;
            }
        }
        ok
    }
}
