// Copyright 2025 The Minsky Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::common::Ident;
use crate::ports::{next_id, Port, PortGraph, PortId, WireId};

pub type VariableId = usize;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VariableKind {
    #[default]
    Undefined,
    Flow,
    Stock,
    /// a temporary flow slot, not visible on the canvas
    TempFlow,
    /// a temporary stock slot used to implement integration
    Integral,
}

impl VariableKind {
    /// variable is on the left hand side of a flow calculation
    pub fn is_lhs(self) -> bool {
        !matches!(self, VariableKind::Stock | VariableKind::Integral)
    }

    pub fn is_temp(self) -> bool {
        matches!(self, VariableKind::TempFlow | VariableKind::Undefined)
    }

    /// number of ports a canvas item of this kind owns (output first)
    pub(crate) fn num_ports(self) -> usize {
        match self {
            VariableKind::Undefined => 0,
            VariableKind::Flow | VariableKind::TempFlow => 2,
            VariableKind::Stock => 1,
            // the input port is toggled on when the integral is decoupled
            VariableKind::Integral => 1,
        }
    }
}

/// The two flat arrays all slot indices point into. Stock variables
/// are integrated through time; flow variables are recomputed from the
/// stocks on every evaluation.
#[derive(Clone, Debug, Default)]
pub struct ValueArrays {
    pub stock: Vec<f64>,
    pub flow: Vec<f64>,
}

impl ValueArrays {
    pub fn clear(&mut self) {
        self.stock.clear();
        self.flow.clear();
    }
}

/// A named scalar slot: its kind selects which array the index points
/// into. Indices are only assigned at reset; an unallocated slot reads
/// back its initial value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VariableValue {
    pub kind: VariableKind,
    pub init: f64,
    pub godley_overridden: bool,
    idx: Option<usize>,
}

impl VariableValue {
    pub fn new(kind: VariableKind, init: f64) -> Self {
        VariableValue {
            kind,
            init,
            godley_overridden: false,
            idx: None,
        }
    }

    pub fn idx(&self) -> Option<usize> {
        self.idx
    }

    pub fn is_lhs(&self) -> bool {
        self.kind.is_lhs()
    }

    pub fn is_temp(&self) -> bool {
        self.kind.is_temp()
    }

    /// allocate space in the matching value array and initialise it
    pub fn alloc(&mut self, arrays: &mut ValueArrays) -> &mut Self {
        match self.kind {
            VariableKind::Undefined => self.idx = None,
            VariableKind::Flow | VariableKind::TempFlow => {
                self.idx = Some(arrays.flow.len());
                arrays.flow.push(self.init);
            }
            VariableKind::Stock | VariableKind::Integral => {
                self.idx = Some(arrays.stock.len());
                arrays.stock.push(self.init);
            }
        }
        self
    }

    pub fn value(&self, arrays: &ValueArrays) -> f64 {
        match (self.kind, self.idx) {
            (VariableKind::Flow | VariableKind::TempFlow, Some(i)) => arrays.flow[i],
            (VariableKind::Stock | VariableKind::Integral, Some(i)) => arrays.stock[i],
            _ => self.init,
        }
    }

    pub fn set_value(&self, arrays: &mut ValueArrays, v: f64) {
        match (self.kind, self.idx) {
            (VariableKind::Flow | VariableKind::TempFlow, Some(i)) => arrays.flow[i] = v,
            (VariableKind::Stock | VariableKind::Integral, Some(i)) => arrays.stock[i] = v,
            _ => {}
        }
    }
}

/// A variable as it appears in the wired graph: a named item owning an
/// output port and, for computed (lhs) kinds, an input port.
#[derive(Clone, Debug)]
pub struct Variable {
    pub kind: VariableKind,
    pub name: Ident,
    pub x: f64,
    pub y: f64,
    /// variable belongs to a Godley table
    pub godley: bool,
    pub(crate) out_port: Option<PortId>,
    pub(crate) in_port: Option<PortId>,
}

impl Variable {
    pub fn out_port(&self) -> Option<PortId> {
        self.out_port
    }

    pub fn in_port(&self) -> Option<PortId> {
        self.in_port
    }

    pub fn ports(&self) -> Vec<PortId> {
        let mut r = Vec::with_capacity(2);
        if let Some(p) = self.out_port {
            r.push(p);
        }
        if let Some(p) = self.in_port {
            r.push(p);
        }
        r
    }
}

/// Variables have certain global constraints: instances with the same
/// name refer to the same scalar slot, and at most one wire may feed
/// any instance of a given name.
#[derive(Debug, Default)]
pub struct VariableRegistry {
    items: BTreeMap<VariableId, Variable>,
    port_to_variable: HashMap<PortId, VariableId>,
    /// names whose input port is wired somewhere
    wired: BTreeSet<Ident>,
    pub values: BTreeMap<Ident, VariableValue>,
}

impl VariableRegistry {
    /// create a new variable item, allocating its ports. If a slot of
    /// the same name exists the item shares it; otherwise a slot of the
    /// item's kind is created.
    pub fn add_variable(
        &mut self,
        graph: &mut PortGraph,
        kind: VariableKind,
        name: &str,
    ) -> VariableId {
        let out_port = if kind.num_ports() > 0 {
            Some(graph.add_port(Port::new(0.0, 0.0, false)))
        } else {
            None
        };
        let in_port = if kind.num_ports() > 1 {
            Some(graph.add_port(Port::new(0.0, 0.0, true)))
        } else {
            None
        };
        self.insert_item(
            None,
            Variable {
                kind,
                name: name.to_string(),
                x: 0.0,
                y: 0.0,
                godley: false,
                out_port,
                in_port,
            },
        )
    }

    /// insert a fully-formed item (ports already allocated), e.g. from
    /// a schema read. With `id == None` the next free id is used.
    pub fn insert_item(&mut self, id: Option<VariableId>, var: Variable) -> VariableId {
        let id = id.unwrap_or_else(|| next_id(&self.items));
        if let Some(p) = var.out_port {
            self.port_to_variable.insert(p, id);
        }
        if let Some(p) = var.in_port {
            self.port_to_variable.insert(p, id);
        }
        if !var.name.is_empty() && !self.values.contains_key(&var.name) {
            self.values
                .insert(var.name.clone(), VariableValue::new(var.kind, 0.0));
        }
        self.items.insert(id, var);
        id
    }

    /// creates a new variable item. If a slot of the same name already
    /// exists, that kind is used, otherwise a flow variable is created.
    pub fn new_variable(&mut self, graph: &mut PortGraph, name: &str) -> VariableId {
        let kind = match self.values.get(name) {
            Some(v) => v.kind,
            None => VariableKind::Flow,
        };
        self.add_variable(graph, kind, name)
    }

    pub fn erase(&mut self, graph: &mut PortGraph, id: VariableId) {
        let var = match self.items.remove(&id) {
            Some(v) => v,
            None => return,
        };
        // drop the named slot only if this was the last instance
        let other = self.items.values().any(|v| v.name == var.name);
        if !other {
            self.values.remove(&var.name);
            self.wired.remove(&var.name);
        }
        for p in var.ports() {
            self.port_to_variable.remove(&p);
            graph.del_port(p);
        }
    }

    /// remove all instances of a named variable
    pub fn remove_name(&mut self, graph: &mut PortGraph, name: &str) {
        let ids: Vec<VariableId> = self
            .items
            .iter()
            .filter(|(_, v)| v.name == name)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let var = self.items.remove(&id).unwrap();
            for p in var.ports() {
                self.port_to_variable.remove(&p);
                graph.del_port(p);
            }
        }
        self.values.remove(name);
        self.wired.remove(name);
    }

    pub fn get(&self, id: VariableId) -> Option<&Variable> {
        self.items.get(&id)
    }

    pub fn get_mut(&mut self, id: VariableId) -> Option<&mut Variable> {
        self.items.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VariableId, &Variable)> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn input_wired(&self, name: &str) -> bool {
        self.wired.contains(name)
    }

    pub fn set_init(&mut self, name: &str, init: f64) {
        if let Some(v) = self.values.get_mut(name) {
            v.init = init;
        }
    }

    pub fn get_value(&self, name: &str) -> Option<&VariableValue> {
        self.values.get(name)
    }

    pub fn variable_from_port(&self, port: PortId) -> Option<&Variable> {
        self.port_to_variable
            .get(&port)
            .and_then(|id| self.items.get(id))
    }

    pub fn variable_id_from_port(&self, port: PortId) -> Option<VariableId> {
        self.port_to_variable.get(&port).copied()
    }

    pub fn value_from_port(&self, port: PortId) -> Option<&VariableValue> {
        self.variable_from_port(port)
            .and_then(|v| self.values.get(&v.name))
    }

    /// returns the wire feeding the named variable, if any
    pub fn wire_to_variable(&self, graph: &PortGraph, name: &str) -> Option<WireId> {
        if !self.input_wired(name) {
            return None;
        }
        for v in self.items.values() {
            if v.name == name {
                if let Some(in_port) = v.in_port {
                    let wires = graph.wires_attached_to(in_port);
                    if !wires.is_empty() {
                        return Some(wires[0]);
                    }
                }
            }
        }
        None
    }

    /// wires emanating from any instance of the named variable
    pub fn wires_from_variable(&self, graph: &PortGraph, name: &str) -> Vec<WireId> {
        let mut wires = Vec::new();
        for v in self.items.values() {
            if v.name == name {
                if let Some(out_port) = v.out_port {
                    wires.extend(graph.wires_attached_to(out_port));
                }
            }
        }
        wires
    }

    /// graph hook: returns false if the wire may not terminate at `to`.
    /// A variable input admits one wire across all instances of the
    /// name, and a variable may not be wired to itself.
    pub fn add_wire(&mut self, from: PortId, to: PortId) -> bool {
        if let Some(&id) = self.port_to_variable.get(&to) {
            if let Some(v) = self.items.get(&id) {
                if Some(from) == v.out_port {
                    return false;
                }
                return self.wired.insert(v.name.clone());
            }
        }
        true
    }

    /// graph hook: a wire terminating at `to` was deleted
    pub fn delete_wire(&mut self, to: PortId) {
        if let Some(&id) = self.port_to_variable.get(&to) {
            if let Some(v) = self.items.get(&id) {
                self.wired.remove(&v.name);
            }
        }
    }

    /// adds the input port for the integral case if not allocated,
    /// removes it if allocated
    pub fn toggle_in_port(&mut self, graph: &mut PortGraph, id: VariableId) {
        let var = match self.items.get_mut(&id) {
            Some(v) if v.kind == VariableKind::Integral => v,
            _ => return,
        };
        match var.in_port {
            None => {
                let p = graph.add_port(Port::new(var.x, var.y, true));
                var.in_port = Some(p);
                self.port_to_variable.insert(p, id);
            }
            Some(p) => {
                var.in_port = None;
                self.port_to_variable.remove(&p);
                graph.del_port(p);
            }
        }
    }

    pub fn move_to(&mut self, graph: &mut PortGraph, id: VariableId, x: f64, y: f64) {
        if let Some(v) = self.items.get_mut(&id) {
            let (dx, dy) = (x - v.x, y - v.y);
            v.x = x;
            v.y = y;
            if let Some(p) = v.out_port {
                graph.move_port(p, dx, dy);
            }
            if let Some(p) = v.in_port {
                graph.move_port(p, dx, dy);
            }
        }
    }

    /// drop all temporary slots from the registry
    pub fn drop_temporaries(&mut self) {
        self.values.retain(|_, v| !v.is_temp());
    }

    /// reallocate every slot in the value arrays, resetting values to
    /// their declared initial values. Iteration order of the registry
    /// makes the indices dense and deterministic.
    pub fn reset_values(&mut self, arrays: &mut ValueArrays) {
        arrays.clear();
        for v in self.values.values_mut() {
            v.alloc(arrays);
        }
    }

    /// scans variable, wire & port definitions to correct any
    /// inconsistencies, e.g. after reading a corrupt file
    pub fn make_consistent(&mut self, graph: &PortGraph) {
        // remove slots with no remaining instances
        let existing: BTreeSet<&Ident> = self.items.values().map(|v| &v.name).collect();
        let stale: Vec<Ident> = self
            .values
            .keys()
            .filter(|name| !existing.contains(name))
            .cloned()
            .collect();
        for name in stale {
            self.values.remove(&name);
        }
        // ensure every instance has a slot
        for v in self.items.values() {
            if !v.name.is_empty() && !self.values.contains_key(&v.name) {
                self.values
                    .insert(v.name.clone(), VariableValue::new(v.kind, 0.0));
            }
        }

        self.port_to_variable.clear();
        let mut entries = Vec::new();
        for (id, v) in self.items.iter() {
            for p in v.ports() {
                entries.push((p, *id));
            }
        }
        for (p, id) in entries {
            self.port_to_variable.insert(p, id);
        }

        self.wired.clear();
        let mut wired = BTreeSet::new();
        for w in graph.wires.values() {
            if let Some(v) = self.variable_from_port(w.to) {
                wired.insert(v.name.clone());
            }
        }
        self.wired = wired;
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.port_to_variable.clear();
        self.wired.clear();
        self.values.clear();
    }
}
