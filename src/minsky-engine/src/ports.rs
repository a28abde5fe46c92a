// Copyright 2025 The Minsky Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::BTreeMap;

pub type PortId = usize;
pub type WireId = usize;

/// A typed endpoint attached to a single owning item (operation,
/// variable or Godley column).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Port {
    pub x: f64,
    pub y: f64,
    /// true if this is an input port
    pub input: bool,
    /// true if multiple wires may terminate here; only ever set on the
    /// input ports of the commutative binary operations
    pub multi_wire_allowed: bool,
}

impl Port {
    pub fn new(x: f64, y: f64, input: bool) -> Self {
        Port {
            x,
            y,
            input,
            multi_wire_allowed: false,
        }
    }

    pub fn multi_input(x: f64, y: f64) -> Self {
        Port {
            x,
            y,
            input: true,
            multi_wire_allowed: true,
        }
    }

    pub fn move_by(&mut self, dx: f64, dy: f64) {
        self.x += dx;
        self.y += dy;
    }
}

/// An ordered pair of ports; `from` is an output, `to` an input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Wire {
    pub from: PortId,
    pub to: PortId,
}

impl Wire {
    pub fn new(from: PortId, to: PortId) -> Self {
        Wire { from, to }
    }
}

/// Directed connectivity store between typed endpoints. Admission
/// policy lives in the orchestrator; this store only hands out dense
/// ids and answers connectivity queries.
#[derive(Clone, Debug, Default)]
pub struct PortGraph {
    pub ports: BTreeMap<PortId, Port>,
    pub wires: BTreeMap<WireId, Wire>,
}

impl PortGraph {
    pub fn add_port(&mut self, p: Port) -> PortId {
        let id = next_id(&self.ports);
        self.ports.insert(id, p);
        id
    }

    pub fn del_port(&mut self, port: PortId) {
        self.ports.remove(&port);
    }

    pub fn add_wire(&mut self, w: Wire) -> WireId {
        let id = next_id(&self.wires);
        self.wires.insert(id, w);
        id
    }

    pub fn delete_wire(&mut self, id: WireId) {
        self.wires.remove(&id);
    }

    pub fn wires_attached_to(&self, port: PortId) -> Vec<WireId> {
        self.wires
            .iter()
            .filter(|(_, w)| w.from == port || w.to == port)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn move_port(&mut self, port: PortId, dx: f64, dy: f64) {
        if let Some(p) = self.ports.get_mut(&port) {
            p.move_by(dx, dy);
        }
    }

    pub fn move_port_to(&mut self, port: PortId, x: f64, y: f64) {
        if let Some(p) = self.ports.get_mut(&port) {
            p.x = x;
            p.y = y;
        }
    }
}

pub(crate) fn next_id<V>(map: &BTreeMap<usize, V>) -> usize {
    match map.last_key_value() {
        Some((id, _)) => id + 1,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_ids() {
        let mut g = PortGraph::default();
        let p0 = g.add_port(Port::new(0.0, 0.0, false));
        let p1 = g.add_port(Port::new(0.0, 0.0, true));
        assert_eq!(0, p0);
        assert_eq!(1, p1);
        g.del_port(p1);
        assert_eq!(1, g.add_port(Port::new(0.0, 0.0, true)));
    }

    #[test]
    fn test_wires_attached_to() {
        let mut g = PortGraph::default();
        let out = g.add_port(Port::new(0.0, 0.0, false));
        let in1 = g.add_port(Port::multi_input(0.0, 0.0));
        let in2 = g.add_port(Port::multi_input(0.0, 0.0));
        let w0 = g.add_wire(Wire::new(out, in1));
        let w1 = g.add_wire(Wire::new(out, in2));
        assert_eq!(vec![w0, w1], g.wires_attached_to(out));
        assert_eq!(vec![w0], g.wires_attached_to(in1));
        g.delete_wire(w0);
        assert_eq!(vec![w1], g.wires_attached_to(out));
    }
}
