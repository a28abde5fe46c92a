// Copyright 2026 The Minsky Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Schema 1 is the defined and published persistence format: an XML
//! document rooted at `Minsky`, with a `model` section of items
//! carrying document-wide unique ids and a parallel `layout` list
//! referencing them. Reads of older files fall back to the flatter
//! legacy schema 0, which carried coordinates inline and no layout
//! array.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::Result;
use crate::godley::{AssetClass, GodleyItem, GodleyTable};
use crate::model::Model;
use crate::operation::{Operation, OperationType};
use crate::ports::{Port, PortId, Wire};
use crate::schema_err;
use crate::variable::{Variable, VariableId, VariableKind};

fn default_schema_version() -> i32 {
    -1
}

fn default_zoom() -> f64 {
    1.0
}

fn default_visible() -> bool {
    true
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename = "Minsky", rename_all = "camelCase")]
pub struct MinskyDoc {
    #[serde(default = "default_schema_version")]
    pub schema_version: i32,
    #[serde(default)]
    pub model: MinskyModel,
    #[serde(default)]
    pub layout: Vec<LayoutEntry>,
    #[serde(default = "default_zoom")]
    pub zoom_factor: f64,
}

pub const SCHEMA_VERSION: i32 = 1;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinskyModel {
    #[serde(default)]
    pub ports: Vec<PortEntry>,
    #[serde(default)]
    pub wires: Vec<WireEntry>,
    #[serde(default)]
    pub operations: Vec<OperationEntry>,
    #[serde(default)]
    pub variables: Vec<VariableEntry>,
    #[serde(default)]
    pub plots: Vec<PlotEntry>,
    #[serde(default)]
    pub groups: Vec<GroupEntry>,
    #[serde(default)]
    pub godleys: Vec<GodleyEntry>,
    #[serde(default)]
    pub runge_kutta: RungeKutta,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortEntry {
    pub id: usize,
    #[serde(default)]
    pub input: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEntry {
    pub id: usize,
    pub from: usize,
    pub to: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEntry {
    pub id: usize,
    #[serde(rename = "type")]
    pub kind: OperationType,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub ports: Vec<usize>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int_var: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableEntry {
    pub id: usize,
    #[serde(rename = "type")]
    pub kind: VariableKind,
    #[serde(default)]
    pub init: f64,
    #[serde(default)]
    pub ports: Vec<usize>,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlotEntry {
    pub id: usize,
    #[serde(default)]
    pub ports: Vec<usize>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupEntry {
    pub id: usize,
    #[serde(default)]
    pub items: Vec<usize>,
    #[serde(default)]
    pub ports: Vec<usize>,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GodleyRow {
    #[serde(default)]
    pub cell: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GodleyEntry {
    pub id: usize,
    #[serde(default)]
    pub ports: Vec<usize>,
    #[serde(default)]
    pub double_entry_compliant: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data: Vec<GodleyRow>,
    #[serde(default)]
    pub asset_classes: Vec<AssetClass>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RungeKutta {
    pub step_min: f64,
    pub step_max: f64,
    pub n_steps: usize,
    pub eps_rel: f64,
    pub eps_abs: f64,
}

impl Default for RungeKutta {
    fn default() -> Self {
        RungeKutta {
            step_min: 0.0,
            step_max: 0.1,
            n_steps: 1,
            eps_rel: 1e-2,
            eps_abs: 1e-3,
        }
    }
}

/// a union of the per-item layout shapes: position for everything,
/// coords for wires
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutEntry {
    pub id: usize,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coords: Vec<f64>,
}

impl MinskyModel {
    /// checks that all items are uniquely identified and that wires
    /// reference known ports
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut check = |id: usize| -> Result<()> {
            if !ids.insert(id) {
                return schema_err!(DuplicateId, format!("duplicate item id {}", id));
            }
            Ok(())
        };
        for p in &self.ports {
            check(p.id)?;
        }
        for w in &self.wires {
            check(w.id)?;
        }
        for o in &self.operations {
            check(o.id)?;
        }
        for v in &self.variables {
            check(v.id)?;
        }
        for p in &self.plots {
            check(p.id)?;
        }
        for g in &self.groups {
            check(g.id)?;
        }
        for g in &self.godleys {
            check(g.id)?;
        }

        let port_ids: HashSet<usize> = self.ports.iter().map(|p| p.id).collect();
        for w in &self.wires {
            if !port_ids.contains(&w.from) || !port_ids.contains(&w.to) {
                return schema_err!(UnknownPort, format!("wire {} references unknown port", w.id));
            }
        }
        Ok(())
    }
}

/// serialise a model into a schema-1 document. Item ids are assigned
/// document-wide; the layout list references them.
pub fn to_doc(model: &Model) -> MinskyDoc {
    let mut doc = MinskyDoc {
        schema_version: SCHEMA_VERSION,
        zoom_factor: model.zoom_factor,
        ..Default::default()
    };
    let mut next_id = 0;
    let mut fresh = || {
        let id = next_id;
        next_id += 1;
        id
    };

    let mut port_sid: HashMap<PortId, usize> = HashMap::new();
    for (pid, p) in &model.graph.ports {
        let id = fresh();
        port_sid.insert(*pid, id);
        doc.model.ports.push(PortEntry { id, input: p.input });
        doc.layout.push(LayoutEntry {
            id,
            x: p.x,
            y: p.y,
            ..Default::default()
        });
    }

    for w in model.graph.wires.values() {
        let id = fresh();
        doc.model.wires.push(WireEntry {
            id,
            from: port_sid[&w.from],
            to: port_sid[&w.to],
        });
        doc.layout.push(LayoutEntry {
            id,
            ..Default::default()
        });
    }

    let mut var_sid: HashMap<VariableId, usize> = HashMap::new();
    for (vid, v) in model.variables.iter() {
        let id = fresh();
        var_sid.insert(*vid, id);
        let init = model
            .variables
            .get_value(&v.name)
            .map(|val| val.init)
            .unwrap_or(0.0);
        doc.model.variables.push(VariableEntry {
            id,
            kind: v.kind,
            init,
            ports: v.ports().iter().map(|p| port_sid[p]).collect(),
            name: v.name.clone(),
        });
        doc.layout.push(LayoutEntry {
            id,
            x: v.x,
            y: v.y,
            ..Default::default()
        });
    }

    for op in model.operations.values() {
        let id = fresh();
        doc.model.operations.push(OperationEntry {
            id,
            kind: op.kind,
            value: op.value,
            ports: op.ports().iter().map(|p| port_sid[p]).collect(),
            name: op.description.clone(),
            int_var: op.int_var().and_then(|v| var_sid.get(&v).copied()),
        });
        doc.layout.push(LayoutEntry {
            id,
            x: op.x,
            y: op.y,
            ..Default::default()
        });
    }

    for item in model.godleys.values() {
        let id = fresh();
        let var_ports = |ids: &[VariableId]| -> Vec<usize> {
            ids.iter()
                .filter_map(|v| model.variables.get(*v))
                .flat_map(|v| v.ports())
                .filter_map(|p| port_sid.get(&p).copied())
                .collect()
        };
        let mut ports = var_ports(&item.flow_vars);
        ports.extend(var_ports(&item.stock_vars));
        doc.model.godleys.push(GodleyEntry {
            id,
            ports,
            double_entry_compliant: item.table.double_entry_compliant,
            name: item.table.title.clone(),
            data: item
                .table
                .data()
                .iter()
                .map(|row| GodleyRow { cell: row.clone() })
                .collect(),
            asset_classes: item.table.asset_classes().to_vec(),
        });
        doc.layout.push(LayoutEntry {
            id,
            x: item.x,
            y: item.y,
            ..Default::default()
        });
    }

    doc.model.runge_kutta = RungeKutta {
        step_min: model.step_min,
        step_max: model.step_max,
        n_steps: model.n_steps,
        eps_rel: model.eps_rel,
        eps_abs: model.eps_abs,
    };
    doc
}

/// rebuild a model from a validated document
pub fn from_doc(doc: &MinskyDoc) -> Result<Model> {
    doc.model.validate()?;

    let layout: HashMap<usize, &LayoutEntry> = doc.layout.iter().map(|l| (l.id, l)).collect();
    let position = |id: usize| -> (f64, f64) {
        layout.get(&id).map(|l| (l.x, l.y)).unwrap_or((0.0, 0.0))
    };

    let mut model = Model::new();
    model.zoom_factor = doc.zoom_factor;

    let mut port_rid: HashMap<usize, PortId> = HashMap::new();
    for p in &doc.model.ports {
        let (x, y) = position(p.id);
        let rid = model.graph.add_port(Port::new(x, y, p.input));
        port_rid.insert(p.id, rid);
    }

    // document id -> runtime id, for integral back-references
    let mut var_rid: HashMap<usize, VariableId> = HashMap::new();
    for v in &doc.model.variables {
        let (x, y) = position(v.id);
        let out_port = v.ports.first().and_then(|p| port_rid.get(p)).copied();
        let in_port = v.ports.get(1).and_then(|p| port_rid.get(p)).copied();
        let id = model.variables.insert_item(
            None,
            Variable {
                kind: v.kind,
                name: v.name.clone(),
                x,
                y,
                godley: false,
                out_port,
                in_port,
            },
        );
        model.variables.set_init(&v.name, v.init);
        var_rid.insert(v.id, id);
    }

    for o in &doc.model.operations {
        let (x, y) = position(o.id);
        let ports = o
            .ports
            .iter()
            .filter_map(|p| port_rid.get(p).copied())
            .collect();
        let int_var = o.int_var.and_then(|sid| var_rid.get(&sid).copied());
        let op = Operation {
            kind: o.kind,
            x,
            y,
            value: o.value,
            description: o.name.clone(),
            ports,
            int_var,
        };
        // multi-wire admission is a property of the operation kind,
        // recomputed rather than persisted
        if op.kind.is_binary_arithmetic() {
            for p in &op.ports()[1..] {
                if let Some(port) = model.graph.ports.get_mut(p) {
                    port.multi_wire_allowed = true;
                }
            }
        }
        let id = crate::ports::next_id(&model.operations);
        model.operations.insert(id, op);
    }

    // duplicate wires between the same two ports are dropped on read
    let mut seen: HashSet<(usize, usize)> = HashSet::new();
    for w in &doc.model.wires {
        if !seen.insert((w.from, w.to)) {
            continue;
        }
        model
            .graph
            .add_wire(Wire::new(port_rid[&w.from], port_rid[&w.to]));
    }

    for g in &doc.model.godleys {
        let (x, y) = position(g.id);
        let mut table = GodleyTable::default();
        table.double_entry_compliant = g.double_entry_compliant;
        table.title = g.name.clone();
        let rows = g.data.len();
        let cols = g.data.iter().map(|r| r.cell.len()).max().unwrap_or(0);
        table.dimension(rows, cols);
        for (r, row) in g.data.iter().enumerate() {
            for (c, cell) in row.cell.iter().enumerate() {
                table.set_cell(r, c, cell);
            }
        }
        for (c, cls) in g.asset_classes.iter().enumerate() {
            table.set_asset_class(c, *cls);
        }
        let mut item = GodleyItem {
            x,
            y,
            table,
            stock_vars: Vec::new(),
            flow_vars: Vec::new(),
        };
        bind_godley_vars(&mut model, &mut item)?;
        let id = crate::ports::next_id(&model.godleys);
        model.godleys.insert(id, item);
    }

    model.step_min = doc.model.runge_kutta.step_min;
    model.step_max = doc.model.runge_kutta.step_max;
    model.n_steps = doc.model.runge_kutta.n_steps;
    model.eps_rel = doc.model.runge_kutta.eps_rel;
    model.eps_abs = doc.model.runge_kutta.eps_abs;

    // rebuild the registry's derived state and refresh each table
    model.variables.make_consistent(&model.graph);
    let godley_ids: Vec<usize> = model.godleys.keys().copied().collect();
    for id in godley_ids {
        let mut item = model.godleys.remove(&id).unwrap();
        item.update(&mut model.variables, &mut model.graph)?;
        model.godleys.insert(id, item);
    }
    model.set_reset_needed();
    Ok(model)
}

/// rebind a loaded table to the variable items read from the document,
/// matching by name and kind, so update() reuses them
fn bind_godley_vars(model: &mut Model, item: &mut GodleyItem) -> Result<()> {
    let mut claim = |name: &str, kind: VariableKind| -> Option<VariableId> {
        let found = model
            .variables
            .iter()
            .find(|(_, v)| v.name == name && v.kind == kind)
            .map(|(id, _)| *id);
        if let Some(id) = found {
            model.variables.get_mut(id).unwrap().godley = true;
        }
        found
    };
    for name in item.table.column_variables()? {
        if let Some(id) = claim(&name, VariableKind::Stock) {
            item.stock_vars.push(id);
        }
    }
    for name in item.table.interior_variables() {
        if let Some(id) = claim(&name, VariableKind::Flow) {
            item.flow_vars.push(id);
        }
    }
    Ok(())
}

// ---- legacy schema 0 ----------------------------------------------

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename = "Minsky", rename_all = "camelCase")]
struct LegacyDoc {
    #[serde(default)]
    ports: Vec<LegacyPort>,
    #[serde(default)]
    wires: Vec<WireEntry>,
    #[serde(default)]
    operations: Vec<LegacyOperation>,
    #[serde(default)]
    variables: Vec<LegacyVariable>,
    #[serde(default)]
    godleys: Vec<GodleyEntry>,
    #[serde(default)]
    step_min: f64,
    #[serde(default = "legacy_step_max")]
    step_max: f64,
    #[serde(default = "legacy_n_steps")]
    n_steps: usize,
    #[serde(default = "legacy_eps_rel")]
    eps_rel: f64,
    #[serde(default = "legacy_eps_abs")]
    eps_abs: f64,
}

fn legacy_step_max() -> f64 {
    0.1
}
fn legacy_n_steps() -> usize {
    1
}
fn legacy_eps_rel() -> f64 {
    1e-2
}
fn legacy_eps_abs() -> f64 {
    1e-3
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyPort {
    id: usize,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    #[serde(default)]
    input: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyOperation {
    id: usize,
    #[serde(rename = "type")]
    kind: OperationType,
    #[serde(default)]
    value: f64,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    #[serde(default)]
    ports: Vec<usize>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    int_var: Option<usize>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyVariable {
    id: usize,
    #[serde(rename = "type")]
    kind: VariableKind,
    #[serde(default)]
    init: f64,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    #[serde(default)]
    ports: Vec<usize>,
    #[serde(default)]
    name: String,
}

impl LegacyDoc {
    /// lift a legacy document into the current schema shape
    fn upgrade(self) -> MinskyDoc {
        let mut doc = MinskyDoc {
            schema_version: SCHEMA_VERSION,
            ..Default::default()
        };
        for p in self.ports {
            doc.model.ports.push(PortEntry {
                id: p.id,
                input: p.input,
            });
            doc.layout.push(LayoutEntry {
                id: p.id,
                x: p.x,
                y: p.y,
                ..Default::default()
            });
        }
        doc.model.wires = self.wires;
        for o in self.operations {
            doc.model.operations.push(OperationEntry {
                id: o.id,
                kind: o.kind,
                value: o.value,
                ports: o.ports,
                name: o.name,
                int_var: o.int_var,
            });
            doc.layout.push(LayoutEntry {
                id: o.id,
                x: o.x,
                y: o.y,
                ..Default::default()
            });
        }
        for v in self.variables {
            doc.model.variables.push(VariableEntry {
                id: v.id,
                kind: v.kind,
                init: v.init,
                ports: v.ports,
                name: v.name,
            });
            doc.layout.push(LayoutEntry {
                id: v.id,
                x: v.x,
                y: v.y,
                ..Default::default()
            });
        }
        doc.model.godleys = self.godleys;
        doc.model.runge_kutta = RungeKutta {
            step_min: self.step_min,
            step_max: self.step_max,
            n_steps: self.n_steps,
            eps_rel: self.eps_rel,
            eps_abs: self.eps_abs,
        };
        doc
    }
}

// ---- file i/o ------------------------------------------------------

pub fn to_xml(model: &Model) -> Result<String> {
    let doc = to_doc(model);
    match quick_xml::se::to_string(&doc) {
        Ok(body) => Ok(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}\n",
            body
        )),
        Err(e) => schema_err!(XmlDeserialization, e.to_string()),
    }
}

pub fn from_xml(xml: &str) -> Result<Model> {
    let doc: MinskyDoc = match quick_xml::de::from_str(xml) {
        Ok(doc) => doc,
        Err(e) => return schema_err!(XmlDeserialization, e.to_string()),
    };
    if doc.schema_version == SCHEMA_VERSION {
        return from_doc(&doc);
    }
    // fall back to the legacy schema
    let legacy: LegacyDoc = match quick_xml::de::from_str(xml) {
        Ok(doc) => doc,
        Err(e) => return schema_err!(SchemaMismatch, e.to_string()),
    };
    from_doc(&legacy.upgrade())
}

impl Model {
    /// save to a file
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.garbage_collect();
        let xml = to_xml(self)?;
        fs::write(path, xml)?;
        self.set_saved();
        Ok(())
    }

    /// load from a file, replacing the current contents
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let xml = fs::read_to_string(path)?;
        let mut loaded = from_xml(&xml)?;
        loaded.reporter = std::mem::take(&mut self.reporter);
        *self = loaded;
        Ok(())
    }
}
