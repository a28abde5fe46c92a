// Copyright 2025 The Minsky Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::{BTreeMap, BTreeSet};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::common::{strip_non_alnum, Ident, Result};
use crate::model_err;
use crate::ports::PortGraph;
use crate::variable::{VariableId, VariableKind, VariableRegistry};

pub const INITIAL_CONDITIONS: &str = "Initial Conditions";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetClass {
    #[default]
    NoAssetClass,
    Asset,
    Liability,
    Equity,
}

/// A double-entry accounting grid. Row 0 holds the stock variable
/// headings, column 0 the row labels; the remaining cells hold signed
/// flow formulas.
#[derive(Clone, Debug, Default)]
pub struct GodleyTable {
    data: Vec<Vec<String>>,
    /// class of each column (used in double-entry compliant mode)
    asset_class: Vec<AssetClass>,
    pub double_entry_compliant: bool,
    pub title: String,
}

impl GodleyTable {
    pub fn new() -> Self {
        let mut t = GodleyTable::default();
        t.dimension(2, 2);
        *t.cell_mut(0, 0) = "Flows V / Stock Variables ->".to_string();
        *t.cell_mut(1, 0) = INITIAL_CONDITIONS.to_string();
        t
    }

    pub fn rows(&self) -> usize {
        self.data.len()
    }

    pub fn cols(&self) -> usize {
        if self.data.is_empty() {
            0
        } else {
            self.data[0].len()
        }
    }

    pub fn cell(&self, row: usize, col: usize) -> &str {
        &self.data[row][col]
    }

    pub fn cell_mut(&mut self, row: usize, col: usize) -> &mut String {
        &mut self.data[row][col]
    }

    pub fn set_cell(&mut self, row: usize, col: usize, v: &str) {
        self.data[row][col] = v.to_string();
    }

    pub fn data(&self) -> &[Vec<String>] {
        &self.data
    }

    pub fn asset_classes(&self) -> &[AssetClass] {
        &self.asset_class
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn resize(&mut self, rows: usize, cols: usize) {
        for row in self.data.iter_mut() {
            row.resize(cols, String::new());
        }
        self.data.resize(rows, vec![String::new(); cols]);
        self.asset_class.resize(cols, AssetClass::NoAssetClass);
    }

    pub fn dimension(&mut self, rows: usize, cols: usize) {
        self.clear();
        self.resize(rows, cols);
    }

    pub fn insert_row(&mut self, row: usize) {
        if row <= self.data.len() {
            let cols = self.cols();
            self.data.insert(row, vec![String::new(); cols]);
        }
    }

    pub fn delete_row(&mut self, row: usize) {
        if row > 0 && row <= self.data.len() {
            self.data.remove(row - 1);
        }
    }

    pub fn insert_col(&mut self, col: usize) {
        self.asset_class.insert(col, AssetClass::NoAssetClass);
        if !self.data.is_empty() && col <= self.data[0].len() {
            for row in self.data.iter_mut() {
                row.insert(col, String::new());
            }
        }
    }

    pub fn delete_col(&mut self, col: usize) {
        if col > 0 && col <= self.asset_class.len() {
            self.asset_class.remove(col - 1);
        }
        if col > 0 && !self.data.is_empty() && col <= self.data[0].len() {
            for row in self.data.iter_mut() {
                row.remove(col - 1);
            }
        }
    }

    /// true if `row` is an "Initial Conditions" row: the label matches
    /// case-insensitively, ignoring leading whitespace
    pub fn initial_condition_row(&self, row: usize) -> bool {
        let label = self.cell(row, 0).trim_start();
        label.len() >= INITIAL_CONDITIONS.len()
            && label[..INITIAL_CONDITIONS.len()].eq_ignore_ascii_case(INITIAL_CONDITIONS)
    }

    pub fn asset_class(&self, col: usize) -> AssetClass {
        self.asset_class
            .get(col)
            .copied()
            .unwrap_or(AssetClass::NoAssetClass)
    }

    pub fn set_asset_class(&mut self, col: usize, cls: AssetClass) {
        if col >= self.asset_class.len() {
            let len = self.cols().max(col + 1);
            self.asset_class.resize(len, AssetClass::NoAssetClass);
        }
        self.asset_class[col] = cls;
    }

    /// The usual mathematical sign convention is reversed in double
    /// entry book keeping if the asset class is a liability or equity.
    pub fn sign_convention_reversed(&self, col: usize) -> bool {
        self.double_entry_compliant
            && matches!(
                self.asset_class(col),
                AssetClass::Liability | AssetClass::Equity
            )
    }

    /// the column stock names in column order, stripped of signs;
    /// duplicate labels are an error
    pub fn column_variables(&self) -> Result<Vec<Ident>> {
        let mut uvars = BTreeSet::new();
        let mut vars = Vec::new();
        for c in 1..self.cols() {
            let var = strip_non_alnum(self.cell(0, c));
            if !var.is_empty() {
                if !uvars.insert(var.clone()) {
                    return model_err!(DuplicateColumnLabel, var);
                }
                vars.push(var);
            }
        }
        Ok(vars)
    }

    /// the unique flow variable names from the interior of the table,
    /// in row then column order
    pub fn interior_variables(&self) -> Vec<Ident> {
        let mut vars = Vec::new();
        let mut uvars = BTreeSet::new();
        for r in 1..self.rows() {
            if self.initial_condition_row(r) {
                continue;
            }
            for c in 1..self.cols() {
                let var = strip_non_alnum(self.cell(r, c));
                if !var.is_empty() && uvars.insert(var.clone()) {
                    vars.push(var);
                }
            }
        }
        vars
    }

    /// the symbolic sum across a row, e.g. "+a-b+2c"; "0" if empty
    pub fn row_sum(&self, row: usize) -> String {
        // accumulate the total coefficient of each variable
        let mut sum: BTreeMap<Ident, f64> = BTreeMap::new();
        for c in 1..self.cols() {
            if let Some((coef, name)) = parse_cell(self.cell(row, c)) {
                *sum.entry(name).or_insert(0.0) += coef;
            }
        }

        let mut ret = String::new();
        for (name, coef) in sum {
            if coef == 0.0 {
                continue;
            }
            if !ret.is_empty() && coef > 0.0 {
                ret.push('+');
            }
            if coef == -1.0 {
                ret.push('-');
            } else if coef != 1.0 {
                ret.push_str(&coef.to_string());
            }
            ret.push_str(&name);
        }

        if ret.is_empty() {
            "0".to_string()
        } else {
            ret
        }
    }

    /// toggle flow signs according to double entry compliant mode: on
    /// switching the mode on, every liability/equity entry has its
    /// leading sign flipped so the displayed formulas keep their value
    pub fn set_double_entry_mode(&mut self, mode: bool) {
        if mode == self.double_entry_compliant {
            return;
        }
        // to allow sign_convention_reversed to work below
        self.double_entry_compliant = true;
        for r in 1..self.rows() {
            if self.initial_condition_row(r) {
                continue;
            }
            for c in 1..self.cols() {
                if !self.sign_convention_reversed(c) {
                    continue;
                }
                let formula = &mut self.data[r][c];
                let start = formula.len() - formula.trim_start().len();
                if start == formula.len() {
                    continue; // empty cell
                }
                if formula.as_bytes()[start] == b'-' {
                    formula.remove(start); // turns a negative into a positive
                } else {
                    formula.insert(start, '-');
                }
            }
        }
        self.double_entry_compliant = mode;
    }
}

/// parse an interior cell as an optional leading signed coefficient
/// followed by a variable name. A bare "-" counts as -1, a bare name
/// as +1; an empty cell yields nothing.
fn parse_cell(formula: &str) -> Option<(f64, Ident)> {
    lazy_static! {
        static ref COEF_RE: Regex =
            Regex::new(r"^\s*([+-]?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?)").unwrap();
    }

    let (coef, rest) = match COEF_RE.captures(formula) {
        Some(caps) => {
            let m = caps.get(1).unwrap();
            (m.as_str().parse::<f64>().unwrap(), &formula[m.end()..])
        }
        None => {
            let rest = formula.trim_start();
            if rest.is_empty() {
                return None;
            }
            match rest.strip_prefix('-') {
                Some(rest) => (-1.0, rest),
                None => (1.0, rest),
            }
        }
    };
    Some((coef, rest.trim().to_string()))
}

/// A Godley table together with the variables it has bound into the
/// registry: one stock per column heading, one flow per distinct
/// interior entry.
#[derive(Debug, Default)]
pub struct GodleyItem {
    pub x: f64,
    pub y: f64,
    pub table: GodleyTable,
    pub stock_vars: Vec<VariableId>,
    pub flow_vars: Vec<VariableId>,
}

impl GodleyItem {
    pub fn new() -> Self {
        GodleyItem {
            table: GodleyTable::new(),
            ..Default::default()
        }
    }

    /// updates the registry's variables to match the table, and
    /// harvests initial-condition cells into slot initial values
    pub fn update(&mut self, registry: &mut VariableRegistry, graph: &mut PortGraph) -> Result<()> {
        let stocks = self.table.column_variables()?;
        let flows = self.table.interior_variables();
        self.stock_vars = update_vars(
            registry,
            graph,
            &self.stock_vars,
            &stocks,
            VariableKind::Stock,
        );
        self.flow_vars = update_vars(
            registry,
            graph,
            &self.flow_vars,
            &flows,
            VariableKind::Flow,
        );

        // retrieve initial conditions, if any
        for r in 1..self.table.rows() {
            if !self.table.initial_condition_row(r) {
                continue;
            }
            for c in 1..self.table.cols() {
                let name = strip_non_alnum(self.table.cell(0, c));
                if name.is_empty() {
                    continue;
                }
                let reversed = self.table.sign_convention_reversed(c);
                let cell = self.table.cell(r, c).trim().to_string();
                let value = registry.values.get_mut(&name);
                let value = match value {
                    Some(v) => v,
                    None => continue,
                };
                value.godley_overridden = false;
                if cell.is_empty() {
                    // populate the cell with the current initial value
                    let init = if reversed { -value.init } else { value.init };
                    *self.table.cell_mut(r, c) = init.to_string();
                } else if let Ok(init) = cell.parse::<f64>() {
                    value.init = if reversed { -init } else { init };
                    value.godley_overridden = true;
                }
            }
        }
        Ok(())
    }
}

fn update_vars(
    registry: &mut VariableRegistry,
    graph: &mut PortGraph,
    old_ids: &[VariableId],
    names: &[Ident],
    kind: VariableKind,
) -> Vec<VariableId> {
    let mut old_by_name: BTreeMap<Ident, VariableId> = BTreeMap::new();
    for id in old_ids {
        if let Some(v) = registry.get(*id) {
            old_by_name.insert(v.name.clone(), *id);
        }
    }

    let mut ids = Vec::with_capacity(names.len());
    for name in names {
        match old_by_name.remove(name) {
            Some(id) => ids.push(id),
            None => {
                let id = registry.add_variable(graph, kind, name);
                registry.get_mut(id).unwrap().godley = true;
                ids.push(id);
            }
        }
    }
    // anything left over no longer appears in the table
    for (_, id) in old_by_name {
        registry.erase(graph, id);
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_condition_row() {
        let mut t = GodleyTable::new();
        assert!(t.initial_condition_row(1));
        *t.cell_mut(1, 0) = "  initial conditions".to_string();
        assert!(t.initial_condition_row(1));
        *t.cell_mut(1, 0) = "Flows".to_string();
        assert!(!t.initial_condition_row(1));
    }

    #[test]
    fn test_column_variables() {
        let mut t = GodleyTable::new();
        t.resize(2, 4);
        t.set_cell(0, 1, "c");
        t.set_cell(0, 2, " d ");
        t.set_cell(0, 3, "");
        assert_eq!(vec!["c", "d"], t.column_variables().unwrap());
        t.set_cell(0, 3, "c");
        assert!(t.column_variables().is_err());
    }

    #[test]
    fn test_interior_variables() {
        let mut t = GodleyTable::new();
        t.resize(3, 3);
        t.set_cell(2, 1, "a");
        t.set_cell(2, 2, "-a");
        assert_eq!(vec!["a"], t.interior_variables());
        t.set_cell(1, 1, "ignored"); // initial conditions row
        assert_eq!(vec!["a"], t.interior_variables());
    }

    #[test]
    fn test_row_sum() {
        let mut t = GodleyTable::new();
        t.resize(3, 4);
        t.set_cell(2, 1, "a");
        t.set_cell(2, 2, "-a");
        assert_eq!("0", t.row_sum(2));
        t.set_cell(2, 3, "b");
        assert_eq!("b", t.row_sum(2));
        t.set_cell(2, 2, "2a");
        assert_eq!("3a+b", t.row_sum(2));
        t.set_cell(2, 1, "-b");
        assert_eq!("2a", t.row_sum(2));
        assert_eq!("0", t.row_sum(1));
    }

    #[test]
    fn test_parse_cell() {
        assert_eq!(None, parse_cell("   "));
        assert_eq!(Some((1.0, "x".to_string())), parse_cell("x"));
        assert_eq!(Some((-1.0, "x".to_string())), parse_cell(" -x"));
        assert_eq!(Some((2.5, "x".to_string())), parse_cell("2.5x"));
        assert_eq!(Some((-2.0, "x y".to_string())), parse_cell("-2 x y "));
    }

    #[test]
    fn test_set_double_entry_mode() {
        let mut t = GodleyTable::new();
        t.resize(3, 3);
        t.set_asset_class(1, AssetClass::Asset);
        t.set_asset_class(2, AssetClass::Liability);
        t.set_cell(2, 1, "a");
        t.set_cell(2, 2, "a");
        t.set_double_entry_mode(true);
        assert_eq!("a", t.cell(2, 1));
        assert_eq!("-a", t.cell(2, 2));
        assert!(t.sign_convention_reversed(2));
        t.set_double_entry_mode(false);
        assert_eq!("a", t.cell(2, 2));
    }

    #[test]
    fn test_double_entry_row_sum_is_zero() {
        // matched asset/liability entries cancel symbolically once the
        // liability column's sign convention is accounted for
        let mut t = GodleyTable::new();
        t.resize(3, 3);
        t.set_asset_class(1, AssetClass::Asset);
        t.set_asset_class(2, AssetClass::Liability);
        t.set_cell(2, 1, "x");
        t.set_cell(2, 2, "x");
        t.set_double_entry_mode(true);
        assert_eq!("0", t.row_sum(2));
    }
}
