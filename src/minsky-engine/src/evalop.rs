// Copyright 2025 The Minsky Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use crate::operation::{OperationId, OperationType, Operations};
use crate::variable::VariableValue;

/// A primitive evaluation step of the compiled program. `out` always
/// indexes the flow array; `flow1`/`flow2` select whether the inputs
/// read from the flow or the stock array.
#[derive(Clone, Debug, PartialEq)]
pub struct EvalOp {
    pub op: OperationType,
    pub out: usize,
    pub in1: usize,
    pub in2: usize,
    pub flow1: bool,
    pub flow2: bool,
    /// owning operation, used for constant values and diagnostics
    pub state: Option<OperationId>,
}

impl EvalOp {
    pub fn new(op: OperationType, out: usize) -> Self {
        EvalOp {
            op,
            out,
            in1: 0,
            in2: 0,
            flow1: true,
            flow2: true,
            state: None,
        }
    }

    /// a copy step moving one slot's value into an lhs slot
    pub fn copy(from: &VariableValue, to: &VariableValue) -> Self {
        debug_assert!(to.is_lhs());
        debug_assert!(from.idx().is_some() && to.idx().is_some());
        debug_assert!(!from.is_lhs() || from.idx() != to.idx());
        EvalOp {
            op: OperationType::Copy,
            out: to.idx().unwrap(),
            in1: from.idx().unwrap(),
            in2: 0,
            flow1: from.is_lhs(),
            flow2: true,
            state: None,
        }
    }

    pub fn num_args(&self) -> usize {
        self.op.arity()
    }

    /// evaluate on the stock array and current flow values, storing the
    /// result in the output flow slot
    pub fn eval(&self, t: f64, fv: &mut [f64], sv: &[f64], ops: &Operations) {
        let x1 = if self.num_args() > 0 {
            if self.flow1 {
                fv[self.in1]
            } else {
                sv[self.in1]
            }
        } else {
            0.0
        };
        let x2 = if self.num_args() > 1 {
            if self.flow2 {
                fv[self.in2]
            } else {
                sv[self.in2]
            }
        } else {
            0.0
        };
        fv[self.out] = match self.op {
            OperationType::Constant => self.constant_value(ops),
            _ => self.op.evaluate(x1, x2, t),
        };
    }

    /// total derivative with respect to a stock variable. Seed `ds`
    /// with 1 in that variable's position and zero elsewhere, zero
    /// `df`, then apply in program order; `df` accumulates the flow
    /// derivatives.
    pub fn deriv(&self, df: &mut [f64], ds: &[f64], sv: &[f64], fv: &[f64]) {
        match self.num_args() {
            0 => df[self.out] = 0.0,
            1 => {
                let x1 = if self.flow1 { fv[self.in1] } else { sv[self.in1] };
                let dx1 = if self.flow1 { df[self.in1] } else { ds[self.in1] };
                df[self.out] = if dx1 != 0.0 {
                    dx1 * self.op.d1(x1, 0.0)
                } else {
                    0.0
                };
            }
            _ => {
                let x1 = if self.flow1 { fv[self.in1] } else { sv[self.in1] };
                let x2 = if self.flow2 { fv[self.in2] } else { sv[self.in2] };
                let dx1 = if self.flow1 { df[self.in1] } else { ds[self.in1] };
                let dx2 = if self.flow2 { df[self.in2] } else { ds[self.in2] };
                df[self.out] = if dx1 != 0.0 {
                    dx1 * self.op.d1(x1, x2)
                } else {
                    0.0
                } + if dx2 != 0.0 {
                    dx2 * self.op.d2(x1, x2)
                } else {
                    0.0
                };
            }
        }
    }

    /// reset state to initial values: constants pre-write their value
    pub fn reset(&self, fv: &mut [f64], ops: &Operations) {
        if self.op == OperationType::Constant {
            fv[self.out] = self.constant_value(ops);
        }
    }

    fn constant_value(&self, ops: &Operations) -> f64 {
        self.state
            .and_then(|id| ops.get(&id))
            .map(|op| op.value)
            .unwrap_or(0.0)
    }
}

/// An additional stock variable that integrates its input flow.
#[derive(Clone, Debug, Default)]
pub struct Integral {
    pub stock: VariableValue,
    pub input: VariableValue,
    /// owning integrate operation, for diagnostics
    pub operation: Option<OperationId>,
}
