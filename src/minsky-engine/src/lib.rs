// Copyright 2025 The Minsky Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The Minsky simulation core: compiles a wired graph of operations,
//! variables and double-entry Godley tables into an ordered program of
//! primitive evaluation steps, integrates the resulting system of
//! ordinary differential equations with an adaptive Runge-Kutta
//! driver, and renders the system as LaTeX.

#![forbid(unsafe_code)]

pub mod common;
mod compiler;
mod evalop;
pub mod godley;
pub mod latex;
mod model;
pub mod operation;
pub mod ports;
mod rk;
pub mod schema;
pub mod variable;

pub use self::common::{Error, ErrorCode, ErrorKind, Ident, Result};
pub use self::evalop::{EvalOp, Integral};
pub use self::godley::{AssetClass, GodleyItem, GodleyTable};
pub use self::latex::SystemOfEquations;
pub use self::model::{GodleyId, Matrix, Model};
pub use self::operation::{Operation, OperationId, OperationType, Operations};
pub use self::ports::{Port, PortGraph, PortId, Wire, WireId};
pub use self::rk::{RungeKuttaFehlberg, Status};
pub use self::variable::{
    ValueArrays, Variable, VariableId, VariableKind, VariableRegistry, VariableValue,
};
