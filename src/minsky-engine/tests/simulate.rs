// Copyright 2025 The Minsky Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! End-to-end simulation scenarios driving the compiled program
//! through the adaptive Runge-Kutta driver.

use float_cmp::approx_eq;

use minsky_engine::{ErrorCode, Matrix, Model, OperationType, PortId, VariableId};

fn op_ports(m: &Model, id: usize) -> Vec<PortId> {
    m.operations[&id].ports().to_vec()
}

fn var_in(m: &Model, id: VariableId) -> PortId {
    m.variables.get(id).unwrap().in_port().unwrap()
}

fn var_out(m: &Model, id: VariableId) -> PortId {
    m.variables.get(id).unwrap().out_port().unwrap()
}

/// build the Godley fixture with stocks c, d, e and flows a, b, f
fn godley_fixture(m: &mut Model, flows: [&str; 3]) {
    let g = m.add_godley_table().unwrap();
    {
        let item = m.godleys.get_mut(&g).unwrap();
        item.table.resize(3, 4);
        item.table.set_cell(0, 1, "c");
        item.table.set_cell(0, 2, "d");
        item.table.set_cell(0, 3, "e");
        item.table.set_cell(2, 1, flows[0]);
        item.table.set_cell(2, 2, flows[1]);
        item.table.set_cell(2, 3, flows[2]);
    }
    let mut item = m.godleys.remove(&g).unwrap();
    item.update(&mut m.variables, &mut m.graph).unwrap();
    m.godleys.insert(g, item);
}

// S1: a constant fed into an integral accumulates linearly
#[test]
fn test_integrate_constant() {
    let mut m = Model::new();
    let k = m.add_operation(OperationType::Constant);
    m.operations.get_mut(&k).unwrap().value = 10.0;
    let int = m.add_operation(OperationType::Integrate);
    let output = m.new_variable("output");

    let k_out = op_ports(&m, k)[0];
    let int_ports = op_ports(&m, int);
    m.add_wire(k_out, int_ports[1]).unwrap();
    m.add_wire(int_ports[0], var_in(&m, output)).unwrap();

    m.n_steps = 1;
    m.step().unwrap();
    let t = m.t;
    assert!(t > 0.0);
    let stock = m.integrals()[0].stock.value(&m.arrays);
    assert!(
        approx_eq!(f64, 10.0 * t, stock, epsilon = 1e-9),
        "stock = {} at t = {}",
        stock,
        t
    );
    assert!(approx_eq!(
        f64,
        stock,
        m.value("output"),
        epsilon = 1e-9
    ));
}

// S2: chaining a second integral gives the quadratic solution
#[test]
fn test_second_order_integral() {
    let mut m = Model::new();
    let k = m.add_operation(OperationType::Constant);
    m.operations.get_mut(&k).unwrap().value = 10.0;
    let int1 = m.add_operation(OperationType::Integrate);
    let int2 = m.add_operation(OperationType::Integrate);

    let k_out = op_ports(&m, k)[0];
    let int1_ports = op_ports(&m, int1);
    let int2_ports = op_ports(&m, int2);
    m.add_wire(k_out, int1_ports[1]).unwrap();
    m.add_wire(int1_ports[0], int2_ports[1]).unwrap();

    m.n_steps = 1;
    m.step().unwrap();
    let t = m.t;
    let second = m.integrals()[1].stock.value(&m.arrays);
    assert!(
        approx_eq!(f64, 0.5 * 10.0 * t * t, second, epsilon = 1e-6),
        "second = {} at t = {}",
        second,
        t
    );
}

// S3: Godley mass flow: a +a/-a pair moves value from d to c
#[test]
fn test_godley_eval() {
    let mut m = Model::new();
    godley_fixture(&mut m, ["a", "-a", ""]);

    m.set_init("c", 10.0);
    m.set_init("d", 20.0);
    m.set_init("e", 30.0);
    m.set_init("a", 5.0);

    m.reset().unwrap();
    assert_eq!(10.0, m.value("c"));
    assert_eq!(20.0, m.value("d"));
    assert_eq!(30.0, m.value("e"));
    assert_eq!(5.0, m.value("a"));

    let mut sv = vec![0.0; m.arrays.stock.len()];
    m.godley_eval(&mut sv, &m.arrays.flow);
    let idx = |name: &str| m.variables.get_value(name).unwrap().idx().unwrap();
    assert_eq!(5.0, sv[idx("c")]);
    assert_eq!(-5.0, sv[idx("d")]);
    assert_eq!(0.0, sv[idx("e")]);
}

// S4: a cycle not passing through an integral is rejected
#[test]
fn test_cyclic_network_throws() {
    let mut m = Model::new();
    let add = m.add_operation(OperationType::Add);
    let w = m.new_variable("w");
    let a = m.new_variable("a");

    let add_ports = op_ports(&m, add);
    m.add_wire(add_ports[0], var_in(&m, w)).unwrap();
    m.add_wire(var_out(&m, w), add_ports[1]).unwrap();
    m.add_wire(var_out(&m, a), add_ports[2]).unwrap();

    let err = m.construct_equations().unwrap_err();
    assert_eq!(ErrorCode::CyclicNetwork, err.code);
    // an error leaves the model requiring a reset
    assert!(m.step().is_err());
    assert!(m.reset_needed());
}

// S5: integration legitimately closes loops through state
#[test]
fn test_cyclic_integrate_does_not_throw() {
    let mut m = Model::new();
    let int = m.add_operation(OperationType::Integrate);
    let mul = m.add_operation(OperationType::Multiply);
    let b = m.new_variable("b");

    let int_ports = op_ports(&m, int);
    let mul_ports = op_ports(&m, mul);
    m.add_wire(int_ports[0], mul_ports[1]).unwrap();
    m.add_wire(mul_ports[0], int_ports[1]).unwrap();
    m.add_wire(var_out(&m, b), mul_ports[2]).unwrap();

    m.construct_equations().unwrap();

    // ds/dt = b*s with b = 1, s0 = 1 is exponential growth
    m.set_init("b", 1.0);
    m.set_init("int", 1.0);
    m.n_steps = 10;
    m.step().unwrap();
    let s = m.integrals()[0].stock.value(&m.arrays);
    assert!(
        approx_eq!(f64, m.t.exp(), s, epsilon = 1e-3),
        "s = {} vs exp(t) = {}",
        s,
        m.t.exp()
    );
}

// S6: two wires into one input port fold through the operation
fn multi_input(kind: OperationType, port: usize, expected: f64) {
    let mut m = Model::new();
    let a = m.new_variable("a");
    let b = m.new_variable("b");
    let c = m.new_variable("c");
    m.set_init("a", 0.1);
    m.set_init("b", 0.2);

    // an integral so the driver has state to advance
    let int = m.add_operation(OperationType::Integrate);
    let op = m.add_operation(kind);

    let op_ps = op_ports(&m, op);
    m.add_wire(var_out(&m, a), op_ps[port]).unwrap();
    m.add_wire(var_out(&m, b), op_ps[port]).unwrap();
    m.add_wire(op_ps[0], var_in(&m, c)).unwrap();
    m.add_wire(var_out(&m, c), op_ports(&m, int)[1]).unwrap();

    m.step().unwrap();
    assert!(
        approx_eq!(f64, expected, m.value("c"), epsilon = 1e-5),
        "{:?}: c = {}",
        kind,
        m.value("c")
    );
}

#[test]
fn test_multi_variable_inputs_add() {
    multi_input(OperationType::Add, 1, 0.3);
}

#[test]
fn test_multi_variable_inputs_subtract() {
    multi_input(OperationType::Subtract, 2, -0.3);
}

#[test]
fn test_multi_variable_inputs_multiply() {
    multi_input(OperationType::Multiply, 1, 0.02);
}

#[test]
fn test_multi_variable_inputs_divide() {
    multi_input(OperationType::Divide, 2, 50.0);
}

// the analytic Jacobian of the classic three-stock fixture
//
//      c           -- a
//        \       /
//         +--int
//        /       \
//      d          * - b
//                /
//      e ------------ f
#[test]
fn test_jacobian() {
    let mut m = Model::new();
    godley_fixture(&mut m, ["a", "b", "f"]);

    let add = m.add_operation(OperationType::Add);
    let int = m.add_operation(OperationType::Integrate);
    let mul = m.add_operation(OperationType::Multiply);

    let name_id = |m: &Model, name: &str| -> VariableId {
        m.variables
            .iter()
            .find(|(_, v)| v.name == name)
            .map(|(id, _)| *id)
            .unwrap()
    };
    let (a, b, e, f) = (
        name_id(&m, "a"),
        name_id(&m, "b"),
        name_id(&m, "e"),
        name_id(&m, "f"),
    );
    let (c, d) = (name_id(&m, "c"), name_id(&m, "d"));

    let add_ports = op_ports(&m, add);
    let int_ports = op_ports(&m, int);
    let mul_ports = op_ports(&m, mul);
    m.add_wire(var_out(&m, e), var_in(&m, f)).unwrap();
    m.add_wire(var_out(&m, c), add_ports[1]).unwrap();
    m.add_wire(var_out(&m, d), add_ports[2]).unwrap();
    m.add_wire(add_ports[0], int_ports[1]).unwrap();
    m.add_wire(int_ports[0], var_in(&m, a)).unwrap();
    m.add_wire(int_ports[0], mul_ports[1]).unwrap();
    m.add_wire(var_out(&m, e), mul_ports[2]).unwrap();
    m.add_wire(mul_ports[0], var_in(&m, b)).unwrap();

    m.construct_equations().unwrap();
    assert!(m.check_equation_order());
    assert_eq!(4, m.arrays.stock.len());

    // state: c=100, d=200, e=300, s=0
    let idx = |name: &str| m.variables.get_value(name).unwrap().idx().unwrap();
    let mut sv = vec![0.0; 4];
    sv[idx("c")] = 100.0;
    sv[idx("d")] = 200.0;
    sv[idx("e")] = 300.0;
    let s_idx = m.integrals()[0].stock.idx().unwrap();

    let n = sv.len();
    let mut data = vec![0.0; n * n];
    let mut jac = Matrix::new(n, &mut data);
    m.jacobian(&mut jac, &sv);

    // dc/dt = a = s       => dc/ds = 1
    // dd/dt = b = s*e     => dd/de = s, dd/ds = e
    // de/dt = f = e       => de/de = 1
    // ds/dt = c + d       => ds/dc = ds/dd = 1
    assert_eq!(1.0, jac[(idx("c"), s_idx)]);
    assert_eq!(0.0, jac[(idx("c"), idx("c"))]);
    assert_eq!(sv[s_idx], jac[(idx("d"), idx("e"))]);
    assert_eq!(sv[idx("e")], jac[(idx("d"), s_idx)]);
    assert_eq!(1.0, jac[(idx("e"), idx("e"))]);
    assert_eq!(1.0, jac[(s_idx, idx("c"))]);
    assert_eq!(1.0, jac[(s_idx, idx("d"))]);
    assert_eq!(0.0, jac[(s_idx, s_idx)]);
}

// the analytic Jacobian agrees with a finite-difference probe
#[test]
fn test_jacobian_matches_finite_differences() {
    let mut m = Model::new();
    let int = m.add_operation(OperationType::Integrate);
    let mul = m.add_operation(OperationType::Multiply);
    let b = m.new_variable("b");
    m.set_init("b", 0.7);
    m.set_init("int", 2.0);

    let int_ports = op_ports(&m, int);
    let mul_ports = op_ports(&m, mul);
    m.add_wire(int_ports[0], mul_ports[1]).unwrap();
    m.add_wire(mul_ports[0], int_ports[1]).unwrap();
    m.add_wire(var_out(&m, b), mul_ports[2]).unwrap();
    m.reset().unwrap();

    let n = m.arrays.stock.len();
    let y0 = m.arrays.stock.clone();
    let mut data = vec![0.0; n * n];
    let mut jac = Matrix::new(n, &mut data);
    m.jacobian(&mut jac, &y0);

    let eps = 1e-7;
    let mut f0 = vec![0.0; n];
    m.eval_equations(&mut f0, &y0).unwrap();
    for j in 0..n {
        let mut y = y0.clone();
        y[j] += eps;
        let mut fj = vec![0.0; n];
        m.eval_equations(&mut fj, &y).unwrap();
        for i in 0..n {
            let fd = (fj[i] - f0[i]) / eps;
            assert!(
                (fd - jac[(i, j)]).abs() < 1e-5,
                "J[{},{}] = {} vs fd {}",
                i,
                j,
                jac[(i, j)],
                fd
            );
        }
    }
}

// flow variables without a wired input keep their declared initial
// value through reset
#[test]
fn test_unwired_flow_keeps_init() {
    let mut m = Model::new();
    let a = m.new_variable("a");
    let int = m.add_operation(OperationType::Integrate);
    m.add_wire(var_out(&m, a), op_ports(&m, int)[1]).unwrap();
    m.set_init("a", 0.25);

    m.reset().unwrap();
    m.eval_flows();
    assert_eq!(0.25, m.value("a"));
}

// identical initial values give identical trajectories
#[test]
fn test_determinism() {
    let run = || -> (f64, f64) {
        let mut m = Model::new();
        let int = m.add_operation(OperationType::Integrate);
        let mul = m.add_operation(OperationType::Multiply);
        let b = m.new_variable("b");
        m.set_init("b", -0.5);
        m.set_init("int", 1.0);
        let int_ports = op_ports(&m, int);
        let mul_ports = op_ports(&m, mul);
        m.add_wire(int_ports[0], mul_ports[1]).unwrap();
        m.add_wire(mul_ports[0], int_ports[1]).unwrap();
        m.add_wire(var_out(&m, b), mul_ports[2]).unwrap();
        m.n_steps = 7;
        m.step().unwrap();
        m.step().unwrap();
        (m.t, m.integrals()[0].stock.value(&m.arrays))
    };
    let (t1, s1) = run();
    let (t2, s2) = run();
    assert_eq!(t1, t2);
    assert_eq!(s1, s2);
}

// mass conservation: matched +x/-x entries in asset vs liability
// columns keep the total stock constant
#[test]
fn test_mass_conservation() {
    use minsky_engine::AssetClass;

    let mut m = Model::new();
    let g = m.add_godley_table().unwrap();
    {
        let item = m.godleys.get_mut(&g).unwrap();
        item.table.resize(3, 3);
        item.table.set_cell(0, 1, "loans");
        item.table.set_cell(0, 2, "deposits");
        item.table.set_asset_class(1, AssetClass::Asset);
        item.table.set_asset_class(2, AssetClass::Liability);
        item.table.set_cell(2, 1, "x");
        item.table.set_cell(2, 2, "-x");
        // the displayed formulas of a compliant row sum to zero
        assert_eq!("0", item.table.row_sum(2));
    }
    let mut item = m.godleys.remove(&g).unwrap();
    item.update(&mut m.variables, &mut m.graph).unwrap();
    m.godleys.insert(g, item);

    m.set_init("loans", 100.0);
    m.set_init("deposits", 40.0);
    m.set_init("x", 3.0);

    m.n_steps = 5;
    m.step().unwrap();
    assert!(m.t > 0.0);
    // both legs grow together: the accounting identity
    // assets - liabilities stays constant
    let net = m.value("loans") - m.value("deposits");
    assert!(approx_eq!(f64, 60.0, net, epsilon = 1e-9), "net = {}", net);
    assert!(m.value("loans") > 100.0);
    assert!(m.value("deposits") > 40.0);
}

// a division by zero is diagnosed with the offending name
#[test]
fn test_non_finite_diagnosed() {
    let mut m = Model::new();
    let zero = m.new_variable("zero");
    let one = m.new_variable("one");
    m.set_init("one", 1.0);
    let div = m.add_operation(OperationType::Divide);
    let out = m.new_variable("out");
    let int = m.add_operation(OperationType::Integrate);

    let div_ports = op_ports(&m, div);
    m.add_wire(var_out(&m, one), div_ports[1]).unwrap();
    m.add_wire(var_out(&m, zero), div_ports[2]).unwrap();
    m.add_wire(div_ports[0], var_in(&m, out)).unwrap();
    m.add_wire(var_out(&m, out), op_ports(&m, int)[1]).unwrap();

    let err = m.step().unwrap_err();
    assert_eq!(ErrorCode::NonFiniteValue, err.code);
    assert!(
        err.get_details().unwrap().contains("out"),
        "details: {:?}",
        err.get_details()
    );
    assert!(m.reset_needed());
}

// an integral with nothing wired to it fails with a clear error
#[test]
fn test_integral_not_wired() {
    let mut m = Model::new();
    m.add_operation(OperationType::Integrate);
    let err = m.step().unwrap_err();
    assert_eq!(ErrorCode::IntegralNotWired, err.code);
}

// the diagnostic sink hears about the offending item
#[test]
fn test_error_sink_called() {
    use std::cell::Cell;
    use std::rc::Rc;

    let mut m = Model::new();
    let hits = Rc::new(Cell::new(0));
    {
        let hits = hits.clone();
        m.reporter.set(Box::new(move |_, _| {
            hits.set(hits.get() + 1);
        }));
    }

    let add = m.add_operation(OperationType::Add);
    let w = m.new_variable("w");
    let add_ports = op_ports(&m, add);
    m.add_wire(add_ports[0], var_in(&m, w)).unwrap();
    m.add_wire(var_out(&m, w), add_ports[1]).unwrap();

    assert!(m.construct_equations().is_err());
    assert!(hits.get() > 0);
}

// a saved model reloads into an equivalent, runnable system
#[test]
fn test_save_load_simulates_identically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s1.mky");

    let mut m = Model::new();
    let k = m.add_operation(OperationType::Constant);
    m.operations.get_mut(&k).unwrap().value = 10.0;
    let int = m.add_operation(OperationType::Integrate);
    let output = m.new_variable("output");
    let k_out = op_ports(&m, k)[0];
    let int_ports = op_ports(&m, int);
    m.add_wire(k_out, int_ports[1]).unwrap();
    m.add_wire(int_ports[0], var_in(&m, output)).unwrap();
    m.save(&path).unwrap();

    m.step().unwrap();
    let expected = m.value("output");

    let mut m2 = Model::new();
    m2.load(&path).unwrap();
    m2.step().unwrap();
    assert_eq!(m.t, m2.t);
    assert_eq!(expected, m2.value("output"));
}
