// Copyright 2025 The Minsky Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::path::Path;
use std::result::Result as StdResult;

use pico_args::Arguments;

use minsky_engine::Model;

const VERSION: &str = "0.1";
const EXIT_FAILURE: i32 = 1;

macro_rules! die(
    ($($arg:tt)*) => { {
        eprintln!($($arg)*);
        std::process::exit(EXIT_FAILURE)
    } }
);

fn usage() -> ! {
    let argv0 = std::env::args()
        .next()
        .unwrap_or_else(|| "minsky".to_string());
    die!(
        concat!(
            "minsky {}: simulate monetary-flow system dynamics models.\n\
             \n\
             USAGE:\n",
            "    {} [SUBCOMMAND] [OPTION...] PATH\n",
            "\n\
             OPTIONS:\n",
            "    -h, --help       show this message\n",
            "    --steps N        number of driver invocations (default 10)\n",
            "    --output FILE    write output to FILE instead of stdout\n",
            "\n\
             SUBCOMMANDS:\n",
            "    simulate         simulate a model and print variable values (default)\n",
            "    equations        print the system of equations as LaTeX\n",
        ),
        VERSION,
        argv0
    );
}

#[derive(Clone, Default, Debug)]
struct Args {
    path: Option<String>,
    output: Option<String>,
    steps: usize,
    is_equations: bool,
}

fn parse_args() -> StdResult<Args, Box<dyn std::error::Error>> {
    let mut parsed = Args {
        steps: 10,
        ..Default::default()
    };
    let mut args = Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        usage();
    }
    if let Some(steps) = args.opt_value_from_str("--steps")? {
        parsed.steps = steps;
    }
    parsed.output = args.opt_value_from_str("--output")?;

    for free in args.finish() {
        let arg = free.to_string_lossy().to_string();
        match arg.as_str() {
            "simulate" => parsed.is_equations = false,
            "equations" => parsed.is_equations = true,
            _ => {
                if parsed.path.is_some() {
                    eprintln!("error: unexpected argument '{}'", arg);
                    usage();
                }
                parsed.path = Some(arg);
            }
        }
    }
    Ok(parsed)
}

fn simulate(model: &mut Model, steps: usize) -> minsky_engine::Result<String> {
    let names: Vec<String> = model.variables.values.keys().cloned().collect();

    let mut out = String::from("t");
    for name in &names {
        out.push('\t');
        out.push_str(name);
    }
    out.push('\n');

    let mut emit = |model: &Model, out: &mut String| {
        out.push_str(&format!("{}", model.t));
        for name in &names {
            out.push_str(&format!("\t{}", model.value(name)));
        }
        out.push('\n');
    };

    model.reset()?;
    model.eval_flows();
    emit(model, &mut out);
    for _ in 0..steps {
        model.step()?;
        emit(model, &mut out);
    }
    Ok(out)
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("error: {}", err);
            usage();
        }
    };
    let path = match args.path {
        Some(ref path) => path.clone(),
        None => usage(),
    };

    let mut model = Model::new();
    if let Err(err) = model.load(Path::new(&path)) {
        die!("error opening {}: {}", path, err);
    }

    let result = if args.is_equations {
        Ok(model.latex())
    } else {
        simulate(&mut model, args.steps)
    };
    let contents = match result {
        Ok(contents) => contents,
        Err(err) => die!("error: {}", err),
    };

    match args.output {
        Some(ref file) => {
            if let Err(err) = std::fs::write(file, contents) {
                die!("error writing {}: {}", file, err);
            }
        }
        None => print!("{}", contents),
    }
}
