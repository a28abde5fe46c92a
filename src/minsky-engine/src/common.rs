// Copyright 2025 The Minsky Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::fmt;
use std::{error, result};

pub type Ident = String;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError, // will never be produced
    CyclicNetwork,
    NotAllWired,
    TooManyInputs,
    InputNotWired,
    IntegralNotWired,
    DuplicateColumnLabel,
    NonFiniteValue,
    DriverFailure,
    SchemaMismatch,
    InvalidModel,
    DuplicateId,
    UnknownPort,
    XmlDeserialization,
    Io,
    Generic,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ErrorCode::*;
        let name = match self {
            NoError => "no_error",
            CyclicNetwork => "cyclic_network",
            NotAllWired => "not_all_wired",
            TooManyInputs => "too_many_inputs",
            InputNotWired => "input_not_wired",
            IntegralNotWired => "integral_not_wired",
            DuplicateColumnLabel => "duplicate_column_label",
            NonFiniteValue => "non_finite_value",
            DriverFailure => "driver_failure",
            SchemaMismatch => "schema_mismatch",
            InvalidModel => "invalid_model",
            DuplicateId => "duplicate_id",
            UnknownPort => "unknown_port",
            XmlDeserialization => "xml_deserialization",
            Io => "io",
            Generic => "generic",
        };

        write!(f, "{}", name)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Model,
    Simulation,
    Schema,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub(crate) details: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, code: ErrorCode, details: Option<String>) -> Self {
        Error {
            kind,
            code,
            details,
        }
    }

    pub fn get_details(&self) -> Option<String> {
        self.details.clone()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            ErrorKind::Model => "ModelError",
            ErrorKind::Simulation => "SimulationError",
            ErrorKind::Schema => "SchemaError",
        };
        match self.details {
            Some(ref details) => write!(f, "{}{{{}: {}}}", kind, self.code, details),
            None => write!(f, "{}{{{}}}", kind, self.code),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Schema,
            code: ErrorCode::Io,
            details: Some(err.to_string()),
        }
    }
}

impl error::Error for Error {}

pub type Result<T> = result::Result<T, Error>;

#[macro_export]
macro_rules! model_err {
    ($code:tt, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error {
            kind: ErrorKind::Model,
            code: ErrorCode::$code,
            details: Some($str.to_string()),
        })
    }};
    ($code:tt) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error {
            kind: ErrorKind::Model,
            code: ErrorCode::$code,
            details: None,
        })
    }};
}

#[macro_export]
macro_rules! sim_err {
    ($code:tt, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error {
            kind: ErrorKind::Simulation,
            code: ErrorCode::$code,
            details: Some($str.to_string()),
        })
    }};
    ($code:tt) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error {
            kind: ErrorKind::Simulation,
            code: ErrorCode::$code,
            details: None,
        })
    }};
}

#[macro_export]
macro_rules! schema_err {
    ($code:tt, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error {
            kind: ErrorKind::Schema,
            code: ErrorCode::$code,
            details: Some($str.to_string()),
        })
    }};
}

/// strip non-alphanumeric characters, e.g. signs, from a Godley cell
/// so that only the referenced variable name remains.
pub fn strip_non_alnum(name: &str) -> Ident {
    name.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// Hook the host may bind to a visual indicator. Any compile or
/// evaluation failure tied to a specific item reports the item's canvas
/// coordinates here before the error is raised.
#[derive(Default)]
pub struct ErrorReporter {
    sink: Option<Box<dyn Fn(f64, f64)>>,
}

impl ErrorReporter {
    pub fn set(&mut self, sink: Box<dyn Fn(f64, f64)>) {
        self.sink = Some(sink);
    }

    pub fn clear(&mut self) {
        self.sink = None;
    }

    pub fn display_error_item(&self, x: f64, y: f64) {
        if let Some(ref sink) = self.sink {
            sink(x, y);
        }
    }
}

impl fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ErrorReporter({})", self.sink.is_some())
    }
}

#[test]
fn test_strip_non_alnum() {
    assert_eq!("a", strip_non_alnum("-a"));
    assert_eq!("a", strip_non_alnum("+ a "));
    assert_eq!("2c", strip_non_alnum("2c"));
    assert_eq!("", strip_non_alnum("  "));
    assert_eq!("flow1", strip_non_alnum("flow_1"));
}
