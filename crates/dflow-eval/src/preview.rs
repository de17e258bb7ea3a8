//! One-call preview: assemble, resolve, evaluate, collect diagnostics.
//!
//! This is the surface an editor calls after every edit burst. It never
//! panics and never returns `Err`: structural problems, operator failures
//! and stalls all come back as positioned diagnostics alongside whatever
//! result was computed.

use serde::{Deserialize, Serialize};
use tracing::debug;

use dflow_core::assemble::{assemble_circuit, BlockDesc};
use dflow_core::error::{DflowError, ErrorKind, Position};

use crate::registry::Registry;
use crate::session::Session;
use crate::value::Value;

/// Tick budget for one preview evaluation.
const PREVIEW_TICKS: usize = 10_000;

/// One reportable problem, flattened for the editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub message: String,
    pub at: Position,
}

impl Diagnostic {
    fn from_error(err: &DflowError) -> Self {
        Diagnostic {
            kind: err.kind(),
            message: err.to_string(),
            at: err.position(),
        }
    }
}

/// Outcome of a preview run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preview {
    /// The output value, when evaluation reached it.
    pub result: Option<Value>,
    /// All problems found, the run-ending one first.
    pub diagnostics: Vec<Diagnostic>,
}

impl Preview {
    pub fn ok(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Evaluates an editor's block lists (one list per graph, graph 0 is the
/// root) with the given external inputs.
pub fn preview(graphs: &[Vec<BlockDesc>], inputs: &[Value]) -> Preview {
    preview_with(graphs, inputs, &Registry::builtin())
}

pub fn preview_with(graphs: &[Vec<BlockDesc>], inputs: &[Value], registry: &Registry) -> Preview {
    let circuit = match assemble_circuit(graphs) {
        Ok(c) => c,
        Err(e) => {
            return Preview {
                result: None,
                diagnostics: vec![Diagnostic::from_error(&e)],
            }
        }
    };

    let mut session = Session::new(inputs.to_vec());
    let outcome = session.run(&circuit, registry, PREVIEW_TICKS);

    let mut diagnostics = Vec::new();
    let result = match outcome {
        Ok(v) => Some(v),
        Err(e) => {
            diagnostics.push(Diagnostic::from_error(&e));
            None
        }
    };
    // Recorded operator errors the run survived (or duplicates of the fatal
    // one, which we skip).
    for (_, err) in session.errors() {
        let d = Diagnostic::from_error(err);
        if !diagnostics
            .iter()
            .any(|x| x.at == d.at && x.message == d.message)
        {
            diagnostics.push(d);
        }
    }
    debug!(
        ok = diagnostics.is_empty(),
        count = diagnostics.len(),
        "preview finished"
    );
    Preview {
        result,
        diagnostics,
    }
}
