use std::sync::Mutex;

use crate::gateway::Entropy;

/// Reports whether httpmock tests must be skipped because the sandbox refuses
/// to bind a loopback port.
pub fn should_skip_httpmock() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping httpmock test: sandbox forbids binding to localhost");
            true
        }
        Err(err) => panic!("failed to bind localhost for httpmock tests: {err}"),
    }
}

/// Entropy source that replays a fixed cycle of unit draws.
#[derive(Debug)]
pub struct ScriptedEntropy {
    values: Vec<f64>,
    next: Mutex<usize>,
}

impl ScriptedEntropy {
    pub fn new(values: impl Into<Vec<f64>>) -> Self {
        let values = values.into();
        assert!(!values.is_empty(), "scripted entropy needs at least one value");
        Self {
            values,
            next: Mutex::new(0),
        }
    }
}

impl Entropy for ScriptedEntropy {
    fn next_unit(&self) -> f64 {
        let mut next = self.next.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let value = self.values[*next % self.values.len()];
        *next += 1;
        value
    }
}
