//! Host-facing pieces: output plumbing and native functions
//!
//! The VM writes `print` output through a swappable writer so embedders and
//! tests can capture it in-process. The only native is `clock`.

use crate::value::Value;
use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared, swappable sink for `print` output
pub type OutputWriter = Rc<RefCell<dyn Write>>;

/// Writer backed by process stdout
pub fn stdout_writer() -> OutputWriter {
    Rc::new(RefCell::new(io::stdout()))
}

/// Native `clock()`: wall-clock seconds since the Unix epoch.
///
/// Natives are total; they cannot raise. Extra arguments are ignored.
pub fn clock_native(_args: &[Value]) -> Value {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0);
    Value::Number(seconds)
}
