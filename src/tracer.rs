//! Diagnostic tracing for wrap/release/call boundaries.
//!
//! Controlled by the `COMBRIDGE_TRACE` environment variable:
//! - `"1"`, `"true"`, or `"stdout"`: write to stdout
//! - `"stderr"`: write to stderr
//! - anything else: treated as a file path
//!
//! Zero-cost when disabled; the `trace_msg!` macro checks the cached flag
//! before formatting anything.

use std::{
    env,
    fs::File,
    io::Write,
    sync::{Mutex, OnceLock},
};

enum Output {
    Stdout,
    Stderr,
    File(File),
}

pub struct Tracer {
    out: Mutex<Output>,
}

impl Tracer {
    fn from_env() -> Option<Tracer> {
        let value = env::var("COMBRIDGE_TRACE").ok()?;
        let out = match value.as_str() {
            "" | "0" | "false" => return None,
            "1" | "true" | "stdout" => Output::Stdout,
            "stderr" => Output::Stderr,
            path => match File::create(path) {
                Ok(f) => Output::File(f),
                Err(e) => {
                    eprintln!("COMBRIDGE_TRACE: cannot open {path}: {e}, tracing to stderr");
                    Output::Stderr
                }
            },
        };
        Some(Tracer {
            out: Mutex::new(out),
        })
    }

    pub fn msg(&self, args: std::fmt::Arguments<'_>) {
        let mut out = match self.out.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match &mut *out {
            Output::Stdout => println!("[combridge] {args}"),
            Output::Stderr => eprintln!("[combridge] {args}"),
            Output::File(f) => {
                let _ = writeln!(f, "[combridge] {args}");
            }
        }
    }
}

static TRACER: OnceLock<Option<Tracer>> = OnceLock::new();

pub fn tracer() -> Option<&'static Tracer> {
    TRACER.get_or_init(Tracer::from_env).as_ref()
}

pub fn enabled() -> bool {
    tracer().is_some()
}

macro_rules! trace_msg {
    ($($format:tt)*) => {
        if let Some(t) = $crate::tracer::tracer() {
            t.msg(format_args!($($format)*));
        }
    };
}
pub(crate) use trace_msg;
