//! The domain-command collaborator: the three executables a sim can run,
//! how their arguments are laid out, and the extractors that recover output
//! files and batch job IDs from an invocation.
//!
//! The supervisor core treats everything here as opaque: workers hand a
//! resolved argument map to a `ProgramRunner` and persist whatever the
//! extractors give back.

use errors::*;

use regex::Regex;
use serde_json;
use slog::Logger;
use std::path::Path;
use std::process;

//
// Public types
//

/// A JSON object as stored in `param.args` and `fout.files`.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// The closed set of commands a sim can run. The tag is stored verbatim in
/// `param.cmd` by the submission tool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Program {
    GSubmit,
    Grompp,
    Shell,
}

impl Program {
    pub fn from_name(name: &str) -> Result<Program> {
        match name {
            "g_submit" => Ok(Program::GSubmit),
            "grompp" => Ok(Program::Grompp),
            "shell" => Ok(Program::Shell),
            _ => Err(format!("Unknown command '{}' in param row", name).into()),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Program::GSubmit => "g_submit",
            Program::Grompp => "grompp",
            Program::Shell => "shell",
        }
    }

    /// The executable invoked for this program. `shell` args are executed
    /// through `sh`.
    pub fn binary(self) -> &'static str {
        match self {
            Program::GSubmit => "g_submit",
            Program::Grompp => "grompp",
            Program::Shell => "sh",
        }
    }

    /// Arguments whose values name files. Relative paths among these are
    /// rebased onto the sim's base directory before invocation.
    pub fn file_args(self) -> &'static [&'static str] {
        match self {
            Program::GSubmit => &[
                "-s", "-cpi", "-ei", "-table", "-tabletf", "-tablep", "-tableb", "-o", "-eo",
                "-deffnm",
            ],
            Program::Grompp => &[
                "-f", "-c", "-r", "-rb", "-n", "-p", "-t", "-e", "-ref", "-po", "-pp", "-o",
                "-imd",
            ],
            Program::Shell => &[],
        }
    }

    /// Arguments that name files the program writes, together with the file
    /// type the daemon records them under.
    pub fn out_types(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Program::GSubmit => &[("-o", "trajectory"), ("-eo", "energy")],
            Program::Grompp => &[("-o", "tpr"), ("-po", "mdout"), ("-pp", "topology")],
            Program::Shell => &[],
        }
    }
}

/// The observable outcome of running a program once.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub exit_code: i32,
    pub stdout:    String,
    pub stderr:    String,
}

impl Invocation {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

//
// ProgramRunnerFactory trait + implementations
//

pub trait ProgramRunnerFactory: Send {
    fn create(&self) -> Box<ProgramRunner>;
}

#[derive(Clone, Debug)]
pub struct ProgramRunnerFactoryLive {}

impl ProgramRunnerFactory for ProgramRunnerFactoryLive {
    fn create(&self) -> Box<ProgramRunner> {
        Box::new(ProgramRunnerLive {})
    }
}

/// Hands every invocation a canned outcome. Lets submit worker tests run
/// without `g_submit` or a batch system anywhere near `$PATH`.
#[derive(Clone, Debug)]
pub struct ProgramRunnerFactoryPassThrough {
    pub exit_code: i32,
    pub stdout:    String,
}

impl ProgramRunnerFactory for ProgramRunnerFactoryPassThrough {
    fn create(&self) -> Box<ProgramRunner> {
        Box::new(ProgramRunnerPassThrough {
            exit_code: self.exit_code,
            stdout:    self.stdout.clone(),
        })
    }
}

//
// ProgramRunner trait + implementations
//

pub trait ProgramRunner: Send {
    fn run(&mut self, log: &Logger, program: Program, args: &[String]) -> Result<Invocation>;
}

#[derive(Clone, Debug)]
pub struct ProgramRunnerLive {}

impl ProgramRunner for ProgramRunnerLive {
    fn run(&mut self, log: &Logger, program: Program, args: &[String]) -> Result<Invocation> {
        debug!(log, "Invoking command";
            "binary" => program.binary(),
            "num_args" => args.len());
        let out = process::Command::new(program.binary()).args(args).output()?;
        Ok(Invocation {
            exit_code: out.status.code().unwrap_or(-1),
            stdout:    String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr:    String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct ProgramRunnerPassThrough {
    pub exit_code: i32,
    pub stdout:    String,
}

impl ProgramRunner for ProgramRunnerPassThrough {
    fn run(&mut self, _log: &Logger, _program: Program, _args: &[String]) -> Result<Invocation> {
        Ok(Invocation {
            exit_code: self.exit_code,
            stdout:    self.stdout.clone(),
            stderr:    String::new(),
        })
    }
}

//
// Public functions
//

/// Flattens a resolved argument map into a command line. Flag-shaped keys
/// are emitted followed by their value; bare keys contribute only their
/// value. Map iteration is ordered by key, so the command line is
/// deterministic.
pub fn flatten_args(args: &JsonMap) -> Vec<String> {
    let mut flat = Vec::with_capacity(args.len() * 2);
    for (key, value) in args {
        if key.starts_with('-') {
            flat.push(key.clone());
        }
        let rendered = render_value(value);
        if !rendered.is_empty() {
            flat.push(rendered);
        }
    }
    flat
}

/// Computes the output files of a successful invocation: the sim's declared
/// files, overlaid with the files named by output-bearing arguments.
pub fn derive_outfiles(program: Program, args: &JsonMap, base: &str, declared: JsonMap) -> JsonMap {
    let mut files = declared;
    for &(flag, file_type) in program.out_types() {
        if let Some(value) = args.get(flag) {
            let path = absolutize(&render_value(value), base);
            files.insert(file_type.to_owned(), serde_json::Value::String(path));
        }
    }
    files
}

/// Pulls batch job IDs out of `g_submit` stdout. Both scheduler dialects
/// are recognized; one submission may yield several IDs.
pub fn gsubmit_batch_ids(stdout: &str) -> Vec<i32> {
    lazy_static! {
        static ref BATCH_ID: Regex =
            Regex::new(r"(?m)^(?:Submitted batch job|Your job)\s+(\d+)").unwrap();
    }
    BATCH_ID
        .captures_iter(stdout)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// Recovers the jobscript and joblog paths `g_submit` reports on stdout.
/// Returned as the reserved `JSCRIPTS` / `JLOGS` fout entries used for
/// cleanup once the sim completes.
pub fn gsubmit_auxfiles(stdout: &str) -> JsonMap {
    let mut jscripts = Vec::new();
    let mut jlogs = Vec::new();
    for token in stdout.split_whitespace() {
        if token.ends_with(".sh") {
            jscripts.push(serde_json::Value::String(token.to_owned()));
        } else if token.ends_with(".log") || token.ends_with(".out") {
            jlogs.push(serde_json::Value::String(token.to_owned()));
        }
    }

    let mut aux = JsonMap::new();
    if !jscripts.is_empty() {
        aux.insert("JSCRIPTS".to_owned(), serde_json::Value::Array(jscripts));
    }
    if !jlogs.is_empty() {
        aux.insert("JLOGS".to_owned(), serde_json::Value::Array(jlogs));
    }
    aux
}

/// Rebases a relative path onto the base directory, keeping only the file
/// name of the original value. Absolute paths pass through untouched.
pub fn absolutize(value: &str, base: &str) -> String {
    let path = Path::new(value);
    if path.is_absolute() {
        return value.to_owned();
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| value.to_owned());
    Path::new(base).join(name).to_string_lossy().into_owned()
}

//
// Private functions
//

fn render_value(value: &serde_json::Value) -> String {
    match *value {
        serde_json::Value::String(ref s) => s.clone(),
        ref other => other.to_string(),
    }
}

//
// Tests
//
