//! The scheduler adapter: translates batch-system dialects (Slurm, SGE) into
//! the small uniform status alphabet the rest of the daemon understands, and
//! aggregates multi-job arrays into a single verdict.

use errors::*;
use model::Status;

use slog::Logger;
use std::collections::HashMap;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

//
// Public constants
//

/// How often a scheduler probe is attempted before its error is surfaced.
pub const PROBE_RETRIES: u32 = 5;

/// Fixed pause between scheduler probe attempts.
pub const PROBE_BACKOFF: Duration = Duration::from_secs(10);

//
// Public types
//

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scheduler {
    Slurm,
    Sge,
}

impl Scheduler {
    /// Resolves a scheduler forced by name on the command line. LSF is
    /// recognized so that the error can say so explicitly.
    pub fn from_name(name: &str) -> Result<Scheduler> {
        match name.to_lowercase().as_str() {
            "slurm" => Ok(Scheduler::Slurm),
            "sge" => Ok(Scheduler::Sge),
            "lsf" => Err(ErrorKind::SchedulerUnsupported("LSF".to_owned()).into()),
            _ => Err(ErrorKind::SchedulerUnsupported(name.to_owned()).into()),
        }
    }

    /// Elects a scheduler by probing for each batch system's queue-listing
    /// binary. The first binary that exits 0 wins.
    pub fn detect(log: &Logger) -> Result<Scheduler> {
        for &(name, binary) in QUEUE_BINARIES {
            if binary_responds(binary) {
                info!(log, "Detected batch scheduler"; "scheduler" => name);
                return Scheduler::from_name(name);
            }
        }
        Err("Could not detect a batch scheduler (probed sinfo, qstat, bqueue)".into())
    }

    pub fn name(self) -> &'static str {
        match self {
            Scheduler::Slurm => "Slurm",
            Scheduler::Sge => "SGE",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Combiner {
    Any,
    All,
}

/// One row of a scheduler's aggregation table: a verdict, the rule used to
/// combine per-job raw states, and the raw states the rule applies to.
pub type AggregationRule = (Status, Combiner, &'static [&'static str]);

/// Reduces the raw states of every job belonging to one sim to a single
/// verdict by walking the scheduler's aggregation table top to bottom. Row
/// order encodes priority: any failure dominates, otherwise any running job
/// dominates, and completion requires unanimity. Returns `None` when no row
/// matches (raw states outside every set), in which case the caller keeps
/// polling.
pub fn aggregate(scheduler: Scheduler, raw_states: &[String]) -> Option<Status> {
    for &(verdict, combiner, tokens) in aggregation_table(scheduler) {
        let hit = match combiner {
            Combiner::Any => raw_states.iter().any(|s| tokens.contains(&s.as_str())),
            Combiner::All => raw_states.iter().all(|s| tokens.contains(&s.as_str())),
        };
        if hit {
            return Some(verdict);
        }
    }
    None
}

pub fn aggregation_table(scheduler: Scheduler) -> &'static [AggregationRule] {
    match scheduler {
        Scheduler::Slurm => SLURM_TABLE,
        Scheduler::Sge => SGE_TABLE,
    }
}

//
// SchedulerClientFactory trait + implementations
//

pub trait SchedulerClientFactory: Send {
    fn create(&self) -> Box<SchedulerClient>;
}

#[derive(Clone, Debug)]
pub struct SchedulerClientFactoryLive {
    pub scheduler: Scheduler,
}

impl SchedulerClientFactory for SchedulerClientFactoryLive {
    fn create(&self) -> Box<SchedulerClient> {
        Box::new(SchedulerClientLive {
            scheduler: self.scheduler,
            retries:   PROBE_RETRIES,
            backoff:   PROBE_BACKOFF,
        })
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerClientFactoryPassThrough {
    pub scheduler:  Scheduler,
    pub raw_states: Arc<HashMap<i32, String>>,
}

impl SchedulerClientFactory for SchedulerClientFactoryPassThrough {
    fn create(&self) -> Box<SchedulerClient> {
        Box::new(SchedulerClientPassThrough {
            scheduler:  self.scheduler,
            raw_states: Arc::clone(&self.raw_states),
        })
    }
}

//
// SchedulerClient trait + implementations
//

/// Asks the batch system for the raw state of a single job. Implementations
/// own the per-scheduler command dialect; callers only ever see raw state
/// tokens fed into `aggregate`.
pub trait SchedulerClient: Send {
    fn scheduler(&self) -> Scheduler;

    fn raw_status(&mut self, log: &Logger, job_id: i32) -> Result<String>;
}

#[derive(Clone, Debug)]
pub struct SchedulerClientLive {
    pub scheduler: Scheduler,
    pub retries:   u32,
    pub backoff:   Duration,
}

impl SchedulerClient for SchedulerClientLive {
    fn scheduler(&self) -> Scheduler {
        self.scheduler
    }

    fn raw_status(&mut self, log: &Logger, job_id: i32) -> Result<String> {
        match self.scheduler {
            Scheduler::Slurm => slurm_raw_status(log, job_id, self.retries, self.backoff),
            Scheduler::Sge => sge_raw_status(log, job_id, self.retries, self.backoff),
        }
    }
}

/// Serves raw states from a canned map. Lets worker tests run without a
/// batch system on `$PATH`.
#[derive(Clone, Debug)]
pub struct SchedulerClientPassThrough {
    pub scheduler:  Scheduler,
    pub raw_states: Arc<HashMap<i32, String>>,
}

impl SchedulerClient for SchedulerClientPassThrough {
    fn scheduler(&self) -> Scheduler {
        self.scheduler
    }

    fn raw_status(&mut self, _log: &Logger, job_id: i32) -> Result<String> {
        match self.raw_states.get(&job_id) {
            Some(s) => Ok(s.clone()),
            None => Err(format!("No canned raw state for job ID {}", job_id).into()),
        }
    }
}

//
// Private constants
//

/// Probed in order; the first binary that exits 0 elects its scheduler. LSF
/// is recognized but unsupported, so electing it fails construction.
const QUEUE_BINARIES: &[(&str, &str)] = &[("Slurm", "sinfo"), ("SGE", "qstat"), ("LSF", "bqueue")];

const SLURM_TABLE: &[AggregationRule] = &[
    (
        Status::Failed,
        Combiner::Any,
        &["FAILED", "PREEMPTED", "SUSPENDED", "STOPPED"],
    ),
    (
        Status::Running,
        Combiner::Any,
        &["RUNNING", "COMPLETING", "PENDING"],
    ),
    (Status::Complete, Combiner::All, &["COMPLETED"]),
];

const SGE_TABLE: &[AggregationRule] = &[
    (Status::Failed, Combiner::Any, &["f"]),
    (Status::Running, Combiner::Any, &["r"]),
    (Status::Complete, Combiner::All, &["c"]),
];

/// SGE states in which `qstat` still lists a job as live.
const SGE_ACTIVE_STATES: &[&str] = &[
    "qw", "hqw", "hRwq", "r", "t", "Rr", "Rt", "s", "ts", "S", "tS",
];

//
// Private functions
//

fn binary_responds(binary: &str) -> bool {
    process::Command::new(binary)
        .stdout(process::Stdio::null())
        .stderr(process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Queries `sacct` for one job's state. A non-zero exit is surfaced
/// immediately; output that doesn't parse is retried, because `sacct` answers
/// with an empty accounting record for a short window after submission.
fn slurm_raw_status(log: &Logger, job_id: i32, retries: u32, backoff: Duration) -> Result<String> {
    for _ in 0..retries {
        let out = process::Command::new("sacct")
            .arg("-j")
            .arg(job_id.to_string())
            .arg("--delimiter=,")
            .arg("--parsable2")
            .arg("--format=JobID,State,ExitCode")
            .output()?;
        if !out.status.success() {
            return Err(format!(
                "sacct exited non-zero for job ID {}: {}",
                job_id,
                String::from_utf8_lossy(&out.stderr)
            ).into());
        }

        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        match parse_sacct(&stdout) {
            Some(state) => return Ok(state),
            None => {
                warn!(log, "Failed to parse sacct output -- will retry"; "job_id" => job_id);
                thread::sleep(backoff);
            }
        }
    }
    Err(format!("Unexpected sacct output for job ID {} after {} attempts", job_id, retries).into())
}

/// Takes the second line (the job's own record, below the header) and its
/// second field as the raw state.
fn parse_sacct(stdout: &str) -> Option<String> {
    let line = stdout.lines().nth(1)?;
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() == 3 {
        Some(fields[1].to_owned())
    } else {
        None
    }
}

/// SGE needs two commands: `qstat` lists live jobs only, so a job absent from
/// it is looked up in the accounting database with `qacct` and classified by
/// its `exit_status`.
fn sge_raw_status(log: &Logger, job_id: i32, retries: u32, backoff: Duration) -> Result<String> {
    for _ in 0..retries {
        let out = process::Command::new("qstat").output()?;
        if !out.status.success() {
            debug!(log, "qstat exited non-zero -- will retry"; "job_id" => job_id);
            thread::sleep(backoff);
            continue;
        }

        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        if qstat_lists_active(&stdout, job_id) {
            return Ok("r".to_owned());
        }

        let out = process::Command::new("qacct")
            .arg("-j")
            .arg(job_id.to_string())
            .output()?;
        if !out.status.success() {
            debug!(log, "qacct exited non-zero -- will retry"; "job_id" => job_id);
            thread::sleep(backoff);
            continue;
        }

        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        match parse_qacct_exit_status(&stdout) {
            Some(0) => return Ok("c".to_owned()),
            Some(_) => return Ok("f".to_owned()),
            None => {
                return Err(format!("qacct output for job ID {} had no exit_status", job_id).into())
            }
        }
    }
    Err(format!("qstat/qacct did not respond for job ID {} after {} attempts", job_id, retries).into())
}

/// Scans `qstat` output (two header lines, then one row per live job with the
/// job ID in column 1 and the state in column 5) for the job in an active
/// state.
fn qstat_lists_active(stdout: &str, job_id: i32) -> bool {
    let wanted = job_id.to_string();
    for line in stdout.lines().skip(2) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }
        let state = match fields.get(4) {
            Some(s) => *s,
            None => continue,
        };
        if fields[0] == wanted && SGE_ACTIVE_STATES.contains(&state) {
            return true;
        }
    }
    false
}

/// Finds the `exit_status` line in `qacct -j` output.
fn parse_qacct_exit_status(stdout: &str) -> Option<i32> {
    for line in stdout.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() == 2 && fields[0] == "exit_status" {
            return fields[1].parse().ok();
        }
    }
    None
}

//
// Tests
//
