use db::Store;
use domain::JsonMap;
use errors::*;
use mediators::common;
use model::Status;
use scheduler;
use scheduler::SchedulerClient;
use time_helpers;

use serde_json;
use slog::Logger;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

//
// Public constants
//

/// Pause between scheduler polls for one sim.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

//
// Public types
//

/// Worker owning a sim in `running`. Polls the scheduler for the aggregate
/// status of the sim's batch jobs and advances the sim to `complete` or
/// `failed` once a terminal verdict arrives, optionally deleting the batch
/// scripts and logs first.
pub struct Mediator {
    pub store:  Store,
    pub sim_id: i32,
    pub client: Box<SchedulerClient>,
    pub clean:  bool,

    pub poll_interval: Duration,

    /// How long to watch before handing the sim back untouched. `None`
    /// watches until a verdict arrives; the supervisor will re-pick the sim
    /// if this worker gives up or dies.
    pub deadline: Option<Duration>,
}

impl Mediator {
    pub fn run(&mut self, log: &Logger) -> Result<RunResult> {
        time_helpers::log_timed(&log.new(o!("step" => file!())), |log| self.run_inner(log))
    }

    fn run_inner(&mut self, log: &Logger) -> Result<RunResult> {
        let job_ids = self.store
            .with_conn(log, |conn| common::select_job_ids(conn, self.sim_id))?;
        debug!(log, "Monitoring sim";
            "num_jobs" => job_ids.len(),
            "scheduler" => self.client.scheduler().name());

        let start = Instant::now();
        while self.deadline.map_or(true, |d| start.elapsed() < d) {
            let mut raw_states = Vec::with_capacity(job_ids.len());
            for &job_id in &job_ids {
                raw_states.push(self.client.raw_status(log, job_id)?);
            }

            match scheduler::aggregate(self.client.scheduler(), &raw_states) {
                Some(Status::Failed) => {
                    error!(log, "Sim no longer running -- failed");
                    self.set_status(log, Status::Failed)?;
                    return Ok(RunResult {
                        final_status: Some(Status::Failed),
                    });
                }
                Some(Status::Complete) => {
                    debug!(log, "Sim no longer running -- complete");
                    if self.clean {
                        self.cleanup(log)?;
                    }
                    self.set_status(log, Status::Complete)?;
                    return Ok(RunResult {
                        final_status: Some(Status::Complete),
                    });
                }
                Some(_) => {}
                None => {
                    debug!(log, "No verdict from aggregation table -- still watching");
                }
            }
            thread::sleep(self.poll_interval);
        }

        debug!(log, "Monitor deadline reached -- handing sim back");
        Ok(RunResult { final_status: None })
    }

    //
    // Steps
    //

    /// Deletes the batch scripts and logs recorded under the reserved
    /// `JSCRIPTS` / `JLOGS` outfile keys, then writes the trimmed map back.
    fn cleanup(&self, log: &Logger) -> Result<()> {
        time_helpers::log_timed(&log.new(o!("step" => "cleanup")), |log| {
            let files = self.store
                .with_conn(log, |conn| common::select_fout_files(conn, self.sim_id))?;
            let mut files = match files {
                Some(files) => files,
                None => {
                    warn!(log, "Cleanup was called but sim has no outfiles");
                    return Ok(());
                }
            };

            remove_listed(log, &mut files, "JSCRIPTS");
            remove_listed(log, &mut files, "JLOGS");

            self.store
                .with_conn(log, |conn| common::upsert_fout(conn, self.sim_id, files.clone()))
        })
    }

    fn set_status(&self, log: &Logger, to: Status) -> Result<()> {
        self.store
            .with_conn(log, |conn| common::update_status(log, conn, self.sim_id, to))
    }
}

pub struct RunResult {
    /// `None` when the watch deadline passed without a terminal verdict.
    pub final_status: Option<Status>,
}

//
// Private functions
//

/// Removes the files listed under one reserved outfile key and drops the key
/// from the map. Missing files are worth a warning, never an error: another
/// daemon may have cleaned them first.
fn remove_listed(log: &Logger, files: &mut JsonMap, key: &str) {
    let listed = match files.remove(key) {
        Some(serde_json::Value::Array(listed)) => listed,
        Some(_) => {
            warn!(log, "Reserved cleanup key does not hold a list"; "key" => key);
            return;
        }
        None => {
            warn!(log, "Cleanup was called but could not find any files"; "key" => key);
            return;
        }
    };

    for value in listed {
        let path = match value {
            serde_json::Value::String(path) => path,
            _ => continue,
        };
        if Path::new(&path).is_file() {
            debug!(log, "Removing file"; "path" => path.as_str());
            if let Err(e) = fs::remove_file(&path) {
                warn!(log, "Failed to remove file"; "path" => path.as_str(), "error" => e.to_string());
            }
        } else {
            warn!(log, "Cleanup could not find file"; "path" => path.as_str());
        }
    }
}

//
// Tests
//
