use db::Store;
use errors::*;
use mediators::common;
use model::Status;
use time_helpers;

use slog::Logger;
use std::thread;
use std::time::{Duration, Instant};

//
// Public constants
//

/// Pause between parent status polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

//
// Public types
//

/// Worker owning a sim in `depend`. Watches the parent sim and either
/// promotes the child to `submitted` (parent completed) or propagates the
/// failure as `depend_failed` (parent failed or its own dependency failed).
/// Promotion hands the sim back to the supervisor, which launches a submit
/// worker on its next tick.
pub struct Mediator {
    pub store:  Store,
    pub sim_id: i32,

    pub poll_interval: Duration,

    /// How long to watch before handing the sim back untouched. `None`
    /// watches until the parent reaches a terminal status.
    pub deadline: Option<Duration>,
}

impl Mediator {
    pub fn run(&mut self, log: &Logger) -> Result<RunResult> {
        time_helpers::log_timed(&log.new(o!("step" => file!())), |log| self.run_inner(log))
    }

    fn run_inner(&mut self, log: &Logger) -> Result<RunResult> {
        let parent_id = self.store
            .with_conn(log, |conn| common::select_sim(conn, self.sim_id))?
            .and_then(|sim| sim.parent_id)
            .ok_or_else(|| Error::from("Depend sim has no parent"))?;
        debug!(log, "Watching parent sim"; "parent_id" => parent_id);

        let start = Instant::now();
        while self.deadline.map_or(true, |d| start.elapsed() < d) {
            let parent = self.store
                .with_conn(log, |conn| common::select_sim(conn, parent_id))?
                .ok_or_else(|| Error::from("Parent sim row disappeared"))?;

            if let Some(next) = promotion(parent.status()?) {
                debug!(log, "Parent sim reached a terminal status";
                    "parent_id" => parent_id,
                    "parent_status" => parent.stat_id,
                    "next" => next.name());
                self.store
                    .with_conn(log, |conn| common::update_status(log, conn, self.sim_id, next))?;
                return Ok(RunResult {
                    final_status: Some(next),
                });
            }
            thread::sleep(self.poll_interval);
        }

        debug!(log, "Depend deadline reached -- handing sim back");
        Ok(RunResult { final_status: None })
    }
}

pub struct RunResult {
    /// `None` when the watch deadline passed before the parent settled.
    pub final_status: Option<Status>,
}

//
// Public functions
//

/// What a parent's status means for a waiting child: completion releases the
/// child for submission, failure of any kind poisons it, anything else keeps
/// it waiting.
pub fn promotion(parent: Status) -> Option<Status> {
    match parent {
        Status::Complete => Some(Status::Submitted),
        Status::Failed | Status::DependFailed => Some(Status::DependFailed),
        _ => None,
    }
}

//
// Tests
//
