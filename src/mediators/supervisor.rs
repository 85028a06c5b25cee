use db::Store;
use domain::ProgramRunnerFactory;
use error_helpers;
use errors::*;
use mediators::common;
use mediators::depend_worker;
use mediators::monitor_worker;
use mediators::submit_worker;
use model;
use model::Status;
use scheduler::SchedulerClientFactory;
use schema;
use time_helpers;

use chan;
use chan::{Receiver, Sender};
use diesel::prelude::*;
use slog::Logger;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

//
// Public constants
//

/// Pause between supervisor ticks.
pub const TICK_INTERVAL: Duration = Duration::from_secs(10);

//
// Public types
//

/// The single long-lived actor. Each tick it reaps finished workers, polls
/// the store for actionable sims, validates the ones about to be worked, and
/// spawns at most one worker per sim. Sim ownership is enforced purely by
/// the in-memory active set; the store is never used as a mutex, which is
/// sound because exactly one supervisor runs against a given database.
pub struct Mediator {
    pub store: Store,
    pub clean: bool,

    pub runner_factory:           Box<ProgramRunnerFactory>,
    pub scheduler_client_factory: Box<SchedulerClientFactory>,

    /// Set by the host process on SIGINT/SIGTERM. Checked once per tick.
    pub shutdown: Arc<AtomicBool>,

    pub tick_interval: Duration,

    // Tells the supervisor to run a single tick and then wait for its
    // workers instead of looping forever.
    pub run_once: bool,
}

impl Mediator {
    pub fn run(&mut self, log: &Logger) -> Result<RunResult> {
        time_helpers::log_timed(&log.new(o!("step" => file!())), |log| self.run_inner(log))
    }

    fn run_inner(&mut self, log: &Logger) -> Result<RunResult> {
        info!(log, "Started supervisor");

        let mut res = RunResult {
            num_ticks:       0,
            num_spawned:     0,
            num_reaped:      0,
            num_invalidated: 0,
        };
        let (done_send, done_recv) = chan::async();
        let mut active: HashMap<i32, thread::JoinHandle<()>> = HashMap::new();
        let mut interrupted = false;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!(log, "Shutdown signal observed -- stopping";
                    "num_active" => active.len());
                interrupted = true;
                break;
            }

            res.num_reaped += reap_finished(log, &mut active, &done_recv);

            for sim in self.select_actionable(log)? {
                if active.contains_key(&sim.id) {
                    continue;
                }
                let status = sim.status()?;

                // Sims about to enter the pipeline get checked; a running
                // sim was already validated when it was submitted.
                if status == Status::Submitted || status == Status::Depend {
                    debug!(log, "Sim has no worker assigned";
                        "sim_id" => sim.id,
                        "status" => status.name());
                    if !self.validate(log, &sim)? {
                        error!(log, "Sim is not a valid job -- flagging as failed";
                            "sim_id" => sim.id);
                        self.store.with_conn(log, |conn| {
                            common::update_status(log, conn, sim.id, Status::Failed)
                        })?;
                        res.num_invalidated += 1;
                        continue;
                    }
                }

                debug!(log, "Launching worker";
                    "sim_id" => sim.id,
                    "status" => status.name());
                let handle = self.spawn_worker(log, sim.id, status, &done_send)?;
                active.insert(sim.id, handle);
                res.num_spawned += 1;
            }

            res.num_ticks += 1;
            if self.run_once {
                break;
            }
            thread::sleep(self.tick_interval);
        }

        // On shutdown the workers are left to the host's grace period. On a
        // normal exit (run_once or an error bubbling up) wait for them so
        // that final row states are observable.
        if !interrupted {
            for (sim_id, handle) in active.drain() {
                debug!(log, "Waiting for worker"; "sim_id" => sim_id);
                let _ = handle.join();
                res.num_reaped += 1;
            }
        }

        info!(log, "Finished supervising";
            "num_ticks" => res.num_ticks,
            "num_spawned" => res.num_spawned,
            "num_reaped" => res.num_reaped,
            "num_invalidated" => res.num_invalidated);
        Ok(res)
    }

    //
    // Steps
    //

    fn select_actionable(&self, log: &Logger) -> Result<Vec<model::Sim>> {
        time_helpers::log_timed(&log.new(o!("step" => "select_actionable")), |log| {
            self.store.with_conn(log, |conn| {
                schema::sim::table
                    .filter(schema::sim::stat_id.eq_any(vec![
                        Status::Submitted.value(),
                        Status::Running.value(),
                        Status::Depend.value(),
                    ]))
                    .order(schema::sim::id)
                    .load::<model::Sim>(conn)
                    .chain_err(|| "Error selecting actionable sims")
            })
        })
    }

    /// A sim entering the pipeline needs at least one param row; a depend
    /// sim additionally needs an existing parent.
    fn validate(&self, log: &Logger, sim: &model::Sim) -> Result<bool> {
        let num_params: i64 = self.store.with_conn(log, |conn| {
            schema::param::table
                .filter(schema::param::sim_id.eq(sim.id))
                .count()
                .first(conn)
                .chain_err(|| "Error counting param rows")
        })?;
        if num_params == 0 {
            error!(log, "Could not find simulation parameters"; "sim_id" => sim.id);
            return Ok(false);
        }

        if sim.stat_id != Status::Depend.value() {
            return Ok(true);
        }
        match sim.parent_id {
            None => {
                error!(log, "Depend sim has no parent"; "sim_id" => sim.id);
                Ok(false)
            }
            Some(parent_id) => {
                let parent = self.store
                    .with_conn(log, |conn| common::select_sim(conn, parent_id))?;
                if parent.is_none() {
                    error!(log, "Could not find parent simulation";
                        "sim_id" => sim.id,
                        "parent_id" => parent_id);
                }
                Ok(parent.is_some())
            }
        }
    }

    fn spawn_worker(
        &self,
        log: &Logger,
        sim_id: i32,
        status: Status,
        done_send: &Sender<i32>,
    ) -> Result<thread::JoinHandle<()>> {
        let thread_name = common::thread_name(sim_id);
        let log = log.new(o!("thread" => thread_name.clone(), "sim_id" => sim_id));
        let store = self.store.clone();
        let done_send = done_send.clone();
        let builder = thread::Builder::new().name(thread_name);

        let handle = match status {
            Status::Submitted => {
                let runner = self.runner_factory.create();
                builder.spawn(move || {
                    let mut mediator = submit_worker::Mediator {
                        store,
                        sim_id,
                        runner,
                        ntrials: submit_worker::NTRIALS,
                        trial_backoff: submit_worker::TRIAL_BACKOFF,
                    };
                    finish_worker(&log, mediator.run(&log).map(|_| ()), &done_send, sim_id);
                })
            }
            Status::Running => {
                let client = self.scheduler_client_factory.create();
                let clean = self.clean;
                builder.spawn(move || {
                    let mut mediator = monitor_worker::Mediator {
                        store,
                        sim_id,
                        client,
                        clean,
                        poll_interval: monitor_worker::POLL_INTERVAL,
                        deadline: None,
                    };
                    finish_worker(&log, mediator.run(&log).map(|_| ()), &done_send, sim_id);
                })
            }
            Status::Depend => builder.spawn(move || {
                let mut mediator = depend_worker::Mediator {
                    store,
                    sim_id,
                    poll_interval: depend_worker::POLL_INTERVAL,
                    deadline: None,
                };
                finish_worker(&log, mediator.run(&log).map(|_| ()), &done_send, sim_id);
            }),
            _ => return Err(format!("No worker kind for status '{}'", status.name()).into()),
        };
        handle.chain_err(|| "Failed to spawn worker thread")
    }
}

pub struct RunResult {
    pub num_ticks:       u64,
    pub num_spawned:     u64,
    pub num_reaped:      u64,
    pub num_invalidated: u64,
}

//
// Private functions
//

/// A worker's last act, success or error: the error chain is logged (a
/// worker never unwinds into the supervisor) and the sim ID goes onto the
/// completion channel so the supervisor releases ownership.
fn finish_worker(log: &Logger, res: Result<()>, done_send: &Sender<i32>, sim_id: i32) {
    if let Err(ref e) = res {
        error_helpers::print_error(log, e);
    }
    done_send.send(sim_id);
}

/// Drains the completion channel without blocking and joins each finished
/// worker, freeing its sim for future ticks.
fn reap_finished(
    log: &Logger,
    active: &mut HashMap<i32, thread::JoinHandle<()>>,
    done_recv: &Receiver<i32>,
) -> u64 {
    let mut num_reaped = 0;
    loop {
        chan_select! {
            done_recv.recv() -> sim_id => {
                let sim_id = match sim_id {
                    Some(sim_id) => sim_id,
                    None => break,
                };
                debug!(log, "Received exit signal for sim"; "sim_id" => sim_id);
                if let Some(handle) = active.remove(&sim_id) {
                    let _ = handle.join();
                    num_reaped += 1;
                    debug!(log, "Recycled worker for sim"; "sim_id" => sim_id);
                }
            },
            default => break,
        }
    }
    num_reaped
}

//
// Tests
//

#[cfg(test)]
mod tests {
    use domain::ProgramRunnerFactoryPassThrough;
    use mediators::supervisor::*;
    use scheduler::{Scheduler, SchedulerClientFactoryPassThrough};
    use test_helpers;

    use diesel::pg::PgConnection;
    use std::sync::Arc;

    // Scenario: happy local. One tick takes a shell sim all the way to
    // complete and leaves a fout row behind.
    #[ignore]
    #[test]
    fn test_supervisor_local_sim() {
        let mut bootstrap = TestBootstrap::new();
        let sim_id = test_helpers::insert_sim(&bootstrap.conn, Status::Submitted, None);
        test_helpers::insert_param(&bootstrap.conn, sim_id, "shell", "/tmp", json!({}));

        let (mut mediator, log) = bootstrap.mediator();
        let res = mediator.run(&log).unwrap();

        assert_eq!(1, res.num_spawned);
        assert_eq!(
            Status::Complete.value(),
            test_helpers::select_stat_id(&bootstrap.conn, sim_id)
        );
        assert!(test_helpers::select_files(&bootstrap.conn, sim_id).is_some());
    }

    // Scenario: invalid submitted. A sim without params is failed without
    // ever spawning a worker.
    #[ignore]
    #[test]
    fn test_supervisor_invalid_sim() {
        let mut bootstrap = TestBootstrap::new();
        let sim_id = test_helpers::insert_sim(&bootstrap.conn, Status::Submitted, None);

        let (mut mediator, log) = bootstrap.mediator();
        let res = mediator.run(&log).unwrap();

        assert_eq!(0, res.num_spawned);
        assert_eq!(1, res.num_invalidated);
        assert_eq!(
            Status::Failed.value(),
            test_helpers::select_stat_id(&bootstrap.conn, sim_id)
        );
    }

    // Scenario: dependency chain. The depend worker promotes the child to
    // submitted; a second tick then runs it to completion.
    #[ignore]
    #[test]
    fn test_supervisor_dependency_chain() {
        let mut bootstrap = TestBootstrap::new();
        let parent_id = test_helpers::insert_sim(&bootstrap.conn, Status::Complete, None);
        let sim_id = test_helpers::insert_sim(&bootstrap.conn, Status::Depend, Some(parent_id));
        test_helpers::insert_param(&bootstrap.conn, sim_id, "shell", "/tmp", json!({}));

        {
            let (mut mediator, log) = bootstrap.mediator();
            mediator.run(&log).unwrap();
        }
        assert_eq!(
            Status::Submitted.value(),
            test_helpers::select_stat_id(&bootstrap.conn, sim_id)
        );

        {
            let (mut mediator, log) = bootstrap.mediator();
            mediator.run(&log).unwrap();
        }
        assert_eq!(
            Status::Complete.value(),
            test_helpers::select_stat_id(&bootstrap.conn, sim_id)
        );
    }

    // Scenario: dependency failure propagation. The child becomes terminal
    // and is never picked up again.
    #[ignore]
    #[test]
    fn test_supervisor_dependency_failure() {
        let mut bootstrap = TestBootstrap::new();
        let parent_id = test_helpers::insert_sim(&bootstrap.conn, Status::Failed, None);
        let sim_id = test_helpers::insert_sim(&bootstrap.conn, Status::Depend, Some(parent_id));
        test_helpers::insert_param(&bootstrap.conn, sim_id, "shell", "/tmp", json!({}));

        {
            let (mut mediator, log) = bootstrap.mediator();
            mediator.run(&log).unwrap();
        }
        assert_eq!(
            Status::DependFailed.value(),
            test_helpers::select_stat_id(&bootstrap.conn, sim_id)
        );

        // Terminal: a further tick finds nothing to do.
        {
            let (mut mediator, log) = bootstrap.mediator();
            let res = mediator.run(&log).unwrap();
            assert_eq!(0, res.num_spawned);
        }
    }

    // A depend sim whose parent row is missing fails validation.
    #[ignore]
    #[test]
    fn test_supervisor_missing_parent() {
        let mut bootstrap = TestBootstrap::new();

        // Insert a real parent to get an id, then delete it out from under
        // the child.
        let parent_id = test_helpers::insert_sim(&bootstrap.conn, Status::Complete, None);
        let sim_id = test_helpers::insert_sim(&bootstrap.conn, Status::Depend, Some(parent_id));
        test_helpers::insert_param(&bootstrap.conn, sim_id, "shell", "/tmp", json!({}));
        test_helpers::delete_sim(&bootstrap.conn, parent_id);

        let (mut mediator, log) = bootstrap.mediator();
        let res = mediator.run(&log).unwrap();

        assert_eq!(1, res.num_invalidated);
        assert_eq!(
            Status::Failed.value(),
            test_helpers::select_stat_id(&bootstrap.conn, sim_id)
        );
    }

    //
    // Private types/functions
    //

    struct TestBootstrap {
        conn:  PgConnection,
        log:   Logger,
        store: Store,
    }

    impl TestBootstrap {
        fn new() -> TestBootstrap {
            TestBootstrap {
                conn:  test_helpers::conn(),
                log:   test_helpers::log(),
                store: test_helpers::store(),
            }
        }

        fn mediator(&mut self) -> (Mediator, Logger) {
            (
                Mediator {
                    store: self.store.clone(),
                    clean: false,
                    runner_factory: Box::new(ProgramRunnerFactoryPassThrough {
                        exit_code: 0,
                        stdout:    String::new(),
                    }),
                    scheduler_client_factory: Box::new(SchedulerClientFactoryPassThrough {
                        scheduler:  Scheduler::Slurm,
                        raw_states: Arc::new(Default::default()),
                    }),
                    shutdown: Arc::new(AtomicBool::new(false)),
                    tick_interval: Duration::from_millis(10),
                    run_once: true,
                },
                self.log.clone(),
            )
        }
    }

    impl Drop for TestBootstrap {
        fn drop(&mut self) {
            test_helpers::clean_database(&self.log, &self.conn);
        }
    }
}
