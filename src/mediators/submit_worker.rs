use db::Store;
use domain;
use domain::{JsonMap, Program, ProgramRunner};
use errors::*;
use mediators::common;
use model;
use model::Status;
use schema;
use time_helpers;

use diesel;
use diesel::prelude::*;
use serde_json;
use slog::Logger;
use std::thread;
use std::time::Duration;

//
// Public constants
//

/// How often the domain command is attempted before the sim is failed.
pub const NTRIALS: u32 = 3;

/// Fixed pause between command trials.
pub const TRIAL_BACKOFF: Duration = Duration::from_secs(5);

//
// Public types
//

/// One-shot worker owning a sim in `submitted`. Resolves the sim's
/// arguments (including files inherited from its parent), invokes the domain
/// command, records outputs and batch job IDs, and advances the sim to
/// `running` (cluster command), `complete` (local command) or `failed`.
pub struct Mediator {
    pub store:  Store,
    pub sim_id: i32,
    pub runner: Box<ProgramRunner>,

    pub ntrials:       u32,
    pub trial_backoff: Duration,
}

impl Mediator {
    pub fn run(&mut self, log: &Logger) -> Result<RunResult> {
        time_helpers::log_timed(&log.new(o!("step" => file!())), |log| self.run_inner(log))
    }

    fn run_inner(&mut self, log: &Logger) -> Result<RunResult> {
        let param = self.select_param(log)?;

        let program = match Program::from_name(&param.cmd) {
            Ok(program) => program,
            Err(e) => return self.fail(log, &e),
        };
        debug!(log, "Running command for sim"; "cmd" => program.name());

        let base = param.path.clone().unwrap_or_else(|| ".".to_owned());

        // A sim with a parent inherits files from the parent's (recursively
        // resolved) outfiles.
        let sim = self.select_self(log)?;
        let parent_fout = match sim.parent_id {
            Some(parent_id) => Some(self.resolve_fout(log, parent_id)?),
            None => None,
        };

        let raw_args = match param.args {
            serde_json::Value::Object(map) => map,
            _ => {
                return self.fail(log, &"Sim args are not a JSON object".into());
            }
        };
        let resolved = match resolve_args(program, &raw_args, &base, parent_fout.as_ref()) {
            Ok(resolved) => resolved,
            Err(e) => return self.fail(log, &e),
        };

        let invocation = match self.invoke(log, program, &resolved)? {
            Some(invocation) => invocation,
            None => return self.fail(log, &"Command failed all trials".into()),
        };

        // Commit (preliminary) outfiles before flipping the status so that
        // the monitor and any dependent sims see them.
        let declared = self.resolve_fout(log, self.sim_id)?;
        let mut files = domain::derive_outfiles(program, &resolved, &base, declared);

        let final_status = match program {
            Program::GSubmit => {
                for (key, value) in domain::gsubmit_auxfiles(&invocation.stdout) {
                    files.insert(key, value);
                }
                self.persist_fout(log, files)?;

                let batch_ids = domain::gsubmit_batch_ids(&invocation.stdout);
                self.insert_job_info(log, &batch_ids)?;
                Status::Running
            }
            Program::Grompp | Program::Shell => {
                self.persist_fout(log, files)?;
                Status::Complete
            }
        };

        self.set_status(log, final_status)?;
        Ok(RunResult { final_status })
    }

    //
    // Steps
    //

    fn select_param(&self, log: &Logger) -> Result<model::Param> {
        time_helpers::log_timed(&log.new(o!("step" => "select_param")), |log| {
            self.store
                .with_conn(log, |conn| {
                    schema::param::table
                        .filter(schema::param::sim_id.eq(self.sim_id))
                        .order(schema::param::id)
                        .first::<model::Param>(conn)
                        .optional()
                        .chain_err(|| "Error selecting param row")
                })?
                .ok_or_else(|| Error::from("No param row for sim"))
        })
    }

    fn select_self(&self, log: &Logger) -> Result<model::Sim> {
        self.store
            .with_conn(log, |conn| common::select_sim(conn, self.sim_id))?
            .ok_or_else(|| Error::from("Sim row disappeared"))
    }

    /// Loads a sim's outfiles and resolves every `%`-inherited entry by
    /// walking the parent chain. When anything was resolved, the result is
    /// written back so that future walks stop here.
    fn resolve_fout(&self, log: &Logger, sim_id: i32) -> Result<JsonMap> {
        let files = self.store
            .with_conn(log, |conn| common::select_fout_files(conn, sim_id))?;
        let mut files = match files {
            Some(files) => files,
            None => return Ok(JsonMap::new()),
        };

        let inherits = files
            .values()
            .any(|v| v.as_str().map_or(false, |s| s.starts_with('%')));
        if !inherits {
            return Ok(files);
        }

        let parent_id = self.store
            .with_conn(log, |conn| common::select_sim(conn, sim_id))?
            .and_then(|sim| sim.parent_id);
        let parent_files = match parent_id {
            Some(parent_id) => self.resolve_fout(log, parent_id)?,
            None => JsonMap::new(),
        };

        let keys: Vec<String> = files.keys().cloned().collect();
        for key in keys {
            let file_type = match files[&key] {
                serde_json::Value::String(ref s) if s.starts_with('%') => s[1..].to_owned(),
                _ => continue,
            };
            match parent_files.get(&file_type) {
                Some(inherited) => {
                    files.insert(key, inherited.clone());
                }
                None => {
                    warn!(log, "Inherited file type missing from parent outfiles -- dropping";
                        "sim_id" => sim_id,
                        "file_type" => file_type);
                    files.remove(&key);
                }
            }
        }

        self.store
            .with_conn(log, |conn| common::upsert_fout(conn, sim_id, files.clone()))?;
        Ok(files)
    }

    fn invoke(
        &mut self,
        log: &Logger,
        program: Program,
        resolved: &JsonMap,
    ) -> Result<Option<domain::Invocation>> {
        let args = domain::flatten_args(resolved);
        let mut last: Option<domain::Invocation> = None;

        for trial in 1..(self.ntrials + 1) {
            match self.runner.run(log, program, &args) {
                Ok(invocation) => {
                    if invocation.success() {
                        return Ok(Some(invocation));
                    }
                    warn!(log, "Command failed -- will retry";
                        "cmd" => program.name(),
                        "exit_code" => invocation.exit_code,
                        "trial" => trial,
                        "ntrials" => self.ntrials);
                    last = Some(invocation);
                }
                Err(e) => {
                    warn!(log, "Command could not be invoked -- will retry";
                        "cmd" => program.name(),
                        "error" => e.to_string(),
                        "trial" => trial,
                        "ntrials" => self.ntrials);
                }
            }
            if trial < self.ntrials {
                thread::sleep(self.trial_backoff);
            }
        }

        if let Some(invocation) = last {
            error!(log, "Command failed all trials";
                "cmd" => program.name(),
                "exit_code" => invocation.exit_code,
                "stdout" => invocation.stdout,
                "stderr" => invocation.stderr);
        }
        Ok(None)
    }

    fn persist_fout(&self, log: &Logger, files: JsonMap) -> Result<()> {
        time_helpers::log_timed(&log.new(o!("step" => "persist_fout")), |log| {
            self.store
                .with_conn(log, |conn| common::upsert_fout(conn, self.sim_id, files.clone()))
        })
    }

    fn insert_job_info(&self, log: &Logger, batch_ids: &[i32]) -> Result<()> {
        if batch_ids.is_empty() {
            warn!(log, "Command produced no batch job IDs");
            return Ok(());
        }
        debug!(log, "Recording batch job IDs"; "num_jobs" => batch_ids.len());

        let rows: Vec<model::insertable::JobInfo> = batch_ids
            .iter()
            .map(|&job_id| model::insertable::JobInfo {
                sim_id: self.sim_id,
                job_id,
            })
            .collect();
        self.store.with_conn(log, |conn| {
            diesel::insert_into(schema::job_info::table)
                .values(&rows)
                .execute(conn)
                .chain_err(|| "Error inserting job_info rows")?;
            Ok(())
        })
    }

    fn set_status(&self, log: &Logger, to: Status) -> Result<()> {
        self.store
            .with_conn(log, |conn| common::update_status(log, conn, self.sim_id, to))
    }

    /// Validation and command failures are terminal for the sim but not for
    /// the worker: the sim is flagged failed and the worker exits cleanly.
    fn fail(&self, log: &Logger, cause: &Error) -> Result<RunResult> {
        error!(log, "Flagging sim as failed"; "cause" => cause.to_string());
        self.set_status(log, Status::Failed)?;
        Ok(RunResult {
            final_status: Status::Failed,
        })
    }
}

pub struct RunResult {
    pub final_status: Status,
}

//
// Public functions
//

/// Resolves a sim's raw argument map for invocation:
///
///   * a string value `%<type>` is replaced by the parent's outfile of that
///     type and fails resolution when absent;
///   * a relative path in a file-bearing argument is rebased onto the sim's
///     base directory;
///   * everything else passes through.
pub fn resolve_args(
    program: Program,
    raw_args: &JsonMap,
    base: &str,
    parent_fout: Option<&JsonMap>,
) -> Result<JsonMap> {
    let mut resolved = JsonMap::new();
    for (key, value) in raw_args {
        let inherited_type = value
            .as_str()
            .and_then(|s| if s.starts_with('%') { Some(&s[1..]) } else { None });

        if let Some(file_type) = inherited_type {
            let parent_fout = parent_fout.ok_or_else(|| {
                Error::from(format!(
                    "Argument '{}' inherits file type '{}' but sim has no dependency outfiles",
                    key, file_type
                ))
            })?;
            let inherited = parent_fout.get(file_type).ok_or_else(|| {
                Error::from(format!(
                    "Argument '{}' inherits file type '{}' not present in dependency outfiles",
                    key, file_type
                ))
            })?;
            resolved.insert(key.clone(), inherited.clone());
        } else if program.file_args().contains(&key.as_str()) {
            match *value {
                serde_json::Value::String(ref path) => {
                    resolved.insert(
                        key.clone(),
                        serde_json::Value::String(domain::absolutize(path, base)),
                    );
                }
                ref other => {
                    resolved.insert(key.clone(), other.clone());
                }
            }
        } else {
            resolved.insert(key.clone(), value.clone());
        }
    }
    Ok(resolved)
}

//
// Tests
//

#[cfg(test)]
mod tests {
    use domain::{ProgramRunnerFactory, ProgramRunnerFactoryPassThrough};
    use mediators::submit_worker::*;
    use test_helpers;

    use diesel::pg::PgConnection;

    #[test]
    fn test_resolve_args_inherits_from_parent() {
        let parent_fout = json_map(json!({"topology": "/abs/a.top"}));
        let raw_args = json_map(json!({"-p": "%topology", "-f": "run.mdp"}));

        let resolved =
            resolve_args(Program::Grompp, &raw_args, "/data/sim", Some(&parent_fout)).unwrap();

        assert_eq!("/abs/a.top", resolved["-p"].as_str().unwrap());
        assert_eq!("/data/sim/run.mdp", resolved["-f"].as_str().unwrap());
    }

    #[test]
    fn test_resolve_args_missing_file_type() {
        let parent_fout = json_map(json!({"trajectory": "/abs/a.xtc"}));
        let raw_args = json_map(json!({"-p": "%topology"}));

        let res = resolve_args(Program::Grompp, &raw_args, "/data", Some(&parent_fout));
        assert!(
            res.err()
                .unwrap()
                .to_string()
                .contains("not present in dependency outfiles")
        );
    }

    #[test]
    fn test_resolve_args_without_parent() {
        let raw_args = json_map(json!({"-p": "%topology"}));

        let res = resolve_args(Program::Grompp, &raw_args, "/data", None);
        assert!(
            res.err()
                .unwrap()
                .to_string()
                .contains("no dependency outfiles")
        );
    }

    #[test]
    fn test_resolve_args_rebases_file_args_only() {
        let raw_args = json_map(json!({"-s": "topol.tpr", "-nt": "8", "name": "npt"}));

        let resolved = resolve_args(Program::GSubmit, &raw_args, "/data/sim", None).unwrap();

        assert_eq!("/data/sim/topol.tpr", resolved["-s"].as_str().unwrap());

        // Not file arguments: passed through untouched.
        assert_eq!("8", resolved["-nt"].as_str().unwrap());
        assert_eq!("npt", resolved["name"].as_str().unwrap());
    }

    #[test]
    fn test_resolve_args_is_idempotent() {
        let raw_args = json_map(json!({"-s": "topol.tpr", "-nt": "8"}));

        let once = resolve_args(Program::GSubmit, &raw_args, "/data", None).unwrap();
        let twice = resolve_args(Program::GSubmit, &once, "/data", None).unwrap();
        assert_eq!(once, twice);
    }

    // Scenario: happy local command. The sim completes in one submit cycle
    // and a fout row appears.
    #[ignore]
    #[test]
    fn test_submit_worker_local_command() {
        let mut bootstrap = TestBootstrap::new();
        let sim_id = test_helpers::insert_sim(&bootstrap.conn, Status::Submitted, None);
        test_helpers::insert_param(&bootstrap.conn, sim_id, "shell", "/tmp", json!({}));

        let (mut mediator, log) = bootstrap.mediator(sim_id, exit_zero());
        let res = mediator.run(&log).unwrap();

        assert_eq!(Status::Complete, res.final_status);
        assert_eq!(
            Status::Complete.value(),
            test_helpers::select_stat_id(&bootstrap.conn, sim_id)
        );
        assert!(test_helpers::select_files(&bootstrap.conn, sim_id).is_some());
    }

    // Scenario: happy cluster command. The sim moves to running and each
    // printed batch ID lands in job_info.
    #[ignore]
    #[test]
    fn test_submit_worker_cluster_command() {
        let mut bootstrap = TestBootstrap::new();
        let sim_id = test_helpers::insert_sim(&bootstrap.conn, Status::Submitted, None);
        test_helpers::insert_param(
            &bootstrap.conn,
            sim_id,
            "g_submit",
            "/tmp",
            json!({"-s": "topol.tpr"}),
        );

        let factory = ProgramRunnerFactoryPassThrough {
            exit_code: 0,
            stdout:    "Submitted batch job 101\nSubmitted batch job 102\n".to_owned(),
        };
        let (mut mediator, log) = bootstrap.mediator(sim_id, factory);
        let res = mediator.run(&log).unwrap();

        assert_eq!(Status::Running, res.final_status);
        assert_eq!(
            Status::Running.value(),
            test_helpers::select_stat_id(&bootstrap.conn, sim_id)
        );
        assert_eq!(
            vec![101, 102],
            test_helpers::select_job_ids(&bootstrap.conn, sim_id)
        );
    }

    // Scenario: inherited file. The parent's outfile feeds the child's
    // argument before invocation.
    #[ignore]
    #[test]
    fn test_submit_worker_inherited_file() {
        let mut bootstrap = TestBootstrap::new();
        let parent_id = test_helpers::insert_sim(&bootstrap.conn, Status::Complete, None);
        test_helpers::insert_fout(
            &bootstrap.conn,
            parent_id,
            json!({"topology": "/abs/a.top"}),
        );

        let sim_id = test_helpers::insert_sim(&bootstrap.conn, Status::Submitted, Some(parent_id));
        test_helpers::insert_param(
            &bootstrap.conn,
            sim_id,
            "grompp",
            "/tmp",
            json!({"-p": "%topology"}),
        );

        let (mut mediator, log) = bootstrap.mediator(sim_id, exit_zero());
        let res = mediator.run(&log).unwrap();

        assert_eq!(Status::Complete, res.final_status);
    }

    // A failing command exhausts its trials and fails the sim.
    #[ignore]
    #[test]
    fn test_submit_worker_command_failure() {
        let mut bootstrap = TestBootstrap::new();
        let sim_id = test_helpers::insert_sim(&bootstrap.conn, Status::Submitted, None);
        test_helpers::insert_param(&bootstrap.conn, sim_id, "shell", "/tmp", json!({}));

        let factory = ProgramRunnerFactoryPassThrough {
            exit_code: 1,
            stdout:    "boom".to_owned(),
        };
        let (mut mediator, log) = bootstrap.mediator(sim_id, factory);
        let res = mediator.run(&log).unwrap();

        assert_eq!(Status::Failed, res.final_status);
        assert_eq!(
            Status::Failed.value(),
            test_helpers::select_stat_id(&bootstrap.conn, sim_id)
        );
    }

    // An unresolvable dependency token fails the sim without invoking the
    // command at all.
    #[ignore]
    #[test]
    fn test_submit_worker_unresolved_dependency() {
        let mut bootstrap = TestBootstrap::new();
        let parent_id = test_helpers::insert_sim(&bootstrap.conn, Status::Complete, None);
        let sim_id = test_helpers::insert_sim(&bootstrap.conn, Status::Submitted, Some(parent_id));
        test_helpers::insert_param(
            &bootstrap.conn,
            sim_id,
            "grompp",
            "/tmp",
            json!({"-p": "%topology"}),
        );

        let (mut mediator, log) = bootstrap.mediator(sim_id, exit_zero());
        let res = mediator.run(&log).unwrap();

        assert_eq!(Status::Failed, res.final_status);
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

        fn mediator(
            &mut self,
            sim_id: i32,
            factory: ProgramRunnerFactoryPassThrough,
        ) -> (Mediator, Logger) {
            (
                Mediator {
                    store:         self.store.clone(),
                    sim_id:        sim_id,
                    runner:        factory.create(),
                    ntrials:       2,
                    trial_backoff: Duration::from_millis(1),
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

    fn exit_zero() -> ProgramRunnerFactoryPassThrough {
        ProgramRunnerFactoryPassThrough {
            exit_code: 0,
            stdout:    String::new(),
        }
    }

    fn json_map(value: ::serde_json::Value) -> JsonMap {
        match value {
            ::serde_json::Value::Object(map) => map,
            _ => panic!("expected a JSON object"),
        }
    }
}
