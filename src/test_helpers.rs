use db;
use model;
use model::Status;
use schema;

use diesel;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json;
use slog;
use slog::{Drain, Logger};
use slog_term;
use std;
use std::env;
use std::time::Duration;

pub fn log() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    slog::Logger::root(drain, o!("env" => "test"))
}

pub fn store() -> db::Store {
    db::Store {
        database_url:  database_url(),
        max_attempts:  3,
        retry_backoff: Duration::from_millis(50),
    }
}

pub fn conn() -> PgConnection {
    // No test transaction here: the workers under test open their own
    // short-lived connections and must see what this one writes.
    PgConnection::establish(&database_url()).unwrap()
}

/// Removes every row the tests (or the workers they ran) created. Tests that
/// use this don't play well with parallelism, so they're marked `ignore` and
/// run single-threaded.
pub fn clean_database(log: &Logger, conn: &PgConnection) {
    debug!(log, "Cleaning database");
    for table in &["job_info", "fout", "param", "sim"] {
        diesel::sql_query(format!("DELETE FROM {}", table))
            .execute(conn)
            .unwrap();
    }
}

//
// Row builders: tests play the submission tool's role.
//

pub fn insert_sim(conn: &PgConnection, status: Status, parent_id: Option<i32>) -> i32 {
    let sim: model::Sim = diesel::insert_into(schema::sim::table)
        .values(&model::insertable::Sim {
            stat_id: status.value(),
            parent_id,
        })
        .get_result(conn)
        .unwrap();
    sim.id
}

pub fn insert_param(
    conn: &PgConnection,
    sim_id: i32,
    cmd: &str,
    path: &str,
    args: serde_json::Value,
) {
    diesel::insert_into(schema::param::table)
        .values(&model::insertable::Param {
            sim_id: sim_id,
            path:   Some(path.to_owned()),
            cmd:    cmd.to_owned(),
            args:   args,
        })
        .execute(conn)
        .unwrap();
}

pub fn insert_fout(conn: &PgConnection, sim_id: i32, files: serde_json::Value) {
    diesel::insert_into(schema::fout::table)
        .values(&model::insertable::Fout {
            sim_id: sim_id,
            files:  files,
        })
        .execute(conn)
        .unwrap();
}

pub fn insert_job_info(conn: &PgConnection, sim_id: i32, job_id: i32) {
    diesel::insert_into(schema::job_info::table)
        .values(&model::insertable::JobInfo {
            sim_id: sim_id,
            job_id: job_id,
        })
        .execute(conn)
        .unwrap();
}

pub fn delete_sim(conn: &PgConnection, sim_id: i32) {
    diesel::delete(schema::sim::table.filter(schema::sim::id.eq(sim_id)))
        .execute(conn)
        .unwrap();
}

//
// Row readers
//

pub fn select_stat_id(conn: &PgConnection, sim_id: i32) -> i16 {
    schema::sim::table
        .filter(schema::sim::id.eq(sim_id))
        .select(schema::sim::stat_id)
        .first(conn)
        .unwrap()
}

pub fn select_files(conn: &PgConnection, sim_id: i32) -> Option<serde_json::Value> {
    schema::fout::table
        .filter(schema::fout::sim_id.eq(sim_id))
        .order(schema::fout::id)
        .select(schema::fout::files)
        .first::<Option<serde_json::Value>>(conn)
        .optional()
        .unwrap()
        .and_then(|files| files)
}

pub fn select_job_ids(conn: &PgConnection, sim_id: i32) -> Vec<i32> {
    schema::job_info::table
        .filter(schema::job_info::sim_id.eq(sim_id))
        .order(schema::job_info::job_id)
        .select(schema::job_info::job_id)
        .load(conn)
        .unwrap()
}

//
// Private functions
//

fn database_url() -> String {
    env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set in order to run tests")
}
