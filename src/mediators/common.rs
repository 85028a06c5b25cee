use domain::JsonMap;
use errors::*;
use model;
use model::Status;
use schema;

use diesel;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json;
use slog::Logger;

/// Small store accesses shared by the supervisor and the workers. Anything
/// with real domain logic belongs in a mediator, not here.

pub fn thread_name(sim_id: i32) -> String {
    format!("sim_{:06}", sim_id)
}

pub fn select_sim(conn: &PgConnection, sim_id: i32) -> Result<Option<model::Sim>> {
    schema::sim::table
        .filter(schema::sim::id.eq(sim_id))
        .first::<model::Sim>(conn)
        .optional()
        .chain_err(|| "Error selecting sim")
}

pub fn select_job_ids(conn: &PgConnection, sim_id: i32) -> Result<Vec<i32>> {
    schema::job_info::table
        .filter(schema::job_info::sim_id.eq(sim_id))
        .order(schema::job_info::id)
        .select(schema::job_info::job_id)
        .load(conn)
        .chain_err(|| "Error selecting job IDs")
}

/// Writes a sim's new status. Failures are worth a line at error level;
/// routine transitions log at debug.
pub fn update_status(log: &Logger, conn: &PgConnection, sim_id: i32, to: Status) -> Result<()> {
    diesel::update(schema::sim::table.filter(schema::sim::id.eq(sim_id)))
        .set(schema::sim::stat_id.eq(to.value()))
        .execute(conn)
        .chain_err(|| "Error updating sim status")?;

    if to == Status::Failed || to == Status::DependFailed {
        error!(log, "Updated sim status"; "sim_id" => sim_id, "status" => to.name());
    } else {
        debug!(log, "Updated sim status"; "sim_id" => sim_id, "status" => to.name());
    }
    Ok(())
}

/// Loads a sim's outfiles map. A sim without a fout row (or with a null
/// document) simply has no outfiles yet.
pub fn select_fout_files(conn: &PgConnection, sim_id: i32) -> Result<Option<JsonMap>> {
    let row = schema::fout::table
        .filter(schema::fout::sim_id.eq(sim_id))
        .order(schema::fout::id)
        .first::<model::Fout>(conn)
        .optional()
        .chain_err(|| "Error selecting fout row")?;

    Ok(row.and_then(|r| r.files).and_then(|v| match v {
        serde_json::Value::Object(map) => Some(map),
        _ => None,
    }))
}

/// Writes a sim's outfiles map back: UPDATE if a row exists, INSERT
/// otherwise. `fout.sim_id` carries no unique constraint, so this can't be
/// an `ON CONFLICT` upsert.
pub fn upsert_fout(conn: &PgConnection, sim_id: i32, files: JsonMap) -> Result<()> {
    let files = serde_json::Value::Object(files);

    let num_updated = diesel::update(schema::fout::table.filter(schema::fout::sim_id.eq(sim_id)))
        .set(schema::fout::files.eq(&files))
        .execute(conn)
        .chain_err(|| "Error updating fout row")?;

    if num_updated == 0 {
        diesel::insert_into(schema::fout::table)
            .values(&model::insertable::Fout { sim_id, files })
            .execute(conn)
            .chain_err(|| "Error inserting fout row")?;
    }
    Ok(())
}

//
// Tests
//

#[cfg(test)]
mod tests {
    use mediators::common::*;

    #[test]
    fn test_thread_name() {
        assert_eq!("sim_000001".to_owned(), thread_name(1));
        assert_eq!("sim_999999".to_owned(), thread_name(999_999));
        assert_eq!("sim_1000000".to_owned(), thread_name(1_000_000));
    }
}
