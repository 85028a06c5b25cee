//! The daemon's data layer: models queried from and inserted into the
//! database, along with the status alphabet that sims move through.
//!
//! Simple helper functions are allowed, but they should be kept extremely
//! simple, with preference for any and all domain logic to be offloaded to a
//! mediator.
//!
//! Insertable models are found in the `insertable` module. These are distinct
//! from queryable models so that we can take advantage of default values
//! provided by the database (the best example being ID sequences, but applies
//! to any field with a `DEFAULT`).

use errors::*;

/// The status alphabet shared with the submission tool. The discriminants are
/// a wire format: they are the exact integer codes stored in `sim.stat_id`
/// and seeded into `sim_status_lookup` by the bootstrap tool. Never renumber.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Status {
    Failed       = 0,
    Submitted    = 1,
    Running      = 2,
    Complete     = 3,
    Depend       = 4,
    DependFailed = 5,
    Updating     = 6,
}

impl Status {
    pub fn from_value(value: i16) -> Result<Status> {
        match value {
            0 => Ok(Status::Failed),
            1 => Ok(Status::Submitted),
            2 => Ok(Status::Running),
            3 => Ok(Status::Complete),
            4 => Ok(Status::Depend),
            5 => Ok(Status::DependFailed),
            6 => Ok(Status::Updating),
            v => Err(ErrorKind::StatusUnknown(v).into()),
        }
    }

    pub fn value(self) -> i16 {
        self as i16
    }

    pub fn name(self) -> &'static str {
        match self {
            Status::Failed => "failed",
            Status::Submitted => "submitted",
            Status::Running => "running",
            Status::Complete => "complete",
            Status::Depend => "depend",
            Status::DependFailed => "depend_failed",
            Status::Updating => "updating",
        }
    }

    /// Terminal statuses are sticky: no worker ever moves a sim out of one.
    pub fn is_terminal(self) -> bool {
        match self {
            Status::Failed | Status::Complete | Status::DependFailed => true,
            _ => false,
        }
    }

    /// Whether the state machine permits moving a sim from `from` to `to`.
    ///
    /// The submitter owns the transitions out of `Updating`; the submit
    /// worker owns those out of `Submitted`; the monitor worker owns those
    /// out of `Running`; the depend worker owns those out of `Depend`. The
    /// supervisor may fail a sim out of `Submitted` or `Depend` when
    /// validation rejects it.
    pub fn permits(from: Status, to: Status) -> bool {
        use model::Status::*;
        match (from, to) {
            (Updating, Submitted) | (Updating, Depend) => true,
            (Submitted, Running) | (Submitted, Complete) | (Submitted, Failed) => true,
            (Running, Complete) | (Running, Failed) => true,
            (Depend, Submitted) | (Depend, DependFailed) | (Depend, Failed) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Queryable)]
pub struct Sim {
    pub id:        i32,
    pub stat_id:   i16,
    pub parent_id: Option<i32>,
}

impl Sim {
    pub fn status(&self) -> Result<Status> {
        Status::from_value(self.stat_id)
    }
}

#[derive(Clone, Debug, Queryable)]
pub struct Param {
    pub id:     i32,
    pub sim_id: i32,
    pub path:   Option<String>,
    pub cmd:    String,
    pub args:   ::serde_json::Value,
}

#[derive(Clone, Debug, Queryable)]
pub struct Fout {
    pub id:     i32,
    pub sim_id: i32,
    pub files:  Option<::serde_json::Value>,
}

#[derive(Clone, Debug, Queryable)]
pub struct JobInfo {
    pub id:     i32,
    pub sim_id: i32,
    pub job_id: i32,
}


pub mod insertable {
    use schema::{fout, job_info, param, sim};

    #[derive(Insertable)]
    #[table_name = "fout"]
    pub struct Fout {
        pub sim_id: i32,
        pub files:  ::serde_json::Value,
    }

    #[derive(Insertable)]
    #[table_name = "job_info"]
    pub struct JobInfo {
        pub sim_id: i32,
        pub job_id: i32,
    }

    // Sim and param rows are created by the submission tool, never by the
    // daemon. These exist so that tests can play the submitter's role.

    #[derive(Insertable)]
    #[table_name = "param"]
    pub struct Param {
        pub sim_id: i32,
        pub path:   Option<String>,
        pub cmd:    String,
        pub args:   ::serde_json::Value,
    }

    #[derive(Insertable)]
    #[table_name = "sim"]
    pub struct Sim {
        pub stat_id:   i16,
        pub parent_id: Option<i32>,
    }
}
