use errors::*;

use diesel::pg::PgConnection;
use diesel::prelude::*;
use slog::Logger;
use std::thread;
use std::time::Duration;

//
// Public constants
//

/// How often a store operation is attempted before its error is surfaced.
pub const MAX_ATTEMPTS: u32 = 10;

/// Fixed pause between store operation attempts.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(2);

//
// Public types
//

/// Handle on the relational store.
///
/// The store caps the number of simultaneous connections and a daemon may
/// have many short-lived workers, so nobody holds a connection open: every
/// operation establishes a fresh connection, runs, and drops it. That trades
/// a little latency for headroom, and it means a worker never holds a
/// connection across a sleep.
///
/// `Store` is a plain value; clone it freely into worker threads.
#[derive(Clone, Debug)]
pub struct Store {
    pub database_url:  String,
    pub max_attempts:  u32,
    pub retry_backoff: Duration,
}

impl Store {
    pub fn new(database_url: String) -> Store {
        Store {
            database_url,
            max_attempts: MAX_ATTEMPTS,
            retry_backoff: RETRY_BACKOFF,
        }
    }

    /// Runs `f` against a fresh connection, retrying the whole operation
    /// (connect included) with a fixed back-off until it succeeds or
    /// attempts are exhausted. Callers can assume the result is
    /// eventually-successful-or-raised and that no connection leaks.
    ///
    /// Operations passed here must be safe to re-run: every statement the
    /// workers issue is either a read or an idempotent write keyed on
    /// `sim_id`.
    pub fn with_conn<T, F>(&self, log: &Logger, f: F) -> Result<T>
    where
        F: Fn(&PgConnection) -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            let res = PgConnection::establish(&self.database_url)
                .chain_err(|| "Error connecting to store")
                .and_then(|conn| f(&conn));
            match res {
                Ok(t) => return Ok(t),
                Err(e) => {
                    if attempt >= self.max_attempts {
                        return Err(e).chain_err(|| {
                            format!("Store operation failed after {} attempts", self.max_attempts)
                        });
                    }
                    warn!(log, "Store operation failed -- will retry";
                        "attempt" => attempt,
                        "error" => e.to_string());
                    thread::sleep(self.retry_backoff);
                    attempt += 1;
                }
            }
        }
    }
}
