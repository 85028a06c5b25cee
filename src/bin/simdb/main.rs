#[macro_use]
extern crate chan;
extern crate chan_signal;
extern crate clap;
extern crate dialoguer;
extern crate isatty;
extern crate percent_encoding;
extern crate simdb;
#[macro_use]
extern crate slog;
extern crate slog_async;
extern crate slog_term;

use simdb::db;
use simdb::domain::ProgramRunnerFactoryLive;
use simdb::error_helpers;
use simdb::errors::*;
use simdb::mediators::supervisor;
use simdb::scheduler::{Scheduler, SchedulerClientFactoryLive};

use chan_signal::Signal;
use clap::{App, ArgMatches};
use dialoguer::Password;
use isatty::stdout_isatty;
use percent_encoding::{utf8_percent_encode, USERINFO_ENCODE_SET};
use slog::{Drain, Logger};
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

//
// Main
//

fn main() {
    // Register for signals before any thread spawns so that delivery is
    // funneled through the channel instead of killing the process outright.
    let signal = chan_signal::notify(&[Signal::INT, Signal::TERM]);

    // Note that when using `arg_from_usage`, `<arg>` is required and `[arg]`
    // is optional.
    let app = App::new("simdb")
        .version("0.1")
        .about("Supervisor daemon driving simulation jobs recorded in the database")
        .arg_from_usage("-d, --dbname=[NAME] 'Database name to connect to'")
        .arg_from_usage("-U, --user=[USER] 'Database user name'")
        .arg_from_usage(
            "-W, --password=[PASSWORD] 'Database password, or a path to a file holding it; \
             prompts when omitted'",
        )
        .arg_from_usage("--host=[HOST] 'Database server host'")
        .arg_from_usage("-p, --port=[PORT] 'Database server port'")
        .arg_from_usage("-q, --queue=[NAME] 'The queuing system; detected when omitted'")
        .arg_from_usage("--clean 'Remove jobscripts and logs when jobs finish'")
        .arg_from_usage("--log_dir=[DIR] 'Logfile directory, defaults to the working directory'")
        .arg_from_usage("-v, --verbose 'Provide extra information, setting log level to DEBUG'");

    let matches = app.get_matches();
    let options = parse_global_options(&matches);

    let log = match log(&options) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("{}", e);
            ::std::process::exit(1);
        }
    };

    let res = run(&log, &options, &signal);
    if let Err(ref e) = res {
        handle_error(&log, e);
    };
}

//
// Private constants/types/functions
//

/// How long workers get to wind down after a shutdown signal before process
/// teardown terminates them.
const GRACE_SECONDS: u64 = 10;

const LOG_FILE: &str = "simdb.log";

struct GlobalOptions {
    clean:    bool,
    dbname:   String,
    host:     String,
    log_dir:  String,
    password: Option<String>,
    port:     String,
    queue:    Option<String>,
    user:     String,
    verbose:  bool,
}

fn run(log: &Logger, options: &GlobalOptions, signal: &chan::Receiver<Signal>) -> Result<()> {
    let password = resolve_password(options)?;

    // Fatal when forced to an unsupported scheduler or when nothing
    // responds: operator intervention required.
    let scheduler = match options.queue {
        Some(ref name) => Scheduler::from_name(name)?,
        None => Scheduler::detect(log)?,
    };
    info!(log, "Elected batch scheduler"; "scheduler" => scheduler.name());

    let store = db::Store::new(database_url(options, &password));
    let shutdown = Arc::new(AtomicBool::new(false));
    let (finished_send, finished_recv) = chan::sync(1);

    let supervisor_log = log.new(o!("thread" => "supervisor"));
    let supervisor_shutdown = Arc::clone(&shutdown);
    let clean = options.clean;
    let supervisor_thread = thread::Builder::new()
        .name("supervisor".to_owned())
        .spawn(move || {
            let mut mediator = supervisor::Mediator {
                store,
                clean,
                runner_factory: Box::new(ProgramRunnerFactoryLive {}),
                scheduler_client_factory: Box::new(SchedulerClientFactoryLive { scheduler }),
                shutdown: supervisor_shutdown,
                tick_interval: supervisor::TICK_INTERVAL,
                run_once: false,
            };
            if let Err(ref e) = mediator.run(&supervisor_log) {
                error_helpers::print_error(&supervisor_log, e);
            }
            finished_send.send(());
        })
        .chain_err(|| "Failed to spawn supervisor thread")?;

    chan_select! {
        signal.recv() -> sig => {
            info!(log, "Received signal -- starting graceful shutdown";
                "signal" => format!("{:?}", sig));
            shutdown.store(true, Ordering::Relaxed);

            // The supervisor checks the flag between ticks; grant it and
            // its workers a bounded grace period, after which returning
            // from main terminates the survivors.
            let grace = chan::after(Duration::from_secs(GRACE_SECONDS));
            chan_select! {
                finished_recv.recv() => {
                    let _ = supervisor_thread.join();
                    info!(log, "Supervisor stopped cleanly");
                },
                grace.recv() => {
                    warn!(log, "Grace period expired -- terminating remaining workers";
                        "seconds" => GRACE_SECONDS);
                },
            }
        },
        finished_recv.recv() => {
            // The supervisor exited on its own; its error (if any) has
            // already been logged.
            let _ = supervisor_thread.join();
        },
    }
    Ok(())
}

fn handle_error(log: &Logger, e: &Error) {
    error_helpers::print_error(log, e);
    ::std::process::exit(1);
}

/// Builds the root logger: console plus an append-mode file under
/// `--log_dir`, both behind the level filter `--verbose` selects.
fn log(options: &GlobalOptions) -> Result<Logger> {
    let level = if options.verbose {
        slog::Level::Debug
    } else {
        slog::Level::Info
    };

    let path = Path::new(&options.log_dir).join(LOG_FILE);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .chain_err(|| format!("Error opening log file: {}", path.display()))?;
    let file_drain = slog_term::FullFormat::new(slog_term::PlainSyncDecorator::new(file))
        .build()
        .fuse();

    let term_decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let term_drain = slog_term::CompactFormat::new(term_decorator).build().fuse();

    let drain = slog::Duplicate::new(term_drain, file_drain).fuse();

    // Sync logging is okay for a terminal, but quite bad for server logs, so
    // detect whether we should go async based on whether stdout is a
    // terminal.
    if stdout_isatty() {
        let drain = slog::LevelFilter::new(drain, level).fuse();
        Ok(slog::Logger::root(drain, o!()))
    } else {
        let drain = slog_async::Async::new(drain).build().fuse();
        let drain = slog::LevelFilter::new(drain, level).fuse();
        Ok(slog::Logger::root(drain, o!()))
    }
}

fn parse_global_options(matches: &ArgMatches) -> GlobalOptions {
    GlobalOptions {
        clean:    matches.is_present("clean"),
        dbname:   matches.value_of("dbname").unwrap_or("gmx").to_owned(),
        host:     matches.value_of("host").unwrap_or("localhost").to_owned(),
        log_dir:  matches
            .value_of("log_dir")
            .map(|s| s.to_owned())
            .unwrap_or_else(|| ".".to_owned()),
        password: matches.value_of("password").map(|s| s.to_owned()),
        // Kept as a string: it only ever lands back in the connection URL,
        // and the store's connect path reports anything malformed.
        port:     matches.value_of("port").unwrap_or("5432").to_owned(),
        queue:    matches.value_of("queue").map(|s| s.to_owned()),
        user:     matches
            .value_of("user")
            .map(|s| s.to_owned())
            .unwrap_or_else(|| env::var("USER").unwrap_or_else(|_| "postgres".to_owned())),
        verbose:  matches.is_present("verbose"),
    }
}

fn database_url(options: &GlobalOptions, password: &str) -> String {
    format!(
        "postgres://{}:{}@{}:{}/{}",
        utf8_percent_encode(&options.user, USERINFO_ENCODE_SET),
        utf8_percent_encode(password, USERINFO_ENCODE_SET),
        options.host,
        options.port,
        options.dbname
    )
}

/// The password is taken literally from `-W`, unless the value names a
/// readable file, in which case the file's first line is used. Without `-W`
/// the operator is prompted.
fn resolve_password(options: &GlobalOptions) -> Result<String> {
    match options.password {
        Some(ref value) => {
            if Path::new(value).is_file() {
                let file = File::open(value)?;
                let mut line = String::new();
                BufReader::new(file).read_line(&mut line)?;
                Ok(line.trim_end_matches('\n').to_owned())
            } else {
                Ok(value.clone())
            }
        }
        None => Password::new()
            .with_prompt("Database password")
            .interact()
            .chain_err(|| "Error reading password from prompt"),
    }
}
