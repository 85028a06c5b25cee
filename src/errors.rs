// Define an errors module and use a glob import as recommended by:
//
//     http://brson.github.io/2016/11/30/starting-with-error-chain
//

// Create the Error, ErrorKind, ResultExt, and Result types
error_chain! {
    // Automatic conversions between this error chain and other error types not defined by the
    // `error_chain!`. The description and cause will forward to the description and cause of the
    // original error.
    foreign_links {
        Database(::diesel::result::Error);
        DatabaseConnection(::diesel::ConnectionError);
        Io(::std::io::Error);
        Json(::serde_json::Error);
        ParseInt(::std::num::ParseIntError);
    }

    errors {
        SchedulerUnsupported(name: String) {
            description("unsupported scheduler")
            display("Scheduler '{}' is recognized but not supported; use Slurm or SGE", name)
        }
        StatusUnknown(value: i16) {
            description("unknown status code")
            display("Status code {} is not part of the status lookup alphabet", value)
        }
    }
}

// Collect error strings together so that we can build a good error message to
// send up. It's worth noting that the original error is actually at the end of
// the iterator, but since it's the most relevant, we reverse the list.
//
// The chain isn't a double-ended iterator (meaning we can't use `rev`), so we
// have to collect it to a Vec first before reversing it.
pub fn error_strings(error: &Error) -> Vec<String> {
    error
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .iter()
        .cloned()
        .rev()
        .collect()
}
