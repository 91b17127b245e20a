use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// At least one child timed out or failed with diagnostics.
    #[error("{failed} of {total} processes failed\n\n{report}")]
    BatchFailed {
        failed: usize,
        total: usize,
        report: String,
    },
    #[error("Can not start child process `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("process `{0}` does not belong to this batch")]
    UnknownProcess(String),
}
