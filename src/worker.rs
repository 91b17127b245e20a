//! Single work item mode of a re-executed child.

use std::{
    ffi::OsStr,
    os::unix::process::CommandExt,
    process::{Command, Stdio},
};

use tracing::debug;

/// Builds `cmd initial_args... work_item`.
pub fn item_command<I>(cmd: &OsStr, initial_args: I, work_item: &str) -> Command
where
    I: IntoIterator,
    I::Item: AsRef<OsStr>,
{
    let mut command = Command::new(cmd);
    command.args(initial_args).arg(work_item).stdin(Stdio::null());
    command
}

/// Replaces the current process with the utility running `work_item`.
///
/// The utility inherits our pid, so the parent observes, times out and
/// kills it directly. Only returns on failure.
pub fn exec_item<I>(cmd: &OsStr, initial_args: I, work_item: &str) -> anyhow::Error
where
    I: IntoIterator,
    I::Item: AsRef<OsStr>,
{
    debug!(work_item, "executing utility");
    let err = item_command(cmd, initial_args, work_item).exec();
    anyhow::Error::new(err).context(format!(
        "Can not run {} for work item {}",
        cmd.to_string_lossy(),
        work_item
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    #[test]
    fn work_item_comes_last() {
        let command = item_command(OsStr::new("grep"), &["-n", "--"], "needle");
        assert_eq!(command.get_program(), "grep");
        let args: Vec<&OsStr> = command.get_args().collect();
        assert_eq!(args, ["-n", "--", "needle"]);
    }

    #[test]
    fn utility_sees_work_item() -> anyhow::Result<()> {
        let status = item_command(
            OsStr::new("/bin/sh"),
            &["-c", "test \"$0\" = item-7 || exit 9"],
            "item-7",
        )
        .status()?;
        assert_eq!(status.code(), Some(0));
        Ok(())
    }

    #[test]
    fn exec_failure_is_reported() {
        let no_args: &[OsString] = &[];
        let err = exec_item(OsStr::new("/nonexistent/utility"), no_args, "x");
        assert!(err.to_string().contains("work item x"));
    }
}
