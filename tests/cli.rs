//! End-to-end tests of the `rsfanout` binary.
//!
//! Children are real re-executions of the binary under test, running `/bin/sh`
//! scripts that see their work item as `$0`.

use assert_cmd::Command;
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;

fn rsfanout() -> Command {
    let mut cmd = Command::cargo_bin("rsfanout").unwrap();
    cmd.env_remove("RUST_LOG").args(&["--pm-interval=5", "--no-progress"]);
    cmd
}

#[test]
fn prints_children_output_in_input_order() {
    rsfanout()
        .args(&["--pm-max=2", "sh", "-c", "printf '[%s]' \"$0\""])
        .write_stdin("a b\nc d")
        .assert()
        .success()
        .stdout("[a][b][c][d]");
}

#[test]
fn default_utility_is_echo() {
    rsfanout().write_stdin("x y").assert().success().stdout("x\ny\n");
}

#[test]
fn nul_separated_items_keep_spaces() {
    rsfanout()
        .args(&["-0", "sh", "-c", "printf '<%s>' \"$0\""])
        .write_stdin("one item\0two\0")
        .assert()
        .success()
        .stdout("<one item><two>");
}

#[test]
fn empty_input_runs_nothing() {
    rsfanout().args(&["false"]).write_stdin("").assert().success().stdout("");
}

#[test]
fn failing_child_fails_the_batch_after_all_ran() {
    rsfanout()
        .args(&[
            "--pm-max=2",
            "sh",
            "-c",
            "if [ \"$0\" = i2 ]; then echo boom >&2; exit 3; fi; echo \"done $0\"",
        ])
        .write_stdin("i1 i2 i3 i4 i5")
        .assert()
        .failure()
        .code(1)
        .stdout("")
        .stderr(contains("1 of 5 processes failed"))
        .stderr(contains("boom"))
        .stderr(contains("--pm-proc-id=i2"))
        .stderr(contains("Exit code: 3"))
        .stderr(contains("--pm-proc-id=i1").not());
}

#[test]
fn diagnostics_of_successful_child_are_a_warning() {
    rsfanout()
        .args(&["sh", "-c", "if [ \"$0\" = i3 ]; then echo careful >&2; fi; printf %s \"$0\""])
        .write_stdin("i1 i2 i3 i4 i5")
        .assert()
        .success()
        .stdout("i1i2i3i4i5")
        .stderr(contains("Warning:").and(contains("careful")));
}

#[test]
fn child_past_its_timeout_is_killed_and_reported() {
    rsfanout()
        .args(&["--pm-max-timeout=1", "sleep"])
        .write_stdin("30")
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .failure()
        .stderr(contains("Reached the timeout of 1 seconds"));
}

#[test]
fn oversubscription_is_only_a_warning() {
    rsfanout()
        .args(&["--pm-max=100000", "true"])
        .write_stdin("a")
        .assert()
        .success()
        .stderr(contains("is higher than the"));
}

#[test]
fn work_item_is_exported_to_the_utility() {
    rsfanout()
        .args(&["sh", "-c", "printf %s \"$RSFANOUT_WORK_ITEM\""])
        .write_stdin("item")
        .assert()
        .success()
        .stdout("item");
}

#[test]
fn single_item_mode_runs_only_that_item() {
    Command::cargo_bin("rsfanout")
        .unwrap()
        .args(&["--pm-proc-id=solo", "--", "sh", "-c", "printf %s \"$0\"; exit 4"])
        .write_stdin("ignored")
        .assert()
        .code(4)
        .stdout("solo");
}
