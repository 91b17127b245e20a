//! Parallel fan-out of work items over re-executed children.
//!
//! Work items are read from stdin. Each one runs in a child started as
//! `rsfanout [forwarded options] --pm-proc-id=<item> -- CMD INITIAL_ARGS...`,
//! which in turn executes `CMD INITIAL_ARGS... <item>`. The parent keeps at
//! most `--pm-max` children running, collects their exit codes and output,
//! and fails if any of them timed out or failed with diagnostics.
//!
//! # Backlog
//!
//! - TODO: kill the whole process tree of a timed out child, not only the utility.

use std::{
    env,
    ffi::OsStr,
    io::{self, Read, Write},
};

use anyhow::Context;
use clap::{App, AppSettings, Arg, ArgMatches};
use tracing_subscriber::EnvFilter;

use rsfanout::{
    batch::{Batch, ReExec},
    command::{ChildTemplate, OptionValue},
    config::{self, BatchConfig, RawOptions},
    output::Console,
    parser::{Parser, Separator},
    worker,
};

mod options {
    pub const COMMAND: &str = "COMMAND";
    pub const NULL: &str = "null";
    pub const VERBOSE: &str = "verbose";
    pub const ANSI: &str = "ansi";
    pub const NO_PROGRESS: &str = "no-progress";
    pub const PM_MAX: &str = "pm-max";
    pub const PM_INTERVAL: &str = "pm-interval";
    pub const PM_START_DELAY: &str = "pm-start-delay";
    pub const PM_MAX_TIMEOUT: &str = "pm-max-timeout";
    pub const PM_PROC_ID: &str = rsfanout::command::PROC_ID;
}

fn app() -> App<'static, 'static> {
    App::new("rsfanout")
        .about("Run a utility once per stdin work item, in parallel child processes.")
        .version(env!("CARGO_PKG_VERSION"))
        .setting(AppSettings::TrailingVarArg)
        .setting(AppSettings::StrictUtf8)
        .arg(
            Arg::with_name(options::COMMAND)
                .help("Utility to run [default: echo], then initial arguments passed before the work item")
                .value_name("CMD")
                .index(1)
                .multiple(true)
                .allow_hyphen_values(true),
        )
        .arg(
            Arg::with_name(options::NULL)
                .help("Work items are separated by NUL bytes instead of whitespace")
                .short("0")
                .long(options::NULL),
        )
        .arg(
            Arg::with_name(options::VERBOSE)
                .help("More logging, repeat for even more")
                .short("v")
                .long(options::VERBOSE)
                .multiple(true),
        )
        .arg(
            Arg::with_name(options::ANSI)
                .help("Colour warnings")
                .long(options::ANSI),
        )
        .arg(
            Arg::with_name(options::NO_PROGRESS)
                .help("Do not draw the progress line")
                .long(options::NO_PROGRESS),
        )
        .arg(
            Arg::with_name(options::PM_MAX)
                .help("Maximum number of children running at once, or 'auto' for one per CPU core")
                .long(options::PM_MAX)
                .value_name("N|auto")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(options::PM_INTERVAL)
                .help("Milliseconds between two looks at the running children [default: 100]")
                .long(options::PM_INTERVAL)
                .value_name("MS")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(options::PM_START_DELAY)
                .help("Milliseconds to wait before starting each child [default: 1]")
                .long(options::PM_START_DELAY)
                .value_name("MS")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(options::PM_MAX_TIMEOUT)
                .help("Seconds after which a child is killed and counted as failed [default: 7200]")
                .long(options::PM_MAX_TIMEOUT)
                .value_name("SECS")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(options::PM_PROC_ID)
                .help("Run only this work item (used by the children)")
                .long(options::PM_PROC_ID)
                .takes_value(true)
                .hidden(true),
        )
}

fn main() -> anyhow::Result<()> {
    let matches = app().get_matches();
    let (cmd, initial_args) = utility(&matches);

    let verbosity = matches.occurrences_of(options::VERBOSE);

    if let Some(work_item) = matches.value_of(options::PM_PROC_ID) {
        // Our stderr is the parent's diagnostics channel: only the forwarded
        // `-v` count opens it, an inherited RUST_LOG does not.
        init_logging(EnvFilter::new(log_directive(verbosity)));
        return Err(worker::exec_item(OsStr::new(&cmd), &initial_args, work_item));
    }

    init_logging(parent_filter(verbosity));

    let work_items = read_work_items(if matches.is_present(options::NULL) {
        Separator::Nul
    } else {
        Separator::Whitespace
    })?;

    let raw = RawOptions {
        max: matches.value_of(options::PM_MAX),
        interval: matches.value_of(options::PM_INTERVAL),
        start_delay: matches.value_of(options::PM_START_DELAY),
        max_timeout: matches.value_of(options::PM_MAX_TIMEOUT),
    };
    let config = BatchConfig::resolve(&raw, config::detected_cores());

    let exe = env::current_exe().context("Can not locate own executable")?;
    let mut positional = vec![cmd.clone()];
    positional.extend(initial_args);
    let template = ChildTemplate::new(&exe.to_string_lossy(), forwarded_options(&matches), &positional);

    let sink = Console::new(
        io::stderr(),
        !matches.is_present(options::NO_PROGRESS) && stderr_is_terminal(),
        matches.is_present(options::ANSI),
    );
    let mut batch = Batch::new(config, template, ReExec, sink);
    let descriptors = batch.run(work_items)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for descriptor in &descriptors {
        if let Some(text) = &descriptor.stdout {
            out.write_all(text.as_bytes()).context("Failed to write to stdout")?;
        }
    }
    out.flush().context("Failed to write to stdout")?;

    Ok(())
}

/// Utility and its initial arguments.
fn utility(matches: &ArgMatches<'_>) -> (String, Vec<String>) {
    let mut words = matches
        .values_of(options::COMMAND)
        .map(|values| values.map(String::from).collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter();
    let cmd = words.next().unwrap_or_else(|| "echo".to_owned());
    (cmd, words.collect())
}

/// Reads all work items from stdin.
fn read_work_items(separator: Separator) -> anyhow::Result<Vec<String>> {
    let mut stdin = io::stdin();
    let mut buf = [0u8; 4096];
    let mut items = Vec::new();
    let mut parser = Parser::new(separator, |item| {
        items.push(item);
        Ok(())
    });

    loop {
        match stdin.read(&mut buf[..]) {
            Ok(0) => break,
            Ok(n) => {
                for b in &buf[..n] {
                    parser.handle_byte(*b)?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("Failed to read from stdin"),
        }
    }

    parser.handle_eof()?;
    Ok(items)
}

/// Options of this invocation, by long name, as children should see them.
fn forwarded_options(matches: &ArgMatches<'_>) -> Vec<(String, OptionValue)> {
    let flag = |name: &str| (name.to_owned(), OptionValue::Flag(matches.is_present(name)));
    let value = |name: &str| {
        (
            name.to_owned(),
            OptionValue::Value(matches.value_of(name).unwrap_or_default().to_owned()),
        )
    };
    vec![
        flag(options::NULL),
        (
            options::VERBOSE.to_owned(),
            OptionValue::Count(matches.occurrences_of(options::VERBOSE)),
        ),
        flag(options::ANSI),
        flag(options::NO_PROGRESS),
        value(options::PM_MAX),
        value(options::PM_INTERVAL),
        value(options::PM_START_DELAY),
        value(options::PM_MAX_TIMEOUT),
        value(options::PM_PROC_ID),
    ]
}

/// Each `-v` opens one more level.
fn log_directive(verbosity: u64) -> &'static str {
    match verbosity {
        0 => "rsfanout=warn",
        1 => "rsfanout=info",
        2 => "rsfanout=debug",
        _ => "rsfanout=trace",
    }
}

/// `RUST_LOG` wins over `-v`.
fn parent_filter(verbosity: u64) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_directive(verbosity)))
}

fn init_logging(filter: EnvFilter) {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn stderr_is_terminal() -> bool {
    atty::is(atty::Stream::Stderr)
}
