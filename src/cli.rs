use std::env;
use std::ffi::OsString;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{App, Arg, ArgMatches};

use crate::config::{Config, ConfigBuilder};
use crate::error::Result;
use crate::exchange::{Event, Exchange, Topic};
use crate::pipeline::{StageState, StageStatus};

/// Globs skipped unless `--no-default-ignore` is given.
pub const DEFAULT_IGNORES: &[&str] = &[
    ".git", ".hg", ".svn", ".DS_Store", "*.swp", "*.swx", "*~",
];

#[derive(Debug)]
pub struct Args {
    pub config: Config,
    pub debug: bool,
}

pub fn get_args() -> Result<Args> {
    get_args_from(env::args_os())
}

pub fn get_args_from<I, T>(from: I) -> Result<Args>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args = App::new("pipewatch")
        .version(crate_version!())
        .about("Re-runs a pipeline of commands whenever watched files change")
        .arg(Arg::with_name("command")
                 .help("Command to run on every change; commands run in order and a failure stops the rest")
                 .short("c")
                 .long("command")
                 .number_of_values(1)
                 .multiple(true)
                 .takes_value(true)
                 .required(true)
                 .value_name("command"))
        .arg(Arg::with_name("background")
                 .help("Command started once every --command has passed, e.g. a server")
                 .short("b")
                 .long("background")
                 .number_of_values(1)
                 .multiple(true)
                 .takes_value(true)
                 .value_name("command"))
        .arg(Arg::with_name("ignore")
                 .help("Ignore modifications to paths matching the pattern")
                 .short("i")
                 .long("ignore")
                 .number_of_values(1)
                 .multiple(true)
                 .takes_value(true)
                 .value_name("pattern"))
        .arg(Arg::with_name("path")
                 .help("Watch a specific directory")
                 .short("w")
                 .long("watch")
                 .takes_value(true))
        .arg(Arg::with_name("verbose")
                 .help("Print the output of passing commands too")
                 .short("v")
                 .long("verbose"))
        .arg(Arg::with_name("debug")
                 .help("Print debugging messages to stderr")
                 .long("debug"))
        .arg(Arg::with_name("postpone")
                 .help("Wait until first change to run the pipeline")
                 .short("p")
                 .long("postpone"))
        .arg(Arg::with_name("no-default-ignore")
                 .help("Skip auto-ignoring of commonly ignored globs")
                 .long("no-default-ignore"))
        .arg(Arg::with_name("poll")
                 .help("Forces polling mode")
                 .long("force-poll")
                 .value_name("interval"))
        .arg(Arg::with_name("kill-timeout")
                 .help("Milliseconds to wait after asking a command to stop before killing it")
                 .long("kill-timeout")
                 .takes_value(true)
                 .value_name("milliseconds"))
        .get_matches_from_safe(from)
        .unwrap_or_else(|e| e.exit());

    let mut ignores = Vec::new();
    if !args.is_present("no-default-ignore") {
        ignores.extend(DEFAULT_IGNORES.iter().map(|s| (*s).to_string()));
    }
    ignores.extend(values(&args, "ignore"));

    let mut builder = ConfigBuilder::default();
    builder
        .sequential(values(&args, "command"))
        .background(values(&args, "background"))
        .ignores(ignores)
        .verbose(args.is_present("verbose"))
        .run_initially(!args.is_present("postpone"));

    if let Some(path) = args.value_of_os("path") {
        builder.path(PathBuf::from(path));
    }

    if args.occurrences_of("poll") > 0 {
        let interval = value_t!(args.value_of("poll"), u64).unwrap_or_else(|e| e.exit());
        builder.poll(true).poll_interval(Duration::from_millis(interval));
    }

    if args.is_present("kill-timeout") {
        let timeout = value_t!(args.value_of("kill-timeout"), u64).unwrap_or_else(|e| e.exit());
        builder.kill_timeout(Duration::from_millis(timeout));
    }

    Ok(Args {
        config: builder.build()?,
        debug: args.is_present("debug"),
    })
}

fn values(args: &ArgMatches, name: &str) -> Vec<String> {
    args.values_of(name)
        .map(|values| values.map(str::to_string).collect())
        .unwrap_or_default()
}

pub fn init_logger(debug: bool) {
    let mut log_builder = env_logger::Builder::new();
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };

    log_builder
        .format(|buf, r| writeln!(buf, "*** {}", r.args()))
        .filter(None, level);
    if let Ok(filters) = env::var("RUST_LOG") {
        log_builder.parse_filters(&filters);
    }

    if log_builder.try_init().is_err() {
        eprintln!("*** logger was already initialized");
    }
}

/// Prints pipeline progress to stdout.
pub fn present(exchange: &Exchange) {
    exchange.listen(Topic::CommandList, |event| {
        if let Event::CommandList(commands) = event {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let _ = writeln!(out, "pipeline:");
            for (i, command) in commands.iter().enumerate() {
                let _ = writeln!(out, "  [{}] {}", i, command);
            }
        }
    });

    exchange.listen(Topic::StageStatus, |event| {
        if let Event::StageStatus(status) = event {
            let stdout = io::stdout();
            let _ = write_status(&mut stdout.lock(), &status);
        }
    });
}

fn write_status<W: Write>(out: &mut W, status: &StageStatus) -> io::Result<()> {
    let marker = match status.state {
        StageState::Passed => "ok",
        StageState::Failed => "FAIL",
        StageState::Killed => "kill",
        StageState::Skipped => "skip",
        StageState::Queued | StageState::Running => "..",
    };
    writeln!(out, "[{:>4}] [{}] {} ({})", marker, status.index, status.command, status.state)?;

    if let Some(output) = status.output.as_ref().filter(|o| !o.is_empty()) {
        for line in output.lines() {
            writeln!(out, "       {}", line)?;
        }
    }
    Ok(())
}
