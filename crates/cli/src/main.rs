#![forbid(unsafe_code)]

use clap::Parser;
use clap::error::ErrorKind;
use config::Config;
use hawk::{cli::Cli, exit, signals};
use monitor::{CommandCheck, ImageConnector, Monitor, RunReport};
use std::process::ExitCode;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit::SUCCESS,
                _ => exit::USAGE,
            };
            // clap picks stdout or stderr itself
            if let Err(print_err) = err.print() {
                #[allow(clippy::print_stderr)]
                {
                    eprintln!("{err}: {print_err}");
                }
            }
            return ExitCode::from(code);
        }
    };

    if let Err(err) = init_logging(&cli) {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("failed to set up logging: {err:#}");
        }
        return ExitCode::from(exit::USAGE);
    }

    match run(cli) {
        Ok(report) => {
            #[allow(clippy::print_stdout)]
            {
                println!("{}", report.stats);
            }
            ExitCode::from(exit::SUCCESS)
        }
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(exit::for_error(&err))
        }
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    // NOTE: The verbosity flag takes precedence over the environment variable.
    // `HAWK_LOG` can only refine levels per crate, e.g.
    // `HAWK_LOG=monitor::walker=trace hawk -v win10`.
    let env_filter = EnvFilter::builder()
        .with_env_var("HAWK_LOG")
        .from_env()?
        .add_directive(cli.verbosity.log_level_filter().as_str().parse()?);

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        _ => {
            let mut candidates = glob::glob("/etc/hawk/config.d/*.toml")?
                .filter_map(Result::ok)
                .collect::<Vec<_>>();
            candidates.insert(0, "/etc/hawk/config.toml".into());
            trace!(?candidates, "config file candidates");
            Config::load_multiple(candidates)?
        }
    };
    if let Some(mode) = cli.mode {
        config.session.mode = mode.into();
    }
    Ok(config)
}

fn run(cli: Cli) -> anyhow::Result<RunReport> {
    let config = load_config(&cli)?;
    debug!(?config, ?cli);

    let interrupt = signals::install()?;

    let mut connector = ImageConnector::new(&config.session.image_dir);
    if let Some(image) = &cli.image {
        connector = connector.with_image(image);
    }
    let check = CommandCheck::new(&cli.guest, config.checks.clone());

    let report = Monitor::open(&connector, &cli.guest, config)?
        .with_interrupt(interrupt)
        .run(Box::new(check))?;

    if let Some(signal) = signals::last_signal() {
        info!(%signal, "interrupted");
    }
    if let Some(err) = &report.poll_error {
        warn!(%err, "polling stopped early");
    }
    if let Some(dispatch) = &report.dispatch {
        debug!(?dispatch, "dispatcher finished");
    }
    info!(
        cleared = report.cleared,
        rescans = report.rescans,
        "monitoring finished"
    );
    Ok(report)
}
