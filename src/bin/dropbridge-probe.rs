use clap::Parser;
use std::process::ExitCode;

use dropbridge::cli::ProbeOpts;
use dropbridge::client::{run_probe, ConsoleReport};
use dropbridge::logging;

fn main() -> ExitCode {
    let config = ProbeOpts::parse().into_config();
    if let Err(e) = logging::init(config.debug, None) {
        eprintln!("Error: {:#}", e);
    }

    // Step failures are printed as they happen; only a failed connection
    // makes the probe itself fail.
    let code = match run_probe(&config, &mut ConsoleReport) {
        Ok(report) if report.all_succeeded() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    };
    println!("Bye");
    code
}
