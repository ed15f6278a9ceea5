// src/main.rs

use std::process::ExitCode;

use hpctest::{cli, logging};

/// Exit codes: 0 all passed (or dry run), 1 some test case did not pass,
/// 2 the suite could not run.
#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();
    if let Err(err) = logging::init_logging(args.log_level) {
        eprintln!("hpctest: {err:#}");
        return ExitCode::from(2);
    }

    match hpctest::run(args).await {
        Ok(Some(report)) if !report.all_passed() => ExitCode::from(1),
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("hpctest: {err:#}");
            ExitCode::from(2)
        }
    }
}
