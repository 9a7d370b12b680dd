use std::process::ExitCode;

use platform_metadata::cli;

fn main() -> ExitCode {
    if let Err(e) = cli::run() {
        // Use eprintln! here in case logger does not initialize.
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
