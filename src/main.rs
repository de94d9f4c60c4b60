mod app;

use std::process::ExitCode;

use task_chain_console::{ConsoleConfig, TaskManager};

fn main() -> ExitCode {
    let config = match ConsoleConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[ERROR]: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = app::logger::init(&config.log_level) {
        eprintln!("[ERROR]: Failed to install logger: {e}");
    }

    let manager = TaskManager::new(&config);
    match app::cli::run_cli(manager) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[ERROR]: {e}");
            ExitCode::FAILURE
        }
    }
}
