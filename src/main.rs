use std::env;
use std::process::ExitCode;

use clap::Parser;
use log::error;

use bastion_ssh_ca::{CliArgs, run};

fn main() -> ExitCode {
    if env::var("RUST_LOG").is_err() {
        // the runtime is not started yet, so no other thread reads the environment
        unsafe { env::set_var("RUST_LOG", "info") }
    }
    env_logger::init();

    let args = CliArgs::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
