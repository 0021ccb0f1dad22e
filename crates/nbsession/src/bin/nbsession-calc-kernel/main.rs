//! Calculator kernel host.
//!
//! Serves [`calculator::Calculator`] over framed stdio, the way an
//! edit-mode session expects a kernel child process to behave. Point a
//! `DefaultKernelLauncher` at this binary to try the session layer without
//! a real language runtime.

mod calculator;

use std::sync::Arc;

use log::error;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let code = match nbsession::kernel::stdio::run(Arc::new(calculator::CalculatorFactory)).await {
        Ok(()) => 0,
        Err(e) => {
            error!("[calc-kernel] {:#}", e);
            1
        }
    };
    // A pending stdin read sits on the blocking pool and would hold up
    // runtime shutdown.
    std::process::exit(code);
}
