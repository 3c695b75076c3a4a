//! flowpatch agent binary entry point

use clap::Parser;
use flowpatch_agent::{build_engine, load_engine_options, logging, logging_config, run_agent, Args};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init_logging(&logging_config(&args))?;

    let options = load_engine_options(&args)?;
    // Declared before the runtime so it is dropped after it
    let engine = build_engine(&args, &options)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        tokio::select! {
            result = run_agent(args, engine.clone()) => {
                if let Err(e) = &result {
                    tracing::error!("Proxy server failed: {:#}", e);
                }
                result
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received, stopping proxy server...");
                Ok(())
            }
        }
    })
}
