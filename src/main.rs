mod app;
mod cli;

use clap::Parser;
use cli::{Cli, Command, RunArgs};

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Run(args) => cmd_run(args),
        Command::Config(args) => cmd_config(args),
    }
}

fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    let config = app::load_config(&args)?;
    let _guard = omni_core::lifecycle::logging::init_logging(&config.app_name, &config.logging);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let application = app::Application::build(config);
        application.serve().await
    })
}

fn cmd_config(args: RunArgs) -> anyhow::Result<()> {
    let config = app::load_config(&args)?;
    print!("{}", serde_yaml_ng::to_string(&config)?);
    Ok(())
}
