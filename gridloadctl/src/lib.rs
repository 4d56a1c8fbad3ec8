use std::io;
use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use thiserror::Error;
use tracing::info;

use gridload_core::{BrowserResults, Credentials, RunConfig, TestRun};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] gridload_core::ConfigError),
    #[error("run error: {0}")]
    Run(#[from] gridload_core::RunError),
    #[error("unknown browser group: {0}")]
    UnknownGroup(String),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs browser test suites on a remote grid", long_about = None)]
pub struct Cli {
    /// Path to the run configuration
    #[arg(long, default_value = "gridload.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs every configured browser, or one named group
    Run(RunArgs),
    /// Lists the named browser groups in the configuration
    Groups,
    /// Validates configuration and credentials without opening any session
    Check,
    /// Prints a shell completion script
    Completions(CompletionArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Named browser group to run
    pub group: Option<String>,
}

#[derive(Args, Debug)]
pub struct CompletionArgs {
    pub shell: Shell,
}

/// Executes the selected command. Returns whether the host should report
/// success: for `run`, that is every browser finishing with zero failures.
pub async fn run(cli: Cli) -> Result<bool> {
    match cli.command {
        Commands::Completions(args) => {
            clap_complete::generate(
                args.shell,
                &mut Cli::command(),
                "gridloadctl",
                &mut io::stdout(),
            );
            Ok(true)
        }
        Commands::Groups => {
            let config = RunConfig::from_path(&cli.config)?;
            let names = config.browsers.group_names();
            if names.is_empty() {
                println!("(no named groups)");
            }
            for name in names {
                println!("{name}");
            }
            Ok(true)
        }
        Commands::Check => {
            let config = RunConfig::from_path(&cli.config)?;
            config.validate()?;
            Credentials::from_env()?;
            println!(
                "ok: {} browser(s) configured",
                config.browsers.flattened().len()
            );
            Ok(true)
        }
        Commands::Run(args) => {
            let mut config = RunConfig::from_path(&cli.config)?;
            // Credentials are required before any tunnel or session work.
            let credentials = Credentials::from_env()?;
            if let Some(group) = &args.group {
                config = config
                    .with_group(group)
                    .ok_or_else(|| AppError::UnknownGroup(group.clone()))?;
            }

            let test_run = TestRun::new(config, credentials)?;
            let shutdown = test_run.shutdown();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received; tearing down");
                    shutdown.trigger().await;
                    std::process::exit(130);
                }
            });

            let results = test_run.execute().await?;
            render(&results, cli.format)?;
            Ok(results.passed())
        }
    }
}

fn render(results: &BrowserResults, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(results)?);
        }
        OutputFormat::Text => {
            for (browser, suite) in results.entries() {
                let readable = browser.readable();
                if suite.total == 0 {
                    println!("{readable}: completed");
                } else if suite.failed == 0 {
                    println!("{readable}: passed ({}/{})", suite.passed, suite.total);
                } else {
                    println!("{readable}: {} failure(s)", suite.failed);
                    for test in &suite.tests {
                        match &test.message {
                            Some(message) => println!("  * {}\n    > {message}", test.name.trim()),
                            None => println!("  * {}", test.name.trim()),
                        }
                    }
                }
            }
            if results.passed() {
                println!("all browsers passed");
            } else {
                println!("failures detected");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;
    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn cli_parses_run_with_group() {
        let cli = Cli::parse_from(["gridloadctl", "run", "desktop"]);
        match cli.command {
            Commands::Run(args) => assert_eq!(args.group.as_deref(), Some("desktop")),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn groups_command_reads_the_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [browsers]
            desktop = [{{ browserName = "firefox" }}]
            "#
        )
        .unwrap();

        let cli = Cli::parse_from([
            "gridloadctl",
            "--config",
            file.path().to_str().unwrap(),
            "groups",
        ]);
        assert!(run(cli).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_group_is_rejected_before_any_session_work() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [browsers]
            desktop = [{{ browserName = "firefox" }}]
            "#
        )
        .unwrap();

        std::env::set_var("SAUCE_USERNAME", "user");
        std::env::set_var("SAUCE_ACCESS_KEY", "key");
        let cli = Cli::parse_from([
            "gridloadctl",
            "--config",
            file.path().to_str().unwrap(),
            "run",
            "missing",
        ]);
        let err = run(cli).await.unwrap_err();
        assert!(matches!(err, AppError::UnknownGroup(name) if name == "missing"));
    }
}
