use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use deck_runtime::{Application, RuntimeConfig, TrustLevel};

mod logging;

#[derive(Parser, Debug)]
#[command(name = "deck-assistant")]
#[command(about = "Scriptable control-panel runtime.", long_about = None)]
#[command(version)]
struct Cli {
    /// Top-level script. Without one, a built-in window script runs.
    script: Option<PathBuf>,

    /// Trust level of the top-level script.
    #[arg(long, value_enum)]
    trust: Option<TrustLevel>,

    /// Tick period in milliseconds (overrides DECK_FRAME_MS).
    #[arg(long)]
    frame_ms: Option<u64>,

    /// VM memory limit in bytes, 0 for none (overrides DECK_MEMORY_LIMIT).
    #[arg(long)]
    memory_limit: Option<usize>,

    /// Log filter used when neither DECK_LOG nor RUST_LOG is set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let mut config = RuntimeConfig::from_env()?;
    if let Some(trust) = cli.trust {
        config.script_trust = trust;
    }
    if let Some(frame_ms) = cli.frame_ms {
        config.frame_ms = frame_ms;
    }
    if let Some(limit) = cli.memory_limit {
        config.memory_limit = limit;
    }
    config.validate()?;

    let mut app = Application::new(config)?;
    app.load_script(cli.script.as_deref())?;
    let code = app.run()?;
    Ok(ExitCode::from(exit_status(code)))
}

/// Truncates a script exit code to its low byte, as `exit(code)` does.
fn exit_status(code: i32) -> u8 {
    (code & 0xff) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_keep_their_low_byte() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(3), 3);
        assert_eq!(exit_status(255), 255);
        assert_eq!(exit_status(256), 0);
        assert_eq!(exit_status(-1), 255);
        assert_ne!(exit_status(-2), 0);
    }
}
