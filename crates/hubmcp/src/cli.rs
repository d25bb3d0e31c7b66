//! Command-line surface: `hubmcp serve` runs the gateway; `hubmcp
//! check-config` validates the environment without binding a listener or
//! touching the database, useful in deploy pipelines before a rollout.

use clap::{Parser, Subcommand};

/// hubmcp - MCP orchestration gateway
#[derive(Parser, Debug)]
#[command(name = "hubmcp", version, about = "Federates MCP servers behind one multi-tenant SSE endpoint")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway: bind the SSE Bridge and run the Janitor until shutdown.
    Serve,
    /// Load and validate `GatewayConfig` from the environment, then exit.
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve() {
        let cli = Cli::try_parse_from(["hubmcp", "serve"]).unwrap();
        assert!(matches!(cli.command, Command::Serve));
    }

    #[test]
    fn parses_check_config() {
        let cli = Cli::try_parse_from(["hubmcp", "check-config"]).unwrap();
        assert!(matches!(cli.command, Command::CheckConfig));
    }

    #[test]
    fn rejects_unknown_subcommand() {
        assert!(Cli::try_parse_from(["hubmcp", "bogus"]).is_err());
    }
}
