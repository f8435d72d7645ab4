//! # Gnosis
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  apps/gnosis (THE BINARY)                │
//! │                                                          │
//! │   ┌─────────────┐   ┌─────────────┐   ┌──────────────┐   │
//! │   │    CLI      │   │  HTTP API   │   │    Config    │   │
//! │   │   (clap)    │   │   (axum)    │   │ (toml + env) │   │
//! │   └──────┬──────┘   └──────┬──────┘   └──────┬───────┘   │
//! │          └─────────────────┼─────────────────┘           │
//! │                            ▼                             │
//! │                    ┌───────────────┐                     │
//! │                    │  gnosis-core  │                     │
//! │                    │  (THE LOGIC)  │                     │
//! │                    └───────────────┘                     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! gnosis keygen -o core.key
//! gnosis init --name atlas
//! GNOSIS_SIGNING_KEY_FILE=core.key gnosis server --port 8080
//! gnosis audit --operation message.reject
//! ```

use clap::Parser;
use gnosis::cli;
use gnosis_core::GnosisError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // GNOSIS_LOG_FORMAT=json switches to machine-parseable output.
    let log_format = std::env::var("GNOSIS_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "gnosis=info,gnosis_core=info,tower_http=debug".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(exit_code(&e));
    }
}

/// Process exit code for a failed command.
fn exit_code(error: &GnosisError) -> i32 {
    match error {
        GnosisError::Validation(_) | GnosisError::Precondition(_) => 2,
        GnosisError::NotFound { .. } | GnosisError::UnknownOperation(_) => 3,
        GnosisError::Conflict { .. } | GnosisError::TransactionClosed(_) => 4,
        GnosisError::Storage(_) | GnosisError::Serialization(_) => 5,
        GnosisError::Permission(_) | GnosisError::DuplicateOperation(_) => 1,
    }
}

fn print_banner() {
    println!(
        r#"
   ____                 _
  / ___|_ __   ___  ___(_)___
 | |  _| '_ \ / _ \/ __| / __|
 | |_| | | | | (_) \__ \ \__ \
  \____|_| |_|\___/|___/_|___/

  Versioned self-referential graph core v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
