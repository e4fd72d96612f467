//! Admin CLI for the submission API: exercises `task_core::submit`
//! directly, standing in for the HTTP submission surface for local
//! testing and operational one-offs.
//!
//! ```bash
//! submit --name echo --payload '{"msg":"hi"}'
//! submit --name echo --payload '{"msg":"hi"}' --at 2026-08-01T12:00:00Z
//! ```

use chrono::{DateTime, Utc};
use task_core::config::Config;

struct Args {
    name: String,
    payload: serde_json::Value,
    scheduled_at: Option<DateTime<Utc>>,
}

impl Args {
    fn parse() -> Result<Self, String> {
        let raw: Vec<String> = std::env::args().collect();
        let mut name = None;
        let mut payload = None;
        let mut scheduled_at = None;

        let mut i = 1;
        while i < raw.len() {
            match raw[i].as_str() {
                "--name" => {
                    name = raw.get(i + 1).cloned();
                    i += 2;
                }
                "--payload" => {
                    let json = raw.get(i + 1).ok_or("--payload requires a value")?;
                    payload = Some(
                        serde_json::from_str(json).map_err(|e| format!("invalid --payload JSON: {e}"))?,
                    );
                    i += 2;
                }
                "--at" => {
                    let raw_at = raw.get(i + 1).ok_or("--at requires a value")?;
                    scheduled_at = Some(
                        DateTime::parse_from_rfc3339(raw_at)
                            .map_err(|e| format!("invalid --at timestamp: {e}"))?
                            .with_timezone(&Utc),
                    );
                    i += 2;
                }
                other => return Err(format!("unknown argument: {other}")),
            }
        }

        Ok(Args {
            name: name.ok_or("--name is required")?,
            payload: payload.unwrap_or_else(|| serde_json::json!({})),
            scheduled_at,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    task_runner::init_logging();

    let args = match Args::parse() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!("usage: submit --name NAME --payload JSON [--at RFC3339]");
            std::process::exit(1);
        }
    };

    let config = Config::from_env();
    let pool = task_runner::connect_and_migrate(&config).await?;

    let outcome = task_core::submit(
        &pool,
        &config.admission,
        &config.broker.stream,
        &args.name,
        args.payload,
        args.scheduled_at,
    )
    .await?;

    println!(
        "{}",
        serde_json::json!({
            "task_id": outcome.task.id,
            "execution_key": outcome.task.execution_key,
            "deduped": outcome.deduped,
        })
    );

    Ok(())
}
