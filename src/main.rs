mod adapter;
mod cli;
mod config;
mod dialect;
mod error;
mod fanout;
mod profile;
mod rag;
mod server;
mod session;
mod stream;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;

use cli::CliArgs;
use fanout::{CompareUnit, ResponseMap, StopSwitch, UnitEvent, UnitUpdate};
use profile::{ModelProfile, ProfileRegistry};
use session::{HttpSession, SessionConfig};
use stream::StreamEvent;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn run(args: CliArgs) -> Result<()> {
    let app_config = config::load(&args.config)?;
    let registry = ProfileRegistry::new(app_config.models.clone());
    let profiles = if args.models.is_empty() {
        registry.selected()
    } else {
        registry.select_by_ids(&args.models)?
    };

    let prompt = args.resolve_prompt()?;
    let session = HttpSession::new(&SessionConfig::new(
        app_config.relay_base.clone(),
        args.timeout(),
    ))?;

    let want_augmentation = args.rag || args.rag_compare || app_config.retrieval.enabled;
    let units = prepare_units(
        &session,
        &app_config.retrieval,
        profiles,
        &prompt,
        want_augmentation,
        args.rag_compare,
    )
    .await?;

    let stop = StopSwitch::default();
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_stop.stop_all();
        }
    });

    let tap = if args.live {
        Some(spawn_live_printer())
    } else {
        None
    };

    let records = fanout::run_compare(&session, units, stop, tap).await?;
    print_panels(&records);

    Ok(())
}

/// Build the units for one round, running the retrieval step first when
/// augmentation is requested. A failed search aborts here, before any
/// pipeline exists.
async fn prepare_units(
    session: &HttpSession,
    retrieval: &rag::RetrievalConfig,
    profiles: Vec<ModelProfile>,
    prompt: &str,
    augment: bool,
    compare_variants: bool,
) -> error::Result<Vec<CompareUnit>> {
    let augmented = if augment {
        Some(rag::augment_prompt(session, retrieval, prompt).await?)
    } else {
        None
    };
    Ok(fanout::build_units(
        profiles,
        prompt,
        augmented.as_deref(),
        compare_variants,
    ))
}

/// Forward tapped updates to stdout as they arrive.
fn spawn_live_printer() -> mpsc::Sender<UnitUpdate> {
    let (sender, mut receiver) = mpsc::channel::<UnitUpdate>(256);
    tokio::spawn(async move {
        while let Some(update) = receiver.recv().await {
            match update.event {
                UnitEvent::Stream(StreamEvent::TextDelta(delta)) => {
                    println!("[{}] {}", update.key, delta);
                }
                UnitEvent::Stream(StreamEvent::Completed) => {
                    println!("[{}] done", update.key);
                }
                UnitEvent::Stream(StreamEvent::Failed(err)) => {
                    println!("[{}] failed: {err}", update.key);
                }
                UnitEvent::Aborted => {
                    println!("[{}] stopped", update.key);
                }
            }
        }
    });
    sender
}

fn print_panels(records: &ResponseMap) {
    for (key, record) in records {
        let tag = if record.used_augmentation {
            " [rag]"
        } else {
            ""
        };
        println!("=== {} ({key}){tag} ===", record.model_name);
        match &record.error {
            Some(error) => println!("error: {error}"),
            None if record.text.is_empty() => println!("(no output)"),
            None => println!("{}", record.text),
        }
        println!();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = CliArgs::parse();

    let result = if args.serve {
        server::run_relay(&args).await
    } else {
        run(args).await
    };

    if let Err(error) = result {
        tracing::error!("{error:?}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompareError;
    use assert_matches::assert_matches;
    use httpmock::prelude::*;
    use std::time::Duration;

    fn relay_profile(endpoint: &str) -> ModelProfile {
        ModelProfile {
            id: "m1".to_owned(),
            name: String::new(),
            endpoint: endpoint.to_owned(),
            api_key: "key".to_owned(),
            deployment_id: "gpt-4o".to_owned(),
            api_version: None,
            is_phi_model: false,
            is_deepseek_model: false,
            selected: true,
        }
    }

    #[tokio::test]
    async fn failed_augmentation_stops_the_round_before_any_model_call() {
        let server = MockServer::start_async().await;
        let search = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/rag/search");
                then.status(500).body("index offline");
            })
            .await;
        let model_endpoint = server
            .mock_async(|when, then| {
                when.method(POST).path_contains("/chat/completions");
                then.status(200);
            })
            .await;

        let retrieval = rag::RetrievalConfig {
            enabled: true,
            index_endpoint: "https://search.example.net".to_owned(),
            index_name: "docs".to_owned(),
            api_key: "search-key".to_owned(),
            ..rag::RetrievalConfig::default()
        };
        let session = HttpSession::new(&SessionConfig::new(
            server.base_url(),
            Duration::from_secs(5),
        ))
        .unwrap();

        let err = prepare_units(
            &session,
            &retrieval,
            vec![relay_profile(&server.base_url())],
            "what changed?",
            true,
            false,
        )
        .await
        .unwrap_err();

        search.assert_async().await;
        assert_matches!(err, CompareError::Retrieval(message) => {
            assert!(message.contains("500"));
        });
        assert_eq!(model_endpoint.hits_async().await, 0);
    }
}
