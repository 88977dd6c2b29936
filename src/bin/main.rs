use investigation_orchestrator::{
    events::StreamItem, Config, EventPayload, Orchestrator,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_QUERY: &str =
    "Shell company wired cash deposits through an offshore jurisdiction to wallet 0x9f2c";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Investigation Orchestrator starting");

    // query first, remaining arguments answer the follow-up questions in order
    let mut args = std::env::args().skip(1);
    let query = args.next().unwrap_or_else(|| DEFAULT_QUERY.to_string());
    let answers: Vec<String> = args.collect();

    let config = Config::from_env()?;
    let orchestrator = Arc::new(Orchestrator::from_config(&config)?);

    info!(query = %query, answers = answers.len(), "Running investigation");

    let mut subscription = orchestrator.investigate(&query, &answers).await?;
    let session_id = subscription.session_id();

    println!("\n=== INVESTIGATION {} ===", session_id);

    let mut failed = false;
    while let Some(item) = subscription.next().await {
        let event = match item {
            StreamItem::Event(event) => event,
            StreamItem::Gap { missed_from, .. } => {
                println!("  (stream fell behind, events from #{} not shown)", missed_from);
                continue;
            }
        };

        match &event.payload {
            EventPayload::SessionStarted { query } => println!("#{} started: {}", event.sequence, query),
            EventPayload::StageChanged { stage } => println!("#{} stage: {:?}", event.sequence, stage),
            EventPayload::AnswerRecorded { question, answer } => {
                println!("#{} answered: {} -> {}", event.sequence, question, answer)
            }
            EventPayload::PatternMatch { keys, .. } => {
                println!("#{} known patterns: {}", event.sequence, keys.join(", "))
            }
            EventPayload::DispatchDecided { kinds } => {
                let kinds: Vec<String> = kinds.iter().map(|k| k.to_string()).collect();
                println!("#{} dispatching: {}", event.sequence, kinds.join(", "))
            }
            EventPayload::TaskDispatched { kind, .. } => println!("#{} task {} dispatched", event.sequence, kind),
            EventPayload::TaskUpdated {
                kind,
                status,
                risk_score,
                ..
            } => match risk_score {
                Some(score) => println!("#{} task {} {:?} (score {:.1})", event.sequence, kind, status, score),
                None => println!("#{} task {} {:?}", event.sequence, kind, status),
            },
            EventPayload::RiskRecomputed { risk } => println!(
                "#{} risk {:.2} {} ({})",
                event.sequence, risk.overall_score, risk.recommendation, risk.confidence_level
            ),
            EventPayload::SessionComplete { summary, .. } => {
                println!("\n=== RESULT ===\n{}", summary);
            }
            EventPayload::SessionError { summary } => {
                eprintln!("\n=== FAILED ===\n{}", summary);
                failed = true;
            }
        }
    }

    let archived = orchestrator.close_session(session_id).await?;
    println!("\nArchived with digest {}", archived.digest);
    println!(
        "{} ms, {}/{} specialists succeeded, {} timed out",
        archived.metrics.duration_ms,
        archived.metrics.succeeded,
        archived.metrics.agents_spawned,
        archived.metrics.timed_out
    );

    if failed {
        std::process::exit(1);
    }

    Ok(())
}
