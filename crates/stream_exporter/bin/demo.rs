//! # Agent Telemetry Stream Exporter Demo
//!
//! Simulates a handful of AI-agent conversations and exports their telemetry as
//! one event stream per conversation.
//!
//! Each conversation is a short agent loop: an `invoke_agent` span wrapping a
//! few `chat` model calls, some of which trigger an `execute_tool` call. About
//! one tool call in ten fails.
//!
//! ## Configuration
//!
//! Read from the environment (`S2_ENDPOINT`, `S2_API_KEY`, `S2_STREAM_PREFIX`,
//! `S2_BATCH_SIZE`, `S2_FLUSH_INTERVAL_MS`). Without `S2_API_KEY` the demo
//! runs against an in-memory store and prints what it would have written.
//!
//! ## Running
//!
//! ```bash
//! # In-memory dry run
//! RUST_LOG=stream_exporter=debug cargo run -p stream_exporter --bin demo
//!
//! # Against a real store
//! S2_API_KEY=... cargo run -p stream_exporter --bin demo -- --conversations 20
//! ```

use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use stream_exporter::{
    ExporterConfig, HttpStreamClient, MemoryStreamClient, QueuedWriter, ResourceSpans, Span, SpanKind, SpanStatus,
    StreamClientBoxed, StreamExporter, DEFAULT_QUEUE_CAPACITY,
};
use tracing_subscriber::EnvFilter;

const MODELS: &[&str] = &["gpt-4o", "claude-sonnet-4", "gemini-2.0-flash"];
const PROVIDERS: &[&str] = &["openai", "anthropic", "gcp.gemini"];
const TOOLS: &[&str] = &["web_search", "read_file", "run_sql", "send_email"];
const FINISH_REASONS: &[&str] = &["stop", "tool_calls", "length"];

// =============================================================================
// SYNTHETIC CONVERSATIONS
// =============================================================================

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// One agent conversation: an agent span, model calls under it, and tool
/// calls under some of the model calls.
fn generate_conversation<R: Rng>(rng: &mut R, conversation_id: &str) -> ResourceSpans {
    let mut resource = ResourceSpans::default();
    let trace_id: u128 = rng.gen();
    let mut clock = now_nanos();
    let mut next_span_id = rng.gen_range(1..u64::MAX / 2);

    let agent_id = next_span_id;
    let mut agent = Span::new(trace_id, agent_id, 0, "invoke_agent research-assistant", SpanKind::Internal)
        .with_attribute("gen_ai.conversation.id", conversation_id)
        .with_attribute("gen_ai.operation.name", "invoke_agent")
        .with_attribute("gen_ai.agent.name", "research-assistant")
        .with_attribute("gen_ai.agent.id", "agent-001");
    agent.start_time = clock;

    let turns = rng.gen_range(1..=4);
    for _ in 0..turns {
        next_span_id += 1;
        let model_index = rng.gen_range(0..MODELS.len());
        let mut chat = Span::new(trace_id, next_span_id, agent_id, format!("chat {}", MODELS[model_index]), SpanKind::Client)
            .with_attribute("gen_ai.conversation.id", conversation_id)
            .with_attribute("gen_ai.operation.name", "chat")
            .with_attribute("gen_ai.provider.name", PROVIDERS[model_index])
            .with_attribute("gen_ai.request.model", MODELS[model_index])
            .with_attribute("gen_ai.response.model", MODELS[model_index])
            .with_attribute("gen_ai.usage.input_tokens", rng.gen_range(200..4000_i64))
            .with_attribute("gen_ai.usage.output_tokens", rng.gen_range(20..800_i64))
            .with_attribute("gen_ai.response.finish_reasons", *FINISH_REASONS.choose(rng).unwrap_or(&"stop"))
            // not on the allow-list; dropped by the converter
            .with_attribute("http.request.method", "POST");
        chat.start_time = clock;
        clock += rng.gen_range(200_000_000..2_000_000_000);
        chat.end_time = clock;
        chat.status = SpanStatus::Ok;
        let chat_id = chat.span_id;
        resource.add(chat);

        if rng.gen_bool(0.6) {
            next_span_id += 1;
            let tool = TOOLS.choose(rng).copied().unwrap_or("web_search");
            let mut call = Span::new(trace_id, next_span_id, chat_id, format!("execute_tool {tool}"), SpanKind::Internal)
                .with_attribute("gen_ai.conversation.id", conversation_id)
                .with_attribute("gen_ai.operation.name", "execute_tool")
                .with_attribute("gen_ai.tool.name", tool)
                .with_attribute("gen_ai.tool.call.id", format!("call_{:08x}", rng.gen::<u32>()));
            call.start_time = clock;
            clock += rng.gen_range(5_000_000..500_000_000);
            call.end_time = clock;
            if rng.gen_bool(0.1) {
                call.status = SpanStatus::Error;
                call.set_attribute("error.type", "timeout");
            } else {
                call.status = SpanStatus::Ok;
            }
            resource.add(call);
        }
    }

    agent.end_time = clock;
    agent.status = SpanStatus::Ok;
    resource.add(agent);
    resource
}

fn parse_count(args: &[String], flag: &str, default: usize) -> usize {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let conversations = parse_count(&args, "--conversations", 8);

    let mut config = ExporterConfig::from_env();
    let memory = Arc::new(MemoryStreamClient::new());
    let dry_run = config.api_key.is_empty();

    println!("Demo Configuration:");
    println!("   Conversations: {conversations}");
    println!("   Stream prefix: {}", config.stream_prefix);
    println!("   Batch size: {}", config.batch_size);
    println!("   Flush interval: {:?}", config.flush_interval);

    let exporter = if dry_run {
        println!("   Store: in-memory (S2_API_KEY not set)\n");
        StreamExporter::new(config.clone(), memory.clone())?
    } else {
        println!("   Store: {}\n", config.endpoint);
        config.validate()?;
        StreamExporter::from_config(config.clone())?
    };

    // =========================================================================
    // Phase 1: ingest agent conversations
    // =========================================================================
    exporter.start();

    let mut rng = rand::thread_rng();
    let mut ids = Vec::with_capacity(conversations);
    let mut span_count = 0;
    for _ in 0..conversations {
        let id = format!("conv-{:06x}", rng.gen::<u32>() & 0x00ff_ffff);
        let batch = generate_conversation(&mut rng, &id);
        span_count += batch.len();
        exporter.ingest(&[batch]);
        ids.push(id);
    }
    println!("Ingested {span_count} spans across {conversations} conversations");

    // =========================================================================
    // Phase 2: single-event writes through the queued writer
    // =========================================================================
    let client: Arc<dyn StreamClientBoxed> = if dry_run {
        memory.clone()
    } else {
        Arc::new(HttpStreamClient::new(&config)?)
    };
    let writer = QueuedWriter::new(client, config.stream_prefix.clone(), DEFAULT_QUEUE_CAPACITY)?;
    if let Some(id) = ids.first() {
        let span = Span::new(rng.gen(), 1, 0, "feedback", SpanKind::Internal)
            .with_attribute("gen_ai.conversation.id", id.as_str())
            .with_attribute("gen_ai.operation.name", "feedback");
        let event = stream_exporter::EventConverter::new().convert_span(&span, &Default::default());
        if let Err(e) = writer.try_write_event(event) {
            eprintln!("   queued write failed: {e}");
        }
    }
    writer.close().await;

    // =========================================================================
    // Phase 3: let the timer fire once, then shut down
    // =========================================================================
    println!("Waiting one flush interval ({:?})...", config.flush_interval);
    tokio::time::sleep(config.flush_interval + Duration::from_millis(100)).await;
    exporter.shutdown().await;

    let metrics = exporter.metrics();
    println!("\nExport Results:");
    println!("   Events exported:  {}", metrics.events_exported());
    println!("   Batches exported: {}", metrics.batches_exported());
    println!("   Batches dropped:  {}", metrics.batches_dropped());
    println!("   Events dropped:   {}", metrics.events_dropped());
    println!("   Queued writes:    {}", writer.metrics().written());

    if dry_run {
        println!("\nStreams:");
        for stream in memory.stream_names() {
            let events = memory.events(&stream);
            println!("   {stream}: {} events", events.len());
            if let Some(first) = events.first() {
                println!("      first: {}", first.to_json()?);
            }
        }
    }

    Ok(())
}
