//! Progressive stream guarding with a scripted generator.
//!
//! The generator replays canned chunks, one of which leaks an email
//! address. The output guardrail cuts the stream off there, and the
//! runner's metrics are printed at the end.
//!
//! ```bash
//! cargo run --example guarded_stream
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tripwire::generate::text_stream;
use tripwire::prelude::*;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let generator = stream_generator_fn(|_, _| async {
        Ok::<_, Error>(text_stream([
            "Sure, ",
            "you can reach ",
            "the team at ",
            "support@example.com ",
            "any time.",
        ]))
    });

    let runner = GuardrailRunner::new(RunnerConfig::default().log_level(LogLevel::Debug))
        .with_tracer(LogTracer);
    let guarded = GuardedGenerator::new(generator)
        .runner(runner.clone())
        .output_guardrail(OutputGuardrail::from_fn("no-email", |ctx: &OutputContext| {
            if ctx.text().contains('@') {
                GuardrailOutput::tripwire("email address in output")
                    .with_severity(Severity::Critical)
            } else {
                GuardrailOutput::pass()
            }
        }))
        .stream_config(StreamConfig::progressive())
        .token_budget(200);

    let mut stream = guarded
        .stream(
            &GenerationParams::from_prompt("How do I contact support?"),
            &CancellationToken::new(),
        )
        .await?;

    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::TextDelta { delta } => print!("{delta}"),
            StreamChunk::Finish { reason, .. } => println!("\n[finish: {reason:?}]"),
            other => println!("\n[{other:?}]"),
        }
    }

    println!("\n{}", runner.metrics());
    Ok(())
}
