use std::io::Write;

use futures::StreamExt;
use serde_json::json;

use crate::bridge::{Bridge, WorkerPool};
use crate::model::{load_model, ChatMessage, ModelArgs};
use crate::params::DefaultsArgs;

#[derive(Debug, clap::Args)]
pub struct GenerateArgs {
    #[arg(long)]
    pub prompt: String,
    #[arg(long)]
    pub system: Option<String>,
    #[arg(long, help = "Print the reply once it is complete")]
    pub unary: bool,
    #[command(flatten)]
    pub model: ModelArgs,
    #[command(flatten)]
    pub defaults: DefaultsArgs,
}

pub async fn generate_main(args: GenerateArgs) -> anyhow::Result<()> {
    let defaults = args.defaults.to_defaults()?;
    let model = load_model(&args.model)?;
    let bridge = Bridge::new(model, WorkerPool::new(1)?, defaults);

    let mut messages = Vec::new();
    if let Some(system) = args.system {
        messages.push(ChatMessage::new("system", system));
    }
    messages.push(ChatMessage::new("user", args.prompt));
    let payload = json!({});

    let mut stdout = std::io::stdout();
    if args.unary {
        let text = bridge.infer(messages, &payload).await?;
        writeln!(stdout, "{}", text)?;
    } else {
        let mut fragments = bridge.stream(messages, &payload).await?;
        while let Some(fragment) = fragments.next().await {
            write!(stdout, "{}", fragment?)?;
            stdout.flush()?;
        }
        writeln!(stdout)?;
    }
    info!(stats = ?bridge.stats(), "Done.");
    bridge.shutdown();
    Ok(())
}
