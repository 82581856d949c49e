mod executor;
mod fake;
mod tokenizer;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::comm;
pub use executor::Executor;
pub use fake::FakeModel;
pub use tokenizer::ChatTokenizer;

/// One chat turn, carried verbatim into the chat template.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateInputs {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u8>,
    pub gencfg: comm::GenerationConfig,
}

/// The tokenizer+model pair every request runs against.
///
/// Loaded once at startup and shared by all worker threads for the lifetime
/// of the process. Implementations must tolerate concurrent calls from up to
/// `--workers` threads.
pub trait ModelCapability: Send + Sync {
    /// Renders the chat template (with the generation prompt appended) and
    /// tokenizes it.
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
    ) -> anyhow::Result<Vec<u32>>;

    /// Runs generation to completion. Returns the input ids followed by the
    /// newly generated ids. `on_token` observes every new id as soon as it is
    /// produced, on the calling thread.
    fn generate(
        &self,
        inputs: &GenerateInputs,
        on_token: Option<&mut dyn FnMut(u32)>,
    ) -> anyhow::Result<Vec<u32>>;

    fn decode(
        &self,
        ids: &[u32],
        skip_special_tokens: bool,
    ) -> anyhow::Result<String>;

    fn eos_token_id(&self) -> u32;

    fn pad_token_id(&self) -> Option<u32>;

    fn stop_token_id(&self) -> u32;
}

#[derive(Debug, Clone, clap::Args)]
pub struct ModelArgs {
    #[arg(
        long,
        env = "PALMA_MODEL_PATH",
        required_unless_present = "fake_model",
        help = "Directory containing tokenizer.json and tokenizer_config.json"
    )]
    pub model_path: Option<PathBuf>,
    #[arg(long, env = "PALMA_STOP_TOKEN", default_value = "<|eot_id|>")]
    pub stop_token: String,
    #[arg(long, env = "PALMA_DEVICE", default_value = "auto")]
    pub device: String,
    #[arg(long, env = "PALMA_DTYPE", default_value = "bfloat16")]
    pub dtype: String,
    #[arg(
        long,
        env = "PALMA_EXECUTOR",
        default_value = "python -m palma_executor",
        help = "Command line of the model executor process"
    )]
    pub executor: String,
    #[arg(long, help = "Use FakeModel instead of a real executor")]
    pub fake_model: bool,
}

/// A tokenizer loaded from disk paired with an executor process.
pub struct Model {
    tokenizer: ChatTokenizer,
    executor: Executor,
    stop_token_id: u32,
}

impl Model {
    pub fn new(
        tokenizer: ChatTokenizer,
        executor: Executor,
        stop_token: &str,
    ) -> anyhow::Result<Self> {
        let stop_token_id =
            tokenizer.token_to_id(stop_token).with_context(|| {
                format!("Stop token {:?} is not in the vocabulary", stop_token)
            })?;
        Ok(Self { tokenizer, executor, stop_token_id })
    }
}

impl ModelCapability for Model {
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
    ) -> anyhow::Result<Vec<u32>> {
        self.tokenizer.apply_chat_template(messages)
    }

    fn generate(
        &self,
        inputs: &GenerateInputs,
        on_token: Option<&mut dyn FnMut(u32)>,
    ) -> anyhow::Result<Vec<u32>> {
        self.executor.generate(inputs, on_token)
    }

    fn decode(
        &self,
        ids: &[u32],
        skip_special_tokens: bool,
    ) -> anyhow::Result<String> {
        self.tokenizer.decode(ids, skip_special_tokens)
    }

    fn eos_token_id(&self) -> u32 {
        self.tokenizer.eos_id()
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.tokenizer.pad_id()
    }

    fn stop_token_id(&self) -> u32 {
        self.stop_token_id
    }
}

pub fn load_model(args: &ModelArgs) -> anyhow::Result<Arc<dyn ModelCapability>> {
    if args.fake_model {
        warn!("Using FakeModel. Responses echo the last message.");
        return Ok(Arc::new(FakeModel::new()));
    }
    let model_path = args
        .model_path
        .as_deref()
        .context("--model-path is required without --fake-model")?;

    let tokenizer = ChatTokenizer::new(model_path).with_context(|| {
        format!("Failed to load tokenizer from {}", model_path.display())
    })?;
    info!("Tokenizer loaded.");

    let executor = Executor::spawn(&args.executor)?;
    executor.init(
        &model_path.display().to_string(),
        &args.device,
        &args.dtype,
    )?;
    info!(device = %args.device, dtype = %args.dtype, "Executor initialized.");

    Ok(Arc::new(Model::new(tokenizer, executor, &args.stop_token)?))
}
