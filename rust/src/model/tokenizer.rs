use std::path::Path;

use anyhow::{anyhow, Context};
use minijinja::{context, Environment, ErrorKind};
use serde_json::Value;

use super::ChatMessage;

pub struct ChatTokenizer {
    tokenizer: tokenizers::Tokenizer,
    template: ChatTemplate,
    eos_id: u32,
    pad_id: Option<u32>,
}

impl ChatTokenizer {
    pub fn new(model_path: &Path) -> anyhow::Result<Self> {
        let tokenizer =
            tokenizers::Tokenizer::from_file(model_path.join("tokenizer.json"))
                .map_err(|e| anyhow!("{}", e))
                .with_context(|| {
                    format!(
                        "Failed to load tokenizer from {}",
                        model_path.display()
                    )
                })?;

        let file =
            std::fs::read_to_string(model_path.join("tokenizer_config.json"))
                .with_context(|| {
                format!(
                    "Failed to read tokenizer_config.json from {}",
                    model_path.display()
                )
            })?;
        let json: Value = serde_json::from_str(&file)?;

        let eos_token = special_token(&json, "eos_token").ok_or_else(|| {
            anyhow!("Cannot read eos_token from tokenizer_config.json")
        })?;
        let eos_id = lookup_id(&tokenizer, &eos_token)?;
        let pad_id = match special_token(&json, "pad_token") {
            Some(pad_token) => Some(lookup_id(&tokenizer, &pad_token)?),
            None => None,
        };
        let source = chat_template_source(&json).ok_or_else(|| {
            anyhow!("Cannot read chat_template from tokenizer_config.json")
        })?;
        let template = ChatTemplate {
            source,
            bos_token: special_token(&json, "bos_token"),
            eos_token: Some(eos_token),
        };

        Ok(Self { tokenizer, template, eos_id, pad_id })
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    pub fn pad_id(&self) -> Option<u32> {
        self.pad_id
    }

    pub fn token_to_id(&self, token: &str) -> anyhow::Result<u32> {
        lookup_id(&self.tokenizer, token)
    }

    pub fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
    ) -> anyhow::Result<Vec<u32>> {
        let prompt = self.template.render(messages)?;
        self.encode(&prompt)
    }

    pub fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        self.tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!("{}", e))
            .map(|encodings| encodings.get_ids().to_vec())
    }

    pub fn decode(
        &self,
        ids: &[u32],
        skip_special_tokens: bool,
    ) -> anyhow::Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow!("{}", e))
    }
}

/// `tokenizer_config.json` stores special tokens either as a plain string or
/// as an `AddedToken` object.
fn special_token(json: &Value, key: &str) -> Option<String> {
    match &json[key] {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => {
            obj.get("content").and_then(Value::as_str).map(str::to_owned)
        }
        _ => None,
    }
}

fn chat_template_source(json: &Value) -> Option<String> {
    match &json["chat_template"] {
        Value::String(s) => Some(s.clone()),
        // Named templates: [{"name": "default", "template": "..."}, ...]
        Value::Array(list) => list
            .iter()
            .find(|t| t["name"] == "default")
            .and_then(|t| t["template"].as_str())
            .map(str::to_owned),
        _ => None,
    }
}

fn lookup_id(
    tokenizer: &tokenizers::Tokenizer,
    token: &str,
) -> anyhow::Result<u32> {
    if let Some(id) = tokenizer.token_to_id(token) {
        return Ok(id);
    }
    tokenizer
        .encode(token, false)
        .map_err(|e| anyhow!("{}", e))?
        .get_ids()
        .first()
        .copied()
        .ok_or_else(|| anyhow!("Token {:?} encodes to nothing", token))
}

/// A Jinja chat template as shipped in `tokenizer_config.json`.
pub struct ChatTemplate {
    source: String,
    bos_token: Option<String>,
    eos_token: Option<String>,
}

impl ChatTemplate {
    pub fn render(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_function(
            "raise_exception",
            |msg: String| -> Result<String, minijinja::Error> {
                Err(minijinja::Error::new(ErrorKind::InvalidOperation, msg))
            },
        );
        env.add_template("chat", &self.source)
            .context("Failed to parse chat template")?;
        let tmpl = env.get_template("chat")?;
        let rendered = tmpl
            .render(context! {
                messages => messages,
                add_generation_prompt => true,
                bos_token => self.bos_token.clone().unwrap_or_default(),
                eos_token => self.eos_token.clone().unwrap_or_default(),
            })
            .context("Failed to render chat template")?;
        Ok(rendered)
    }
}
