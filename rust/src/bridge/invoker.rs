use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use uuid::Uuid;

use super::channel::{EmissionSender, Mode};
use crate::comm;
use crate::model::{ChatMessage, GenerateInputs, ModelCapability};
use crate::params::GenerationParameters;

/// One request's generation, executed on a pool thread.
pub struct WorkerTask {
    pub request_id: Uuid,
    pub messages: Vec<ChatMessage>,
    pub params: GenerationParameters,
    pub model: Arc<dyn ModelCapability>,
    pub sender: EmissionSender,
}

impl WorkerTask {
    pub fn run(self) {
        let WorkerTask { request_id, messages, params, model, sender } = self;
        let mode = sender.mode();
        let _span = tracing::info_span!(
            "generate",
            %request_id,
            mode = mode.as_str()
        )
        .entered();
        let started = Instant::now();

        let inputs = match prepare(&*model, &messages, &params) {
            Ok(inputs) => inputs,
            Err(e) => {
                let cause = format!("{:#}", e);
                error!(cause = %cause, "Failed to prepare inputs.");
                sender.fail(cause);
                return;
            }
        };
        let result = match mode {
            Mode::Unary => generate_text(&*model, &inputs).map(Some),
            Mode::Streaming => {
                stream_text(&*model, &inputs, &sender).map(|()| None)
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(text) => {
                info!(elapsed_ms, "Generation finished.");
                match text {
                    Some(text) => sender.complete(text),
                    None => sender.end(),
                }
            }
            Err(e) => {
                let cause = format!("{:#}", e);
                error!(elapsed_ms, cause = %cause, "Generation failed.");
                sender.fail(cause);
            }
        }
    }
}

/// Templates the messages and assembles everything the model needs.
pub fn prepare(
    model: &dyn ModelCapability,
    messages: &[ChatMessage],
    params: &GenerationParameters,
) -> anyhow::Result<GenerateInputs> {
    let input_ids = model
        .apply_chat_template(messages)
        .context("Failed to apply chat template")?;
    let eos_token_id = model.eos_token_id();
    let pad_token_id = model.pad_token_id().unwrap_or(eos_token_id);
    let attention_mask =
        input_ids.iter().map(|&id| u8::from(id != pad_token_id)).collect();
    Ok(GenerateInputs {
        input_ids,
        attention_mask,
        gencfg: comm::GenerationConfig {
            max_new_tokens: params.max_new_tokens,
            eos_token_ids: vec![eos_token_id, model.stop_token_id()],
            pad_token_id,
            do_sample: params.do_sample,
            temperature: params.temperature,
            top_p: params.top_p,
        },
    })
}

fn generate_text(
    model: &dyn ModelCapability,
    inputs: &GenerateInputs,
) -> anyhow::Result<String> {
    let output_ids = model.generate(inputs, None).context("Generation failed")?;
    let new_ids = output_ids.get(inputs.input_ids.len()..).unwrap_or_default();
    model.decode(new_ids, true).context("Failed to decode output")
}

fn stream_text(
    model: &dyn ModelCapability,
    inputs: &GenerateInputs,
    sender: &EmissionSender,
) -> anyhow::Result<()> {
    let mut abandoned = false;
    let mut emit = |text: String| {
        if !sender.push(text) && !abandoned {
            abandoned = true;
            debug!("Client went away; finishing generation anyway.");
        }
    };
    let mut streamer = TextStreamer::new(model, &mut emit);
    let on_token: &mut dyn FnMut(u32) = &mut |id: u32| streamer.put(id);
    model.generate(inputs, Some(on_token)).context("Generation failed")?;
    streamer.end()
}

/// Turns a token stream into printable text, releasing text only at word
/// boundaries, line ends and CJK characters so that multi-token words are
/// never split mid-way.
pub struct TextStreamer<'a> {
    model: &'a dyn ModelCapability,
    emit: &'a mut dyn FnMut(String),
    token_cache: Vec<u32>,
    print_len: usize,
    error: Option<anyhow::Error>,
}

impl<'a> TextStreamer<'a> {
    pub fn new(
        model: &'a dyn ModelCapability,
        emit: &'a mut dyn FnMut(String),
    ) -> Self {
        Self { model, emit, token_cache: Vec::new(), print_len: 0, error: None }
    }

    pub fn put(&mut self, token_id: u32) {
        if self.error.is_some() {
            return;
        }
        self.token_cache.push(token_id);
        let text = match self.model.decode(&self.token_cache, true) {
            Ok(text) => text,
            Err(e) => {
                self.error = Some(e.context("Failed to decode fragment"));
                return;
            }
        };

        if text.ends_with('\n') {
            let printable = text.get(self.print_len..).unwrap_or_default();
            self.send(printable.to_owned());
            self.token_cache.clear();
            self.print_len = 0;
            return;
        }
        // Incomplete multi-byte sequence; wait for the next token.
        if text.ends_with('\u{FFFD}') {
            return;
        }
        let end = match text.chars().last() {
            Some(c) if is_cjk(c) => text.len(),
            _ => text.rfind(' ').map_or(0, |i| i + 1),
        };
        if end > self.print_len {
            if let Some(printable) = text.get(self.print_len..end) {
                let printable = printable.to_owned();
                self.print_len = end;
                self.send(printable);
            }
        }
    }

    /// Flushes whatever is left. Reports the first decode error, if any.
    pub fn end(mut self) -> anyhow::Result<()> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        if !self.token_cache.is_empty() {
            let text = self
                .model
                .decode(&self.token_cache, true)
                .context("Failed to decode fragment")?;
            let printable = text.get(self.print_len..).unwrap_or_default();
            self.send(printable.to_owned());
        }
        Ok(())
    }

    fn send(&mut self, text: String) {
        if !text.is_empty() {
            (self.emit)(text);
        }
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF
        | 0x3400..=0x4DBF
        | 0x20000..=0x2A6DF
        | 0x2A700..=0x2B73F
        | 0x2B740..=0x2B81F
        | 0x2B820..=0x2CEAF
        | 0xF900..=0xFAFF
        | 0x2F800..=0x2FA1F)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::{emission_channel, Emission};
    use crate::model::FakeModel;

    const PARAMS: GenerationParameters = GenerationParameters {
        max_new_tokens: 64,
        do_sample: false,
        temperature: 0.6,
        top_p: 0.9,
    };

    fn user(content: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::new("user", content)]
    }

    fn task(
        model: Arc<dyn ModelCapability>,
        content: &str,
        sender: EmissionSender,
    ) -> WorkerTask {
        WorkerTask {
            request_id: Uuid::now_v7(),
            messages: user(content),
            params: PARAMS,
            model,
            sender,
        }
    }

    async fn drain(rx: &mut crate::bridge::channel::EmissionReceiver) -> Vec<Emission> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[test]
    fn prepare_falls_back_to_eos_for_padding() {
        let model = FakeModel::new();
        let inputs = prepare(&model, &user("Hi"), &PARAMS).unwrap();
        let eos = model.eos_token_id();
        assert_eq!(inputs.gencfg.pad_token_id, eos);
        assert_eq!(inputs.gencfg.eos_token_ids, vec![eos, model.stop_token_id()]);
        assert_eq!(inputs.attention_mask.len(), inputs.input_ids.len());
        assert!(inputs.attention_mask.iter().all(|&m| m == 1));
        assert_eq!(inputs.gencfg.max_new_tokens, PARAMS.max_new_tokens);
    }

    #[test]
    fn streamer_releases_whole_words() {
        let model = FakeModel::new();
        let mut out = Vec::new();
        let mut emit = |s: String| out.push(s);
        let mut streamer = TextStreamer::new(&model, &mut emit);
        for c in "Hello big\nworld 世界 end".chars() {
            streamer.put(c as u32 + 16);
        }
        streamer.end().unwrap();
        assert_eq!(out, vec!["Hello ", "big\n", "world ", "世", "界", " ", "end"]);
    }

    #[tokio::test]
    async fn unary_task_emits_single_trimmed_result() {
        let (tx, mut rx) = emission_channel(Mode::Unary);
        task(Arc::new(FakeModel::new()), "Hi", tx).run();
        assert_eq!(drain(&mut rx).await, vec![Emission::Complete("Hi".to_owned())]);
    }

    #[tokio::test]
    async fn streaming_task_ends_with_one_sentinel() {
        let (tx, mut rx) = emission_channel(Mode::Streaming);
        task(Arc::new(FakeModel::new()), "one two three", tx).run();
        let items = drain(&mut rx).await;
        assert_eq!(
            items,
            vec![
                Emission::Fragment("one ".to_owned()),
                Emission::Fragment("two ".to_owned()),
                Emission::Fragment("three".to_owned()),
                Emission::End,
            ]
        );
    }

    #[tokio::test]
    async fn failures_still_terminate_the_channel() {
        for mode in [Mode::Unary, Mode::Streaming] {
            let (tx, mut rx) = emission_channel(mode);
            task(Arc::new(FakeModel::failing()), "Hi", tx).run();
            let items = drain(&mut rx).await;
            assert_eq!(items.len(), 1);
            assert!(matches!(&items[0], Emission::Failed(msg) if msg.contains("FakeModel failure")));
        }
    }

    #[test]
    fn abandoned_stream_runs_to_completion() {
        let (tx, rx) = emission_channel(Mode::Streaming);
        drop(rx);
        let model = Arc::new(FakeModel::new());
        task(model.clone(), "nobody listens", tx).run();
        assert_eq!(model.finished(), 1);
    }

    #[tokio::test]
    async fn late_failure_follows_emitted_fragments() {
        let (tx, mut rx) = emission_channel(Mode::Streaming);
        task(Arc::new(FakeModel::failing_after(5)), "one two three", tx).run();
        let items = drain(&mut rx).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Emission::Fragment("one ".to_owned()));
        assert!(matches!(&items[1], Emission::Failed(msg) if msg.contains("after 5 tokens")));
    }

    #[tokio::test]
    async fn empty_reply_streams_only_the_sentinel() {
        let (tx, mut rx) = emission_channel(Mode::Streaming);
        task(Arc::new(FakeModel::new()), "", tx).run();
        assert_eq!(drain(&mut rx).await, vec![Emission::End]);
    }

    /// Byte-level vocabulary: every token is one UTF-8 byte, so a single
    /// character may span several tokens.
    struct ByteModel;

    impl ModelCapability for ByteModel {
        fn apply_chat_template(&self, _: &[ChatMessage]) -> anyhow::Result<Vec<u32>> {
            Ok(Vec::new())
        }

        fn generate(
            &self,
            inputs: &GenerateInputs,
            _: Option<&mut dyn FnMut(u32)>,
        ) -> anyhow::Result<Vec<u32>> {
            Ok(inputs.input_ids.clone())
        }

        fn decode(&self, ids: &[u32], _: bool) -> anyhow::Result<String> {
            let bytes: Vec<u8> = ids.iter().map(|&id| id as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }

        fn eos_token_id(&self) -> u32 {
            0
        }

        fn pad_token_id(&self) -> Option<u32> {
            None
        }

        fn stop_token_id(&self) -> u32 {
            0
        }
    }

    #[test]
    fn streamer_holds_back_split_characters() {
        let model = ByteModel;
        let mut out = Vec::new();
        let mut emit = |s: String| out.push(s);
        let mut streamer = TextStreamer::new(&model, &mut emit);
        for b in "世界 ok".bytes() {
            streamer.put(u32::from(b));
        }
        streamer.end().unwrap();
        assert_eq!(out, vec!["世", "界", " ", "ok"]);
        assert!(out.iter().all(|s| !s.contains('\u{FFFD}')));
    }
}
