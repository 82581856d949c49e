use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use parking_lot::{Condvar, Mutex};

use super::{ChatMessage, GenerateInputs, ModelCapability};

const EOS_ID: u32 = 0;
const STOP_ID: u32 = 1;
const CHAR_OFFSET: u32 = 16;
const ASSISTANT_PROMPT: &str = "assistant: ";

/// Deterministic stand-in for a real model: a char-level tokenizer whose
/// "generation" echoes the content of the last message.
#[derive(Default)]
pub struct FakeModel {
    behavior: Behavior,
    gate: Option<Gate>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    finished: AtomicUsize,
}

#[derive(Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), allow(dead_code))]
enum Behavior {
    #[default]
    Echo,
    Fail,
    /// Emits this many tokens, then errors.
    FailAfter(usize),
    Panic,
}

impl FakeModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every generation returns an error.
    #[cfg(test)]
    pub fn failing() -> Self {
        Self { behavior: Behavior::Fail, ..Self::default() }
    }

    /// Every generation errors after emitting `tokens` tokens.
    #[cfg(test)]
    pub fn failing_after(tokens: usize) -> Self {
        Self { behavior: Behavior::FailAfter(tokens), ..Self::default() }
    }

    /// Every generation panics on the worker thread.
    #[cfg(test)]
    pub fn panicking() -> Self {
        Self { behavior: Behavior::Panic, ..Self::default() }
    }

    /// Generations block until the returned gate is opened.
    #[cfg(test)]
    pub fn gated() -> (Self, Gate) {
        let gate = Gate::default();
        (Self { gate: Some(gate.clone()), ..Self::default() }, gate)
    }

    /// Highest number of generations observed running at the same time.
    #[cfg(test)]
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Number of generations that ran to the end successfully.
    #[cfg(test)]
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    fn encode(text: &str) -> Vec<u32> {
        text.chars().map(|c| c as u32 + CHAR_OFFSET).collect()
    }

    fn reply_for(&self, input_ids: &[u32]) -> anyhow::Result<String> {
        let prompt = self.decode(input_ids, true)?;
        let last = prompt
            .strip_suffix(ASSISTANT_PROMPT)
            .and_then(|p| p.lines().last())
            .ok_or_else(|| anyhow!("Prompt lacks a generation prompt"))?;
        let content = last.split_once(": ").map_or(last, |(_, c)| c);
        Ok(content.to_owned())
    }
}

impl ModelCapability for FakeModel {
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
    ) -> anyhow::Result<Vec<u32>> {
        let mut prompt = String::new();
        for m in messages {
            prompt.push_str(&m.role);
            prompt.push_str(": ");
            prompt.push_str(&m.content.replace('\n', " "));
            prompt.push('\n');
        }
        prompt.push_str(ASSISTANT_PROMPT);
        Ok(Self::encode(&prompt))
    }

    fn generate(
        &self,
        inputs: &GenerateInputs,
        mut on_token: Option<&mut dyn FnMut(u32)>,
    ) -> anyhow::Result<Vec<u32>> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        struct Running<'a>(&'a AtomicUsize);
        impl Drop for Running<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }
        let _running = Running(&self.running);

        if let Some(gate) = &self.gate {
            gate.wait();
        }
        match self.behavior {
            Behavior::Echo | Behavior::FailAfter(_) => {}
            Behavior::Fail => bail!("FakeModel failure"),
            Behavior::Panic => panic!("FakeModel panic"),
        }

        let max_new_tokens = inputs.gencfg.max_new_tokens as usize;
        let mut new_ids = Self::encode(&self.reply_for(&inputs.input_ids)?);
        if new_ids.len() < max_new_tokens {
            new_ids.push(EOS_ID);
        } else {
            new_ids.truncate(max_new_tokens);
        }

        let mut output_ids = inputs.input_ids.clone();
        for (i, id) in new_ids.into_iter().enumerate() {
            if self.behavior == Behavior::FailAfter(i) {
                bail!("FakeModel failure after {} tokens", i);
            }
            output_ids.push(id);
            if let Some(on_token) = on_token.as_mut() {
                on_token(id);
            }
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(output_ids)
    }

    fn decode(
        &self,
        ids: &[u32],
        skip_special_tokens: bool,
    ) -> anyhow::Result<String> {
        let mut text = String::new();
        for &id in ids {
            if id < CHAR_OFFSET {
                if !skip_special_tokens {
                    text.push_str(if id == EOS_ID { "</s>" } else { "<stop>" });
                }
                continue;
            }
            let c = char::from_u32(id - CHAR_OFFSET)
                .ok_or_else(|| anyhow!("Invalid token id {}", id))?;
            text.push(c);
        }
        Ok(text)
    }

    fn eos_token_id(&self) -> u32 {
        EOS_ID
    }

    fn pad_token_id(&self) -> Option<u32> {
        None
    }

    fn stop_token_id(&self) -> u32 {
        STOP_ID
    }
}

/// Holds gated [`FakeModel`] generations until opened.
#[derive(Clone, Default)]
pub struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    #[cfg(test)]
    pub fn open(&self) {
        let (open, cond) = &*self.0;
        *open.lock() = true;
        cond.notify_all();
    }

    fn wait(&self) {
        let (open, cond) = &*self.0;
        let mut open = open.lock();
        while !*open {
            cond.wait(&mut open);
        }
    }
}
