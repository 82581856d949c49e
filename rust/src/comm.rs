use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use uuid::Uuid;

//====== Generation ======

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub max_new_tokens: u32,
    pub eos_token_ids: Vec<u32>,
    pub pad_token_id: u32,

    pub do_sample: bool,
    pub temperature: f32,
    pub top_p: f32,
}

#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FinishReason {
    NotFinished = 0,
    Stop = 1,
    Length = 2,
    Error = 3,
}

//====== Executor ======

#[derive(Serialize, Deserialize, Debug)]
pub struct TokenChunk {
    pub request_id: Uuid,
    pub token_ids: Vec<u32>,
    pub finish_reason: FinishReason,
    #[serde(default)]
    pub error: Option<String>,
}
