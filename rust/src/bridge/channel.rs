//! Per-request hand-off between a worker thread and the request handler.
//!
//! The sender side never blocks and may be used from any thread. The receiver
//! is awaited from the async request handler. Exactly one terminal item is
//! delivered per channel: the consuming methods on [`EmissionSender`] send it
//! explicitly, and dropping the sender without one (early return, panic
//! unwinding) sends [`Emission::Failed`] instead.

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Unary,
    Streaming,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Unary => "unary",
            Mode::Streaming => "streaming",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    /// Incremental text; streaming mode only.
    Fragment(String),
    /// The single result of a unary generation. Terminal.
    Complete(String),
    /// End-of-stream sentinel. Terminal.
    End,
    /// The task failed. Terminal in either mode.
    Failed(String),
}

impl Emission {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Emission::Fragment(_))
    }
}

const DROPPED_WITHOUT_RESULT: &str = "generation task ended without a result";

pub fn emission_channel(mode: Mode) -> (EmissionSender, EmissionReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EmissionSender { tx: Some(tx), mode },
        EmissionReceiver { rx, finished: false },
    )
}

pub struct EmissionSender {
    tx: Option<mpsc::UnboundedSender<Emission>>,
    mode: Mode,
}

impl EmissionSender {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Queues a fragment. Returns `false` once the receiver is gone.
    pub fn push(&self, fragment: String) -> bool {
        debug_assert_eq!(self.mode, Mode::Streaming);
        match &self.tx {
            Some(tx) => tx.send(Emission::Fragment(fragment)).is_ok(),
            None => false,
        }
    }

    pub fn complete(mut self, text: String) {
        debug_assert_eq!(self.mode, Mode::Unary);
        self.finish(Emission::Complete(text));
    }

    pub fn end(mut self) {
        debug_assert_eq!(self.mode, Mode::Streaming);
        self.finish(Emission::End);
    }

    pub fn fail(mut self, reason: String) {
        self.finish(Emission::Failed(reason));
    }

    fn finish(&mut self, item: Emission) {
        if let Some(tx) = self.tx.take() {
            // The receiver may already be gone; nothing is waiting then.
            let _ = tx.send(item);
        }
    }
}

impl Drop for EmissionSender {
    fn drop(&mut self) {
        self.finish(Emission::Failed(DROPPED_WITHOUT_RESULT.to_owned()));
    }
}

pub struct EmissionReceiver {
    rx: mpsc::UnboundedReceiver<Emission>,
    finished: bool,
}

impl EmissionReceiver {
    /// Waits for the next item. After the terminal item has been returned,
    /// always returns `None`.
    pub async fn recv(&mut self) -> Option<Emission> {
        if self.finished {
            return None;
        }
        let item = self.rx.recv().await;
        match &item {
            Some(item) if !item.is_terminal() => {}
            _ => {
                self.finished = true;
                self.rx.close();
            }
        }
        item
    }
}
