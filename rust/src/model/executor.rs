use std::io::{Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::GenerateInputs;
use crate::comm;

#[derive(Serialize, Debug)]
#[serde(tag = "t", content = "c")]
enum Request<'a> {
    Init(Init<'a>),
    Shutdown(Shutdown),
    Generate(Generate<'a>),
}

#[derive(Serialize, Debug)]
struct Init<'a> {
    model_path: &'a str,
    device: &'a str,
    dtype_str: &'a str,
}

#[derive(Serialize, Debug)]
struct Shutdown {}

#[derive(Serialize, Debug)]
struct Generate<'a> {
    reqid: Uuid,
    input_ids: &'a [u32],
    attention_mask: &'a [u8],
    gencfg: &'a comm::GenerationConfig,
}

type Pending = DashMap<Uuid, mpsc::Sender<comm::TokenChunk>>;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Client of the external model process.
///
/// Requests are multiplexed over one stdin/stdout pair: any number of threads
/// may call [`Executor::generate`] concurrently, and a dedicated reader thread
/// routes token chunks back by request id.
pub struct Executor {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<Option<ChildStdout>>,
    pending: Arc<Pending>,
    alive: Arc<AtomicBool>,
}

impl Executor {
    pub fn spawn(cmdline: &str) -> anyhow::Result<Self> {
        let mut parts = cmdline.split_whitespace();
        let program =
            parts.next().ok_or_else(|| anyhow!("Empty executor command"))?;
        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to spawn executor: {}", cmdline))?;
        let stdin = child.stdin.take().context("executor stdin")?;
        let stdout = child.stdout.take().context("executor stdout")?;
        info!(pid = child.id(), "Executor spawned.");
        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(Some(stdout)),
            pending: Arc::new(DashMap::new()),
            alive: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Loads the model in the executor and starts routing its output.
    pub fn init(
        &self,
        model_path: &str,
        device: &str,
        dtype_str: &str,
    ) -> anyhow::Result<()> {
        let mut stdout = self
            .stdout
            .lock()
            .take()
            .ok_or_else(|| anyhow!("Executor already initialized"))?;
        let init = Request::Init(Init { model_path, device, dtype_str });
        write_msg(&mut *self.stdin.lock(), &init)?;
        read_msg::<i32, _>(&mut stdout).context("Executor init failed")?;

        self.alive.store(true, Ordering::SeqCst);
        let pending = self.pending.clone();
        let alive = self.alive.clone();
        std::thread::Builder::new()
            .name("executor-reader".to_owned())
            .spawn(move || read_loop(&mut stdout, &pending, &alive))?;
        Ok(())
    }

    pub fn generate(
        &self,
        inputs: &GenerateInputs,
        mut on_token: Option<&mut dyn FnMut(u32)>,
    ) -> anyhow::Result<Vec<u32>> {
        let reqid = Uuid::now_v7();
        let (tx, rx) = mpsc::channel();
        self.pending.insert(reqid, tx);

        struct PendingGuard<'a> {
            pending: &'a Pending,
            reqid: Uuid,
        }

        impl Drop for PendingGuard<'_> {
            fn drop(&mut self) {
                self.pending.remove(&self.reqid);
            }
        }

        let _guard = PendingGuard { pending: &self.pending, reqid };
        // Registered before the check: a reader exiting after this point
        // clears the entry and wakes us.
        if !self.alive.load(Ordering::SeqCst) {
            bail!("Executor is not running");
        }

        let generate = Request::Generate(Generate {
            reqid,
            input_ids: &inputs.input_ids,
            attention_mask: &inputs.attention_mask,
            gencfg: &inputs.gencfg,
        });
        write_msg(&mut *self.stdin.lock(), &generate)?;

        let mut output_ids = inputs.input_ids.clone();
        loop {
            let chunk = rx
                .recv()
                .map_err(|_| anyhow!("Executor exited during generation"))?;
            if let Some(e) = chunk.error {
                bail!("Executor failed: {}", e);
            }
            for token_id in chunk.token_ids {
                output_ids.push(token_id);
                if let Some(on_token) = on_token.as_mut() {
                    on_token(token_id);
                }
            }
            match chunk.finish_reason {
                comm::FinishReason::NotFinished => continue,
                comm::FinishReason::Error => {
                    bail!("Executor reported a generation error")
                }
                comm::FinishReason::Stop | comm::FinishReason::Length => break,
            }
        }
        Ok(output_ids)
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        let _ = write_msg(
            &mut *self.stdin.lock(),
            &Request::Shutdown(Shutdown {}),
        );
        let mut child = self.child.lock();
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!(%status, "Executor exited.");
                    return;
                }
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                _ => break,
            }
        }
        warn!("Executor did not exit in time; killing it.");
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Body of the reader thread. Once the output stream ends or breaks, every
/// waiting generation is failed and no new one is accepted.
fn read_loop<R: Read>(reader: &mut R, pending: &Pending, alive: &AtomicBool) {
    if let Err(e) = route_chunks(reader, pending) {
        error!(cause = %e, "Executor output stream broken.");
    }
    alive.store(false, Ordering::SeqCst);
    pending.clear();
}

/// Forwards every chunk to the sender registered under its request id until
/// the stream ends. A frame that is not a chunk cannot be attributed to any
/// request, so it ends the stream with an error.
fn route_chunks<R: Read>(reader: &mut R, pending: &Pending) -> anyhow::Result<()> {
    while let Some(buf) = read_frame(reader)? {
        let chunk = decode_msg::<comm::TokenChunk>(&buf)
            .context("Executor sent an unroutable reply")?;
        match pending.get(&chunk.request_id) {
            Some(tx) => {
                let _ = tx.send(chunk);
            }
            None => {
                warn!(request_id = %chunk.request_id, "Chunk for unknown request.");
            }
        }
    }
    Ok(())
}

fn write_msg<W: Write>(writer: &mut W, msg: &Request<'_>) -> anyhow::Result<()> {
    let bin = rmp_serde::to_vec_named(msg)?;
    let len = bin.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&bin)?;
    writer.flush()?;
    Ok(())
}

fn read_msg<T: DeserializeOwned, R: Read>(reader: &mut R) -> anyhow::Result<T> {
    let buf = read_frame(reader)?
        .ok_or_else(|| anyhow!("Executor closed its output"))?;
    decode_msg(&buf)
}

/// Returns `None` on a clean end of stream between frames.
fn read_frame<R: Read>(reader: &mut R) -> anyhow::Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None)
        }
        Err(e) => return Err(e.into()),
    }
    let mut buf = vec![0; u32::from_le_bytes(len) as usize];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

fn decode_msg<T: DeserializeOwned>(buf: &[u8]) -> anyhow::Result<T> {
    let res: Result<T, String> = rmp_serde::from_slice(buf)?;
    res.map_err(|err| anyhow!(err))
}
