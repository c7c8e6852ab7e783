//! External postprocessor spawn (spec §9 "Postprocessor streams").
//!
//! `query_bytes`'s `postprocess` mode pipes the emitted byte stream through
//! a whitelisted external program. The child's stdout *is* the caller's
//! sink: bytes are forwarded as they arrive, not buffered until the child
//! exits. If the child exits nonzero the operation fails *after* whatever
//! bytes were already forwarded — callers must treat partial output as
//! potentially invalid (spec §9, deliberate, matching the deployed
//! semantics). Stdin is fed from a dedicated thread so a child that writes
//! to stdout before it has finished reading stdin cannot deadlock against
//! this process: `Pipe`'s stdout-reading thread drains the child
//! continuously regardless of how fast the caller is producing input.

use std::io::{Read, Write};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc;
use std::thread::JoinHandle;

use crate::error::{ArkError, Result};

const CHUNK_SIZE: usize = 64 * 1024;

/// A running postprocessor child, mid-stream. Created by [`Pipe::spawn`];
/// the caller feeds it message bytes via [`Pipe::send`] as they're
/// resolved and forwards whatever output has arrived so far via
/// [`Pipe::drain_ready`], then calls [`Pipe::finish`] once there is no more
/// input, which flushes the remaining output and reports the child's exit
/// status.
pub struct Pipe {
    program: String,
    child: Child,
    input_tx: Option<mpsc::Sender<Vec<u8>>>,
    output_rx: mpsc::Receiver<Vec<u8>>,
    writer_handle: JoinHandle<std::io::Result<()>>,
    reader_handle: JoinHandle<std::io::Result<()>>,
}

impl Pipe {
    /// Spawns `program` (which must be one of `whitelist`) with piped
    /// stdin/stdout; stderr is discarded (spec §6 `postprocess`:
    /// "whitelist of external postprocessor program names"). Fails before
    /// spawning if `program` is not whitelisted.
    pub fn spawn(program: &str, args: &[String], whitelist: &[String]) -> Result<Self> {
        if !whitelist.iter().any(|p| p == program) {
            return Err(ArkError::Config(format!(
                "postprocessor {:?} is not in the dataset's whitelist",
                program
            )));
        }

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ArkError::consistency("postprocessor child has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ArkError::consistency("postprocessor child has no stdout"))?;

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>();
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>();

        let writer_handle = std::thread::spawn(move || write_stdin(stdin, input_rx));
        let reader_handle = std::thread::spawn(move || read_stdout(stdout, output_tx));

        Ok(Self {
            program: program.to_string(),
            child,
            input_tx: Some(input_tx),
            output_rx,
            writer_handle,
            reader_handle,
        })
    }

    /// Queues `data` to be written to the child's stdin. Never blocks on
    /// the child's own I/O — the write happens on the dedicated writer
    /// thread.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        let tx = self
            .input_tx
            .as_ref()
            .ok_or_else(|| ArkError::consistency("postprocessor pipe already finished"))?;
        tx.send(data.to_vec()).map_err(|_| {
            ArkError::consistency(format!(
                "postprocessor {:?} closed its stdin early",
                self.program
            ))
        })
    }

    /// Forwards to `sink` whatever output chunks have already arrived,
    /// without blocking for more.
    pub fn drain_ready(&mut self, sink: &mut dyn Write) -> Result<()> {
        while let Ok(chunk) = self.output_rx.try_recv() {
            sink.write_all(&chunk)?;
        }
        Ok(())
    }

    /// Signals end of input, flushes every remaining output chunk to
    /// `sink`, and reports the child's exit status. Bytes already written
    /// to `sink` (by this call or an earlier [`Pipe::drain_ready`]) are
    /// never retracted, even if the child exited nonzero.
    pub fn finish(mut self, sink: &mut dyn Write) -> Result<()> {
        self.input_tx.take();
        let writer_result = self
            .writer_handle
            .join()
            .unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "postprocessor stdin writer thread panicked",
                ))
            });

        let mut write_err = None;
        while let Ok(chunk) = self.output_rx.recv() {
            if let Err(err) = sink.write_all(&chunk) {
                write_err = Some(err);
                break;
            }
        }

        let reader_result = self
            .reader_handle
            .join()
            .unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "postprocessor stdout reader thread panicked",
                ))
            });

        let status = self.child.wait()?;

        if let Some(err) = write_err {
            return Err(err.into());
        }
        writer_result?;
        reader_result?;

        if !status.success() {
            log::warn!(
                "postprocessor {:?} exited with {:?}; bytes already forwarded stand as-is",
                self.program,
                status.code()
            );
            return Err(ArkError::consistency(format!(
                "postprocessor {:?} exited with status {:?}",
                self.program,
                status.code()
            )));
        }
        Ok(())
    }
}

fn write_stdin(mut stdin: impl Write, input_rx: mpsc::Receiver<Vec<u8>>) -> std::io::Result<()> {
    while let Ok(chunk) = input_rx.recv() {
        stdin.write_all(&chunk)?;
    }
    Ok(())
}

fn read_stdout(mut stdout: ChildStdout, output_tx: mpsc::Sender<Vec<u8>>) -> std::io::Result<()> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = stdout.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        if output_tx.send(buf[..n].to_vec()).is_err() {
            // Receiver gone (caller dropped the Pipe without finishing);
            // nothing left to forward to, stop reading.
            return Ok(());
        }
    }
}
