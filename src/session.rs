//! Adapts any reader/writer pair (TLS stream, pipe, file, stdio) to one
//! deadline-capable interface, and runs the per-connection command loop
//! on top of it.

use std::{io, sync::Arc, time::Duration};

use chrono::Local;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    access::Capabilities,
    commands::{self, Bridge, SessionState},
};

pub const GREETING: &str =
    "# Enter \"help\" to get a list of commands.\n# Ctrl-D terminates the connection.\n";

const CHUNK_SIZE: usize = 4096;
const CHUNK_QUEUE: usize = 32;

pub enum ReadChunk {
    Data(Vec<u8>),
    /// The read deadline expired; distinct from EOF so the caller can
    /// replay a repeating command.
    TimedOut,
    Eof,
}

/// A background task reads chunks into a bounded queue; `read_chunk`
/// takes them out under an optional deadline. Dropping the `SessionIo`
/// ends the filler task on its next send.
pub struct SessionIo {
    chunks: mpsc::Receiver<io::Result<Vec<u8>>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    label: String,
    eof: bool,
}

impl SessionIo {
    pub fn new<R, W>(reader: R, writer: W, label: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE);
        tokio::spawn(fill_chunks(reader, tx));
        Self {
            chunks: rx,
            writer: Box::new(writer),
            label: label.into(),
            eof: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn read_chunk(&mut self, deadline: Option<Duration>) -> io::Result<ReadChunk> {
        if self.eof {
            return Ok(ReadChunk::Eof);
        }
        let item = match deadline {
            Some(deadline) => match timeout(deadline, self.chunks.recv()).await {
                Err(_) => return Ok(ReadChunk::TimedOut),
                Ok(item) => item,
            },
            None => self.chunks.recv().await,
        };
        match item {
            None => {
                self.eof = true;
                Ok(ReadChunk::Eof)
            }
            Some(Ok(data)) if data.is_empty() => {
                self.eof = true;
                Ok(ReadChunk::Eof)
            }
            Some(Ok(data)) => Ok(ReadChunk::Data(data)),
            Some(Err(err)) => {
                self.eof = true;
                Err(err)
            }
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }
}

async fn fill_chunks<R>(mut reader: R, tx: mpsc::Sender<io::Result<Vec<u8>>>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    loop {
        let mut buf = vec![0u8; CHUNK_SIZE];
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(Ok(Vec::new())).await;
                return;
            }
            Ok(n) => {
                buf.truncate(n);
                if tx.send(Ok(buf)).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        }
    }
}

/// Runs one command session until EOF or an I/O error. Lines may be
/// separated by newlines or `;`; empty lines are ignored. A command may
/// request a repeat: if nothing new arrives within the delay, the same
/// line runs again; input that is already buffered cancels the repeat.
pub async fn run_session(bridge: Arc<Bridge>, mut io: SessionIo, capabilities: Capabilities) {
    let mut state = SessionState::new(capabilities);

    if let Err(err) = io.write_all(GREETING.as_bytes()).await {
        warn!("{}: cannot send greeting: {err}", io.label());
        return;
    }

    let mut buf: Vec<u8> = Vec::new();
    let mut repeat: Option<Duration> = None;
    let mut repeat_command = String::new();

    'session: loop {
        debug!("{}: receiving", io.label());
        let chunk = match io.read_chunk(repeat).await {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!("{}: read: {err}", io.label());
                break;
            }
        };
        repeat = None;

        let mut at_eof = false;
        match chunk {
            ReadChunk::TimedOut => buf.extend_from_slice(repeat_command.as_bytes()),
            ReadChunk::Data(data) => buf.extend_from_slice(&data),
            ReadChunk::Eof => {
                at_eof = true;
                buf.push(b'\n');
            }
        }

        // ";" separates multiple commands on one line
        for byte in buf.iter_mut() {
            if *byte == b';' {
                *byte = b'\n';
            }
        }

        let mut start = 0;
        while let Some(pos) = buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            let line = String::from_utf8_lossy(&buf[start..end]).trim().to_string();
            start = end + 1;
            if line.is_empty() {
                continue;
            }

            let (reply, wants_repeat) =
                commands::process_line(&bridge, &mut state, &line, Local::now()).await;
            repeat = wants_repeat;
            repeat_command = format!("{line}\n");

            // more input is already waiting: the repeat is obsolete
            if start < buf.len() {
                repeat = None;
            }

            if !reply.is_empty() {
                debug!("{}: reply: {reply}", io.label());
                let mut out = reply;
                out.push('\n');
                if let Err(err) = io.write_all(out.as_bytes()).await {
                    warn!("{}: write: {err}", io.label());
                    break 'session;
                }
            }
        }
        buf.drain(..start);

        if at_eof {
            break;
        }
    }
    debug!("{}: session closed", io.label());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_chunk_returns_data_then_eof() {
        let (client, server) = tokio::io::duplex(256);
        let (read_half, _keep) = tokio::io::split(server);
        let (_, mut write_half) = tokio::io::split(client);
        let mut io = SessionIo::new(read_half, tokio::io::sink(), "test");

        write_half.write_all(b"hello").await.unwrap();
        match io.read_chunk(None).await.unwrap() {
            ReadChunk::Data(data) => assert_eq!(data, b"hello"),
            _ => panic!("expected data"),
        }

        drop(write_half);
        drop(_keep);
        assert!(matches!(io.read_chunk(None).await.unwrap(), ReadChunk::Eof));
        // EOF is sticky
        assert!(matches!(io.read_chunk(None).await.unwrap(), ReadChunk::Eof));
    }

    #[tokio::test]
    async fn read_chunk_times_out_distinctly() {
        let (_client, server) = tokio::io::duplex(256);
        let (read_half, _w) = tokio::io::split(server);
        let mut io = SessionIo::new(read_half, tokio::io::sink(), "test");

        match io
            .read_chunk(Some(Duration::from_millis(20)))
            .await
            .unwrap()
        {
            ReadChunk::TimedOut => {}
            _ => panic!("expected a timeout"),
        }
    }
}
