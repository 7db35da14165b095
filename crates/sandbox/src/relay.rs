//! Incremental line reader over the sandbox's output pipes.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;

use crate::error::ExecError;

const LINE_BUFFER: usize = 256;
/// Longer lines are split into chunks of this size.
pub const MAX_LINE_BYTES: u64 = 64 * 1024;

#[derive(Debug)]
pub enum Relayed {
    Line(String),
    /// Nothing arrived within the wait; the stream is still open.
    Idle,
    /// Every pipe reached end of file.
    Closed,
    Failed(io::Error),
}

/// Fans stdout and stderr of a sandbox into one ordered line channel. Each pipe
/// is drained by its own task so a quiet stderr never stalls stdout.
pub struct OutputRelay {
    lines: mpsc::Receiver<io::Result<String>>,
}

impl OutputRelay {
    pub fn attach(child: &mut Child) -> Result<Self, ExecError> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::Internal("sandbox missing stdout".to_owned()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecError::Internal("sandbox missing stderr".to_owned()))?;
        let (sender, lines) = mpsc::channel(LINE_BUFFER);
        spawn_reader(stdout, sender.clone());
        spawn_reader(stderr, sender);
        Ok(Self { lines })
    }

    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (sender, lines) = mpsc::channel(LINE_BUFFER);
        spawn_reader(reader, sender);
        Self { lines }
    }

    /// Waits at most `wait` for the next line.
    pub async fn next_within(&mut self, wait: Duration) -> Relayed {
        match tokio::time::timeout(wait, self.lines.recv()).await {
            Ok(Some(Ok(line))) => Relayed::Line(line),
            Ok(Some(Err(err))) => Relayed::Failed(err),
            Ok(None) => Relayed::Closed,
            Err(_) => Relayed::Idle,
        }
    }
}

fn spawn_reader<R>(reader: R, sender: mpsc::Sender<io::Result<String>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut carry = Vec::new();
        loop {
            buf.clear();
            buf.append(&mut carry);
            let read = (&mut reader)
                .take(MAX_LINE_BYTES)
                .read_until(b'\n', &mut buf)
                .await;
            let item = match read {
                Ok(0) if buf.is_empty() => break,
                // End of file with a dangling partial character.
                Ok(0) => Ok(decode_line(&buf)),
                Ok(len) => {
                    // Hitting the limit mid-line means the line continues.
                    if len as u64 == MAX_LINE_BYTES && !buf.ends_with(b"\n") {
                        carry = split_partial_char(&mut buf);
                    }
                    Ok(decode_line(&buf))
                }
                Err(err) => Err(err),
            };
            let failed = item.is_err();
            if sender.send(item).await.is_err() || failed {
                break;
            }
        }
    });
}

/// Splits off a UTF-8 sequence cut short at the end of `buf`, so a chunk
/// boundary never lands inside a character.
fn split_partial_char(buf: &mut Vec<u8>) -> Vec<u8> {
    let tail = buf.len().saturating_sub(3);
    let Some(lead) = (tail..buf.len()).rev().find(|&idx| buf[idx] & 0xC0 != 0x80) else {
        return Vec::new();
    };
    match std::str::from_utf8(&buf[lead..]) {
        Err(err) if err.error_len().is_none() => buf.split_off(lead),
        _ => Vec::new(),
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
