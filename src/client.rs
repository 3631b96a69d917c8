//! Terminal client for `linerelay join`
//!
//! Sends each stdin line to the relay and prints whatever the relay sends
//! back until either side closes.

use std::io::BufRead;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::relay::frame::strip_terminator;
use crate::relay::LineReader;
use crate::shutdown;
use crate::Result;

const MAX_INPUT_LINE: usize = 64 * 1024;
const INPUT_QUEUE: usize = 16;

/// How a client session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Local input reached EOF
    InputClosed,
    /// The relay closed the connection
    ServerClosed,
    Interrupted,
}

/// Connect to `addr` and bridge it to stdin/stdout.
pub async fn join(addr: &str, connect_timeout: Duration) -> Result<SessionEnd> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .with_context(|| format!("Timed out connecting to {}", addr))?
        .with_context(|| format!("Failed to connect to {}", addr))?;
    info!("Connected to {} as {}", addr, stream.local_addr()?);

    let (server_rx, server_tx) = stream.into_split();
    let interrupted = shutdown::termination_signal()?;
    let input = stdin_lines()?;

    tokio::select! {
        end = session(input, tokio::io::stdout(), server_rx, server_tx) => end,
        _ = interrupted => Ok(SessionEnd::Interrupted),
    }
}

/// Read stdin on its own thread.
///
/// A blocking stdin read cannot be cancelled, and a runtime blocking task
/// would hold up runtime shutdown until the next keypress. A plain thread
/// is simply abandoned when the process exits.
fn stdin_lines() -> Result<mpsc::Receiver<Bytes>> {
    let (tx, rx) = mpsc::channel(INPUT_QUEUE);
    std::thread::Builder::new()
        .name("linerelay-stdin".to_string())
        .spawn(move || read_lines_blocking(std::io::stdin().lock(), tx))
        .context("Failed to spawn stdin reader")?;
    Ok(rx)
}

/// Forward complete lines from `reader` into `tx` until EOF, a read error,
/// or the receiver going away.
fn read_lines_blocking<R: BufRead>(mut reader: R, tx: mpsc::Sender<Bytes>) {
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) if line.last() != Some(&b'\n') => {
                debug!("Discarding {} bytes of unterminated input", line.len());
                break;
            }
            Ok(n) if n > MAX_INPUT_LINE => {
                warn!("Skipping input line of {} bytes (limit {})", n, MAX_INPUT_LINE);
            }
            Ok(_) => {
                if tx.blocking_send(strip_terminator(std::mem::take(&mut line))).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Failed to read input: {}", e);
                break;
            }
        }
    }
}

/// Forward lines from an async `reader` into a channel, the way
/// [`stdin_lines`] does for stdin.
pub fn forward_lines<R>(reader: R) -> mpsc::Receiver<Bytes>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(INPUT_QUEUE);
    tokio::spawn(async move {
        let mut lines = LineReader::new(reader, MAX_INPUT_LINE);
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read input: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

/// Pump lines from `input` to the relay and relay output to `output`.
/// The session ends with `InputClosed` once every sender of `input` is gone.
pub async fn session<O, R, W>(
    mut input: mpsc::Receiver<Bytes>,
    mut output: O,
    mut server_rx: R,
    mut server_tx: W,
) -> Result<SessionEnd>
where
    O: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            line = input.recv() => match line {
                Some(line) => {
                    server_tx.write_all(&line).await?;
                    server_tx.write_all(b"\n").await?;
                    server_tx.flush().await?;
                }
                None => {
                    debug!("Input closed, ending session");
                    server_tx.shutdown().await?;
                    return Ok(SessionEnd::InputClosed);
                }
            },
            read = server_rx.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    output.flush().await?;
                    info!("Relay closed the connection");
                    return Ok(SessionEnd::ServerClosed);
                }
                output.write_all(&buf[..n]).await?;
                output.flush().await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_input_lines_reach_server() {
        let input = tokio_test::io::Builder::new()
            .read(b"hi\n")
            .read(b"there\r\n")
            .build();
        let (server_side, client_tx) = tokio::io::duplex(256);
        // the relay stays silent but open
        let (_relay_out, client_rx) = tokio::io::duplex(256);

        let mut output = Vec::new();
        let end = session(forward_lines(input), &mut output, client_rx, client_tx)
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::InputClosed);
        assert!(output.is_empty());

        let mut sent = String::new();
        let mut server_side = server_side;
        server_side.read_to_string(&mut sent).await.unwrap();
        assert_eq!(sent, "hi\nthere\n");
    }

    #[tokio::test]
    async fn test_relay_output_is_printed() {
        // input that never produces anything
        let (_keyboard, input) = mpsc::channel(1);
        let (mut relay_out, client_rx) = tokio::io::duplex(256);
        let (_server_side, client_tx) = tokio::io::duplex(256);

        relay_out.write_all(b"1.2.3.4:5 -> hey\n").await.unwrap();
        drop(relay_out);

        let mut output = Vec::new();
        let end = session(input, &mut output, client_rx, client_tx).await.unwrap();
        assert_eq!(end, SessionEnd::ServerClosed);
        assert_eq!(output, b"1.2.3.4:5 -> hey\n");
    }

    #[tokio::test]
    async fn test_server_close_ends_session_while_input_is_idle() {
        // a keyboard nobody types on, held open for the whole test
        let (keyboard, input) = mpsc::channel(1);
        let (relay_out, client_rx) = tokio::io::duplex(64);
        let (_server_side, client_tx) = tokio::io::duplex(64);
        drop(relay_out);

        let mut output = Vec::new();
        let end = timeout(
            Duration::from_secs(1),
            session(input, &mut output, client_rx, client_tx),
        )
        .await
        .expect("session should end when the relay closes")
        .unwrap();
        assert_eq!(end, SessionEnd::ServerClosed);
        drop(keyboard);
    }

    #[tokio::test]
    async fn test_blocking_reader_forwards_complete_lines() {
        let (tx, mut rx) = mpsc::channel(8);
        let input = std::io::Cursor::new(b"one\r\n\ntwo\npartial".to_vec());
        tokio::task::spawn_blocking(move || read_lines_blocking(input, tx))
            .await
            .unwrap();

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["one", "", "two"]);
    }

    #[tokio::test]
    async fn test_blocking_reader_stops_when_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let input = std::io::Cursor::new(b"a\nb\nc\n".to_vec());
        // returns instead of blocking on a full channel
        timeout(
            Duration::from_secs(1),
            tokio::task::spawn_blocking(move || read_lines_blocking(input, tx)),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_join_unreachable_address_fails() {
        // bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(join(&addr.to_string(), Duration::from_secs(1)).await.is_err());
    }
}
