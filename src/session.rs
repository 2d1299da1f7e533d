//! The Client Session: one task per TCP connection.
//!
//! Command replies and streamed hit lines share one outbound channel so
//! a single writer task serializes everything onto the socket. A
//! client reading `respond\n...` never gets a hit line spliced into the
//! middle of it, since both kinds of output go through the same
//! `mpsc::Sender<String>` the Manager also holds for this client.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::manager::ManagerHandle;
use crate::protocol;

const OUTGOING_CAPACITY: usize = 256;

pub async fn run(stream: TcpStream, peer: std::net::SocketAddr, manager: ManagerHandle) {
    let (read_half, mut write_half) = stream.into_split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(OUTGOING_CAPACITY);

    let client_id = manager.connect(outgoing_tx.clone()).await;
    tracing::info!(%peer, client = client_id, "client connected");

    let writer = tokio::spawn(async move {
        while let Some(line) = outgoing_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(%peer, client = client_id, error = %err, "read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let frame = match protocol::parse_line(&line) {
            Ok(cmd) => {
                let is_select = cmd.is_select();
                match manager.dispatch(client_id, cmd).await {
                    Ok(body) if is_select => body,
                    Ok(body) => format!("respond\n{body}"),
                    Err(err) if is_select => err.to_string(),
                    Err(err) => format!("respond\n{err}"),
                }
            }
            Err(err) => format!("respond\n{err}"),
        };
        if outgoing_tx.send(frame).await.is_err() {
            break;
        }
    }

    drop(outgoing_tx);
    let _ = writer.await;
    manager.disconnect(client_id).await;
    tracing::info!(%peer, client = client_id, "client disconnected");
}
