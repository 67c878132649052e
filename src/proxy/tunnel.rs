//! Byte relays for CONNECT tunnels.
//!
//! Each tunnel runs two mediator tasks, one per direction. A mediator
//! copies until its source reaches end of stream, any error occurs, or the
//! shared terminate signal fires. The tunnel owner watches both tasks and
//! terminates the opposite direction as soon as one side finishes, tearing
//! the whole tunnel down together.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

const RELAY_BUF: usize = 4096;

/// Copies bytes from `src` to `dst` until EOF, error or termination.
/// Returns the number of bytes relayed.
pub async fn mediate<R, W>(
    mut src: R,
    mut dst: W,
    mut terminate: watch::Receiver<bool>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; RELAY_BUF];
    let mut relayed = 0u64;
    loop {
        if *terminate.borrow() {
            break;
        }
        tokio::select! {
            changed = terminate.changed() => {
                if changed.is_err() || *terminate.borrow() {
                    break;
                }
            }
            read = src.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if dst.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                        relayed += n as u64;
                    }
                }
            }
        }
    }
    let _ = dst.flush().await;
    let _ = dst.shutdown().await;
    relayed
}

/// Runs a full bidirectional tunnel between the client stream halves and
/// the origin stream halves. Returns bytes relayed towards the client.
pub async fn run_tunnel<CR, CW, OR, OW>(
    client_read: CR,
    client_write: CW,
    origin_read: OR,
    origin_write: OW,
) -> u64
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    OR: AsyncRead + Unpin + Send + 'static,
    OW: AsyncWrite + Unpin + Send + 'static,
{
    let (terminate_tx, terminate_rx) = watch::channel(false);

    let mut upstream = tokio::spawn(mediate(client_read, origin_write, terminate_rx.clone()));
    let mut downstream = tokio::spawn(mediate(origin_read, client_write, terminate_rx));

    // One direction ending tears down the other.
    let mut to_client = 0u64;
    tokio::select! {
        up = &mut upstream => {
            let _ = up;
            let _ = terminate_tx.send(true);
            if let Ok(n) = downstream.await {
                to_client = n;
            }
        }
        down = &mut downstream => {
            if let Ok(n) = down {
                to_client = n;
            }
            let _ = terminate_tx.send(true);
            let _ = upstream.await;
        }
    }
    to_client
}
