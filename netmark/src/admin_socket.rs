//! Admin socket plumbing: per-client line loop and broadcast fan-out.
//!
//! Connection tasks do no parsing and hold no controller state; every line
//! travels to the main loop over one channel, which is what serializes all
//! mutations. Replies come back per-request over a oneshot; unsolicited
//! 600-series broadcasts are fanned out to every connected client.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc, oneshot};

use netmark_lib::admin::Reply;

pub struct AdminRequest {
    pub line: String,
    pub resp: oneshot::Sender<Reply>,
}

pub async fn serve(
    listener: UnixListener,
    cmd_sender: mpsc::Sender<AdminRequest>,
    broadcasts: broadcast::Sender<String>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let cmd_sender = cmd_sender.clone();
                let broadcast_receiver = broadcasts.subscribe();
                tokio::spawn(async move {
                    handle_client(stream, cmd_sender, broadcast_receiver).await;
                });
            }
            Err(e) => {
                tracing::error!(error = ?e, "error accepting admin connection");
            }
        }
    }
}

async fn handle_client(
    stream: tokio::net::UnixStream,
    cmd_sender: mpsc::Sender<AdminRequest>,
    mut broadcasts: broadcast::Receiver<String>,
) {
    let (reader_half, mut writer_half) = stream.into_split();
    let mut lines = BufReader::new(reader_half).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => return,
                    Err(e) => {
                        tracing::debug!(error = ?e, "error reading admin line");
                        return;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let (resp_sender, resp_receiver) = oneshot::channel();
                if cmd_sender
                    .send(AdminRequest { line, resp: resp_sender })
                    .await
                    .is_err()
                {
                    tracing::warn!("dispatcher gone, closing admin connection");
                    return;
                }

                // The dispatcher always answers; a dropped sender only
                // happens at shutdown.
                let Ok(reply) = resp_receiver.await else { return };
                for reply_line in &reply.lines {
                    let wire = format!("{} {} {}\n", reply_line.code.as_u16(), reply.cookie, reply_line.message);
                    if writer_half.write_all(wire.as_bytes()).await.is_err() {
                        // The client went away; its command has already
                        // been applied, only the reply is discarded.
                        return;
                    }
                }
            }
            event = broadcasts.recv() => {
                match event {
                    Ok(line) => {
                        if writer_half.write_all(line.as_bytes()).await.is_err()
                            || writer_half.write_all(b"\n").await.is_err()
                        {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "admin client lagged behind broadcasts");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}
