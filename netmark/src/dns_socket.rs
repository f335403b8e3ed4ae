//! DNS proxy socket plumbing.
//!
//! Each connection carries one shell-quoted request line. The effective
//! netId is computed under the controller read lock with `for_dns` set;
//! the resolver call itself runs on the request's own task so a slow
//! upstream never stalls the listener.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::RwLock;

use netmark_lib::admin::tokenize;
use netmark_lib::dns::{self, SystemResolver};

use crate::ProdNetworkController;

pub async fn serve(
    listener: UnixListener,
    network: Arc<RwLock<ProdNetworkController>>,
    resolver: Arc<SystemResolver>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let network = network.clone();
                let resolver = resolver.clone();
                tokio::spawn(async move {
                    handle_client(stream, network, resolver).await;
                });
            }
            Err(e) => {
                tracing::error!(error = ?e, "error accepting dns proxy connection");
            }
        }
    }
}

async fn handle_client(
    stream: tokio::net::UnixStream,
    network: Arc<RwLock<ProdNetworkController>>,
    resolver: Arc<SystemResolver>,
) {
    let uid = match stream.peer_cred() {
        Ok(cred) => cred.uid(),
        Err(e) => {
            tracing::debug!(error = ?e, "cannot read peer credentials");
            return;
        }
    };

    let (reader_half, mut writer_half) = stream.into_split();
    let line = match BufReader::new(reader_half).lines().next_line().await {
        Ok(Some(line)) => line,
        Ok(None) => return,
        Err(e) => {
            tracing::debug!(error = ?e, "error reading dns request");
            return;
        }
    };

    let request = tokenize(&line)
        .map_err(|e| dns::Error::BadRequest(e.to_string()))
        .and_then(|argv| dns::parse_request(&argv));
    let request = match request {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, uid, "rejecting dns request");
            let mut reply = Vec::new();
            reply.extend_from_slice(&dns::encode_status(-libc::EINVAL));
            reply.extend_from_slice(&dns::encode_frame(&[]));
            let _ = writer_half.write_all(&reply).await;
            return;
        }
    };

    let net_id = {
        let controller = network.read().await;
        controller.get_network_for_user(uid, request.requested_net_id(), true)
    };
    tracing::debug!(uid, %net_id, request = ?request, "dns request");

    let reply = dns::run_request(&request, net_id, resolver.as_ref()).await;
    if let Err(e) = writer_half.write_all(&reply).await {
        tracing::debug!(error = ?e, "error writing dns reply");
    }
}
