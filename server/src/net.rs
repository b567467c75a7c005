//! TCP accept loop and per-connection task (§5: "each TCP connection is
//! served by one logical I/O task"). Authentication is a pre-dispatch
//! phase: the connection's first frame is always treated as a login
//! request, regardless of its token, since the real 0xA3 INIT handshake's
//! screenname/password encoding is opaque per §1/`Session::init_packet`.
//! This implementation defines its own minimal login body shape
//! (`screenname_len(1) + screenname + password_len(1) + password`),
//! documented in DESIGN.md alongside the other invented wire surrogates.

use crate::config::ServerConfig;
use common::time::timestamp_secs;
use p3core::context::{ConnState, Services};
use p3core::dispatcher;
use p3core::handlers::login::handle_login;
use p3core::registry::DisconnectRequest;
use p3core::session::Platform;
use protocol::frame::{parse_frame, OutboundFrame, ParseOutcome};
use protocol::pacer::PacerHandle;
use slog::{debug, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const READ_CHUNK: usize = 4096;

/// Accepts connections forever, spawning one task per connection. Runs
/// until the listener itself errors (process shutdown).
pub async fn run(listener: TcpListener, services: Arc<Services>, config: Arc<ServerConfig>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(services.logger, "accepted connection"; "peer" => %peer);
                let services = services.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    handle_connection(stream, services, config).await;
                });
            }
            Err(err) => {
                warn!(services.logger, "accept failed"; "error" => %err);
            }
        }
    }
}

/// Parses a login request body (§6 username rule enforced downstream in
/// `handle_login`): two length-prefixed ASCII strings.
fn parse_login_body(body: &[u8]) -> Option<(String, String)> {
    let screenname_len = *body.first()? as usize;
    let screenname_end = 1 + screenname_len;
    let screenname = body.get(1..screenname_end)?;
    let password_len = *body.get(screenname_end)? as usize;
    let password_start = screenname_end + 1;
    let password = body.get(password_start..password_start + password_len)?;

    Some((
        String::from_utf8_lossy(screenname).into_owned(),
        String::from_utf8_lossy(password).into_owned(),
    ))
}

/// Resolves once the connection's in-flight download's `xG` deadline (if
/// any) elapses, yielding the download's generation so the caller can tell
/// an expired wait apart from a download that already moved on. Never
/// resolves while no download is `AwaitingXg` (§5: download `xG` timeout).
async fn xg_timeout(state: &ConnState) -> u64 {
    match state.download.xg_deadline() {
        Some((deadline, generation)) => {
            tokio::time::sleep_until(deadline).await;
            generation
        }
        None => std::future::pending().await,
    }
}

async fn handle_connection(stream: TcpStream, services: Arc<Services>, config: Arc<ServerConfig>) {
    let peer = stream.peer_addr().ok();
    let (mut read_half, mut write_half) = stream.into_split();
    let (pacer, mut write_rx) = PacerHandle::new();

    let writer_logger = services.logger.clone();
    let writer = tokio::spawn(async move {
        while let Some(bytes) = write_rx.recv().await {
            if let Err(err) = write_half.write_all(&bytes).await {
                debug!(writer_logger, "write failed, closing connection"; "error" => %err);
                break;
            }
        }
    });

    let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel();
    let mut state = ConnState::new(timestamp_secs());
    state.session.low_color = config.low_color_default;

    let mut buf = Vec::new();
    let mut read_buf = vec![0u8; READ_CHUNK];
    let mut logged_in = false;

    'connection: loop {
        tokio::select! {
            read_result = read_half.read(&mut read_buf) => {
                match read_result {
                    Ok(0) => break 'connection,
                    Ok(n) => buf.extend_from_slice(&read_buf[..n]),
                    Err(err) => {
                        debug!(services.logger, "read failed, closing connection"; "error" => %err);
                        break 'connection;
                    }
                }
            }
            request = disconnect_rx.recv() => {
                match request {
                    Some(DisconnectRequest::Graceful { message }) => {
                        let frame = OutboundFrame::new(*b"UC", message.into_bytes());
                        pacer.enqueue_and_drain(frame, "disconnect", config.burst);
                        break 'connection;
                    }
                    Some(DisconnectRequest::Force) | None => break 'connection,
                }
            }
            generation = xg_timeout(&state) => {
                state.download.expire_if_still_awaiting(generation);
                warn!(services.logger, "xG timeout fired, download marked failed"; "peer" => ?peer);
                services.note_event(format!("download xG timeout {peer:?}"));
            }
        }

        loop {
            match parse_frame(&buf) {
                ParseOutcome::Frame { frame, consumed } => {
                    pacer.note_received(frame.tx);
                    buf.drain(..consumed);

                    if !logged_in {
                        let Some((screenname, password)) = parse_login_body(&frame.body) else {
                            warn!(services.logger, "malformed login frame, closing connection"; "peer" => ?peer);
                            break 'connection;
                        };

                        match handle_login(
                            &services,
                            &mut state,
                            pacer.clone(),
                            Platform::Unknown,
                            disconnect_tx.clone(),
                            &screenname,
                            &password,
                        )
                        .await
                        {
                            Ok(replaced) => {
                                if let Some(old) = replaced {
                                    info!(services.logger, "login displaced prior session"; "screenname" => old.screenname());
                                }
                                logged_in = true;
                                info!(services.logger, "login succeeded"; "screenname" => %screenname);
                            }
                            Err(err) => {
                                warn!(services.logger, "login failed, closing connection";
                                    "screenname" => %screenname, "error" => %err);
                                break 'connection;
                            }
                        }
                    } else {
                        dispatcher::dispatch(&services, &mut state, frame).await;
                    }
                }
                ParseOutcome::Incomplete => break,
                ParseOutcome::Corrupt => {
                    warn!(services.logger, "corrupt frame, closing connection"; "peer" => ?peer);
                    break 'connection;
                }
            }
        }
    }

    dispatcher::handle_disconnect(&services, &mut state).await;
    writer.abort();
    info!(services.logger, "connection closed"; "peer" => ?peer);
}
