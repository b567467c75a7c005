//! Token dispatcher (§4.2): routes each inbound frame's 2-byte token to its
//! handler. Unknown tokens are silently dropped; handler errors are logged
//! and swallowed here so a single bad frame never closes the connection
//! (§7 propagation rule).

use crate::context::{ConnState, Services};
use crate::handlers::{chat, dod, im, xfer_download, xfer_upload};
use common::error::HandlerResult;
use protocol::frame::InboundFrame;
use slog::warn;

/// Dispatches one inbound frame, logging and swallowing any handler error.
/// Returns nothing: per §4.2/§7, dispatch never propagates failure upward.
pub async fn dispatch(services: &Services, state: &mut ConnState, frame: InboundFrame) {
    let token = frame.token;
    let result: HandlerResult<()> = match &token {
        b"Aa" => chat::handle_aa(services, state, &frame).await,
        b"ME" | b"CJ" => chat::handle_join(services, state, &frame).await,
        b"CO" => chat::handle_co(services, state, &frame).await,
        b"CL" => chat::handle_cl(services, state, &frame).await,
        b"iS" | b"iT" => im::handle_im(services, state, &frame).await,
        b"fh" => dod::handle_fh(services, state, &frame).await,
        b"f1" => dod::handle_f1(services, state, &frame).await,
        b"f2" => dod::handle_f2(services, state, &frame).await,
        b"K1" => dod::handle_k1(services, state, &frame).await,
        b"xG" => xfer_download::handle_xg(services, state, &frame).await,
        b"th" => xfer_upload::handle_th_response(services, state, &frame).await,
        b"td" => xfer_upload::handle_td_response(services, state, &frame).await,
        b"xK" => {
            // xK is shared between download-cancel and upload-abort; try
            // whichever transfer is actually in flight.
            if state.download.is_active() {
                xfer_download::handle_xk(services, state, &frame).await
            } else {
                xfer_upload::handle_xk(services, state, &frame).await
            }
        }
        b"tf" => {
            if frame.body.first().copied() == Some(0x80) {
                xfer_upload::handle_tf_start(services, state, &frame).await
            } else {
                Ok(())
            }
        }
        b"xd" | b"xb" => xfer_upload::handle_data(services, state, &frame).await,
        b"xe" => xfer_upload::handle_xe(services, state, &frame).await,
        _ => {
            return;
        }
    };

    if let Err(err) = result {
        warn!(services.logger, "handler error, dropping frame";
            "token" => frame.token_str(), "error" => %err);
    }
}

/// Invoked by the connection task on disconnect (§4.9): runs the same
/// chat-departure path CL would, then releases every other per-connection
/// resource in order.
pub async fn handle_disconnect(services: &Services, state: &mut ConnState) {
    chat::leave_chat_if_present(services, state, "disconnect").await;

    if let Some(screenname) = state.screenname().map(str::to_owned) {
        services.registry.unregister(&screenname);
        services.note_event(format!("unregister {screenname}"));
        if state.session.ephemeral {
            services.guests.release(&screenname);
        }
    }

    state.download.cancel_all();
    state.upload.cancel_all();

    if let Some(conn) = &state.conn {
        conn.clear_deferred();
    }

    state.session.clear_password();
}
