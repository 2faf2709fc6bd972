//! HTTP/1.1 upgrade to the Noise control channel.
//!
//! The client sends its Noise initiation in the `X-Tailscale-Handshake`
//! header of an `Upgrade: tailscale-control-protocol` request. The server
//! answers the initiation, optionally writes the early payload, and from
//! then on speaks HTTP/2 inside the secure channel.

use crate::body::{empty, text_response, ResponseBody};
use crate::error::{HttpError, ServerError};
use crate::server::ControlState;
use crate::session::NoiseSession;
use data_encoding::BASE64;
use http::header::{HeaderValue, CONNECTION, UPGRADE};
use http::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info_span, trace, warn, Instrument};
use ts2021_core::{CapabilityVersion, ControlResult, ServerHandshake, EARLY_NOISE_CAPABILITY_VERSION};

/// Path the upgrade request is sent to.
pub const TS2021_UPGRADE_PATH: &str = "/ts2021";

/// Value of the `Upgrade` header.
pub const UPGRADE_PROTOCOL: &str = "tailscale-control-protocol";

/// Header carrying the base64 Noise initiation.
pub const HANDSHAKE_HEADER: &str = "x-tailscale-handshake";

/// Buffer between the secure channel pumps and the HTTP/2 server.
const STREAM_BUFFER: usize = 64 * 1024;

/// Writes the early payload for a connection.
///
/// Called once per connection, after the Noise response and before any
/// HTTP/2 byte, and only for clients at or above
/// [`EARLY_NOISE_CAPABILITY_VERSION`]. The writer buffers; its contents go
/// out through the secure channel in a single write.
pub trait EarlyNoiseHook: Send + Sync {
    fn early_noise(&self, protocol_version: CapabilityVersion, writer: &mut dyn Write) -> ControlResult<()>;
}

/// Collect the early payload bytes for `protocol_version`.
///
/// Older clients get nothing and the hook is not called.
pub fn early_payload(hook: &dyn EarlyNoiseHook, protocol_version: CapabilityVersion) -> ControlResult<Vec<u8>> {
    let mut buf = Vec::new();
    if protocol_version >= EARLY_NOISE_CAPABILITY_VERSION {
        hook.early_noise(protocol_version, &mut buf)?;
    }
    Ok(buf)
}

/// Handle a request to [`TS2021_UPGRADE_PATH`].
///
/// The initiation is processed before answering, so a bad handshake or a
/// failing early hook is reported as a plain 500. On success the response is
/// `101 Switching Protocols` and a spawned task takes over the connection.
pub fn noise_upgrade_handler<B>(
    state: &Arc<ControlState>,
    mut req: Request<B>,
    remote: SocketAddr,
) -> Response<ResponseBody>
where
    B: Send + 'static,
{
    trace!(%remote, "noise upgrade handler");

    let Some(upgrade) = req.headers().get(UPGRADE) else {
        warn!(
            %remote,
            "No Upgrade header in TS2021 request. If the server is behind a reverse proxy, \
             make sure it is configured to pass WebSockets through."
        );
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error");
    };
    if upgrade.as_bytes() != UPGRADE_PROTOCOL.as_bytes() {
        return HttpError::bad_request("unsupported upgrade protocol").into_response();
    }

    let Some(init) = req.headers().get(HANDSHAKE_HEADER) else {
        return HttpError::bad_request("missing handshake header").into_response();
    };
    let init = match BASE64.decode(init.as_bytes()) {
        Ok(init) => init,
        Err(e) => {
            return HttpError::bad_request("invalid handshake header")
                .with_source(e)
                .into_response();
        }
    };

    let handshake = match ServerHandshake::accept(&state.noise_private_key, &init) {
        Ok(hs) => hs,
        Err(e) => {
            return HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, "noise upgrade failed")
                .with_source(e)
                .into_response();
        }
    };

    let machine_key = handshake.peer();
    let version = CapabilityVersion::from(handshake.protocol_version());
    let session = Arc::new(NoiseSession::new(state.clone(), machine_key, version));

    let early = match early_payload(session.as_ref(), version) {
        Ok(early) => early,
        Err(e) => {
            return HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, "noise upgrade failed")
                .with_source(e)
                .into_response();
        }
    };

    // The upgrade only resolves after the 101 below has been written, so
    // the rest runs on its own task.
    tokio::task::spawn(
        async move {
            match hyper::upgrade::on(&mut req).await {
                Ok(upgraded) => {
                    if let Err(err) = serve_upgraded(session, handshake, early, TokioIo::new(upgraded)).await {
                        warn!(error = %err, "noise connection failed");
                    } else {
                        debug!("noise connection closed");
                    }
                }
                Err(err) => warn!(error = %err, "upgrade error"),
            }
        }
        .instrument(info_span!(
            "noise",
            %remote,
            machine_key = %machine_key.short_string(),
            version = %version
        )),
    );

    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static(UPGRADE_PROTOCOL));
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    response
}

/// Finish the handshake on the hijacked stream and serve the session.
async fn serve_upgraded<T>(
    session: Arc<NoiseSession>,
    handshake: ServerHandshake,
    early: Vec<u8>,
    io: T,
) -> Result<(), ServerError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut conn = handshake.finish(io).await?;
    if !early.is_empty() {
        conn.write_all(&early).await?;
    }

    let (stream, mut pumps) = conn.into_stream(STREAM_BUFFER);
    let cancel = session.cancel_token().clone();
    let serve = session.serve(stream);
    tokio::pin!(serve);

    tokio::select! {
        res = &mut serve => res?,
        res = pumps.inbound_closed() => {
            match res {
                Ok(()) => debug!("client closed the secure channel"),
                Err(e) => debug!(error = %e, "secure channel read failed"),
            }
            // Stop in-flight requests; HTTP/2 sees EOF on its own.
            cancel.cancel();
            serve.await?;
        }
    }
    if let Err(e) = pumps.finish().await {
        debug!(error = %e, "secure channel closed uncleanly");
    }
    Ok(())
}
