//! `/machine/register` over the Noise channel.

use crate::body::{full, json_response, read_body, BoxError, ResponseBody};
use crate::error::HttpError;
use crate::gate::reject_unsupported;
use crate::session::NoiseSession;
use futures_util::future::BoxFuture;
use http::{Request, Response, StatusCode};
use hyper::body::Body;
use thiserror::Error;
use tracing::{debug, trace, warn};
use ts2021_core::tailcfg::{RegisterRequest, RegisterResponse};
use ts2021_core::MachinePublic;

/// Why a registration was refused.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("registration failed: {0}")]
    Internal(#[source] BoxError),
}

impl From<RegisterError> for HttpError {
    fn from(err: RegisterError) -> Self {
        match err {
            RegisterError::Unauthorized(msg) => HttpError::new(StatusCode::UNAUTHORIZED, msg),
            RegisterError::BadRequest(msg) => HttpError::bad_request(msg),
            RegisterError::Internal(source) => HttpError::internal(source),
        }
    }
}

/// Decides the outcome of a registration request.
pub trait Registrar: Send + Sync {
    fn register(
        &self,
        request: RegisterRequest,
        machine_key: MachinePublic,
    ) -> BoxFuture<'_, Result<RegisterResponse, RegisterError>>;
}

impl NoiseSession {
    /// Handle a registration request.
    ///
    /// The registrar runs before the version gate; an unsupported client gets
    /// the gate's 400 whatever the registrar decided.
    pub async fn handle_register<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        trace!(machine_key = %self.machine_key().short_string(), "registration request");

        let body = match read_body(req.into_body()).await {
            Ok(body) => body,
            Err(e) => return HttpError::internal(e).into_response(),
        };
        let request: RegisterRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "undecodable registration request");
                return HttpError::internal(e).into_response();
            }
        };

        let version = request.version;
        let node_key = request.node_key;
        self.record_node_key(node_key);

        let outcome = self
            .state()
            .registrar
            .register(request, self.machine_key())
            .await
            .map_err(|e| {
                warn!(
                    error = %e,
                    machine_key = %self.machine_key().short_string(),
                    node_key = %node_key.short_string(),
                    "registration failed"
                );
                HttpError::from(e)
            })
            .and_then(|resp| serde_json::to_vec(&resp).map_err(HttpError::internal));

        if let Err(rejection) = reject_unsupported(version, &self.machine_key(), &node_key) {
            return rejection.into_response();
        }

        match outcome {
            Ok(json) => json_response(StatusCode::OK, full(json)),
            Err(e) => e.into_response(),
        }
    }
}
