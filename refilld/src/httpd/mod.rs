//! The REST surface the pump-station terminal and the fleet operator
//! app talk to (spec §6). Built the way `drmemd`'s GraphQL server is
//! built -- one shared context injected into every filter with
//! `warp::any().map(move || ctxt.clone())`, filters stitched together
//! with `.or()`, served with `warp::serve(filter).run(addr)` -- just
//! over plain JSON routes instead of a GraphQL schema.

mod auth;
mod dto;

use crate::supervisor::protocol::{OperationRequest, OperatorCommand};
use auth::AuthState;
use dto::{
    AuthRequest, DrfSubmitRequest, HlsResponse, KilometersValue, OperationRequestDto,
    OperationResponseDto, StateResponseDto, UartRequest,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::warn;
use warp::http::StatusCode;
use warp::multipart::FormData;
use warp::{Filter, Rejection, Reply};

use crate::supervisor::protocol::StateSnapshot;

#[derive(Clone)]
pub struct HttpContext {
    operator: mpsc::Sender<OperatorCommand>,
    snapshot: watch::Receiver<StateSnapshot>,
    auth: Arc<AuthState>,
    uploads_dir: PathBuf,
}

impl HttpContext {
    pub fn new(
        operator: mpsc::Sender<OperatorCommand>,
        snapshot: watch::Receiver<StateSnapshot>,
        shared_secret: String,
        uploads_dir: PathBuf,
    ) -> Self {
        HttpContext {
            operator,
            snapshot,
            auth: Arc::new(AuthState::new(shared_secret)),
            uploads_dir,
        }
    }
}

/// Builds the full route tree and serves it until the process exits.
pub async fn serve(ctxt: HttpContext, bind: SocketAddr) {
    warp::serve(routes(ctxt)).run(bind).await
}

fn routes(ctxt: HttpContext) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let with_ctxt = warp::any().map(move || ctxt.clone());

    let fill = warp::path!("api" / "fill")
        .and(warp::post())
        .and(with_ctxt.clone())
        .and_then(handle_fill);

    let drf_submit = warp::path!("api" / "drf-submit")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_ctxt.clone())
        .and_then(handle_drf_submit);

    let state = warp::path!("api" / "state")
        .and(warp::get())
        .and(with_ctxt.clone())
        .and_then(handle_state);

    let operation = warp::path!("api" / "operation")
        .and(warp::post())
        .and(warp::header::optional::<String>("x-session-token"))
        .and(warp::body::json())
        .and(with_ctxt.clone())
        .and_then(handle_operation);

    let auth = warp::path!("api" / "auth")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_ctxt.clone())
        .and_then(handle_auth);

    let hls = warp::path!("api" / "hls" / u32)
        .and(warp::get())
        .and(with_ctxt.clone())
        .and_then(handle_hls);

    let uart = warp::path!("api" / "uart")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_ctxt.clone())
        .and_then(handle_uart);

    let upload = warp::path!("api" / "upload")
        .and(warp::post())
        .and(warp::multipart::form().max_length(16 * 1024 * 1024))
        .and(with_ctxt.clone())
        .and_then(handle_upload);

    fill.or(drf_submit)
        .or(state)
        .or(operation)
        .or(auth)
        .or(hls)
        .or(uart)
        .or(upload)
        .recover(handle_rejection)
        .boxed()
}

async fn ask<T>(
    tx: &mpsc::Sender<OperatorCommand>,
    build: impl FnOnce(oneshot::Sender<T>) -> OperatorCommand,
) -> Option<T> {
    let (reply_tx, reply_rx) = oneshot::channel();
    if tx.send(build(reply_tx)).await.is_err() {
        return None;
    }
    reply_rx.await.ok()
}

fn reply_snapshot(snapshot: StateSnapshot, status: StatusCode) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(&StateResponseDto::from(snapshot)), status)
}

async fn handle_fill(ctxt: HttpContext) -> Result<impl Reply, Infallible> {
    match ask(&ctxt.operator, OperatorCommand::Fill).await {
        Some(Ok(snap)) => Ok(reply_snapshot(snap, StatusCode::OK)),
        Some(Err(r)) => Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "error": r.error, "state": r.current_state })),
            StatusCode::CONFLICT,
        )),
        None => Ok(service_unavailable()),
    }
}

async fn handle_drf_submit(body: DrfSubmitRequest, ctxt: HttpContext) -> Result<impl Reply, Infallible> {
    let kilometers = match body.kilometers {
        KilometersValue::Int(n) => n,
        KilometersValue::Str(s) => match s.parse::<i64>() {
            Ok(n) => n,
            Err(_) => {
                return Ok(warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({ "error": "kilometers must be an integer" })),
                    StatusCode::BAD_REQUEST,
                ))
            }
        },
    };

    let result = ask(&ctxt.operator, |reply| OperatorCommand::DrfSubmit { kilometers, reply }).await;

    match result {
        Some(Ok(snap)) => Ok(reply_snapshot(snap, StatusCode::OK)),
        Some(Err(r)) => Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "error": r.error, "state": r.current_state })),
            StatusCode::BAD_REQUEST,
        )),
        None => Ok(service_unavailable()),
    }
}

async fn handle_state(ctxt: HttpContext) -> Result<impl Reply, Infallible> {
    match ask(&ctxt.operator, OperatorCommand::PollState).await {
        Some(snap) => Ok(reply_snapshot(snap, StatusCode::OK)),
        None => Ok(service_unavailable()),
    }
}

async fn handle_operation(
    token: Option<String>,
    body: OperationRequestDto,
    ctxt: HttpContext,
) -> Result<impl Reply, Infallible> {
    if !token.map(|t| ctxt.auth.is_valid(&t)).unwrap_or(false) {
        return Ok(warp::reply::with_status(
            warp::reply::json(&OperationResponseDto::invalid_token()),
            StatusCode::UNAUTHORIZED,
        ));
    }

    let request: OperationRequest = body.into();
    let response = ask(&ctxt.operator, |reply| OperatorCommand::Operation { request, reply }).await;

    match response {
        Some(resp) => Ok(warp::reply::with_status(
            warp::reply::json(&OperationResponseDto::from(resp)),
            StatusCode::OK,
        )),
        None => Ok(service_unavailable()),
    }
}

async fn handle_auth(body: AuthRequest, ctxt: HttpContext) -> Result<impl Reply, Infallible> {
    if ctxt.auth.verify(&body.username, &body.password) {
        let token = ctxt.auth.issue_token();
        Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "token": token })),
            StatusCode::OK,
        ))
    } else {
        Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "error": "invalid credentials" })),
            StatusCode::UNAUTHORIZED,
        ))
    }
}

async fn handle_hls(socket_id: u32, ctxt: HttpContext) -> Result<impl Reply, Infallible> {
    if socket_id != 3 && socket_id != 4 {
        return Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "error": "socketId must be 3 or 4" })),
            StatusCode::BAD_REQUEST,
        ));
    }

    let result = ask(&ctxt.operator, |reply| OperatorCommand::HlsRead { socket_id, reply }).await;

    match result {
        Some(Ok((meter_read, denominator))) => Ok(warp::reply::with_status(
            warp::reply::json(&HlsResponse {
                hls_id: socket_id,
                meter_read,
                denominator,
                timestamp: chrono::Utc::now(),
            }),
            StatusCode::OK,
        )),
        Some(Err(e)) => Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "error": e.to_string() })),
            StatusCode::INTERNAL_SERVER_ERROR,
        )),
        None => Ok(service_unavailable()),
    }
}

async fn handle_uart(body: UartRequest, ctxt: HttpContext) -> Result<impl Reply, Infallible> {
    let _ = ctxt.operator.send(OperatorCommand::Uart { line: body.line }).await;
    Ok(warp::reply::with_status(warp::reply::json(&serde_json::json!({})), StatusCode::ACCEPTED))
}

async fn handle_upload(form: FormData, ctxt: HttpContext) -> Result<impl Reply, Infallible> {
    use bytes::Buf;
    use futures::{StreamExt, TryStreamExt};
    use tokio::io::AsyncWriteExt;

    let prefix = chrono::Utc::now().timestamp_millis();
    let mut saved = Vec::new();
    let mut parts = form;

    loop {
        let part = match parts.try_next().await {
            Ok(Some(p)) => p,
            Ok(None) => break,
            Err(e) => {
                warn!("multipart upload read failed -- {}", e);
                break;
            }
        };

        let name = part
            .filename()
            .map(|s| s.to_owned())
            .unwrap_or_else(|| String::from("upload.bin"));
        let dest = ctxt.uploads_dir.join(format!("{}-{}", prefix, sanitize(&name)));

        if tokio::fs::create_dir_all(&ctxt.uploads_dir).await.is_err() {
            continue;
        }

        let mut stream = part.stream();
        if let Ok(mut file) = tokio::fs::File::create(&dest).await {
            let mut ok = true;
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(buf) => {
                        if file.write_all(buf.chunk()).await.is_err() {
                            ok = false;
                            break;
                        }
                    }
                    Err(_) => {
                        ok = false;
                        break;
                    }
                }
            }
            if ok {
                saved.push(dest.display().to_string());
            }
        }
    }

    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "saved": saved })),
        StatusCode::OK,
    ))
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn service_unavailable() -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": "supervisor is not responding" })),
        StatusCode::SERVICE_UNAVAILABLE,
    )
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "no such route")
    } else if err.find::<warp::filters::body::BodyDeserializeError>().is_some() {
        (StatusCode::BAD_REQUEST, "malformed request body")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "unhandled error")
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": message })),
        code,
    ))
}
