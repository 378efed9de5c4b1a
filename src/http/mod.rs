//! The ancillary HTTP surface: EdgeQL-over-HTTP, GraphQL, notebook,
//! health, and Prometheus metrics.
//!
//! HTTP/1.1 is handled by hand over the tokio stream, one request per
//! connection, the same way the metrics exporter this is modeled on does
//! it. Queries arriving here run on the `SIMPLE_HTTP` transport, which
//! forbids DDL and explicit transactions regardless of client flags.

use std::io::Write;
use std::sync::Arc;

use ahash::AHashMap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::future::BoxFuture;
use log::{debug, error, info};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};

use crate::app::state::ServerState;
use crate::client::Transport;
use crate::compiler::CompileRequest;
use crate::errors::{CapabilityError, Error, QueryError};
use crate::metrics;
use crate::pool::Lease;
use crate::protocol::types::{
    Capabilities, Cardinality, InputLanguage, OutputFormat, ProtocolVersion,
};
use crate::protocol::wire::encode_argument_tuple;
use crate::utils::cancel::CancelToken;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// External GraphQL-to-EdgeQL translation service.
pub trait GraphqlTranslator: Send + Sync {
    fn translate(
        &self,
        query: &str,
        operation_name: Option<&str>,
        variables: &Value,
    ) -> BoxFuture<'_, Result<String, QueryError>>;
}

struct Request {
    method: String,
    path: String,
    headers: AHashMap<String, String>,
    body: Vec<u8>,
}

struct Response {
    status: u16,
    content_type: String,
    body: Vec<u8>,
    gzip: bool,
}

impl Response {
    fn json(status: u16, value: &Value) -> Response {
        Response {
            status,
            content_type: "application/json".to_string(),
            body: serde_json::to_vec(value).unwrap_or_default(),
            gzip: false,
        }
    }

    fn text(status: u16, body: &str) -> Response {
        Response {
            status,
            content_type: "text/plain".to_string(),
            body: body.as_bytes().to_vec(),
            gzip: false,
        }
    }
}

/// Accept loop for the HTTP listener.
pub async fn serve(state: Arc<ServerState>, listener: TcpListener) {
    info!(
        "HTTP interface listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    );
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        handle_connection(state, stream).await;
                    });
                }
                Err(err) => error!("HTTP accept failed: {err}"),
            }
        }
    }
}

async fn handle_connection(state: Arc<ServerState>, stream: TcpStream) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    let request = match read_request(&mut reader).await {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(err) => {
            debug!("bad HTTP request: {err}");
            let _ = write_response(&mut writer, Response::text(400, "bad request")).await;
            return;
        }
    };

    let accepts_gzip = request
        .headers
        .get("accept-encoding")
        .map(|v| v.to_lowercase().contains("gzip"))
        .unwrap_or(false);

    let mut response = route(&state, &request).await;
    response.gzip &= accepts_gzip;
    if let Err(err) = write_response(&mut writer, response).await {
        debug!("failed to write HTTP response: {err}");
    }
}

async fn read_request<R>(reader: &mut R) -> Result<Option<Request>, Error>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    // Read until the end of the header block.
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(Error::BadConfig("oversized HTTP headers".to_string()));
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(Error::Socket(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated HTTP request",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let header_text = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_uppercase();
    let path = parts.next().unwrap_or_default().to_string();
    if method.is_empty() || path.is_empty() {
        return Err(Error::BadConfig("malformed request line".to_string()));
    }

    let mut headers = AHashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(Error::BadConfig("oversized HTTP body".to_string()));
    }

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Socket(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated HTTP body",
            )));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Some(Request {
        method,
        path,
        headers,
        body,
    }))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn write_response<W>(writer: &mut W, response: Response) -> Result<(), Error>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let (body, encoding_header) = if response.gzip {
        let mut compressed = Vec::new();
        {
            let mut encoder = GzEncoder::new(&mut compressed, Compression::default());
            encoder.write_all(&response.body)?;
            encoder.finish()?;
        }
        (compressed, "Content-Encoding: gzip\r\n")
    } else {
        (response.body, "")
    };

    let status_text = match response.status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    };
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        status_text,
        response.content_type,
        encoding_header,
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

async fn route(state: &Arc<ServerState>, request: &Request) -> Response {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/server/status/alive") | ("GET", "/server/status/ready") => {
            Response::text(200, "OK")
        }
        ("GET", "/metrics") => {
            let (content_type, body) = metrics::render(state);
            Response {
                status: 200,
                content_type,
                body,
                gzip: true,
            }
        }
        ("POST", path) => {
            let Some((branch, endpoint)) = parse_branch_path(path) else {
                return Response::text(404, "not found");
            };
            if !authorize(state, request) {
                return Response::json(
                    401,
                    &json!({"error": {"message": "authentication required",
                                       "type": "AuthenticationError",
                                       "code": crate::errors::ErrorCode::AUTHENTICATION.0}}),
                );
            }
            match endpoint {
                "edgeql" => handle_edgeql(state, &branch, &request.body).await,
                "graphql" => handle_graphql(state, &branch, &request.body).await,
                "notebook" => handle_notebook(state, &branch, &request.body).await,
                _ => Response::text(404, "not found"),
            }
        }
        ("GET", _) => Response::text(404, "not found"),
        _ => Response::text(405, "method not allowed"),
    }
}

/// `/branch/<name>/<endpoint>` (and the older `/db/<name>/<endpoint>`).
fn parse_branch_path(path: &str) -> Option<(String, &str)> {
    let rest = path
        .strip_prefix("/branch/")
        .or_else(|| path.strip_prefix("/db/"))?;
    let (branch, endpoint) = rest.split_once('/')?;
    if branch.is_empty() {
        return None;
    }
    Some((branch.to_string(), endpoint))
}

fn authorize(state: &ServerState, request: &Request) -> bool {
    let auth = &state.authenticator;
    let Some(header) = request.headers.get("authorization") else {
        // Trust mode accepts anonymous requests.
        return auth.check_password("", "");
    };
    if let Some(encoded) = header.strip_prefix("Basic ") {
        if let Ok(decoded) = BASE64.decode(encoded.trim()) {
            if let Ok(text) = String::from_utf8(decoded) {
                if let Some((user, password)) = text.split_once(':') {
                    return auth.check_password(user, password);
                }
            }
        }
        return false;
    }
    if let Some(token) = header.strip_prefix("Bearer ") {
        return auth.check_bearer(token.trim());
    }
    false
}

fn error_json(err: &Error) -> Value {
    json!({
        "error": {
            "message": err.to_string(),
            "type": err.code().name(),
            "code": err.code().0,
        }
    })
}

async fn handle_edgeql(state: &Arc<ServerState>, branch: &str, body: &[u8]) -> Response {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => {
            return Response::json(
                400,
                &error_json(&Error::Query(QueryError::new(format!(
                    "invalid JSON body: {err}"
                )))),
            )
        }
    };
    let Some(query) = payload.get("query").and_then(Value::as_str) else {
        return Response::json(
            400,
            &error_json(&Error::Query(QueryError::new("missing \"query\" field"))),
        );
    };
    let variables = payload.get("variables").cloned().unwrap_or(Value::Null);

    match run_http_query(state, branch, query, &variables).await {
        Ok(rows) => Response::json(200, &json!({ "data": rows })),
        Err(err) => Response::json(400, &error_json(&err)),
    }
}

async fn handle_graphql(state: &Arc<ServerState>, branch: &str, body: &[u8]) -> Response {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => return Response::json(400, &error_json(&Error::Query(QueryError::new("invalid JSON body")))),
    };
    let Some(query) = payload.get("query").and_then(Value::as_str) else {
        return Response::json(
            400,
            &error_json(&Error::Query(QueryError::new("missing \"query\" field"))),
        );
    };
    let operation_name = payload.get("operationName").and_then(Value::as_str);
    let variables = payload.get("variables").cloned().unwrap_or(Value::Null);

    let Some(translator) = state.graphql.get().cloned() else {
        return Response::json(
            400,
            &error_json(&Error::Unsupported("GraphQL translator is not configured")),
        );
    };
    let edgeql = match translator.translate(query, operation_name, &variables).await {
        Ok(edgeql) => edgeql,
        Err(err) => return Response::json(400, &error_json(&Error::Query(err))),
    };

    match run_http_query(state, branch, &edgeql, &variables).await {
        Ok(rows) => Response::json(200, &json!({ "data": rows })),
        Err(err) => Response::json(400, &error_json(&err)),
    }
}

/// Notebook protocol: run every cell inside one transaction, then roll it
/// back so the notebook never mutates the branch.
async fn handle_notebook(state: &Arc<ServerState>, branch: &str, body: &[u8]) -> Response {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => return Response::json(400, &error_json(&Error::Query(QueryError::new("invalid JSON body")))),
    };
    let queries: Vec<String> = payload
        .get("queries")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let cancel = CancelToken::new();
    let mut lease = match state.pool.acquire(branch, &cancel).await {
        Ok(lease) => lease,
        Err(err) => return Response::json(400, &error_json(&Error::Pool(err))),
    };

    let mut results = Vec::new();
    if let Err(err) = run_raw(&mut lease, b"start transaction").await {
        return Response::json(400, &error_json(&err));
    }
    for query in &queries {
        match execute_on_lease(state, &mut lease, branch, query, &Value::Null).await {
            Ok(rows) => results.push(json!({"kind": "data", "data": rows})),
            Err(err) => {
                results.push(json!({
                    "kind": "error",
                    "error": [err.code().name(), err.to_string(), {}],
                }));
                break;
            }
        }
    }
    let _ = run_raw(&mut lease, b"rollback").await;

    Response::json(200, &json!({"kind": "results", "results": results}))
}

/// Compile and execute one query on a fresh backend lease.
async fn run_http_query(
    state: &Arc<ServerState>,
    branch: &str,
    query: &str,
    variables: &Value,
) -> Result<Vec<Value>, Error> {
    let cancel = CancelToken::new();
    let mut lease = state.pool.acquire(branch, &cancel).await?;
    let rows = execute_on_lease(state, &mut lease, branch, query, variables).await?;
    Ok(rows)
}

async fn execute_on_lease(
    state: &Arc<ServerState>,
    lease: &mut Lease,
    branch: &str,
    query: &str,
    variables: &Value,
) -> Result<Vec<Value>, Error> {
    if !state.config.branch_allowed(branch) {
        return Err(QueryError::new(format!("branch {branch:?} is not available")).into());
    }

    let request = CompileRequest {
        query: query.to_string(),
        branch: branch.to_string(),
        protocol_version: ProtocolVersion::CURRENT,
        schema_version: state.schema_version(),
        input_language: InputLanguage::EdgeQl,
        output_format: OutputFormat::Json,
        expected_cardinality: Cardinality::Many,
        implicit_limit: 0,
        compilation_flags: 0,
        modaliases: Default::default(),
        variables: Vec::new(),
    };
    let group = state
        .cache
        .lookup_or_compile(&request, &[], state.gateway.as_ref())
        .await?;

    // Only one statement per request, and never DDL or transaction
    // control over plain HTTP.
    if group.units.len() > 1 {
        return Err(QueryError::new("HTTP queries must contain a single statement").into());
    }
    let required = group.capabilities();
    let allowed = Capabilities(
        Capabilities::ALL.0 & !Transport::SimpleHttp.forbidden_capabilities().0,
    );
    if !required.missing_from(allowed).is_empty() {
        return Err(CapabilityError {
            required: required.0,
            allowed: allowed.0,
        }
        .into());
    }

    let arguments = build_arguments(&group.units[0].param_names, variables)?;

    let mut rows = Vec::new();
    for unit in &group.units {
        if let Err(err) = lease.conn.send_query(&unit.sql, &arguments).await {
            lease.mark_broken();
            return Err(err.into());
        }
        loop {
            match lease.conn.next_event().await {
                Ok(crate::backend::BackendEvent::Row(row)) => rows.push(decode_row(&row)),
                Ok(crate::backend::BackendEvent::Complete { .. }) => break,
                Ok(crate::backend::BackendEvent::Error(err)) => {
                    return Err(match err.as_query_error() {
                        Some(query_err) => Error::Query(query_err),
                        None => Error::Backend(err),
                    })
                }
                Err(err) => {
                    lease.mark_broken();
                    return Err(err.into());
                }
            }
        }
    }
    Ok(rows)
}

/// Issue a raw command and drain its events, ignoring row data.
async fn run_raw(lease: &mut Lease, sql: &[u8]) -> Result<(), Error> {
    lease.conn.send_query(sql, &[]).await.map_err(|err| {
        lease.mark_broken();
        Error::from(err)
    })?;
    loop {
        match lease.conn.next_event().await {
            Ok(crate::backend::BackendEvent::Row(_)) => {}
            Ok(crate::backend::BackendEvent::Complete { .. }) => return Ok(()),
            Ok(crate::backend::BackendEvent::Error(err)) => return Err(err.into()),
            Err(err) => {
                lease.mark_broken();
                return Err(err.into());
            }
        }
    }
}

/// Positional arguments from the JSON `variables` object, in declaration
/// order, each encoded as its JSON text.
fn build_arguments(param_names: &[String], variables: &Value) -> Result<Vec<u8>, Error> {
    if param_names.is_empty() {
        return Ok(Vec::new());
    }
    let Some(map) = variables.as_object() else {
        return Err(QueryError::new("parameterized query requires \"variables\"").into());
    };
    let mut values = Vec::with_capacity(param_names.len());
    for name in param_names {
        let Some(value) = map.get(name) else {
            return Err(QueryError::new(format!("missing variable ${name}")).into());
        };
        values.push(serde_json::to_vec(value).unwrap_or_default());
    }
    Ok(encode_argument_tuple(&values))
}

/// Backend rows are opaque bytes; present them as JSON when they parse,
/// text when they are UTF-8, base64 otherwise.
fn decode_row(row: &[u8]) -> Value {
    if let Ok(value) = serde_json::from_slice::<Value>(row) {
        return value;
    }
    match std::str::from_utf8(row) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::String(BASE64.encode(row)),
    }
}

#[cfg(test)]
mod http_tests;
