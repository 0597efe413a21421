use std::fs;

use streamwire_protocol::{Connection, Request};
use streamwire_transport::UnixDomainSocket;
use tracing::debug;

use crate::cmd::RequestArgs;
use crate::exit::{
    io_error, protocol_error, transport_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT,
    USAGE,
};
use crate::output::{print_response, Body, OutputFormat};

pub async fn run(args: RequestArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.connection.config()?;
    let deadline = config.request_timeout;
    let request = build_request(&args)?;

    let socket = UnixDomainSocket::connect(&args.path)
        .await
        .map_err(|err| transport_error("connect failed", err))?;
    let conn = Connection::start(socket, config);

    let outcome = exchange(&conn, request, deadline).await;
    conn.close().await;
    let (status, bodies) = outcome?;

    print_response(status, &bodies, format);
    Ok(if (200..300).contains(&status) {
        SUCCESS
    } else {
        FAILURE
    })
}

/// Send the request and collect every response attachment in full.
async fn exchange(
    conn: &Connection,
    request: Request,
    deadline: std::time::Duration,
) -> CliResult<(u16, Vec<Body>)> {
    let response = conn
        .send_request(request)
        .await
        .map_err(|err| protocol_error("request failed", err))?;
    debug!(status = response.status_code, attachments = response.streams.len(), "response received");

    let mut bodies = Vec::with_capacity(response.streams.len());
    for stream in &response.streams {
        let read = tokio::time::timeout(deadline, stream.reader().read_to_end()).await;
        let data = match read {
            Ok(Ok(data)) => data,
            Ok(Err(err)) => return Err(protocol_error("reading response body failed", err)),
            Err(_) => {
                return Err(CliError::new(
                    TIMEOUT,
                    format!("reading response body timed out after {deadline:?}"),
                ))
            }
        };
        bodies.push(Body {
            id: stream.id().to_string(),
            content_type: stream.content_type().to_string(),
            data,
        });
    }
    Ok((response.status_code, bodies))
}

fn build_request(args: &RequestArgs) -> CliResult<Request> {
    if !args.target.starts_with('/') {
        return Err(CliError::new(USAGE, "--path must start with '/'"));
    }
    let request = Request::new(args.verb.to_ascii_uppercase(), args.target.clone());

    let attachment = if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        Some(("application/json", json.as_bytes().to_vec()))
    } else if let Some(data) = &args.data {
        Some(("text/plain", data.as_bytes().to_vec()))
    } else if let Some(path) = &args.file {
        let contents = fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), &err))?;
        Some(("application/octet-stream", contents))
    } else {
        None
    };

    Ok(match attachment {
        Some((default_type, body)) => {
            let content_type = args.content_type.as_deref().unwrap_or(default_type);
            request.with_body(content_type, body)
        }
        None => request,
    })
}
