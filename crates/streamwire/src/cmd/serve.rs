use streamwire_protocol::{Connection, ContentStream, InboundRequest, Response};
use streamwire_transport::UnixDomainSocket;
use tracing::{debug, info};

use crate::cmd::ServeArgs;
use crate::exit::{transport_error, CliResult, SUCCESS};

pub async fn run(args: ServeArgs) -> CliResult<i32> {
    let config = args.connection.config()?;
    let listener =
        UnixDomainSocket::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;
    info!(path = %listener.path().display(), "serving");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut connections: Vec<Connection> = Vec::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            accepted = listener.accept() => {
                let stream = accepted.map_err(|err| transport_error("accept failed", err))?;
                connections.retain(Connection::is_connected);
                connections.push(Connection::start_with_handler(stream, config.clone(), serve_request));
                debug!(open = connections.len(), "peer connected");
            }
        }
    }

    for conn in &connections {
        conn.cancel_all().await;
    }
    Ok(SUCCESS)
}

/// `GET /version` reports the package version; every other request gets a
/// 200 whose attachments echo the request's attachments as they arrive.
pub async fn serve_request(request: InboundRequest) -> Response {
    if request.verb.eq_ignore_ascii_case("GET") && request.path == "/version" {
        let body = serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }).to_string();
        return Response::ok().with_body("application/json", body);
    }

    info!(
        id = %request.id,
        verb = %request.verb,
        path = %request.path,
        attachments = request.streams.len(),
        "echoing request"
    );
    request
        .streams
        .into_iter()
        .map(echo_stream)
        .fold(Response::ok(), Response::with_stream)
}

fn echo_stream(inbound: ContentStream) -> ContentStream {
    let (writer, outbound) = ContentStream::channel(inbound.content_type(), inbound.length());
    tokio::spawn(async move {
        let mut reader = inbound.reader();
        loop {
            match reader.read().await {
                Ok(Some(chunk)) => {
                    if writer.append(chunk).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    writer.end();
                    break;
                }
                Err(err) => {
                    // Dropping the writer cancels the echo.
                    debug!(id = %inbound.id(), error = %err, "echo source failed");
                    break;
                }
            }
        }
    });
    outbound
}
