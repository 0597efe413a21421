use std::io::IsTerminal;

use bytes::Bytes;
use clap::ValueEnum;
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Text
        } else {
            Self::Json
        }
    }
}

/// One fully read response attachment.
#[derive(Debug, Clone)]
pub struct Body {
    pub id: String,
    pub content_type: String,
    pub data: Bytes,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResponseOutput<'a> {
    status_code: u16,
    streams: Vec<StreamOutput<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamOutput<'a> {
    id: &'a str,
    content_type: &'a str,
    length: usize,
    body: String,
}

pub fn print_response(status_code: u16, bodies: &[Body], format: OutputFormat) {
    println!("{}", render_response(status_code, bodies, format));
}

fn render_response(status_code: u16, bodies: &[Body], format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            let out = ResponseOutput {
                status_code,
                streams: bodies
                    .iter()
                    .map(|body| StreamOutput {
                        id: &body.id,
                        content_type: &body.content_type,
                        length: body.data.len(),
                        body: body_preview(&body.data),
                    })
                    .collect(),
            };
            serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Text => {
            let mut lines = vec![format!("status={status_code}")];
            for body in bodies {
                lines.push(format!(
                    "stream={} type={} size={}",
                    body.id,
                    body.content_type,
                    body.data.len()
                ));
                lines.push(body_preview(&body.data));
            }
            lines.join("\n")
        }
    }
}

fn body_preview(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<{} bytes binary>", data.len()),
    }
}
