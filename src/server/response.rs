//! Content negotiation and result serialization.
//!
//! The same row source serializes as TSV (`text/plain`), CSV (`text/csv`),
//! a buffered JSON array (`application/json`), or streaming JSON-lines
//! (the default, including `application/jsonlines`). Streaming formats
//! never buffer the dataset; the pump stops on client disconnect by
//! cancelling the stream's execution context.

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::db::{column_names, Columns, Dataset, Row, RowStream};

/// Response header echoing the request/query id.
pub const HEADER_REQUEST_ID: &str = "X-Request-ID";
/// Response header carrying `[name, type, db_type]` triples.
pub const HEADER_COLUMNS: &str = "X-Request-Columns";
/// Response header carrying the query status.
pub const HEADER_STATUS: &str = "X-Request-Status";

/// Channel depth between the encoder task and the HTTP writer.
const ENCODE_BUFFER: usize = 64;

/// The negotiated response format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiated {
    /// Tab-separated, streaming.
    Tsv,
    /// Comma-separated, streaming.
    Csv,
    /// Buffered JSON array of row objects, values cast to strings.
    Json,
    /// Streaming JSON-lines; the first record is the column-name array.
    JsonLines,
}

/// Pick a format from the `Accept` header.
pub fn negotiate(headers: &HeaderMap) -> Negotiated {
    let accept = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_lowercase();
    match accept.as_str() {
        "text/plain" => Negotiated::Tsv,
        "text/csv" => Negotiated::Csv,
        "application/json" => Negotiated::Json,
        _ => Negotiated::JsonLines,
    }
}

impl Negotiated {
    fn content_type(&self) -> &'static str {
        match self {
            Negotiated::Tsv => "text/plain",
            Negotiated::Csv => "text/csv",
            Negotiated::Json => "application/json",
            Negotiated::JsonLines => "application/jsonlines",
        }
    }
}

/// The `X-Request-Columns` value: a JSON array of triples.
fn columns_header_value(columns: &Columns) -> String {
    let triples: Vec<[&str; 3]> = columns
        .iter()
        .map(|c| [c.name.as_str(), c.column_type.name(), c.db_type.as_str()])
        .collect();
    serde_json::to_string(&triples).unwrap_or_else(|_| "[]".to_string())
}

fn base_builder(request_id: &str) -> axum::http::response::Builder {
    Response::builder().status(StatusCode::OK).header(HEADER_REQUEST_ID, request_id)
}

fn encode_delimited(fields: &[String], delimiter: u8) -> Bytes {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(Vec::with_capacity(128));
    // a per-record writer keeps the encoder stateless between chunks
    let _ = writer.write_record(fields);
    let _ = writer.flush();
    Bytes::from(writer.into_inner().unwrap_or_default())
}

fn encode_json_line(value: &serde_json::Value) -> Bytes {
    let mut bytes = serde_json::to_vec(value).unwrap_or_default();
    bytes.push(b'\n');
    Bytes::from(bytes)
}

fn row_display(row: &Row) -> Vec<String> {
    row.iter().map(|v| v.display()).collect()
}

/// Serialize a live row stream.
///
/// Streaming formats hand the socket a lazy body; `application/json`
/// collects into memory first (and casts values to strings so 64-bit
/// integers survive JavaScript number parsing).
pub async fn stream_rows(request_id: &str, accept: Negotiated, mut rows: RowStream) -> Response {
    let columns = rows.columns().clone();
    let builder = base_builder(request_id)
        .header(HEADER_COLUMNS, columns_header_value(&columns))
        .header(CONTENT_TYPE, accept.content_type());

    match accept {
        Negotiated::Json => {
            let names = column_names(&columns);
            let mut records = Vec::new();
            while let Some(item) = rows.next_row().await {
                match item {
                    Ok(row) => {
                        let record: serde_json::Map<String, serde_json::Value> = names
                            .iter()
                            .cloned()
                            .zip(row.iter().map(|v| v.to_json_string_cast()))
                            .collect();
                        records.push(serde_json::Value::Object(record));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "row stream failed while buffering");
                        rows.cancel();
                        break;
                    }
                }
            }
            let body = serde_json::to_vec(&records).unwrap_or_else(|_| b"[]".to_vec());
            builder.body(Body::from(body)).expect("static response parts")
        }
        Negotiated::Tsv | Negotiated::Csv => {
            let delimiter = if accept == Negotiated::Tsv { b'\t' } else { b',' };
            let head = encode_delimited(&column_names(&columns), delimiter);
            stream_body(builder, rows, head, move |row| {
                encode_delimited(&row_display(row), delimiter)
            })
        }
        Negotiated::JsonLines => {
            let head = encode_json_line(&serde_json::Value::from(column_names(&columns)));
            stream_body(builder, rows, head, |row| {
                let values: Vec<serde_json::Value> = row.iter().map(|v| v.to_json()).collect();
                encode_json_line(&serde_json::Value::from(values))
            })
        }
    }
}

fn stream_body(
    builder: axum::http::response::Builder,
    mut rows: RowStream,
    head: Bytes,
    encode: impl Fn(&Row) -> Bytes + Send + 'static,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(ENCODE_BUFFER);
    tokio::spawn(async move {
        if tx.send(Ok(head)).await.is_err() {
            rows.cancel();
            return;
        }
        while let Some(item) = rows.next_row().await {
            match item {
                Ok(row) => {
                    if tx.send(Ok(encode(&row))).await.is_err() {
                        // client went away; tear the cursor down
                        rows.cancel();
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "row stream failed mid-response");
                    rows.cancel();
                    return;
                }
            }
        }
    });
    builder
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .expect("static response parts")
}

/// Serialize a buffered dataset (metadata endpoints).
pub fn respond_dataset(request_id: &str, accept: Negotiated, data: Dataset) -> Response {
    let builder = base_builder(request_id)
        .header(HEADER_COLUMNS, columns_header_value(&data.columns))
        .header(CONTENT_TYPE, accept.content_type());

    let body: Vec<u8> = match accept {
        Negotiated::Tsv | Negotiated::Csv => {
            let delimiter = if accept == Negotiated::Tsv { b'\t' } else { b',' };
            let mut out = Vec::new();
            out.extend_from_slice(&encode_delimited(&column_names(&data.columns), delimiter));
            for row in &data.rows {
                out.extend_from_slice(&encode_delimited(&row_display(row), delimiter));
            }
            out
        }
        Negotiated::Json => {
            // same string cast as the streaming path: 64-bit integers must
            // survive JavaScript number parsing
            let names = column_names(&data.columns);
            let records: Vec<serde_json::Value> = data
                .rows
                .iter()
                .map(|row| {
                    let record: serde_json::Map<String, serde_json::Value> = names
                        .iter()
                        .cloned()
                        .zip(row.iter().map(|v| v.to_json_string_cast()))
                        .collect();
                    serde_json::Value::Object(record)
                })
                .collect();
            serde_json::to_vec(&records).unwrap_or_else(|_| b"[]".to_vec())
        }
        Negotiated::JsonLines => {
            let mut out = Vec::new();
            out.extend_from_slice(&encode_json_line(&serde_json::Value::from(column_names(
                &data.columns,
            ))));
            for row in &data.rows {
                let values: Vec<serde_json::Value> = row.iter().map(|v| v.to_json()).collect();
                out.extend_from_slice(&encode_json_line(&serde_json::Value::from(values)));
            }
            out
        }
    };
    builder.body(Body::from(body)).expect("static response parts")
}

/// A JSON payload response carrying the request id.
pub fn respond_payload(
    request_id: &str,
    status: StatusCode,
    payload: &serde_json::Value,
) -> Response {
    base_builder(request_id)
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(payload).unwrap_or_default()))
        .expect("static response parts")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Column, ColumnType, DbError, Value};
    use tokio_util::sync::CancellationToken;

    fn columns() -> Columns {
        vec![Column::integer("id"), Column::text("city")]
    }

    fn rows_fixture(rows: Vec<Row>) -> RowStream {
        let (tx, rx) = mpsc::channel(rows.len().max(1));
        for row in rows {
            tx.try_send(Ok(row)).expect("capacity");
        }
        drop(tx);
        RowStream::new(columns(), rx, CancellationToken::new())
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn negotiation_table() {
        let mut headers = HeaderMap::new();
        assert_eq!(negotiate(&headers), Negotiated::JsonLines);

        headers.insert("accept", "text/plain".parse().unwrap());
        assert_eq!(negotiate(&headers), Negotiated::Tsv);
        headers.insert("accept", "text/csv".parse().unwrap());
        assert_eq!(negotiate(&headers), Negotiated::Csv);
        headers.insert("accept", "application/json".parse().unwrap());
        assert_eq!(negotiate(&headers), Negotiated::Json);
        headers.insert("accept", "application/jsonlines".parse().unwrap());
        assert_eq!(negotiate(&headers), Negotiated::JsonLines);
    }

    #[tokio::test]
    async fn csv_streams_header_and_rows_in_order() {
        let stream = rows_fixture(vec![
            vec![Value::Int(1), Value::Text("Big".into())],
            vec![Value::Int(2), Value::Text("Small".into())],
        ]);
        let response = stream_rows("req-1", Negotiated::Csv, stream).await;

        assert_eq!(response.headers().get(HEADER_REQUEST_ID).unwrap(), "req-1");
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/csv");
        let text = body_text(response).await;
        assert_eq!(text, "id,city\n1,Big\n2,Small\n");
    }

    #[tokio::test]
    async fn tsv_uses_tabs() {
        let stream = rows_fixture(vec![vec![Value::Int(1), Value::Text("Big".into())]]);
        let response = stream_rows("req", Negotiated::Tsv, stream).await;
        let text = body_text(response).await;
        assert_eq!(text, "id\tcity\n1\tBig\n");
    }

    #[tokio::test]
    async fn jsonl_leads_with_column_names() {
        let stream = rows_fixture(vec![vec![Value::Int(1), Value::Null]]);
        let response = stream_rows("req", Negotiated::JsonLines, stream).await;
        let text = body_text(response).await;
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), r#"["id","city"]"#);
        assert_eq!(lines.next().unwrap(), "[1,null]");
    }

    #[tokio::test]
    async fn json_casts_values_to_strings() {
        let big = 9_007_199_254_740_993_i64; // beyond the 53-bit float range
        let stream = rows_fixture(vec![vec![Value::Int(big), Value::Text("x".into())]]);
        let response = stream_rows("req", Negotiated::Json, stream).await;
        let text = body_text(response).await;
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed[0]["id"], serde_json::json!(big.to_string()));
    }

    #[tokio::test]
    async fn zero_row_stream_still_emits_header() {
        let stream = rows_fixture(vec![]);
        let response = stream_rows("req", Negotiated::Csv, stream).await;
        assert!(response.headers().contains_key(HEADER_COLUMNS));
        assert_eq!(body_text(response).await, "id,city\n");
    }

    #[tokio::test]
    async fn columns_header_carries_triples() {
        let stream = rows_fixture(vec![]);
        let response = stream_rows("req", Negotiated::JsonLines, stream).await;
        let header = response.headers().get(HEADER_COLUMNS).unwrap().to_str().unwrap();
        let parsed: Vec<[String; 3]> = serde_json::from_str(header).unwrap();
        assert_eq!(parsed[0][0], "id");
        assert_eq!(parsed[0][1], ColumnType::Integer.name());
    }

    #[tokio::test]
    async fn mid_stream_error_truncates_output() {
        let (tx, rx) = mpsc::channel(4);
        tx.try_send(Ok(vec![Value::Int(1), Value::Text("a".into())])).unwrap();
        tx.try_send(Err(DbError::Query { message: "boom".into() })).unwrap();
        drop(tx);
        let stream = RowStream::new(columns(), rx, CancellationToken::new());

        let response = stream_rows("req", Negotiated::Csv, stream).await;
        let text = body_text(response).await;
        assert_eq!(text, "id,city\n1,a\n");
    }

    #[tokio::test]
    async fn dataset_json_casts_values_to_strings() {
        let big = 9_007_199_254_740_993_i64;
        let mut data = Dataset::new(columns());
        data.push(vec![Value::Int(big), Value::Null]);
        let response = respond_dataset("req", Negotiated::Json, data);
        let text = body_text(response).await;
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed[0]["id"], serde_json::json!(big.to_string()));
        assert_eq!(parsed[0]["city"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn payload_sets_request_id() {
        let response =
            respond_payload("abc", StatusCode::ACCEPTED, &serde_json::json!({"status": "submitted"}));
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers().get(HEADER_REQUEST_ID).unwrap(), "abc");
    }
}
