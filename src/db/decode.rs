//! Inbound body decoding for bulk ingest.
//!
//! Turns a request body into a [`DecodedStream`] of rows according to the
//! negotiated format. CSV and JSON-lines decode incrementally; JSON arrays
//! and XML documents are buffered, since both need the full document before
//! the record set is known.

use std::collections::BTreeMap;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::SyncIoBridge;

use super::{DbError, Row, Value};

/// Channel depth between a decoder task and the consuming driver.
const DECODE_BUFFER: usize = 256;

/// Inbound body formats the decoder understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    /// Comma-separated values with a header row.
    Csv,
    /// A JSON array of objects (or a single object).
    Json,
    /// One JSON object per line.
    JsonLines,
    /// A flat XML document, one record per child element.
    Xml,
}

impl BodyFormat {
    /// Pick a format from a `Content-Type` header value.
    pub fn from_content_type(content_type: &str) -> BodyFormat {
        let ct = content_type.to_lowercase();
        if ct.starts_with("text/csv") || ct.starts_with("text/plain") {
            BodyFormat::Csv
        } else if ct.starts_with("application/xml") {
            BodyFormat::Xml
        } else if ct.starts_with("application/jsonlines") {
            BodyFormat::JsonLines
        } else {
            BodyFormat::Json
        }
    }

    /// Sniff a format from the first bytes of an uploaded file.
    pub fn sniff(head: &[u8]) -> BodyFormat {
        for b in head {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' => continue,
                b'{' | b'[' => return BodyFormat::Json,
                b'<' => return BodyFormat::Xml,
                _ => return BodyFormat::Csv,
            }
        }
        BodyFormat::Csv
    }
}

/// A decoded sequence of rows with a fixed column set.
///
/// Later records are projected onto the columns of the first; missing fields
/// become NULL and unknown fields are dropped.
pub struct DecodedStream {
    columns: Vec<String>,
    rx: mpsc::Receiver<Result<Row, DbError>>,
}

impl DecodedStream {
    /// The column names, known before the first row.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Await the next decoded row.
    pub async fn next_row(&mut self) -> Option<Result<Row, DbError>> {
        self.rx.recv().await
    }

    /// Blocking receive, for driver actors running off the async runtime.
    pub fn blocking_next_row(&mut self) -> Option<Result<Row, DbError>> {
        self.rx.blocking_recv()
    }

    /// Build a stream from fully-buffered rows.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Row>) -> DecodedStream {
        let (tx, rx) = mpsc::channel(rows.len().max(1));
        for row in rows {
            // capacity matches, sends cannot fail
            let _ = tx.try_send(Ok(row));
        }
        DecodedStream { columns, rx }
    }
}

impl std::fmt::Debug for DecodedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedStream").field("columns", &self.columns).finish()
    }
}

type Record = BTreeMap<String, serde_json::Value>;

fn record_to_row(columns: &[String], record: &Record) -> Row {
    columns
        .iter()
        .map(|c| record.get(c).map(Value::from_json).unwrap_or(Value::Null))
        .collect()
}

/// Decode a body in the given format.
pub async fn decode_body<R>(format: BodyFormat, reader: R) -> Result<DecodedStream, DbError>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    match format {
        BodyFormat::Csv => decode_csv(reader).await,
        BodyFormat::Json => decode_json(reader).await,
        BodyFormat::JsonLines => decode_jsonl(reader).await,
        BodyFormat::Xml => decode_xml(reader).await,
    }
}

/// Streaming CSV decode on a blocking worker.
async fn decode_csv<R>(reader: R) -> Result<DecodedStream, DbError>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (header_tx, header_rx) = oneshot::channel::<Result<Vec<String>, DbError>>();
    let (tx, rx) = mpsc::channel(DECODE_BUFFER);

    tokio::task::spawn_blocking(move || {
        let bridge = SyncIoBridge::new(reader);
        let mut csv_reader = csv::Reader::from_reader(bridge);

        let headers = match csv_reader.headers() {
            Ok(h) => h.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            Err(e) => {
                let _ = header_tx.send(Err(DbError::Decode { message: e.to_string() }));
                return;
            }
        };
        if header_tx.send(Ok(headers)).is_err() {
            return;
        }

        for result in csv_reader.records() {
            let item = match result {
                Ok(record) => {
                    Ok(record.iter().map(|s| Value::Text(s.to_string())).collect::<Row>())
                }
                Err(e) => Err(DbError::Decode { message: e.to_string() }),
            };
            let stop = item.is_err();
            if tx.blocking_send(item).is_err() || stop {
                return;
            }
        }
    });

    let columns = header_rx
        .await
        .map_err(|_| DbError::Decode { message: "csv decoder exited early".to_string() })??;
    Ok(DecodedStream { columns, rx })
}

/// Buffered JSON-array decode. A single object decodes as one row.
async fn decode_json<R>(mut reader: R) -> Result<DecodedStream, DbError>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut body = Vec::new();
    reader
        .read_to_end(&mut body)
        .await
        .map_err(|e| DbError::Decode { message: e.to_string() })?;

    let value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| DbError::Decode { message: format!("invalid json body: {e}") })?;

    let records: Vec<Record> = match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item)
                    .map_err(|e| DbError::Decode { message: format!("invalid record: {e}") })
            })
            .collect::<Result<_, _>>()?,
        serde_json::Value::Object(_) => vec![serde_json::from_value(value)
            .map_err(|e| DbError::Decode { message: format!("invalid record: {e}") })?],
        _ => {
            return Err(DbError::Decode {
                message: "expected a json object or array of objects".to_string(),
            })
        }
    };

    Ok(records_to_stream(records))
}

/// Streaming JSON-lines decode.
async fn decode_jsonl<R>(reader: R) -> Result<DecodedStream, DbError>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();

    // the first record fixes the column set
    let first: Record = loop {
        match lines
            .next_line()
            .await
            .map_err(|e| DbError::Decode { message: e.to_string() })?
        {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => {
                break serde_json::from_str(&line)
                    .map_err(|e| DbError::Decode { message: format!("invalid record: {e}") })?
            }
            None => return Ok(DecodedStream::from_rows(Vec::new(), Vec::new())),
        }
    };

    let columns: Vec<String> = first.keys().cloned().collect();
    let first_row = record_to_row(&columns, &first);

    let (tx, rx) = mpsc::channel(DECODE_BUFFER);
    let task_columns = columns.clone();
    tokio::spawn(async move {
        if tx.send(Ok(first_row)).await.is_err() {
            return;
        }
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return,
                Err(e) => {
                    let _ = tx.send(Err(DbError::Decode { message: e.to_string() })).await;
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let item = serde_json::from_str::<Record>(&line)
                .map(|record| record_to_row(&task_columns, &record))
                .map_err(|e| DbError::Decode { message: format!("invalid record: {e}") });
            let stop = item.is_err();
            if tx.send(item).await.is_err() || stop {
                return;
            }
        }
    });

    Ok(DecodedStream { columns, rx })
}

/// Buffered flat-XML decode: each child of the root element is a record and
/// its children are the fields.
async fn decode_xml<R>(mut reader: R) -> Result<DecodedStream, DbError>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    use quick_xml::events::Event;

    let mut body = Vec::new();
    reader
        .read_to_end(&mut body)
        .await
        .map_err(|e| DbError::Decode { message: e.to_string() })?;

    let mut xml = quick_xml::Reader::from_reader(body.as_slice());
    xml.config_mut().trim_text(true);

    let mut records: Vec<Record> = Vec::new();
    let mut current: Option<Record> = None;
    let mut field: Option<String> = None;
    let mut depth = 0usize;
    let mut buf = Vec::new();

    loop {
        match xml
            .read_event_into(&mut buf)
            .map_err(|e| DbError::Decode { message: format!("invalid xml body: {e}") })?
        {
            Event::Start(start) => {
                depth += 1;
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                match depth {
                    2 => current = Some(Record::new()),
                    3 => field = Some(name),
                    _ => {}
                }
            }
            Event::Text(text) => {
                if let (Some(record), Some(name)) = (current.as_mut(), field.as_ref()) {
                    let value = text
                        .unescape()
                        .map_err(|e| DbError::Decode { message: e.to_string() })?;
                    record.insert(name.clone(), serde_json::Value::from(value.into_owned()));
                }
            }
            Event::End(_) => {
                match depth {
                    2 => {
                        if let Some(record) = current.take() {
                            records.push(record);
                        }
                    }
                    3 => field = None,
                    _ => {}
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(records_to_stream(records))
}

fn records_to_stream(records: Vec<Record>) -> DecodedStream {
    let columns: Vec<String> = records
        .first()
        .map(|r| r.keys().cloned().collect())
        .unwrap_or_default();
    let rows = records.iter().map(|r| record_to_row(&columns, r)).collect();
    DecodedStream::from_rows(columns, rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut ds: DecodedStream) -> (Vec<String>, Vec<Row>) {
        let columns = ds.columns().to_vec();
        let mut rows = Vec::new();
        while let Some(row) = ds.next_row().await {
            rows.push(row.expect("decode row"));
        }
        (columns, rows)
    }

    #[tokio::test]
    async fn decodes_json_array() {
        let body = br#"[{"id": 1, "city": "Big"}, {"id": 2, "city": "Small"}]"#;
        let ds = decode_body(BodyFormat::Json, &body[..]).await.unwrap();
        let (columns, rows) = collect(ds).await;
        assert_eq!(columns, vec!["city", "id"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec![Value::Text("Big".into()), Value::Int(1)]);
    }

    #[tokio::test]
    async fn decodes_single_json_object() {
        let body = br#"{"id": 7}"#;
        let ds = decode_body(BodyFormat::Json, &body[..]).await.unwrap();
        let (columns, rows) = collect(ds).await;
        assert_eq!(columns, vec!["id"]);
        assert_eq!(rows, vec![vec![Value::Int(7)]]);
    }

    #[tokio::test]
    async fn decodes_jsonl() {
        let body = b"{\"id\": 1}\n\n{\"id\": 2}\n";
        let ds = decode_body(BodyFormat::JsonLines, &body[..]).await.unwrap();
        let (columns, rows) = collect(ds).await;
        assert_eq!(columns, vec!["id"]);
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn decodes_csv_with_header() {
        let body = b"id,city\n1,Big\n2,Small\n";
        let ds = decode_body(BodyFormat::Csv, &body[..]).await.unwrap();
        let (columns, rows) = collect(ds).await;
        assert_eq!(columns, vec!["id", "city"]);
        assert_eq!(rows[1], vec![Value::Text("2".into()), Value::Text("Small".into())]);
    }

    #[tokio::test]
    async fn decodes_flat_xml() {
        let body = b"<rows><row><id>1</id><city>Big</city></row></rows>";
        let ds = decode_body(BodyFormat::Xml, &body[..]).await.unwrap();
        let (columns, rows) = collect(ds).await;
        assert_eq!(columns, vec!["city", "id"]);
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn missing_fields_become_null() {
        let body = br#"[{"id": 1, "city": "Big"}, {"id": 2}]"#;
        let ds = decode_body(BodyFormat::Json, &body[..]).await.unwrap();
        let (_, rows) = collect(ds).await;
        assert_eq!(rows[1][0], Value::Null);
    }

    #[test]
    fn sniffs_upload_formats() {
        assert_eq!(BodyFormat::sniff(b"  [{\"a\":1}]"), BodyFormat::Json);
        assert_eq!(BodyFormat::sniff(b"<rows/>"), BodyFormat::Xml);
        assert_eq!(BodyFormat::sniff(b"id,city\n"), BodyFormat::Csv);
    }

    #[test]
    fn picks_format_from_content_type() {
        assert_eq!(BodyFormat::from_content_type("text/csv"), BodyFormat::Csv);
        assert_eq!(BodyFormat::from_content_type("application/xml"), BodyFormat::Xml);
        assert_eq!(
            BodyFormat::from_content_type("application/jsonlines"),
            BodyFormat::JsonLines
        );
        assert_eq!(BodyFormat::from_content_type("application/json"), BodyFormat::Json);
        assert_eq!(BodyFormat::from_content_type(""), BodyFormat::Json);
    }
}
