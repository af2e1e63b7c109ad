// Newline-delimited JSON source for local runs
//
// Reads from a file or stdin. Positions are 1-based line numbers; blank lines
// are skipped but still advance the position. Lines are handed on as raw
// bytes, so a line that is not UTF-8 fails decoding like any other bad record.

use super::{Position, RecordSource, SourceEvent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::info;

pub struct JsonLinesSource {
    name: String,
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
    buf: Vec<u8>,
    line: u64,
    finished: bool,
    acknowledged: Option<u64>,
}

impl JsonLinesSource {
    /// Open a file, or stdin when the path is `-`.
    pub async fn open(path: &Path) -> Result<Self> {
        if path == Path::new("-") {
            return Ok(Self::from_reader("stdin", BufReader::new(tokio::io::stdin())));
        }

        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open input file: {}", path.display()))?;
        Ok(Self::from_reader(
            path.display().to_string(),
            BufReader::new(file),
        ))
    }

    pub fn from_reader<R>(name: impl Into<String>, reader: R) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        Self {
            name: name.into(),
            reader: Box::new(reader),
            buf: Vec::new(),
            line: 0,
            finished: false,
            acknowledged: None,
        }
    }

    /// Highest acknowledged line number.
    pub fn acknowledged(&self) -> Option<u64> {
        self.acknowledged
    }
}

#[async_trait]
impl RecordSource for JsonLinesSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_event(&mut self) -> Result<SourceEvent> {
        while !self.finished {
            self.buf.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .await
                .with_context(|| format!("Failed to read from {}", self.name))?;
            if read == 0 {
                self.finished = true;
                break;
            }

            self.line += 1;
            let payload = trim_line_ending(&self.buf);
            if payload.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(SourceEvent::Record {
                payload: payload.to_vec(),
                position: Position {
                    partition: self.name.clone(),
                    sequence: self.line.to_string(),
                },
            });
        }

        Ok(SourceEvent::EndOfPartition {
            partition: self.name.clone(),
            remaining: 0,
        })
    }

    async fn ack(&mut self, positions: &[Position]) -> Result<()> {
        for position in positions.iter().filter(|p| p.partition == self.name) {
            let line: u64 = position
                .sequence
                .parse()
                .with_context(|| format!("Invalid line position: {}", position))?;
            if self.acknowledged.map_or(true, |acked| line > acked) {
                self.acknowledged = Some(line);
                info!(source = %self.name, line, "Acknowledged input position");
            }
        }
        Ok(())
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(input: &'static str) -> JsonLinesSource {
        JsonLinesSource::from_reader("test", BufReader::new(input.as_bytes()))
    }

    #[tokio::test]
    async fn test_reads_lines_with_positions() {
        let mut source = source("{\"a\":1}\n\n{\"a\":2}\n");

        match source.next_event().await.unwrap() {
            SourceEvent::Record { payload, position } => {
                assert_eq!(payload, b"{\"a\":1}");
                assert_eq!(position.sequence, "1");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match source.next_event().await.unwrap() {
            SourceEvent::Record { position, .. } => assert_eq!(position.sequence, "3"),
            other => panic!("unexpected event: {:?}", other),
        }
        for _ in 0..2 {
            assert_eq!(
                source.next_event().await.unwrap(),
                SourceEvent::EndOfPartition {
                    partition: "test".to_string(),
                    remaining: 0
                }
            );
        }
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_passed_through() {
        let input: &'static [u8] = b"\xff\xfe bad\r\n{\"a\":1}";
        let mut source = JsonLinesSource::from_reader("test", BufReader::new(input));

        match source.next_event().await.unwrap() {
            SourceEvent::Record { payload, position } => {
                assert_eq!(payload, b"\xff\xfe bad");
                assert_eq!(position.sequence, "1");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match source.next_event().await.unwrap() {
            SourceEvent::Record { payload, position } => {
                assert_eq!(payload, b"{\"a\":1}");
                assert_eq!(position.sequence, "2");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            source.next_event().await.unwrap(),
            SourceEvent::EndOfPartition { remaining: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_open_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"ticker": "AMZN", "event_time": "t", "price": 0.5}}"#).unwrap();

        let mut source = JsonLinesSource::open(file.path()).await.unwrap();
        assert_eq!(source.name(), file.path().display().to_string());
        assert!(matches!(
            source.next_event().await.unwrap(),
            SourceEvent::Record { .. }
        ));
        assert!(matches!(
            source.next_event().await.unwrap(),
            SourceEvent::EndOfPartition { remaining: 0, .. }
        ));

        let missing = file.path().with_extension("missing");
        assert!(JsonLinesSource::open(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_ack_keeps_highest_line() {
        let mut source = source("");
        let at = |line: &str| Position {
            partition: "test".to_string(),
            sequence: line.to_string(),
        };

        source.ack(&[at("5")]).await.unwrap();
        source.ack(&[at("3")]).await.unwrap();
        assert_eq!(source.acknowledged(), Some(5));
        assert!(source.ack(&[at("x")]).await.is_err());
    }
}
