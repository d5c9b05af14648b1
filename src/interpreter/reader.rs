//! Buffered line reader with byte-position tracking and seek support.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::Result;

const READ_CHUNK: usize = 4096;

/// One physical line, with its source location.
pub struct Line {
    /// Line contents without the newline.
    pub text: String,
    /// Byte offset of the line start.
    pub position: u64,
    /// 1-based line number, when known.
    pub number: Option<u64>,
    /// Bytes consumed, including the newline.
    pub length: u64,
}

pub struct LineReader {
    file: File,
    buffer: Vec<u8>,
    cursor: usize,
    filled: usize,
    /// File offset of the next unconsumed byte.
    position: u64,
    line_number: Option<u64>,
}

impl LineReader {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).await?;
        Ok(Self {
            file,
            buffer: vec![0; READ_CHUNK],
            cursor: 0,
            filled: 0,
            position: 0,
            line_number: Some(1),
        })
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn line_number(&self) -> Option<u64> {
        self.line_number
    }

    /// Seek to `position`, invalidating the read buffer. The caller decides
    /// what the line number becomes (known after a seek to a line start,
    /// unknown otherwise).
    pub async fn seek(&mut self, position: u64, line_number: Option<u64>) -> Result<()> {
        self.file
            .seek(std::io::SeekFrom::Start(position))
            .await?;
        self.cursor = 0;
        self.filled = 0;
        self.position = position;
        self.line_number = line_number;
        Ok(())
    }

    /// Read the next line, or `None` at end of file.
    pub async fn read_line(&mut self) -> Result<Option<Line>> {
        let start = self.position;
        let number = self.line_number;
        let mut text = Vec::new();
        let mut consumed = 0u64;
        let mut saw_newline = false;

        loop {
            if self.cursor < self.filled {
                let chunk = &self.buffer[self.cursor..self.filled];
                match chunk.iter().position(|b| *b == b'\n') {
                    Some(index) => {
                        text.extend_from_slice(&chunk[..index]);
                        self.cursor += index + 1;
                        consumed += index as u64 + 1;
                        saw_newline = true;
                        break;
                    }
                    None => {
                        text.extend_from_slice(chunk);
                        consumed += chunk.len() as u64;
                        self.cursor = self.filled;
                    }
                }
            }
            let n = self.file.read(&mut self.buffer).await?;
            if n == 0 {
                break;
            }
            self.cursor = 0;
            self.filled = n;
        }

        if consumed == 0 && !saw_newline {
            return Ok(None);
        }
        self.position += consumed;
        if saw_newline {
            self.line_number = self.line_number.map(|n| n + 1);
        }
        if text.last() == Some(&b'\r') {
            text.pop();
        }
        Ok(Some(Line {
            text: String::from_utf8_lossy(&text).into_owned(),
            position: start,
            number,
            length: consumed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn reader_for(content: &str) -> (tempfile::NamedTempFile, LineReader) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let reader = LineReader::open(file.path()).await.unwrap();
        (file, reader)
    }

    #[tokio::test]
    async fn tracks_positions_and_line_numbers() {
        let (_guard, mut reader) = reader_for("G28\nG1 X5\n").await;

        let line = reader.read_line().await.unwrap().unwrap();
        assert_eq!(line.text, "G28");
        assert_eq!(line.position, 0);
        assert_eq!(line.number, Some(1));
        assert_eq!(line.length, 4);

        let line = reader.read_line().await.unwrap().unwrap();
        assert_eq!(line.text, "G1 X5");
        assert_eq!(line.position, 4);
        assert_eq!(line.number, Some(2));

        assert!(reader.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn last_line_without_newline() {
        let (_guard, mut reader) = reader_for("M400").await;
        let line = reader.read_line().await.unwrap().unwrap();
        assert_eq!(line.text, "M400");
        assert_eq!(line.length, 4);
        assert!(reader.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn seek_invalidates_buffer_and_line_count() {
        let (_guard, mut reader) = reader_for("G28\nG1 X5\nM400\n").await;
        reader.read_line().await.unwrap().unwrap();
        reader.read_line().await.unwrap().unwrap();

        reader.seek(4, None).await.unwrap();
        assert_eq!(reader.position(), 4);
        assert_eq!(reader.line_number(), None);
        let line = reader.read_line().await.unwrap().unwrap();
        assert_eq!(line.text, "G1 X5");
        assert_eq!(line.number, None);

        reader.seek(0, Some(1)).await.unwrap();
        let line = reader.read_line().await.unwrap().unwrap();
        assert_eq!(line.text, "G28");
        assert_eq!(line.number, Some(1));
    }

    #[tokio::test]
    async fn strips_carriage_returns() {
        let (_guard, mut reader) = reader_for("G28\r\nG29\r\n").await;
        assert_eq!(reader.read_line().await.unwrap().unwrap().text, "G28");
        // The \r is part of the consumed length.
        assert_eq!(reader.position(), 5);
    }
}
