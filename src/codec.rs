//! Streaming reader and writer for chain documents.
//!
//! A chain document is a JSON array of parent records. The decoder yields one
//! parent at a time and the encoder writes the brackets and separators itself,
//! so neither side ever holds more than one record of the file in memory.

use crate::chain::Parent;
use crate::error::{MarkovError, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

pub struct ChainDecoder<R: BufRead> {
    reader: R,
    started: bool,
    finished: bool,
}

impl ChainDecoder<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(ChainDecoder::new(BufReader::new(file)))
    }
}

impl<R: BufRead> ChainDecoder<R> {
    pub fn new(reader: R) -> Self {
        ChainDecoder {
            reader,
            started: false,
            finished: false,
        }
    }

    /// Skip whitespace and return the next byte without consuming it.
    fn peek(&mut self) -> Result<Option<u8>> {
        loop {
            let (skip, found) = {
                let buf = self.reader.fill_buf()?;
                if buf.is_empty() {
                    return Ok(None);
                }
                match buf.iter().position(|b| !b.is_ascii_whitespace()) {
                    Some(i) => (i, Some(buf[i])),
                    None => (buf.len(), None),
                }
            };
            self.reader.consume(skip);
            if found.is_some() {
                return Ok(found);
            }
        }
    }

    pub fn next_parent(&mut self) -> Result<Option<Parent>> {
        if self.finished {
            return Ok(None);
        }

        if !self.started {
            match self.peek()? {
                // A zero-length document is treated as an empty chain.
                None => {
                    self.finished = true;
                    return Ok(None);
                }
                Some(b'[') => {
                    self.reader.consume(1);
                    self.started = true;
                }
                Some(other) => {
                    return Err(MarkovError::Corrupt(format!(
                        "expected '[' at start of document, found '{}'",
                        other as char
                    )));
                }
            }
        }

        loop {
            match self.peek()? {
                Some(b']') => {
                    self.reader.consume(1);
                    self.finished = true;
                    return Ok(None);
                }
                Some(b',') => {
                    self.reader.consume(1);
                }
                Some(b'{') => {
                    let mut de = serde_json::Deserializer::from_reader(&mut self.reader);
                    let parent = Parent::deserialize(&mut de)?;
                    return Ok(Some(parent));
                }
                Some(other) => {
                    return Err(MarkovError::Corrupt(format!(
                        "unexpected '{}' between records",
                        other as char
                    )));
                }
                None => {
                    return Err(MarkovError::Corrupt("document ended before ']'".into()));
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for ChainDecoder<R> {
    type Item = Result<Parent>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_parent() {
            Ok(Some(parent)) => Some(Ok(parent)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Writes `[`, then one record per line separated by commas, then `]` on `finish`.
/// The output is a complete JSON array only once `finish` has run.
pub struct ChainEncoder<W: Write> {
    writer: W,
    entries: usize,
}

impl ChainEncoder<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        ChainEncoder::new(BufWriter::new(file))
    }

    /// Flush, close the array and fsync the file.
    pub fn finish_file(self) -> Result<usize> {
        let entries = self.entries;
        let writer = self.finish()?;
        let file = writer.into_inner().map_err(|e| MarkovError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(entries)
    }
}

impl<W: Write> ChainEncoder<W> {
    pub fn new(mut writer: W) -> Result<Self> {
        writer.write_all(b"[")?;
        Ok(ChainEncoder { writer, entries: 0 })
    }

    pub fn add(&mut self, parent: &Parent) -> Result<()> {
        if self.entries > 0 {
            self.writer.write_all(b",")?;
        }
        self.writer.write_all(b"\n")?;
        serde_json::to_writer(&mut self.writer, parent)?;
        self.entries += 1;
        Ok(())
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer.write_all(b"\n]")?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Write an empty chain document.
pub fn write_empty<P: AsRef<Path>>(path: P) -> Result<()> {
    ChainEncoder::create(path)?.finish_file()?;
    Ok(())
}
