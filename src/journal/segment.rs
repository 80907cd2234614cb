use crc32fast::Hasher;
use log::warn;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Segment header: magic then a big-endian format version.
pub const SEGMENT_MAGIC: [u8; 4] = *b"BNDJ";
pub const HEADER_LEN: u64 = 8;

/// Format version that introduced ledger-key meta records.
pub const VERSION_V3: u32 = 3;
/// Format version that introduced fence meta records.
pub const VERSION_V4: u32 = 4;
pub const CURRENT_VERSION: u32 = VERSION_V4;

/// Records larger than this are rejected at the framing layer.
pub const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

const FRAME_LEN: usize = 8;

pub fn segment_file_name(id: u64) -> String {
    format!("{id:x}.txn")
}

fn parse_segment_id(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".txn")?;
    u64::from_str_radix(stem, 16).ok()
}

/// Segment ids present in `dir`, ascending.
pub fn list_segments(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for child in fs::read_dir(dir)? {
        let child = child?;
        if let Some(id) = child.file_name().to_str().and_then(parse_segment_id) {
            segments.push((id, child.path()));
        }
    }
    segments.sort_unstable_by_key(|(id, _)| *id);
    Ok(segments)
}

/// Appends `len | crc32 | payload` to `buf`.
pub fn frame_record(buf: &mut Vec<u8>, payload: &[u8]) -> Result<(), SegmentError> {
    if payload.len() > MAX_RECORD_BYTES {
        return Err(SegmentError::RecordTooLarge {
            len: payload.len(),
        });
    }
    let mut hasher = Hasher::new();
    hasher.update(payload);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&hasher.finalize().to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(())
}

/// Open segment file owned by the journal writer.
#[derive(Debug)]
pub struct SegmentWriter {
    id: u64,
    file: File,
    offset: u64,
}

impl SegmentWriter {
    pub fn create(dir: &Path, id: u64) -> io::Result<Self> {
        let path = dir.join(segment_file_name(id));
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;
        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(&SEGMENT_MAGIC);
        header.extend_from_slice(&CURRENT_VERSION.to_be_bytes());
        file.write_all(&header)?;
        Ok(Self {
            id,
            file,
            offset: HEADER_LEN,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Byte position records written next will start at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk)?;
        self.offset += chunk.len() as u64;
        Ok(())
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// Sequential reader over one segment's records.
///
/// A truncated frame, or a checksum mismatch on the final record, ends the
/// stream cleanly; crashed writers leave exactly such tails behind. A
/// mismatch with more bytes after it cannot come from a torn write and is
/// reported as corruption.
pub struct SegmentScanner {
    id: u64,
    version: u32,
    reader: BufReader<File>,
    offset: u64,
    file_len: u64,
    path: PathBuf,
    done: bool,
}

impl SegmentScanner {
    pub fn open(id: u64, path: &Path) -> Result<Self, SegmentError> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut header = [0u8; HEADER_LEN as usize];
        reader
            .read_exact(&mut header)
            .map_err(|_| SegmentError::BadHeader {
                path: path.to_path_buf(),
            })?;
        if header[..4] != SEGMENT_MAGIC {
            return Err(SegmentError::BadHeader {
                path: path.to_path_buf(),
            });
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version > CURRENT_VERSION {
            return Err(SegmentError::UnknownVersion { version });
        }
        Ok(Self {
            id,
            version,
            reader,
            offset: HEADER_LEN,
            file_len,
            path: path.to_path_buf(),
            done: false,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Next `(record_offset, payload)`, or `None` at end of stream.
    pub fn next_record(&mut self) -> Result<Option<(u64, Vec<u8>)>, SegmentError> {
        if self.done {
            return Ok(None);
        }
        let mut frame = [0u8; FRAME_LEN];
        match read_exact_or_eof(&mut self.reader, &mut frame)? {
            ReadOutcome::Eof => {
                self.done = true;
                return Ok(None);
            }
            ReadOutcome::Partial => {
                warn!(
                    "event=journal_torn_tail segment={} offset={}",
                    self.id, self.offset
                );
                self.done = true;
                return Ok(None);
            }
            ReadOutcome::Full => {}
        }
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let crc = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
        if len > MAX_RECORD_BYTES {
            return Err(SegmentError::Corrupt {
                path: self.path.clone(),
                offset: self.offset,
            });
        }
        let mut payload = vec![0u8; len];
        match read_exact_or_eof(&mut self.reader, &mut payload)? {
            ReadOutcome::Full => {}
            ReadOutcome::Eof | ReadOutcome::Partial => {
                warn!(
                    "event=journal_torn_tail segment={} offset={}",
                    self.id, self.offset
                );
                self.done = true;
                return Ok(None);
            }
        }
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != crc {
            let record_end = self.offset + (FRAME_LEN + len) as u64;
            if record_end < self.file_len {
                // bytes after the bad record mean this is not a torn write
                return Err(SegmentError::Corrupt {
                    path: self.path.clone(),
                    offset: self.offset,
                });
            }
            warn!(
                "event=journal_crc_mismatch_at_tail segment={} offset={}",
                self.id, self.offset
            );
            self.done = true;
            return Ok(None);
        }
        let record_offset = self.offset;
        self.offset += (FRAME_LEN + len) as u64;
        Ok(Some((record_offset, payload)))
    }

    /// Position after the last successfully read record.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                })
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(ReadOutcome::Full)
}

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("bad segment header at {path}")]
    BadHeader { path: PathBuf },
    #[error("unknown journal format version {version}")]
    UnknownVersion { version: u32 },
    #[error("corrupt segment {path} at offset {offset}")]
    Corrupt { path: PathBuf, offset: u64 },
    #[error("record of {len} bytes exceeds the frame limit")]
    RecordTooLarge { len: usize },
}
