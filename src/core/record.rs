//! Record container: sequential, length-prefixed, checksummed records with a
//! companion text index for random access.
//!
//! Frame layout (all integers little-endian):
//!   [0..8]     payload length (u64)
//!   [8..12]    masked CRC-32C of the 8 length bytes (u32)
//!   [12..12+n] payload
//!   [..+4]     masked CRC-32C of the payload (u32)
//!
//! Payload layout:
//!   field count (u16), then per field:
//!   name length (u8), name (utf-8), kind (u8: 0 = bytes, 1 = i64), value length (u32), value

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use memmap2::Mmap;
use tracing::warn;

use super::crc::masked_crc32c;
use crate::config::ImageFormat;
use crate::error::TileError;

pub const CONTAINER_EXT: &str = "tfrecords";
pub const INDEX_EXT: &str = "index";

const FRAME_HEADER_SIZE: usize = 12;
const FRAME_FOOTER_SIZE: usize = 4;
const KIND_BYTES: u8 = 0;
const KIND_INT: u8 = 1;

/// One tile as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub slide: String,
    pub image_raw: Vec<u8>,
    pub loc_x: i64,
    pub loc_y: i64,
}

/// Byte offset and total frame length of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub length: u64,
}

pub fn index_path_for(container: &Path) -> PathBuf {
    container.with_extension(INDEX_EXT)
}

/// Slide name a container was written for (its file stem).
pub fn container_name(container: &Path) -> String {
    container
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

pub fn encode_record(record: &Record) -> Vec<u8> {
    let mut buf = Vec::with_capacity(record.image_raw.len() + record.slide.len() + 64);
    buf.extend_from_slice(&4u16.to_le_bytes());
    push_field(&mut buf, "slide", KIND_BYTES, record.slide.as_bytes());
    push_field(&mut buf, "image_raw", KIND_BYTES, &record.image_raw);
    push_field(&mut buf, "loc_x", KIND_INT, &record.loc_x.to_le_bytes());
    push_field(&mut buf, "loc_y", KIND_INT, &record.loc_y.to_le_bytes());
    buf
}

fn push_field(buf: &mut Vec<u8>, name: &str, kind: u8, value: &[u8]) {
    buf.push(name.len() as u8);
    buf.extend_from_slice(name.as_bytes());
    buf.push(kind);
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value);
}

/// Parse a payload. Unknown fields are skipped.
pub fn decode_record(payload: &[u8]) -> Result<Record> {
    let mut slide = None;
    let mut image_raw = None;
    let mut loc_x = None;
    let mut loc_y = None;

    let mut cursor = Cursor { data: payload, pos: 0 };
    let count = u16::from_le_bytes(cursor.take_array::<2>()?);
    for _ in 0..count {
        let name_len = cursor.take(1)?[0] as usize;
        let name = std::str::from_utf8(cursor.take(name_len)?)
            .map_err(|_| anyhow!("field name is not utf-8"))?
            .to_string();
        let kind = cursor.take(1)?[0];
        let len = u32::from_le_bytes(cursor.take_array::<4>()?) as usize;
        let value = cursor.take(len)?;
        match (name.as_str(), kind) {
            ("slide", KIND_BYTES) => {
                slide = Some(
                    String::from_utf8(value.to_vec()).map_err(|_| anyhow!("slide name is not utf-8"))?,
                )
            }
            ("image_raw", KIND_BYTES) => image_raw = Some(value.to_vec()),
            ("loc_x", KIND_INT) => loc_x = Some(read_i64(value)?),
            ("loc_y", KIND_INT) => loc_y = Some(read_i64(value)?),
            _ => {}
        }
    }

    Ok(Record {
        slide: slide.ok_or_else(|| anyhow!("record missing 'slide'"))?,
        image_raw: image_raw.ok_or_else(|| anyhow!("record missing 'image_raw'"))?,
        loc_x: loc_x.unwrap_or(0),
        loc_y: loc_y.unwrap_or(0),
    })
}

fn read_i64(value: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = value
        .try_into()
        .map_err(|_| anyhow!("integer field has {} bytes, expected 8", value.len()))?;
    Ok(i64::from_le_bytes(bytes))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(anyhow!("payload truncated at byte {} (need {})", self.pos, n));
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let len_bytes = (payload.len() as u64).to_le_bytes();
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len() + FRAME_FOOTER_SIZE);
    buf.extend_from_slice(&len_bytes);
    buf.extend_from_slice(&masked_crc32c(&len_bytes).to_le_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&masked_crc32c(payload).to_le_bytes());
    buf
}

/// Parse the frame starting at `data[0]`, returning the verified payload.
fn unframe<'a>(data: &'a [u8], path: &Path, offset: u64) -> Result<&'a [u8]> {
    let corrupt = |reason: String| -> anyhow::Error {
        TileError::RecordCorruption { path: path.to_path_buf(), reason }.into()
    };
    if data.len() < FRAME_HEADER_SIZE {
        return Err(corrupt(format!("truncated header at offset {}", offset)));
    }
    let len_bytes = &data[0..8];
    let stored = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    if stored != masked_crc32c(len_bytes) {
        return Err(corrupt(format!("length checksum mismatch at offset {}", offset)));
    }
    let len = u64::from_le_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ]) as usize;
    let end = match len.checked_add(FRAME_HEADER_SIZE + FRAME_FOOTER_SIZE) {
        Some(end) if end <= data.len() => end,
        _ => return Err(corrupt(format!("truncated payload at offset {}", offset))),
    };
    if data.len() < end {
        return Err(corrupt(format!("truncated payload at offset {}", offset)));
    }
    let payload = &data[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len];
    let f = &data[FRAME_HEADER_SIZE + len..end];
    let stored = u32::from_le_bytes([f[0], f[1], f[2], f[3]]);
    if stored != masked_crc32c(payload) {
        return Err(corrupt(format!("payload checksum mismatch at offset {}", offset)));
    }
    Ok(payload)
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Streams records into a container. Call [`RecordWriter::finish`] to flush,
/// write the index, and delete the container if nothing was written.
pub struct RecordWriter {
    path: PathBuf,
    out: BufWriter<File>,
    index: Vec<IndexEntry>,
    position: u64,
}

impl RecordWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create container {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            index: Vec::new(),
            position: 0,
        })
    }

    pub fn write(&mut self, record: &Record) -> Result<()> {
        self.write_payload(&encode_record(record))
    }

    /// Write an already-encoded payload (used when copying records between containers).
    pub fn write_payload(&mut self, payload: &[u8]) -> Result<()> {
        let bytes = frame(payload);
        self.out
            .write_all(&bytes)
            .with_context(|| format!("Failed to write record to {}", self.path.display()))?;
        self.index.push(IndexEntry { offset: self.position, length: bytes.len() as u64 });
        self.position += bytes.len() as u64;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Finalize the container. Returns the number of records written.
    pub fn finish(mut self) -> Result<usize> {
        self.out.flush()?;
        drop(self.out);
        if self.index.is_empty() {
            fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove empty container {}", self.path.display()))?;
            let _ = fs::remove_file(index_path_for(&self.path));
            return Ok(0);
        }
        write_index(&index_path_for(&self.path), &self.index)?;
        Ok(self.index.len())
    }

    /// Discard a partially written container and any index left beside it.
    pub fn abandon(self) {
        drop(self.out);
        for path in [self.path.clone(), index_path_for(&self.path)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove partial container {}: {}", path.display(), e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

pub fn write_index(path: &Path, entries: &[IndexEntry]) -> Result<()> {
    let mut out = BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create index {}", path.display()))?,
    );
    for e in entries {
        writeln!(out, "{} {}", e.offset, e.length)?;
    }
    out.flush()?;
    Ok(())
}

/// Load an index. `Ok(None)` means the index exists but is empty (no records).
pub fn read_index(path: &Path) -> Result<Option<Vec<IndexEntry>>> {
    let file = File::open(path).with_context(|| format!("Index not found: {}", path.display()))?;
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }
    let mut entries = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let parse = |s: Option<&str>| -> Result<u64> {
            s.ok_or_else(|| anyhow!("{}:{}: missing column", path.display(), lineno + 1))?
                .parse::<u64>()
                .map_err(|e| anyhow!("{}:{}: {}", path.display(), lineno + 1, e))
        };
        let offset = parse(parts.next())?;
        let length = parse(parts.next())?;
        entries.push(IndexEntry { offset, length });
    }
    Ok(Some(entries))
}

/// Scan a container and write its index. An empty container gets a zero-byte index.
pub fn build_index(container: &Path) -> Result<usize> {
    let mut entries = Vec::new();
    let mut reader = RecordReader::open(container)?;
    loop {
        let offset = reader.position();
        match reader.next_payload()? {
            Some(payload) => entries.push(IndexEntry {
                offset,
                length: (FRAME_HEADER_SIZE + payload.len() + FRAME_FOOTER_SIZE) as u64,
            }),
            None => break,
        }
    }
    let index_path = index_path_for(container);
    if entries.is_empty() {
        File::create(&index_path)?;
    } else {
        write_index(&index_path, &entries)?;
    }
    Ok(entries.len())
}

// ---------------------------------------------------------------------------
// Sequential reader
// ---------------------------------------------------------------------------

/// Full sequential scan of a container, verifying checksums.
pub struct RecordReader {
    path: PathBuf,
    input: BufReader<File>,
    position: u64,
}

impl RecordReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open container {}", path.display()))?;
        Ok(Self { path: path.to_path_buf(), input: BufReader::new(file), position: 0 })
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Next raw payload, or `None` at a clean end of file.
    pub fn next_payload(&mut self) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match read_exact_or_eof(&mut self.input, &mut header)? {
            0 => return Ok(None),
            n if n < FRAME_HEADER_SIZE => {
                return Err(TileError::RecordCorruption {
                    path: self.path.clone(),
                    reason: format!("truncated header at offset {}", self.position),
                }
                .into())
            }
            _ => {}
        }
        let len = u64::from_le_bytes([
            header[0], header[1], header[2], header[3], header[4], header[5], header[6], header[7],
        ]) as usize;
        // Verify the length checksum before trusting `len` for the allocation.
        unframe_header(&header, &self.path, self.position)?;
        let mut frame_buf = Vec::with_capacity(FRAME_HEADER_SIZE + len + FRAME_FOOTER_SIZE);
        frame_buf.extend_from_slice(&header);
        frame_buf.resize(FRAME_HEADER_SIZE + len + FRAME_FOOTER_SIZE, 0);
        self.input
            .read_exact(&mut frame_buf[FRAME_HEADER_SIZE..])
            .map_err(|_| TileError::RecordCorruption {
                path: self.path.clone(),
                reason: format!("truncated payload at offset {}", self.position),
            })?;
        let payload = unframe(&frame_buf, &self.path, self.position)?.to_vec();
        self.position += frame_buf.len() as u64;
        Ok(Some(payload))
    }
}

fn unframe_header(header: &[u8; FRAME_HEADER_SIZE], path: &Path, offset: u64) -> Result<()> {
    let stored = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    if stored != masked_crc32c(&header[0..8]) {
        return Err(TileError::RecordCorruption {
            path: path.to_path_buf(),
            reason: format!("length checksum mismatch at offset {}", offset),
        }
        .into());
    }
    Ok(())
}

fn read_exact_or_eof(input: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl Iterator for RecordReader {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_payload() {
            Ok(Some(payload)) => Some(decode_record(&payload)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Sequential scan that keeps record `i` only when `i % num_shards == shard`.
pub struct ShardedReader {
    inner: RecordReader,
    shard: usize,
    num_shards: usize,
    next_index: usize,
}

impl ShardedReader {
    pub fn open(path: &Path, shard: usize, num_shards: usize) -> Result<Self> {
        if num_shards == 0 || shard >= num_shards {
            return Err(anyhow!("invalid shard {} of {}", shard, num_shards));
        }
        Ok(Self { inner: RecordReader::open(path)?, shard, num_shards, next_index: 0 })
    }
}

impl Iterator for ShardedReader {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let payload = match self.inner.next_payload() {
                Ok(Some(p)) => p,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            };
            let i = self.next_index;
            self.next_index += 1;
            if i % self.num_shards == self.shard {
                return Some(decode_record(&payload));
            }
        }
    }
}

/// Number of records in a container, by full scan.
pub fn count_records(container: &Path) -> Result<usize> {
    let mut reader = RecordReader::open(container)?;
    let mut n = 0;
    while reader.next_payload()?.is_some() {
        n += 1;
    }
    Ok(n)
}

// ---------------------------------------------------------------------------
// Random access
// ---------------------------------------------------------------------------

/// A memory-mapped container with its index, for random access by record number.
pub struct IndexedContainer {
    path: PathBuf,
    mmap: Option<Mmap>,
    index: Vec<IndexEntry>,
}

impl IndexedContainer {
    /// Open a container using its companion index. A zero-byte index yields
    /// an empty container.
    pub fn open(path: &Path) -> Result<Self> {
        let index = read_index(&index_path_for(path))?.unwrap_or_default();
        Self::with_index(path, index)
    }

    pub fn with_index(path: &Path, index: Vec<IndexEntry>) -> Result<Self> {
        if index.is_empty() {
            return Ok(Self { path: path.to_path_buf(), mmap: None, index });
        }
        let file = File::open(path)
            .with_context(|| format!("Failed to open container {}", path.display()))?;
        // SAFETY: read-only mapping; containers are not rewritten while being sampled.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to mmap container {}", path.display()))?;
        let len = mmap.len() as u64;
        for (i, entry) in index.iter().enumerate() {
            match entry.offset.checked_add(entry.length) {
                Some(end) if end <= len => {}
                _ => {
                    return Err(TileError::RecordCorruption {
                        path: path.to_path_buf(),
                        reason: format!("index entry {} extends past EOF ({} bytes)", i, len),
                    }
                    .into())
                }
            }
        }
        Ok(Self { path: path.to_path_buf(), mmap: Some(mmap), index })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Verified payload bytes of record `i`.
    pub fn payload(&self, i: usize) -> Result<&[u8]> {
        let entry = self
            .index
            .get(i)
            .ok_or_else(|| anyhow!("record {} out of range ({} records)", i, self.index.len()))?;
        let mmap = self
            .mmap
            .as_ref()
            .ok_or_else(|| anyhow!("container {} has no records", self.path.display()))?;
        let bytes = usize::try_from(entry.offset)
            .ok()
            .zip(usize::try_from(entry.length).ok())
            .and_then(|(start, length)| Some(start..start.checked_add(length)?))
            .and_then(|range| mmap.get(range))
            .ok_or_else(|| TileError::RecordCorruption {
                path: self.path.clone(),
                reason: format!("record {} at offset {} is out of bounds", i, entry.offset),
            })?;
        unframe(bytes, &self.path, entry.offset)
    }

    pub fn get(&self, i: usize) -> Result<Record> {
        decode_record(self.payload(i)?)
    }
}

/// Image format and dimensions of the first record, or `None` for an empty container.
pub fn detect_format(container: &Path) -> Result<Option<(ImageFormat, u32, u32)>> {
    let mut reader = RecordReader::open(container)?;
    let Some(payload) = reader.next_payload()? else {
        return Ok(None);
    };
    let record = decode_record(&payload)?;
    let format = match image::guess_format(&record.image_raw)? {
        image::ImageFormat::Png => ImageFormat::Png,
        image::ImageFormat::Jpeg => ImageFormat::Jpg,
        other => return Err(anyhow!("unsupported tile image format {:?}", other)),
    };
    let img = image::load_from_memory(&record.image_raw)?;
    Ok(Some((format, img.width(), img.height())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(slide: &str, x: i64, y: i64) -> Record {
        Record { slide: slide.into(), image_raw: vec![x as u8, y as u8, 0xFF], loc_x: x, loc_y: y }
    }

    #[test]
    fn test_write_then_scan_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("S.tfrecords");
        let mut writer = RecordWriter::create(&path).unwrap();
        writer.write(&record("S", 0, 0)).unwrap();
        writer.write(&record("S", 512, 0)).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        let records: Vec<Record> = RecordReader::open(&path).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.slide == "S"));
        assert_eq!((records[0].loc_x, records[0].loc_y), (0, 0));
        assert_eq!((records[1].loc_x, records[1].loc_y), (512, 0));
        assert_eq!(count_records(&path).unwrap(), 2);
    }

    #[test]
    fn test_empty_writer_deletes_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.tfrecords");
        let writer = RecordWriter::create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(writer.finish().unwrap(), 0);
        assert!(!path.exists());
        assert!(!index_path_for(&path).exists());
    }

    #[test]
    fn test_random_access_matches_sequential() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slide.tfrecords");
        let mut writer = RecordWriter::create(&path).unwrap();
        for i in 0..10 {
            writer.write(&record("slide", i * 100, i * 7)).unwrap();
        }
        writer.finish().unwrap();

        let indexed = IndexedContainer::open(&path).unwrap();
        assert_eq!(indexed.len(), 10);
        assert_eq!(indexed.get(7).unwrap(), record("slide", 700, 49));
        assert_eq!(indexed.get(0).unwrap(), record("slide", 0, 0));
        assert!(indexed.get(10).is_err());
    }

    #[test]
    fn test_bad_index_entries_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tfrecords");
        let mut writer = RecordWriter::create(&path).unwrap();
        for i in 0..3 {
            writer.write(&record("bad", i, i)).unwrap();
        }
        writer.finish().unwrap();
        let mut index = read_index(&index_path_for(&path)).unwrap().unwrap();
        let size = fs::metadata(&path).unwrap().len();

        // a middle entry past EOF is caught even though the last one is fine
        let mut past_eof = index.clone();
        past_eof[1].offset = size;
        let err = IndexedContainer::with_index(&path, past_eof).err().unwrap();
        assert!(matches!(err.downcast_ref::<TileError>(), Some(TileError::RecordCorruption { .. })));

        let mut overflow = index.clone();
        overflow[0] = IndexEntry { offset: u64::MAX, length: 16 };
        assert!(IndexedContainer::with_index(&path, overflow).is_err());

        // in bounds but not on a frame boundary
        index[2].offset += 1;
        index[2].length -= 1;
        let misaligned = IndexedContainer::with_index(&path, index).unwrap();
        assert!(misaligned.get(0).is_ok());
        let err = misaligned.get(2).unwrap_err();
        assert!(matches!(err.downcast_ref::<TileError>(), Some(TileError::RecordCorruption { .. })));
    }

    #[test]
    fn test_abandon_removes_partial_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.tfrecords");
        let mut writer = RecordWriter::create(&path).unwrap();
        writer.write(&record("partial", 0, 0)).unwrap();
        writer.abandon();
        assert!(!path.exists());
        assert!(!index_path_for(&path).exists());
    }

    #[test]
    fn test_build_index_matches_writer_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tfrecords");
        let mut writer = RecordWriter::create(&path).unwrap();
        writer.write(&record("a", 1, 2)).unwrap();
        writer.write(&record("a", 3, 4)).unwrap();
        writer.finish().unwrap();
        let from_writer = read_index(&index_path_for(&path)).unwrap();

        fs::remove_file(index_path_for(&path)).unwrap();
        assert_eq!(build_index(&path).unwrap(), 2);
        assert_eq!(read_index(&index_path_for(&path)).unwrap(), from_writer);
    }

    #[test]
    fn test_zero_byte_index_means_no_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("none.tfrecords");
        File::create(&path).unwrap();
        assert_eq!(build_index(&path).unwrap(), 0);
        assert_eq!(fs::metadata(index_path_for(&path)).unwrap().len(), 0);
        assert!(read_index(&index_path_for(&path)).unwrap().is_none());
        assert!(IndexedContainer::open(&path).unwrap().is_empty());
    }

    #[test]
    fn test_missing_index_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_index(&dir.path().join("nope.index")).is_err());
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.tfrecords");
        let mut writer = RecordWriter::create(&path).unwrap();
        writer.write(&record("c", 5, 5)).unwrap();
        writer.finish().unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = RecordReader::open(&path).unwrap().next().unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TileError>(),
            Some(TileError::RecordCorruption { .. })
        ));
    }

    #[test]
    fn test_truncated_container_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.tfrecords");
        let mut writer = RecordWriter::create(&path).unwrap();
        writer.write(&record("t", 1, 1)).unwrap();
        writer.write(&record("t", 2, 2)).unwrap();
        writer.finish().unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        let results: Vec<Result<Record>> = RecordReader::open(&path).unwrap().collect();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn test_decode_skips_unknown_fields() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&3u16.to_le_bytes());
        push_field(&mut payload, "label", KIND_INT, &9i64.to_le_bytes());
        push_field(&mut payload, "slide", KIND_BYTES, b"x");
        push_field(&mut payload, "image_raw", KIND_BYTES, &[1, 2]);
        let r = decode_record(&payload).unwrap();
        assert_eq!(r.slide, "x");
        assert_eq!(r.image_raw, vec![1, 2]);
        assert_eq!((r.loc_x, r.loc_y), (0, 0));
    }

    #[test]
    fn test_container_name_from_path() {
        assert_eq!(container_name(Path::new("/a/b/TCGA-01.tfrecords")), "TCGA-01");
    }

    #[test]
    fn test_sharded_reader_partitions_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.tfrecords");
        let mut w = RecordWriter::create(&path).unwrap();
        for i in 0..7 {
            w.write(&Record { slide: "s".into(), image_raw: vec![i as u8], loc_x: i, loc_y: 0 }).unwrap();
        }
        w.finish().unwrap();
        let shard = |k| -> Vec<i64> {
            ShardedReader::open(&path, k, 3).unwrap().map(|r| r.unwrap().loc_x).collect()
        };
        assert_eq!(shard(0), vec![0, 3, 6]);
        assert_eq!(shard(1), vec![1, 4]);
        assert_eq!(shard(2), vec![2, 5]);
        assert!(ShardedReader::open(&path, 3, 3).is_err());
    }
}
