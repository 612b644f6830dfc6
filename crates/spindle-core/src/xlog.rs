//! Snapshot and WAL file container.
//!
//! Both kinds of file share one layout: a text header, a stream of
//! checksummed binary rows, and a mandatory EOF marker.
//!
//! ```text
//! SNAP                          -- or XLOG
//! 0.13
//! Server: <uuid>
//! VClock: {1: 12, 2: 0}
//!                               -- blank line ends the header
//! [row]*                        -- marker, length, xxh3, body
//! [eof marker]
//! ```
//!
//! A row body is `(op, space_id, body-bytes, lsn, server_id)` with
//! varint framing. Rows are trusted only as far as their checksums; a
//! mismatch is an [`SpindleError::XlogError`], which recovery either
//! refuses or skips depending on the panic-if-error policy. A file
//! whose byte stream ends without the EOF marker was truncated
//! mid-write and is treated the same way.
//!
//! While being written, a snapshot carries the `.inprogress` suffix;
//! the rename to its final name is the commit point of a checkpoint.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use spindle_error::{Result, SpindleError};
use spindle_fiber as fiber;
use spindle_types::codec::{read_varint, write_varint};
use tracing::debug;
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

/// Marker preceding every row.
pub const ROW_MARKER: u32 = 0xd5ba_0bab;
/// Marker closing a complete file.
pub const EOF_MARKER: u32 = 0xd510_aded;
/// Container format version written to the header.
pub const XLOG_VERSION: &str = "0.13";

/// Which kind of file a container holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Snap,
    Xlog,
}

impl FileKind {
    pub const fn filetype(self) -> &'static str {
        match self {
            Self::Snap => "SNAP",
            Self::Xlog => "XLOG",
        }
    }

    pub const fn extension(self) -> &'static str {
        match self {
            Self::Snap => "snap",
            Self::Xlog => "xlog",
        }
    }

    fn from_filetype(s: &str) -> Result<Self> {
        match s {
            "SNAP" => Ok(Self::Snap),
            "XLOG" => Ok(Self::Xlog),
            other => Err(SpindleError::xlog(format!("unknown filetype '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Vector clocks
// ---------------------------------------------------------------------------

/// Vector clock: server id → last known LSN. Identifies a recovery
/// point; the component sum names snapshot and WAL files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VClock(BTreeMap<u32, i64>);

impl VClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, server_id: u32) -> i64 {
        self.0.get(&server_id).copied().unwrap_or(0)
    }

    /// Allocate the next LSN for `server_id`.
    pub fn advance(&mut self, server_id: u32) -> i64 {
        let entry = self.0.entry(server_id).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Move `server_id` forward to `lsn` if it is ahead.
    pub fn follow(&mut self, server_id: u32, lsn: i64) {
        let entry = self.0.entry(server_id).or_insert(0);
        if lsn > *entry {
            *entry = lsn;
        }
    }

    /// The signature: sum of all components.
    pub fn sum(&self) -> i64 {
        self.0.values().sum()
    }

    pub fn parse(s: &str) -> Result<Self> {
        let inner = s
            .trim()
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .ok_or_else(|| SpindleError::xlog(format!("malformed vclock '{s}'")))?;
        let mut map = BTreeMap::new();
        for part in inner.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (id, lsn) = part
                .split_once(':')
                .ok_or_else(|| SpindleError::xlog(format!("malformed vclock component '{part}'")))?;
            let id: u32 = id
                .trim()
                .parse()
                .map_err(|_| SpindleError::xlog(format!("malformed vclock server id '{id}'")))?;
            let lsn: i64 = lsn
                .trim()
                .parse()
                .map_err(|_| SpindleError::xlog(format!("malformed vclock lsn '{lsn}'")))?;
            map.insert(id, lsn);
        }
        Ok(Self(map))
    }
}

impl fmt::Display for VClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (id, lsn)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{id}: {lsn}")?;
        }
        f.write_str("}")
    }
}

// ---------------------------------------------------------------------------
// File naming
// ---------------------------------------------------------------------------

/// `<dir>/<020-padded signature>.<ext>[.inprogress]`
pub fn format_filename(dir: &Path, signature: i64, kind: FileKind, inprogress: bool) -> PathBuf {
    let suffix = if inprogress { ".inprogress" } else { "" };
    dir.join(format!(
        "{signature:020}.{ext}{suffix}",
        ext = kind.extension()
    ))
}

/// List completed files of one kind, sorted by signature.
pub fn scan_dir(dir: &Path, kind: FileKind) -> Result<Vec<(i64, PathBuf)>> {
    let mut found = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(&format!(".{}", kind.extension())) else {
            continue;
        };
        if let Ok(signature) = stem.parse::<i64>() {
            found.push((signature, path));
        }
    }
    found.sort_by_key(|(signature, _)| *signature);
    Ok(found)
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Operation carried by a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOp {
    Insert = 1,
    Replace = 2,
    Delete = 3,
}

impl RowOp {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Insert),
            2 => Ok(Self::Replace),
            3 => Ok(Self::Delete),
            other => Err(SpindleError::UnknownRequestType { ty: other.into() }),
        }
    }
}

/// One log row: a request body plus its position in the vclock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub op: RowOp,
    pub space_id: u32,
    /// Wire-encoded tuple (insert/replace) or primary key (delete).
    pub body: Vec<u8>,
    pub lsn: i64,
    pub server_id: u32,
}

impl Row {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.body.len() + 16);
        buf.push(self.op as u8);
        write_varint(&mut buf, u64::from(self.space_id));
        write_varint(&mut buf, self.body.len() as u64);
        buf.extend_from_slice(&self.body);
        write_varint(&mut buf, self.lsn as u64);
        write_varint(&mut buf, u64::from(self.server_id));
        buf
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let (&op, rest) = data
            .split_first()
            .ok_or_else(|| SpindleError::xlog("truncated row body"))?;
        let op = RowOp::from_u8(op).map_err(|_| SpindleError::xlog("unknown row op"))?;
        let (space_id, n) = read_varint(rest).map_err(row_decode_err)?;
        let rest = &rest[n..];
        let (body_len, n) = read_varint(rest).map_err(row_decode_err)?;
        let rest = &rest[n..];
        let body_len =
            usize::try_from(body_len).map_err(|_| SpindleError::xlog("row body overflow"))?;
        let body = rest
            .get(..body_len)
            .ok_or_else(|| SpindleError::xlog("truncated row body"))?
            .to_vec();
        let rest = &rest[body_len..];
        let (lsn, n) = read_varint(rest).map_err(row_decode_err)?;
        let rest = &rest[n..];
        let (server_id, n) = read_varint(rest).map_err(row_decode_err)?;
        if n != rest.len() {
            return Err(SpindleError::xlog("trailing bytes in row body"));
        }
        Ok(Self {
            op,
            space_id: u32::try_from(space_id)
                .map_err(|_| SpindleError::xlog("row space id overflow"))?,
            body,
            lsn: lsn as i64,
            server_id: u32::try_from(server_id)
                .map_err(|_| SpindleError::xlog("row server id overflow"))?,
        })
    }

    /// Build the WAL image of one applied statement: a replace carrying
    /// the new tuple, or a delete carrying the primary key.
    pub fn from_stmt(
        space: &crate::space::Space,
        old: Option<&spindle_types::TupleRef>,
        new: Option<&spindle_types::TupleRef>,
    ) -> Result<Self> {
        match (old, new) {
            (_, Some(new)) => Ok(Self {
                op: RowOp::Replace,
                space_id: space.id(),
                body: new.data().to_vec(),
                lsn: 0,
                server_id: 0,
            }),
            (Some(old), None) => {
                let pk = space.primary_key()?;
                let key = pk.lock().key_def().extract_key(old.fields())?;
                Ok(Self {
                    op: RowOp::Delete,
                    space_id: space.id(),
                    body: spindle_types::codec::encode_tuple(&key),
                    lsn: 0,
                    server_id: 0,
                })
            }
            (None, None) => Err(SpindleError::illegal_params("empty statement")),
        }
    }
}

fn row_decode_err(_: SpindleError) -> SpindleError {
    SpindleError::xlog("truncated row body")
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

pub struct XlogWriter {
    file: BufWriter<File>,
    path: PathBuf,
    rows: u64,
}

impl XlogWriter {
    /// Create a new log file with its header. Refuses to overwrite.
    pub fn create(
        path: &Path,
        kind: FileKind,
        server_uuid: Uuid,
        vclock: &VClock,
    ) -> Result<Self> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut writer = BufWriter::new(file);
        write!(
            writer,
            "{}\n{}\nServer: {}\nVClock: {}\n\n",
            kind.filetype(),
            XLOG_VERSION,
            server_uuid,
            vclock
        )?;
        debug!(path = %path.display(), kind = kind.filetype(), "log file created");
        Ok(Self {
            file: writer,
            path: path.to_owned(),
            rows: 0,
        })
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row; returns the bytes written.
    pub fn write_row(&mut self, row: &Row) -> Result<usize> {
        let body = row.encode();
        let mut frame = Vec::with_capacity(body.len() + 16);
        frame.extend_from_slice(&ROW_MARKER.to_le_bytes());
        write_varint(&mut frame, body.len() as u64);
        frame.extend_from_slice(&xxh3_64(&body).to_le_bytes());
        frame.extend_from_slice(&body);
        self.file.write_all(&frame)?;
        self.rows += 1;
        Ok(frame.len())
    }

    /// Flush buffered rows and push them to stable storage.
    pub fn sync_data(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    /// Write the EOF marker and sync. The file is complete after this.
    pub fn finalize(mut self) -> Result<()> {
        self.file.write_all(&EOF_MARKER.to_le_bytes())?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

pub struct XlogReader {
    kind: FileKind,
    server_uuid: Uuid,
    vclock: VClock,
    data: Vec<u8>,
    offset: usize,
    eof_read: bool,
}

impl XlogReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        let header_end = data
            .windows(2)
            .position(|w| w == b"\n\n")
            .ok_or_else(|| SpindleError::xlog("missing header terminator"))?;
        let header = std::str::from_utf8(&data[..header_end])
            .map_err(|_| SpindleError::xlog("header is not valid UTF-8"))?;
        let mut lines = header.lines();
        let kind = FileKind::from_filetype(
            lines
                .next()
                .ok_or_else(|| SpindleError::xlog("empty header"))?,
        )?;
        let version = lines
            .next()
            .ok_or_else(|| SpindleError::xlog("missing version line"))?;
        if version != XLOG_VERSION {
            return Err(SpindleError::xlog(format!(
                "unsupported log version '{version}'"
            )));
        }
        let mut server_uuid = None;
        let mut vclock = None;
        for line in lines {
            if let Some(value) = line.strip_prefix("Server: ") {
                server_uuid = Some(Uuid::parse_str(value.trim()).map_err(|_| {
                    SpindleError::InvalidUuid {
                        value: value.trim().to_owned(),
                    }
                })?);
            } else if let Some(value) = line.strip_prefix("VClock: ") {
                vclock = Some(VClock::parse(value)?);
            }
        }
        Ok(Self {
            kind,
            server_uuid: server_uuid
                .ok_or_else(|| SpindleError::xlog("missing Server header line"))?,
            vclock: vclock.ok_or_else(|| SpindleError::xlog("missing VClock header line"))?,
            data,
            offset: header_end + 2,
            eof_read: false,
        })
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn server_uuid(&self) -> Uuid {
        self.server_uuid
    }

    pub fn vclock(&self) -> &VClock {
        &self.vclock
    }

    /// Whether the EOF marker has been seen. A fully consumed file
    /// without it was truncated.
    pub fn eof_read(&self) -> bool {
        self.eof_read
    }

    /// Read the next row. `Ok(None)` at the end of the stream; check
    /// [`XlogReader::eof_read`] to distinguish a clean end from a
    /// truncated file.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        if self.eof_read || self.offset == self.data.len() {
            return Ok(None);
        }
        let rest = &self.data[self.offset..];
        if rest.len() < 4 {
            return Err(SpindleError::xlog("truncated row marker"));
        }
        let marker = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
        if marker == EOF_MARKER {
            self.eof_read = true;
            self.offset += 4;
            return Ok(None);
        }
        if marker != ROW_MARKER {
            return Err(SpindleError::xlog(format!(
                "bad row marker {marker:#010x}"
            )));
        }
        let rest = &rest[4..];
        let (body_len, n) =
            read_varint(rest).map_err(|_| SpindleError::xlog("truncated row length"))?;
        let body_len =
            usize::try_from(body_len).map_err(|_| SpindleError::xlog("row length overflow"))?;
        let rest = &rest[n..];
        if rest.len() < 8 + body_len {
            return Err(SpindleError::xlog("truncated row"));
        }
        let checksum = u64::from_le_bytes(rest[..8].try_into().expect("8-byte slice"));
        let body = &rest[8..8 + body_len];
        if xxh3_64(body) != checksum {
            return Err(SpindleError::xlog("row checksum mismatch"));
        }
        let row = Row::decode(body)?;
        self.offset += 4 + n + 8 + body_len;
        Ok(Some(row))
    }
}

// ---------------------------------------------------------------------------
// Snapshot I/O rate limiting
// ---------------------------------------------------------------------------

/// Byte-budget limiter for the snapshot writer. When the bytes written
/// in the current wall-clock second cross the limit, the file cache is
/// flushed and the writer sleeps out the remainder of the second.
pub struct SnapIoRateLimiter {
    limit: u64,
    bytes: u64,
    last: Option<Instant>,
}

impl SnapIoRateLimiter {
    /// `limit` in bytes per second; `None` disables throttling.
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit: limit.unwrap_or(u64::MAX),
            bytes: 0,
            last: None,
        }
    }

    pub fn account(&mut self, written: usize, writer: &mut XlogWriter) -> Result<()> {
        self.bytes += written as u64;
        if self.limit == u64::MAX {
            return Ok(());
        }
        if self.last.is_none() {
            self.last = Some(Instant::now());
        }
        if self.bytes > self.limit {
            // Flush the cache, otherwise the limit is not really
            // enforced.
            writer.sync_data()?;
        }
        while self.bytes > self.limit {
            let last = self.last.expect("window start set");
            let elapsed = last.elapsed();
            if elapsed < Duration::from_secs(1) {
                fiber::sleep(Duration::from_secs(1) - elapsed);
            }
            self.last = Some(Instant::now());
            self.bytes -= self.limit;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_row(lsn: i64) -> Row {
        Row {
            op: RowOp::Replace,
            space_id: 512,
            body: vec![1, 2, 3, 4],
            lsn,
            server_id: 1,
        }
    }

    #[test]
    fn vclock_roundtrip_and_sum() {
        let mut vclock = VClock::new();
        assert_eq!(vclock.advance(1), 1);
        assert_eq!(vclock.advance(1), 2);
        vclock.follow(2, 10);
        vclock.follow(2, 5);
        assert_eq!(vclock.get(2), 10);
        assert_eq!(vclock.sum(), 12);
        let parsed = VClock::parse(&vclock.to_string()).unwrap();
        assert_eq!(parsed, vclock);
    }

    #[test]
    fn filename_formatting() {
        let path = format_filename(Path::new("/tmp"), 42, FileKind::Snap, true);
        assert_eq!(
            path.to_str().unwrap(),
            "/tmp/00000000000000000042.snap.inprogress"
        );
        let path = format_filename(Path::new("/tmp"), 0, FileKind::Xlog, false);
        assert_eq!(path.to_str().unwrap(), "/tmp/00000000000000000000.xlog");
    }

    #[test]
    fn write_then_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("00000000000000000000.snap");
        let uuid = Uuid::new_v4();
        let mut vclock = VClock::new();
        vclock.follow(1, 7);

        let mut writer = XlogWriter::create(&path, FileKind::Snap, uuid, &vclock).unwrap();
        writer.write_row(&sample_row(1)).unwrap();
        writer.write_row(&sample_row(2)).unwrap();
        writer.finalize().unwrap();

        let mut reader = XlogReader::open(&path).unwrap();
        assert_eq!(reader.kind(), FileKind::Snap);
        assert_eq!(reader.server_uuid(), uuid);
        assert_eq!(reader.vclock().get(1), 7);
        assert_eq!(reader.next_row().unwrap().unwrap(), sample_row(1));
        assert_eq!(reader.next_row().unwrap().unwrap(), sample_row(2));
        assert!(reader.next_row().unwrap().is_none());
        assert!(reader.eof_read());
    }

    #[test]
    fn truncated_file_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("00000000000000000000.snap");
        let mut writer =
            XlogWriter::create(&path, FileKind::Snap, Uuid::new_v4(), &VClock::new()).unwrap();
        writer.write_row(&sample_row(1)).unwrap();
        writer.sync_data().unwrap();
        drop(writer); // no finalize: no EOF marker

        let mut reader = XlogReader::open(&path).unwrap();
        assert!(reader.next_row().unwrap().is_some());
        assert!(reader.next_row().unwrap().is_none());
        assert!(!reader.eof_read(), "file must be reported as truncated");
    }

    #[test]
    fn corrupt_row_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("00000000000000000000.snap");
        let mut writer =
            XlogWriter::create(&path, FileKind::Snap, Uuid::new_v4(), &VClock::new()).unwrap();
        writer.write_row(&sample_row(1)).unwrap();
        writer.finalize().unwrap();

        // Flip a byte in the row body.
        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 10] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let mut reader = XlogReader::open(&path).unwrap();
        assert!(matches!(
            reader.next_row(),
            Err(SpindleError::XlogError { .. })
        ));
    }

    #[test]
    fn scan_dir_sorts_by_signature() {
        let dir = tempdir().unwrap();
        for signature in [30i64, 10, 20] {
            let path = format_filename(dir.path(), signature, FileKind::Xlog, false);
            XlogWriter::create(&path, FileKind::Xlog, Uuid::new_v4(), &VClock::new())
                .unwrap()
                .finalize()
                .unwrap();
        }
        // An in-progress file must not be picked up.
        let inprogress = format_filename(dir.path(), 40, FileKind::Xlog, true);
        XlogWriter::create(&inprogress, FileKind::Xlog, Uuid::new_v4(), &VClock::new()).unwrap();

        let found = scan_dir(dir.path(), FileKind::Xlog).unwrap();
        let signatures: Vec<i64> = found.iter().map(|(s, _)| *s).collect();
        assert_eq!(signatures, vec![10, 20, 30]);
    }
}
