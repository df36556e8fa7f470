use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Larger length prefixes can only come from a damaged frame.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Frame one event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Outcome of reading one frame during replay.
enum Frame {
    /// An intact event and the number of bytes its frame occupies.
    Event(Event, u64),
    End,
    /// Torn or corrupt tail; everything from here on is discarded.
    Damaged(&'static str),
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Frame::End),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Frame::Damaged("oversized entry"));
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    for buf in [payload.as_mut_slice(), crc_buf.as_mut_slice()] {
        match reader.read_exact(buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Frame::Damaged("truncated entry")),
            Err(e) => return Err(e),
        }
    }

    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Damaged("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Event(event, (len + 8) as u64)),
        Err(_) => Ok(Frame::Damaged("undecodable payload")),
    }
}

/// Append-only write-ahead log of one campus.
///
/// Each entry is `[u32 len][bincode Event][u32 crc32]`, little endian, where
/// `len` counts only the payload. A torn last entry left by a crash fails the
/// length or checksum test and is dropped on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without syncing. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted event set to a sibling temp file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::compact_tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact event from disk. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::scan(path)?.map_or_else(Vec::new, |scan| scan.events))
    }

    /// Replay, then cut any damaged tail off the file so later appends land
    /// directly after the last intact entry.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let Some(scan) = Self::scan(path)? else {
            return Ok(Vec::new());
        };
        if scan.damaged {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(scan.intact_len)?;
            file.sync_all()?;
            warn!("{}: truncated WAL to {} bytes", path.display(), scan.intact_len);
        }
        Ok(scan.events)
    }

    fn scan(path: &Path) -> io::Result<Option<Scan>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut scan = Scan::default();
        loop {
            match read_frame(&mut reader)? {
                Frame::Event(event, frame_len) => {
                    scan.events.push(event);
                    scan.intact_len += frame_len;
                }
                Frame::End => break,
                Frame::Damaged(reason) => {
                    warn!(
                        "{}: discarding WAL tail after {} events ({reason})",
                        path.display(),
                        scan.events.len()
                    );
                    scan.damaged = true;
                    break;
                }
            }
        }
        Ok(Some(scan))
    }
}

#[derive(Default)]
struct Scan {
    events: Vec<Event>,
    /// Bytes covered by intact frames.
    intact_len: u64,
    damaged: bool,
}
