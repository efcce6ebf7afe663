use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Size of the frame header and trailer around each bincode payload.
const LEN_BYTES: usize = 4;
const CRC_BYTES: usize = 4;

fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Outcome of reading one frame.
enum Frame {
    /// An intact record and its size on disk.
    Event(Event, u64),
    /// Clean end of file.
    End,
    /// Short read, oversized length, bad checksum or undecodable payload.
    /// Everything from here on is dropped.
    Torn,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read the frame at the reader's position. `remaining` is the number of bytes
/// left in the file, which bounds the payload length before anything is allocated.
fn read_frame(reader: &mut impl Read, remaining: u64) -> io::Result<Frame> {
    let mut len_buf = [0u8; LEN_BYTES];
    // A zero-byte read at a frame boundary is a clean end; anything shorter is torn.
    let mut first = [0u8; 1];
    if reader.read(&mut first)? == 0 {
        return Ok(Frame::End);
    }
    len_buf[0] = first[0];
    if !read_exact_or_eof(reader, &mut len_buf[1..])? {
        return Ok(Frame::Torn);
    }

    let len = u64::from(u32::from_le_bytes(len_buf));
    let frame_len = (LEN_BYTES + CRC_BYTES) as u64 + len;
    if frame_len > remaining {
        return Ok(Frame::Torn);
    }
    let mut payload = vec![0u8; len as usize];
    let mut crc_buf = [0u8; CRC_BYTES];
    if !read_exact_or_eof(reader, &mut payload)? || !read_exact_or_eof(reader, &mut crc_buf)? {
        return Ok(Frame::Torn);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Torn);
    }
    Ok(match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Frame::Event(event, frame_len),
        Err(_) => Frame::Torn,
    })
}

/// What replay recovered from a log file.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the intact prefix. Anything past it is a torn tail.
    pub valid_len: u64,
}

/// Append-only event log on disk.
///
/// Each record is `[u32 LE: payload len][bincode Event][u32 LE: crc32 of payload]`.
/// A crash mid-append leaves a torn final record, which replay discards and
/// `open` cuts off so later appends follow the last intact record.
pub struct EventLog {
    file: File,
    path: PathBuf,
    /// Bytes known to be written and synced.
    len: u64,
    /// Frames pushed since the last sync.
    pending: Vec<u8>,
    pending_count: u64,
    appends_since_rewrite: u64,
}

impl EventLog {
    /// Open for appending after the first `valid_len` bytes, truncating any
    /// torn tail beyond them.
    pub fn open(path: &Path, valid_len: u64) -> io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            warn!(
                path = %path.display(),
                dropped = on_disk - valid_len,
                "truncating torn tail of event log"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len: valid_len.min(on_disk),
            pending: Vec::new(),
            pending_count: 0,
            appends_since_rewrite: 0,
        })
    }

    /// Buffer one record. Nothing reaches the file until `sync`.
    pub fn push(&mut self, event: &Event) -> io::Result<()> {
        let mut frame = Vec::new();
        write_frame(&mut frame, event)?;
        self.pending.extend_from_slice(&frame);
        self.pending_count += 1;
        Ok(())
    }

    /// Drop records pushed since the last sync.
    pub fn discard(&mut self) {
        self.pending.clear();
        self.pending_count = 0;
    }

    /// Write buffered records and fsync. On failure the file is cut back to
    /// its last synced length and the buffered records are dropped.
    pub fn sync(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let written = self
            .file
            .write_all(&self.pending)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            self.discard();
            if let Err(cut) = self.file.set_len(self.len) {
                warn!(path = %self.path.display(), "could not roll back failed append: {cut}");
            }
            return Err(e);
        }
        self.len += self.pending.len() as u64;
        self.appends_since_rewrite += self.pending_count;
        self.discard();
        Ok(())
    }

    pub fn appends_since_rewrite(&self) -> u64 {
        self.appends_since_rewrite
    }

    /// Replace the log with `events`. The new contents are written and synced
    /// to a sibling temp file first, then renamed over the log.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        // Pending appends must land in the old file before it is replaced.
        self.sync()?;
        let tmp_path = self.path.with_extension("wal.tmp");
        let new_len = {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                write_frame(&mut tmp, event)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
            tmp.get_ref().metadata()?.len()
        };
        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.len = new_len;
        self.appends_since_rewrite = 0;
        Ok(())
    }

    /// Read every intact record. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        loop {
            match read_frame(&mut reader, total - replay.valid_len)? {
                Frame::Event(event, size) => {
                    replay.events.push(event);
                    replay.valid_len += size;
                }
                Frame::End => break,
                Frame::Torn => {
                    warn!(
                        path = %path.display(),
                        recovered = replay.events.len(),
                        dropped = total - replay.valid_len,
                        "discarding torn tail of event log"
                    );
                    break;
                }
            }
        }
        Ok(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("seatd_test_log");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn restaurant() -> Event {
        Event::RestaurantCreated(Restaurant {
            id: Ulid::new(),
            name: "Noodle Bar".into(),
            address: "9 Canal Rd".into(),
            open_time: "11:00".into(),
            close_time: "21:30".into(),
            created_at: 1,
        })
    }

    fn table(restaurant_id: Ulid) -> Table {
        Table {
            id: Ulid::new(),
            restaurant_id,
            name: "Window".into(),
            capacity: 4,
            created_at: 2,
        }
    }

    fn booking(t: &Table, start: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            restaurant_id: t.restaurant_id,
            table_id: t.id,
            user_id: "alice".into(),
            span: Span::new(start, start + 3_600_000),
            guests: 2,
            status: ReservationStatus::Confirmed,
            created_at: 3,
        }
    }

    #[test]
    fn push_sync_replay() {
        let path = tmp_path("push_sync_replay.wal");
        let t = table(Ulid::new());
        let events = vec![
            restaurant(),
            Event::TableCreated(t.clone()),
            Event::ReservationCreated(booking(&t, 1_000)),
        ];
        {
            let mut log = EventLog::open(&path, 0).unwrap();
            for e in &events {
                log.push(e).unwrap();
            }
            assert_eq!(log.appends_since_rewrite(), 0);
            log.sync().unwrap();
            assert_eq!(log.appends_since_rewrite(), 3);
        }
        let replay = EventLog::replay(&path).unwrap();
        assert_eq!(replay.events, events);
        assert_eq!(replay.valid_len, fs::metadata(&path).unwrap().len());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_empty() {
        let path = tmp_path("never_written.wal");
        assert!(EventLog::replay(&path).unwrap().events.is_empty());
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn_tail.wal");
        let first = restaurant();
        {
            let mut log = EventLog::open(&path, 0).unwrap();
            log.push(&first).unwrap();
            log.sync().unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8, 0, 0]).unwrap(); // partial length prefix
        }
        let replay = EventLog::replay(&path).unwrap();
        assert_eq!(replay.events, vec![first]);
        assert_eq!(replay.valid_len + 3, fs::metadata(&path).unwrap().len());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn oversized_length_prefix_is_torn() {
        let path = tmp_path("oversized_len.wal");
        let good = restaurant();
        {
            let mut f = File::create(&path).unwrap();
            write_frame(&mut f, &good).unwrap();
            // Claims a ~4 GiB payload that the file cannot hold.
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }
        let replay = EventLog::replay(&path).unwrap();
        assert_eq!(replay.events, vec![good]);
        assert_eq!(replay.valid_len + 20, fs::metadata(&path).unwrap().len());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn open_cuts_torn_tail_before_appending() {
        let path = tmp_path("cut_then_append.wal");
        let first = restaurant();
        {
            let mut log = EventLog::open(&path, 0).unwrap();
            log.push(&first).unwrap();
            log.sync().unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0]).unwrap();
        }

        let replay = EventLog::replay(&path).unwrap();
        let second = restaurant();
        {
            let mut log = EventLog::open(&path, replay.valid_len).unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), replay.valid_len);
            log.push(&second).unwrap();
            log.sync().unwrap();
        }
        assert_eq!(EventLog::replay(&path).unwrap().events, vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn discarded_records_never_reach_the_file() {
        let path = tmp_path("discard.wal");
        let kept = restaurant();
        {
            let mut log = EventLog::open(&path, 0).unwrap();
            log.push(&kept).unwrap();
            log.sync().unwrap();
            log.push(&restaurant()).unwrap();
            log.discard();
            log.sync().unwrap();
            assert_eq!(log.appends_since_rewrite(), 1);
        }
        assert_eq!(EventLog::replay(&path).unwrap().events, vec![kept]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = restaurant();
        let bad = Event::ReservationCancelled { id: Ulid::new() };
        {
            let mut f = File::create(&path).unwrap();
            write_frame(&mut f, &good).unwrap();
            let payload = bincode::serialize(&bad).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(EventLog::replay(&path).unwrap().events, vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rewrite_shrinks_and_accepts_new_appends() {
        let path = tmp_path("rewrite.wal");
        let t = table(Ulid::new());
        let keep = booking(&t, 0);
        {
            let mut log = EventLog::open(&path, 0).unwrap();
            log.push(&Event::TableCreated(t.clone())).unwrap();
            log.push(&Event::ReservationCreated(keep.clone())).unwrap();
            for i in 0..20 {
                let churn = booking(&t, (i + 1) * 10_000_000);
                log.push(&Event::ReservationCreated(churn.clone())).unwrap();
                log.push(&Event::ReservationCancelled { id: churn.id }).unwrap();
            }
            log.sync().unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        let compacted = vec![
            Event::TableCreated(t.clone()),
            Event::ReservationCreated(keep.clone()),
        ];
        let later = Event::ReservationCancelled { id: keep.id };
        {
            let mut log = EventLog::open(&path, before).unwrap();
            log.rewrite(&compacted).unwrap();
            assert_eq!(log.appends_since_rewrite(), 0);
            log.push(&later).unwrap();
            log.sync().unwrap();
        }
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "rewritten log should be smaller: {after} < {before}");

        let mut expected = compacted;
        expected.push(later);
        assert_eq!(EventLog::replay(&path).unwrap().events, expected);
        let _ = fs::remove_file(&path);
    }
}
