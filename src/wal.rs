use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::model::Event;

/// Frames claiming more than this are treated as a corrupt tail.
const MAX_FRAME_BYTES: usize = 1 << 20;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little-endian.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one frame and its size on disk. `Ok(None)` means clean EOF or a
/// torn/corrupt tail.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, len as u64 + 8)))
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Every intact event plus the byte length of the intact prefix.
fn read_intact(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut intact = 0;
    while let Some((event, size)) = read_frame(&mut reader)? {
        events.push(event);
        intact += size;
    }
    Ok((events, intact))
}

fn open_for_append(path: &Path) -> io::Result<(File, u64)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

/// Append-only log of scheduling events.
///
/// Frames are staged in memory and reach the file only in `flush_sync`. A
/// failed flush cuts the file back to its last synced length, so an event
/// whose append was reported as failed never replays. If the file cannot be
/// cut back the log is poisoned and refuses further writes until the next
/// compaction rewrites it.
pub struct Wal {
    file: File,
    path: PathBuf,
    pending: Vec<u8>,
    pending_events: u64,
    /// File length after the last successful `flush_sync`.
    synced_len: u64,
    poisoned: bool,
    appends_since_compact: u64,
    #[cfg(test)]
    fail_next_flush: bool,
}

impl Wal {
    /// Open (or create) the log at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (file, synced_len) = open_for_append(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            pending: Vec::new(),
            pending_events: 0,
            synced_len,
            poisoned: false,
            appends_since_compact: 0,
            #[cfg(test)]
            fail_next_flush: false,
        })
    }

    /// Replay the log, cut off any torn tail, and open it for appending.
    /// New frames land directly after the last intact one.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, intact) = read_intact(path)?;
        let mut wal = Self::open(path)?;
        if wal.synced_len > intact {
            warn!(
                "discarding {} bytes of torn WAL tail in {}",
                wal.synced_len - intact,
                path.display()
            );
            wal.file.set_len(intact)?;
            wal.file.sync_all()?;
            wal.synced_len = intact;
        }
        Ok((wal, events))
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Stage an event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.pending, event)?;
        self.pending_events += 1;
        Ok(())
    }

    /// Forget staged events without writing them.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.pending_events = 0;
    }

    /// Write and fsync everything staged. On failure nothing staged survives,
    /// in memory or on disk.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.poisoned {
            self.discard_pending();
            return Err(io::Error::other("WAL poisoned by an earlier failed write"));
        }
        let result = self.write_pending();
        let written = self.pending.len() as u64;
        let events = self.pending_events;
        self.discard_pending();
        match result {
            Ok(()) => {
                self.synced_len += written;
                self.appends_since_compact += events;
                Ok(())
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    fn write_pending(&mut self) -> io::Result<()> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_flush) {
            // Half the batch reaches the file before the device gives up.
            let half = self.pending.len() / 2;
            self.file.write_all(&self.pending[..half])?;
            return Err(io::Error::other("injected write failure"));
        }
        self.file.write_all(&self.pending)?;
        self.file.sync_all()
    }

    fn rollback(&mut self) {
        let result = self
            .file
            .set_len(self.synced_len)
            .and_then(|()| self.file.sync_all());
        if let Err(e) = result {
            error!("cannot cut WAL back to {} bytes, refusing writes: {e}", self.synced_len);
            self.poisoned = true;
        }
    }

    #[cfg(test)]
    pub(crate) fn fail_next_flush(&mut self) {
        self.fail_next_flush = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted event set next to the log and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the log and reopen it for appends.
    /// The rewritten log is whole, so a poisoned log recovers here.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let (file, synced_len) = open_for_append(&self.path)?;
        self.file = file;
        self.synced_len = synced_len;
        self.poisoned = false;
        self.discard_pending();
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

    /// Read every intact event. A missing file replays as empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        read_intact(path).map(|(events, _)| events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HOUR_MS, SessionLength, SessionStatus, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("mentord_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn published(mentor_id: Ulid) -> Event {
        Event::AvailabilityPublished {
            id: Ulid::new(),
            mentor_id,
            span: Span::new(9 * HOUR_MS, 17 * HOUR_MS),
        }
    }

    fn requested(id: Ulid, mentor_id: Ulid) -> Event {
        Event::SessionRequested {
            id,
            mentor_id,
            mentee_id: Ulid::new(),
            availability_id: Ulid::new(),
            start: 10 * HOUR_MS,
            length: SessionLength::Thirty,
            status: SessionStatus::Pending,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let mentor = Ulid::new();
        let session = Ulid::new();
        let events = vec![
            published(mentor),
            requested(session, mentor),
            Event::SessionStatusChanged {
                id: session,
                status: SessionStatus::Confirmed,
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = published(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            // Length prefix promising 200 bytes, then only a few.
            f.write_all(&200u32.to_le_bytes()).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.wal");
        let good = published(Ulid::new());
        let bad = requested(Ulid::new(), Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compact_replaces_history() {
        let path = tmp_path("compact.wal");
        let mentor = Ulid::new();
        let session = Ulid::new();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&published(mentor)).unwrap();
            wal.append(&requested(session, mentor)).unwrap();
            for status in [
                SessionStatus::Confirmed,
                SessionStatus::Canceled,
                SessionStatus::Pending,
                SessionStatus::Canceled,
            ] {
                wal.append(&Event::SessionStatusChanged { id: session, status })
                    .unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let folded = vec![Event::SessionRequested {
            id: session,
            mentor_id: mentor,
            mentee_id: Ulid::new(),
            availability_id: Ulid::new(),
            start: 10 * HOUR_MS,
            length: SessionLength::Thirty,
            status: SessionStatus::Canceled,
        }];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&folded).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should shrink: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), folded);
    }

    #[test]
    fn append_after_compact_lands_after_snapshot() {
        let path = tmp_path("compact_then_append.wal");
        let mentor = Ulid::new();
        let snapshot = vec![published(mentor)];
        let next = requested(Ulid::new(), mentor);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&snapshot[0]).unwrap();
            wal.compact(&snapshot).unwrap();
            wal.append(&next).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![snapshot[0].clone(), next]);
    }

    #[test]
    fn buffered_appends_count_once_flushed() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..4).map(|_| published(Ulid::new())).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(Wal::replay(&path).unwrap().is_empty());
            wal.flush_sync().unwrap();
            assert_eq!(wal.appends_since_compact(), 4);
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn failed_flush_leaves_nothing_behind() {
        let path = tmp_path("failed_flush.wal");
        let kept = published(Ulid::new());
        let rejected = vec![requested(Ulid::new(), Ulid::new()), published(Ulid::new())];
        let after = published(Ulid::new());

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        let synced = fs::metadata(&path).unwrap().len();

        for e in &rejected {
            wal.append_buffered(e).unwrap();
        }
        wal.fail_next_flush();
        assert!(wal.flush_sync().is_err());
        // The half-written batch was cut off again.
        assert_eq!(fs::metadata(&path).unwrap().len(), synced);
        assert_eq!(wal.appends_since_compact(), 1);

        // The next flush carries only its own events.
        wal.append(&after).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, after]);
    }

    #[test]
    fn discarded_events_are_never_written() {
        let path = tmp_path("discarded.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append_buffered(&published(Ulid::new())).unwrap();
        wal.discard_pending();
        let next = published(Ulid::new());
        wal.append(&next).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![next]);
    }

    #[test]
    fn recover_cuts_torn_tail_before_new_appends() {
        let path = tmp_path("recover_torn.wal");
        let first = published(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&200u32.to_le_bytes()).unwrap();
            f.write_all(&[9, 9, 9]).unwrap();
        }

        let second = published(Ulid::new());
        {
            let (mut wal, events) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            wal.append(&second).unwrap();
        }
        // Without the cut, replay would stop at the torn frame and lose `second`.
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }
}
