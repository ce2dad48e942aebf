use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// One committed transaction: every row write it made, in apply order.
pub type Record = Vec<Event>;

fn encode_record(writer: &mut impl Write, record: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only write-ahead log, one frame per transaction.
///
/// Frame: `[u32: len][bincode: Vec<Event>][u32: crc32]`. A torn or corrupt
/// tail frame is dropped on replay together with everything after it, so a
/// transaction is either replayed whole or not at all.
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

    #[cfg(test)]
    pub fn append(&mut self, record: &[Event]) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer a record without syncing. The group-commit writer calls
    /// `flush_sync()` once per batch.
    pub fn append_buffered(&mut self, record: &[Event]) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
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

    /// Write a snapshot to `<wal>.wal.tmp` and fsync it. Slow; runs before
    /// the swap.
    pub fn write_compact_file(path: &Path, snapshot: &[Record]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for record in snapshot {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the snapshot over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, snapshot: &[Record]) -> io::Result<()> {
        Self::write_compact_file(&self.path, snapshot)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact record. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Record>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                tracing::warn!("WAL {}: checksum mismatch, dropping tail", path.display());
                break;
            }

            match bincode::deserialize::<Record>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("slotward_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn session(id: Ulid, capacity: u32) -> Session {
        Session {
            id,
            template_id: None,
            instructor_id: Ulid::nil(),
            branch_id: Ulid::nil(),
            span: Span::new(1_000, 2_000),
            capacity,
            booked_count: 0,
            is_cancelled: false,
            cancel_reason: None,
            notes: None,
        }
    }

    fn booking(session_id: Ulid) -> Booking {
        Booking {
            id: Ulid::new(),
            session_id,
            holder: Holder {
                name: "Ann".into(),
                email: "ann@example.com".into(),
                phone: None,
                user_id: None,
            },
            status: BookingStatus::Confirmed,
            confirmation_code: "ABCD2345".into(),
            notes: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let sid = Ulid::new();
        let records: Vec<Record> = vec![
            vec![Event::SessionCreated { session: session(sid, 2) }],
            vec![
                Event::BookingInserted { booking: booking(sid) },
                Event::SeatsAdjusted { session_id: sid, booked_count: 1 },
            ],
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for r in &records {
                wal.append(r).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, records);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_tail_drops_whole_transaction() {
        let path = tmp_path("torn_tail.wal");
        let _ = fs::remove_file(&path);

        let sid = Ulid::new();
        let first = vec![Event::SessionCreated { session: session(sid, 1) }];
        let second = vec![
            Event::BookingInserted { booking: booking(sid) },
            Event::SeatsAdjusted { session_id: sid, booked_count: 1 },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&second).unwrap();
        }

        // Chop the last few bytes off the booking transaction.
        let full = fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(full - 3).unwrap();
        drop(f);

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![first]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let _ = fs::remove_file(&path);

        let record = vec![Event::SessionDeleted { session_id: Ulid::new() }];
        {
            let payload = bincode::serialize(&record).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let sid = Ulid::new();
        let snapshot = vec![vec![Event::SessionCreated { session: session(sid, 3) }]];
        let after = vec![Event::CapacitySet { session_id: sid, capacity: 5 }];

        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..20 {
                wal.append(&[Event::CapacitySet { session_id: sid, capacity: 4 }])
                    .unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            wal.append(&after).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0], snapshot[0]);
        assert_eq!(replayed[1], after);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_count_until_flush() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let records: Vec<Record> = (0..5)
            .map(|_| vec![Event::TemplateRemoved { id: Ulid::new() }])
            .collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for r in &records {
                wal.append_buffered(r).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), records);
        let _ = fs::remove_file(&path);
    }
}
