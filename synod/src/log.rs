//! The acceptor's durable memory: an append-only file of framed, checksummed records in a
//! lockfile-protected directory.  Every mutation of the acceptor's promises hits this file before
//! the reply leaves the node, and open() replays the file to reconstruct the acceptor.
//!
//! A record is a one-byte header length, an [rpc_pb::Frame] with the record's size and crc32c,
//! and the record itself.  A torn final record is the signature of a crash mid-append and gets
//! truncated away; any other inconsistency is corruption and poisons the open.

use std::fs::{create_dir, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use biometrics::{Collector, Counter};
use buffertk::{stack_pack, v64, Packable, Unpackable, Unpacker};
use indicio::{clue, WARNING};
use prototk_derive::Message;
use tatl::{HeyListen, Stationary};
use utilz::lockfile::Lockfile;
use zerror::Z;

use hasp_pb::{Ballot, Error, View};

use super::COLLECTOR;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

#[allow(non_snake_case)]
fn LOCKFILE<P: AsRef<Path>>(root: P) -> PathBuf {
    root.as_ref().to_path_buf().join("LOCKFILE")
}

#[allow(non_snake_case)]
fn LOG<P: AsRef<Path>>(root: P) -> PathBuf {
    root.as_ref().to_path_buf().join("LOG")
}

const HEADER_MAX_SIZE: usize = 1 + 1 + 10 + 1 + 4;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static APPENDS: Counter = Counter::new("synod.log.appends");
static REPLAYED: Counter = Counter::new("synod.log.replayed");
static TORN_TAIL: Counter = Counter::new("synod.log.torn_tail");

static CORRUPTION: Counter = Counter::new("synod.log.corruption");
static CORRUPTION_MONITOR: Stationary = Stationary::new("synod.log.corruption", &CORRUPTION);

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&APPENDS);
    collector.register_counter(&REPLAYED);
    collector.register_counter(&TORN_TAIL);
    collector.register_counter(&CORRUPTION);
}

pub fn register_monitors(hey_listen: &mut HeyListen) {
    hey_listen.register_stationary(&CORRUPTION_MONITOR);
}

///////////////////////////////////////////// LogRecord ////////////////////////////////////////////

/// One durable step of the acceptor.
#[derive(Clone, Debug, Message, PartialEq)]
pub enum LogRecord {
    /// The acceptor promised to reject ballots below `n`.
    #[prototk(1, message)]
    Promised {
        #[prototk(1, message)]
        n: Ballot,
    },
    /// The acceptor accepted `value` for `instance` under ballot `n`.
    #[prototk(2, message)]
    Accepted {
        #[prototk(1, uint64)]
        instance: u64,
        #[prototk(2, message)]
        n: Ballot,
        #[prototk(3, message)]
        value: View,
    },
    /// The acceptor learned that `instance` decided `value`.
    #[prototk(3, message)]
    Decided {
        #[prototk(1, uint64)]
        instance: u64,
        #[prototk(2, message)]
        value: View,
    },
}

impl Default for LogRecord {
    fn default() -> Self {
        Self::Promised { n: Ballot::BOTTOM }
    }
}

///////////////////////////////////////////// DurableLog ///////////////////////////////////////////

/// The open log.  Holds the directory's lockfile for its lifetime.
pub struct DurableLog {
    _lockfile: Lockfile,
    file: File,
    path: PathBuf,
}

impl DurableLog {
    /// Open the log under `root`, creating the directory if need be, and replay its records.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<(Self, Vec<LogRecord>), Error> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            create_dir(&root)
                .map_err(Error::from)
                .with_info("root", root.to_string_lossy())?;
        }
        let lockfile = Lockfile::lock(LOCKFILE(&root))
            .map_err(Error::from)
            .with_info("root", root.to_string_lossy())?;
        let Some(lockfile) = lockfile else {
            return Err(Error::SystemError {
                core: zerror_core::ErrorCore::default(),
                what: "lock not obtained".to_owned(),
            }
            .with_info("root", root.to_string_lossy()));
        };
        let path = LOG(&root);
        let (records, good_bytes, total_bytes) = Self::replay(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if good_bytes < total_bytes {
            TORN_TAIL.click();
            clue!(COLLECTOR, WARNING, {
                torn_tail: {
                    path: path.to_string_lossy().to_string(),
                    keep: good_bytes,
                    drop: total_bytes - good_bytes,
                },
            });
            file.set_len(good_bytes)?;
        }
        Ok((
            Self {
                _lockfile: lockfile,
                file,
                path,
            },
            records,
        ))
    }

    /// Append one record and sync it to disk.
    pub fn append(&mut self, record: &LogRecord) -> Result<(), Error> {
        APPENDS.click();
        let msg = stack_pack(record).to_vec();
        let frame = rpc_pb::Frame::from_buffer(&msg);
        let frame_sz: v64 = frame.pack_sz().into();
        let mut buf = stack_pack(frame_sz).pack(frame).to_vec();
        buf.extend_from_slice(&msg);
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// The path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(path: &Path) -> Result<(Vec<LogRecord>, u64, u64), Error> {
        let mut bytes = Vec::new();
        match File::open(path) {
            Ok(mut file) => {
                file.read_to_end(&mut bytes)?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err.into());
            }
        };
        let mut records = Vec::new();
        let mut off = 0usize;
        while off < bytes.len() {
            let remain = &bytes[off..];
            let hdr_sz = remain[0] as usize;
            if hdr_sz == 0 || hdr_sz > HEADER_MAX_SIZE - 1 {
                CORRUPTION.click();
                return Err(Error::corruption("log frame header size invalid")
                    .with_info("offset", off));
            }
            if 1 + hdr_sz > remain.len() {
                break;
            }
            let mut up = Unpacker::new(&remain[1..1 + hdr_sz]);
            let frame: rpc_pb::Frame = match up.unpack() {
                Ok(frame) => frame,
                Err(_) => {
                    CORRUPTION.click();
                    return Err(Error::corruption("log frame does not parse")
                        .with_info("offset", off));
                }
            };
            let body_start = 1 + hdr_sz;
            let body_end = body_start + frame.size as usize;
            if body_end > remain.len() {
                break;
            }
            let body = &remain[body_start..body_end];
            if crc32c::crc32c(body) != frame.crc32c {
                CORRUPTION.click();
                return Err(Error::corruption("log record fails its checksum")
                    .with_info("offset", off));
            }
            let record = match LogRecord::unpack(body) {
                Ok((record, _)) => record,
                Err(_) => {
                    CORRUPTION.click();
                    return Err(Error::corruption("log record does not parse")
                        .with_info("offset", off));
                }
            };
            REPLAYED.click();
            records.push(record);
            off = body_end;
        }
        Ok((records, off as u64, bytes.len() as u64))
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use rpc_pb::{Host, HostID};

    use super::*;

    fn ballot(number: u64, idx: u8) -> Ballot {
        let mut id = [0u8; 16];
        id[15] = idx;
        Ballot {
            number,
            leader: HostID::new(id),
        }
    }

    fn view(vid: u64) -> View {
        let mut id = [0u8; 16];
        id[15] = vid as u8;
        View {
            vid,
            members: vec![Host::new(HostID::new(id), format!("127.0.0.1:{}", 8000 + vid))],
        }
    }

    fn tmpdir(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("synod-log-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&path);
        path
    }

    #[test]
    fn replay_returns_appends_in_order() {
        let root = tmpdir("replay");
        let records = vec![
            LogRecord::Promised { n: ballot(1, 1) },
            LogRecord::Accepted {
                instance: 2,
                n: ballot(1, 1),
                value: view(2),
            },
            LogRecord::Decided {
                instance: 2,
                value: view(2),
            },
        ];
        {
            let (mut log, replayed) = DurableLog::open(&root).unwrap();
            assert!(replayed.is_empty());
            for record in &records {
                log.append(record).unwrap();
            }
        }
        let (_log, replayed) = DurableLog::open(&root).unwrap();
        assert_eq!(records, replayed);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let root = tmpdir("torn");
        {
            let (mut log, _) = DurableLog::open(&root).unwrap();
            log.append(&LogRecord::Promised { n: ballot(3, 1) }).unwrap();
        }
        // Simulate a crash mid-append.
        let path = LOG(&root);
        let len = std::fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[9, 1, 2, 3]).unwrap();
        drop(file);
        let (_log, replayed) = DurableLog::open(&root).unwrap();
        assert_eq!(vec![LogRecord::Promised { n: ballot(3, 1) }], replayed);
        assert_eq!(len, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn flipped_bit_is_corruption() {
        let root = tmpdir("corrupt");
        {
            let (mut log, _) = DurableLog::open(&root).unwrap();
            log.append(&LogRecord::Promised { n: ballot(4, 1) }).unwrap();
            log.append(&LogRecord::Promised { n: ballot(5, 1) }).unwrap();
        }
        let path = LOG(&root);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        assert!(DurableLog::open(&root).is_err());
    }
}
