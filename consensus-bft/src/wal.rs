//! Write-ahead log of consensus events for crash recovery.
//!
//! The WAL is a line-delimited append-only stream: one JSON record per
//! line, with height boundaries marked by literal `#ENDHEIGHT: <H>` lines.
//! On restart the handshake replays every entry after the last marker into
//! a fresh state machine. A line that fails to parse means the log is
//! corrupt, which is fatal; operators restore from a snapshot.

use {
    crate::{
        engine::{EngineInput, Step},
        error::{ConsensusError, Result},
    },
    log::{debug, info},
    serde::{Deserialize, Serialize},
    std::{
        fs::{File, OpenOptions},
        io::{BufRead, BufReader, BufWriter, Write},
        path::{Path, PathBuf},
    },
};

/// Marker prefix terminating a height's entries.
const ENDHEIGHT_PREFIX: &str = "#ENDHEIGHT: ";

/// One journaled consensus event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalEntry {
    /// The machine entered a new (height, round, step).
    RoundStep {
        /// Height entered.
        height: u64,
        /// Round entered.
        round: u32,
        /// Step entered.
        step: Step,
    },

    /// An inbound message, remote (`peer_id`) or locally produced
    /// (`"local"`).
    Message {
        /// Source peer id, or "local".
        peer_id: String,
        /// The state-machine input that was processed.
        input: EngineInput,
    },

    /// A timeout fired.
    Timeout {
        /// Height the timeout was scheduled for.
        height: u64,
        /// Round the timeout was scheduled for.
        round: u32,
        /// Step the timeout was scheduled for.
        step: Step,
    },
}

/// Append-only journal bound to one file.
pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Wal {
    /// Open (creating if absent) the WAL at `path` for appending.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        info!("opened WAL at {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// The file this WAL appends to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry as a JSON line.
    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    /// Append the `#ENDHEIGHT` marker for a finished height and flush.
    /// Durability of the marker is what the handshake's height
    /// reconciliation relies on.
    pub fn end_height(&mut self, height: u64) -> Result<()> {
        writeln!(self.writer, "{ENDHEIGHT_PREFIX}{height}")?;
        self.writer.flush()?;
        debug!("WAL marked end of height {height}");
        Ok(())
    }

    /// Flush buffered entries to the file.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Read the entries recorded after the `#ENDHEIGHT: height` marker.
    ///
    /// With `height == 0` and no marker present, the whole log is
    /// returned. A missing marker for a non-zero height, or any
    /// unparseable line, is `WalCorrupt`.
    pub fn entries_since(&mut self, height: u64) -> Result<Vec<WalEntry>> {
        self.flush()?;
        read_entries_since(&self.path, height)
    }
}

/// Scan `path` for the entries after the `#ENDHEIGHT: height` marker.
pub fn read_entries_since<P: AsRef<Path>>(path: P, height: u64) -> Result<Vec<WalEntry>> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);

    let marker = format!("{ENDHEIGHT_PREFIX}{height}");
    let mut entries = Vec::new();
    let mut found_marker = height == 0;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix(ENDHEIGHT_PREFIX) {
            rest.trim().parse::<u64>().map_err(|_| {
                ConsensusError::WalCorrupt(format!(
                    "bad ENDHEIGHT marker at line {}: {line}",
                    line_no + 1
                ))
            })?;
            if line == marker {
                // Everything before the marker belongs to finished
                // heights; replay starts fresh after it.
                entries.clear();
                found_marker = true;
            }
            continue;
        }
        let entry: WalEntry = serde_json::from_str(&line).map_err(|e| {
            ConsensusError::WalCorrupt(format!("line {}: {e}", line_no + 1))
        })?;
        entries.push(entry);
    }

    if !found_marker {
        return Err(ConsensusError::WalCorrupt(format!(
            "missing marker {marker:?}"
        )));
    }
    Ok(entries)
}
