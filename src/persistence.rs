use crate::error::StoreError;
use crate::storage::StoreImage;
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const SNAP_MAGIC: &[u8; 8] = b"TGVSNP01";
const SNAP_VERSION: u32 = 1;
/// magic + version + timestamp + payload length + crc32.
const HEADER_LEN: u64 = 8 + 4 + 8 + 8 + 4;

/// Timestamp type for snapshot file names (nanoseconds since epoch).
pub type Timestamp = u64;

/// Bincode envelope of a snapshot. Records travel as JSON text since bincode cannot encode
/// self-describing values.
#[derive(Serialize, Deserialize, Debug)]
struct SnapshotPayload {
    next_seq: u64,
    collections: Vec<(String, Vec<String>)>,
}

impl SnapshotPayload {
    fn from_image(image: &StoreImage) -> Result<Self, StoreError> {
        let mut collections = Vec::with_capacity(image.collections.len());
        for (name, records) in &image.collections {
            let encoded = records
                .iter()
                .map(serde_json::to_string)
                .collect::<Result<Vec<_>, _>>()?;
            collections.push((name.clone(), encoded));
        }
        Ok(SnapshotPayload {
            next_seq: image.next_seq,
            collections,
        })
    }

    fn into_image(self) -> Result<StoreImage, StoreError> {
        let mut image = StoreImage {
            next_seq: self.next_seq,
            ..StoreImage::default()
        };
        for (name, encoded) in self.collections {
            let records = encoded
                .iter()
                .map(|s| serde_json::from_str(s))
                .collect::<Result<Vec<_>, _>>()?;
            image.collections.insert(name, records);
        }
        Ok(image)
    }
}

/// Handles snapshot operations
#[derive(Debug)]
pub struct Snapshotter {
    snapshot_dir: PathBuf,
}

impl Snapshotter {
    /// Creates a new Snapshotter instance
    pub fn new<P: AsRef<Path>>(snapshot_dir: P) -> Result<Self, StoreError> {
        let dir_path = snapshot_dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir_path)?;

        Ok(Snapshotter {
            snapshot_dir: dir_path,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Writes a snapshot of `image`, installed atomically.
    pub fn create_snapshot(
        &self,
        image: &StoreImage,
        timestamp: Timestamp,
    ) -> Result<PathBuf, StoreError> {
        let payload = bincode::serialize(&SnapshotPayload::from_image(image)?)?;

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        // Atomic install: write to temp, fsync, rename, fsync dir.
        let final_path = self.snapshot_dir.join(format!("snapshot_{}.bin", timestamp));
        let tmp_path = self.snapshot_dir.join(format!(".tmp_snapshot_{}.bin", timestamp));

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut w = BufWriter::new(file);
        w.write_all(SNAP_MAGIC)?;
        w.write_all(&SNAP_VERSION.to_le_bytes())?;
        w.write_all(&timestamp.to_le_bytes())?;
        w.write_all(&(payload.len() as u64).to_le_bytes())?;
        w.write_all(&crc.to_le_bytes())?;
        w.write_all(&payload)?;
        w.flush()?;
        w.get_ref().sync_data()?;
        drop(w);

        fs::rename(&tmp_path, &final_path)?;
        sync_dir(&self.snapshot_dir)?;
        Ok(final_path)
    }

    /// Loads the latest snapshot
    pub fn load_latest_snapshot(&self) -> Result<Option<StoreImage>, StoreError> {
        let mut snaps = list_snapshots(&self.snapshot_dir)?;
        snaps.sort_by(|a, b| b.0.cmp(&a.0));

        let Some((_, latest_path)) = snaps.first() else {
            return Ok(None);
        };
        read_snapshot(latest_path).map(Some)
    }

    /// Finds the latest snapshot timestamp
    pub fn get_latest_snapshot_timestamp(&self) -> Result<Option<Timestamp>, StoreError> {
        let mut snaps = list_snapshots(&self.snapshot_dir)?;
        snaps.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(snaps.first().map(|(ts, _)| *ts))
    }

    /// Deletes all but the `keep` newest snapshots. Returns how many were removed.
    pub fn prune(&self, keep: usize) -> Result<usize, StoreError> {
        let mut snaps = list_snapshots(&self.snapshot_dir)?;
        snaps.sort_by(|a, b| b.0.cmp(&a.0));
        let mut removed = 0;
        for (_, path) in snaps.into_iter().skip(keep.max(1)) {
            fs::remove_file(path)?;
            removed += 1;
        }
        if removed > 0 {
            sync_dir(&self.snapshot_dir)?;
        }
        Ok(removed)
    }
}

fn read_snapshot(path: &Path) -> Result<StoreImage, StoreError> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    // Header
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != SNAP_MAGIC {
        return Err(StoreError::Corruption {
            details: format!("Bad snapshot magic in {:?}", path),
        });
    }
    let mut v = [0u8; 4];
    reader.read_exact(&mut v)?;
    let version = u32::from_le_bytes(v);
    if version != SNAP_VERSION {
        return Err(StoreError::Corruption {
            details: format!("Unsupported snapshot version {} in {:?}", version, path),
        });
    }
    let mut b8 = [0u8; 8];
    reader.read_exact(&mut b8)?;
    let _timestamp = u64::from_le_bytes(b8);
    reader.read_exact(&mut b8)?;
    let payload_len = u64::from_le_bytes(b8);
    let mut c4 = [0u8; 4];
    reader.read_exact(&mut c4)?;
    let expected_crc = u32::from_le_bytes(c4);

    // Checked against the file before allocating.
    if payload_len > file_len.saturating_sub(HEADER_LEN) {
        return Err(StoreError::Corruption {
            details: format!(
                "Snapshot payload length {} exceeds file size {} in {:?}",
                payload_len, file_len, path
            ),
        });
    }
    let payload_len = usize::try_from(payload_len).map_err(|_| StoreError::Corruption {
        details: format!("Snapshot payload length {} unaddressable in {:?}", payload_len, path),
    })?;

    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload)?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    if hasher.finalize() != expected_crc {
        return Err(StoreError::Corruption {
            details: format!("Snapshot payload CRC mismatch in {:?}", path),
        });
    }

    let decoded: SnapshotPayload = bincode::deserialize(&payload)?;
    decoded.into_image()
}

fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    let d = File::open(dir)?;
    d.sync_data()?;
    Ok(())
}

fn list_snapshots(dir: &Path) -> Result<Vec<(Timestamp, PathBuf)>, StoreError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let ts_part = name
            .strip_prefix("snapshot_")
            .and_then(|s| s.strip_suffix(".bin"));
        let Some(ts_str) = ts_part else { continue };
        let Ok(ts) = ts_str.parse::<u64>() else { continue };
        out.push((ts, entry.path()));
    }
    Ok(out)
}
