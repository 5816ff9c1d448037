//! Chunk planning: split a file into fixed-size chunks, describe them in a manifest,
//! track which ones are done.

use serde::{Deserialize, Serialize};

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024; // 1 MiB

/// Largest chunk a manifest may declare. A chunk travels in one frame.
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// One chunk of a file. `offset == index * chunk_size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: u32,
    pub size: u64,
    pub offset: u64,
    /// Hex SHA-256 of the bytes in `[offset, offset + size)`. Empty until hashed.
    #[serde(default)]
    pub checksum: String,
    #[serde(skip)]
    pub completed: bool,
}

/// `ceil(file_size / chunk_size)`. Zero for an empty file.
pub fn total_chunks(file_size: u64, chunk_size: u64) -> Result<u32, ChunkError> {
    if chunk_size == 0 {
        return Err(ChunkError::ZeroChunkSize);
    }
    let n = file_size.div_ceil(chunk_size);
    u32::try_from(n).map_err(|_| ChunkError::TooManyChunks(n))
}

/// Lay out chunks for a file. Checksums are left empty.
pub fn plan_chunks(file_size: u64, chunk_size: u64) -> Result<Vec<ChunkInfo>, ChunkError> {
    let total = total_chunks(file_size, chunk_size)?;
    let chunks = (0..total)
        .map(|index| {
            let offset = index as u64 * chunk_size;
            ChunkInfo {
                index,
                size: chunk_size.min(file_size - offset),
                offset,
                checksum: String::new(),
                completed: false,
            }
        })
        .collect();
    Ok(chunks)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
    #[error("chunk size {0} exceeds the {MAX_CHUNK_SIZE} byte limit")]
    ChunkTooLarge(u64),
    #[error("too many chunks ({0})")]
    TooManyChunks(u64),
    #[error("manifest declares {declared} chunks, layout needs {expected}")]
    CountMismatch { declared: usize, expected: u32 },
    #[error("chunk {index} does not match the layout")]
    BadLayout { index: u32 },
    #[error("chunk {index} has an invalid checksum")]
    BadChecksum { index: u32 },
}

/// Chunk layout of one file, sent before any chunk payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub chunks: Vec<ChunkInfo>,
}

impl Manifest {
    /// Check the chunk list against the layout implied by size and chunk size.
    /// Nothing is allocated from the declared sizes.
    pub fn validate(&self) -> Result<(), ChunkError> {
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ChunkError::ChunkTooLarge(self.chunk_size));
        }
        let expected = total_chunks(self.file_size, self.chunk_size)?;
        if self.chunks.len() as u64 != expected as u64 {
            return Err(ChunkError::CountMismatch {
                declared: self.chunks.len(),
                expected,
            });
        }
        for (i, got) in self.chunks.iter().enumerate() {
            let index = i as u32;
            let offset = index as u64 * self.chunk_size;
            let size = self.chunk_size.min(self.file_size - offset);
            if got.index != index || got.offset != offset || got.size != size {
                return Err(ChunkError::BadLayout { index: got.index });
            }
            if got.checksum.len() != 64 || hex::decode(&got.checksum).is_err() {
                return Err(ChunkError::BadChecksum { index: got.index });
            }
        }
        Ok(())
    }

    pub fn chunk(&self, index: u32) -> Option<&ChunkInfo> {
        self.chunks.get(index as usize)
    }
}

/// Completion state of a transfer's chunks.
#[derive(Debug, Clone)]
pub struct ChunkLedger {
    done: Vec<bool>,
    completed: u32,
}

impl ChunkLedger {
    pub fn new(total: u32) -> Self {
        Self {
            done: vec![false; total as usize],
            completed: 0,
        }
    }

    /// Mark a chunk completed. Returns false if it already was (or is out of range).
    pub fn mark_completed(&mut self, index: u32) -> bool {
        match self.done.get_mut(index as usize) {
            Some(slot) if !*slot => {
                *slot = true;
                self.completed += 1;
                true
            }
            _ => false,
        }
    }

    pub fn is_completed(&self, index: u32) -> bool {
        self.done.get(index as usize).copied().unwrap_or(false)
    }

    pub fn completed_count(&self) -> u32 {
        self.completed
    }

    pub fn total(&self) -> u32 {
        self.done.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.completed == self.total()
    }

    /// Indices not yet completed, ascending.
    pub fn pending(&self) -> impl Iterator<Item = u32> + '_ {
        self.done
            .iter()
            .enumerate()
            .filter(|(_, d)| !**d)
            .map(|(i, _)| i as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity;

    fn hashed(file_size: u64, chunk_size: u64) -> Manifest {
        let mut chunks = plan_chunks(file_size, chunk_size).unwrap();
        for c in &mut chunks {
            c.checksum = integrity::hash_chunk(&c.index.to_be_bytes());
        }
        Manifest {
            file_id: "f".into(),
            file_name: "a.bin".into(),
            file_size,
            chunk_size,
            chunks,
        }
    }

    #[test]
    fn split_chunks() {
        let chunks = plan_chunks(100, 30).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[0].size, 30);
        assert_eq!(chunks[3].offset, 90);
        assert_eq!(chunks[3].size, 10);
    }

    #[test]
    fn split_exact_multiple() {
        let chunks = plan_chunks(90, 30).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].offset + chunks[2].size, 90);
    }

    #[test]
    fn split_zero_length() {
        assert_eq!(total_chunks(0, 30).unwrap(), 0);
        assert!(plan_chunks(0, 30).unwrap().is_empty());
    }

    #[test]
    fn zero_chunk_size_rejected() {
        assert_eq!(plan_chunks(10, 0), Err(ChunkError::ZeroChunkSize));
    }

    #[test]
    fn ten_and_a_half_megabytes() {
        let chunks = plan_chunks(10_500_000, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(chunks.len(), 11);
        assert_eq!(chunks[10].offset, 10_485_760);
        assert_eq!(chunks[10].size, 104_448);
    }

    #[test]
    fn layout_invariants_hold() {
        for &(file_size, chunk_size) in &[(1u64, 1u64), (7, 3), (4096, 4096), (12_345, 1000)] {
            let chunks = plan_chunks(file_size, chunk_size).unwrap();
            assert_eq!(chunks.len() as u64, file_size.div_ceil(chunk_size));
            assert_eq!(chunks.iter().map(|c| c.size).sum::<u64>(), file_size);
            for c in &chunks {
                assert_eq!(c.offset, c.index as u64 * chunk_size);
                assert!(c.size > 0);
                assert!(c.offset + c.size <= file_size);
            }
        }
    }

    #[test]
    fn manifest_validation() {
        let good = hashed(100, 30);
        assert!(good.validate().is_ok());

        let mut short = good.clone();
        short.chunks.pop();
        assert!(matches!(
            short.validate(),
            Err(ChunkError::CountMismatch { .. })
        ));

        let mut moved = good.clone();
        moved.chunks[1].offset = 31;
        assert_eq!(moved.validate(), Err(ChunkError::BadLayout { index: 1 }));

        let mut unhashed = good;
        unhashed.chunks[2].checksum.clear();
        assert_eq!(unhashed.validate(), Err(ChunkError::BadChecksum { index: 2 }));
    }

    #[test]
    fn oversized_declarations_rejected_cheaply() {
        let empty = Manifest {
            file_id: "f".into(),
            file_name: "a.bin".into(),
            file_size: 16 * 1024 * 1024,
            chunk_size: 1,
            chunks: vec![],
        };
        let started = std::time::Instant::now();
        assert_eq!(
            empty.validate(),
            Err(ChunkError::CountMismatch {
                declared: 0,
                expected: 16 * 1024 * 1024
            })
        );
        assert!(started.elapsed() < std::time::Duration::from_millis(50));

        let huge = Manifest {
            file_size: u64::MAX,
            ..empty.clone()
        };
        assert_eq!(huge.validate(), Err(ChunkError::TooManyChunks(u64::MAX)));

        let wide = Manifest {
            file_size: 1 << 40,
            chunk_size: 1 << 40,
            ..empty
        };
        assert_eq!(wide.validate(), Err(ChunkError::ChunkTooLarge(1 << 40)));
    }

    #[test]
    fn duplicate_chunk_is_idempotent() {
        let mut ledger = ChunkLedger::new(3);
        assert!(ledger.mark_completed(1));
        assert!(!ledger.mark_completed(1));
        assert_eq!(ledger.completed_count(), 1);
        assert!(!ledger.mark_completed(7));
        assert_eq!(ledger.pending().collect::<Vec<_>>(), vec![0, 2]);
        ledger.mark_completed(0);
        ledger.mark_completed(2);
        assert!(ledger.is_complete());
        assert!(ledger.completed_count() <= ledger.total());
    }

    #[test]
    fn completed_flag_not_serialized() {
        let mut chunks = plan_chunks(10, 10).unwrap();
        chunks[0].completed = true;
        let json = serde_json::to_value(&chunks[0]).unwrap();
        assert!(json.get("completed").is_none());
    }
}
