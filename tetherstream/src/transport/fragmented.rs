//! Fragmentation engine.
//!
//! Payloads larger than the configured fragment size are split into
//! `ceil(len / fragment_size)` chunks that share a message id. Every chunk is
//! sent as its own reliable datagram. The receiver keeps one assembly record
//! per message id and emits the concatenated payload once every index has
//! arrived.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rand::RngExt as _;

use crate::error::{Result, TetherStreamError};
use crate::packet::FragmentHeader;

/// Sending side: splits payloads and assigns message ids.
pub struct Fragmenter {
    next_message_id: AtomicU16,
    fragment_size: usize,
}

impl Fragmenter {
    pub fn new(fragment_size: usize) -> Self {
        Self {
            next_message_id: AtomicU16::new(rand::rng().random::<u16>()),
            fragment_size,
        }
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// Split `payload` into fragments. Chunks are zero-copy slices of it.
    pub fn split(&self, payload: &Bytes, sequence: Option<u8>) -> Result<Vec<(FragmentHeader, Bytes)>> {
        let count = payload.len().div_ceil(self.fragment_size).max(1);
        let total = u16::try_from(count).map_err(|_| TetherStreamError::MessageTooLarge {
            size: payload.len(),
            max: self.fragment_size * u16::MAX as usize,
        })?;
        let message_id = self.next_message_id.fetch_add(1, Ordering::AcqRel);

        let fragments = (0..total)
            .map(|index| {
                let start = index as usize * self.fragment_size;
                let end = (start + self.fragment_size).min(payload.len());
                let header = FragmentHeader {
                    message_id,
                    index,
                    total,
                    sequence,
                };
                (header, payload.slice(start..end))
            })
            .collect();
        Ok(fragments)
    }
}

/// A message whose fragments have all arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub message_id: u16,
    pub sequence: Option<u8>,
    pub payload: Bytes,
}

struct AssemblyRecord {
    total: u16,
    sequence: Option<u8>,
    chunks: Vec<Option<Bytes>>,
    received: u16,
}

/// Receiving side: one record per in-progress message id.
pub struct FragmentAssembler {
    records: Mutex<HashMap<u16, AssemblyRecord>>,
    fragment_size: usize,
    max_message_size: usize,
}

impl FragmentAssembler {
    pub fn new(fragment_size: usize, max_message_size: usize) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            fragment_size,
            max_message_size,
        }
    }

    /// Check a fragment against the size bounds and against any record
    /// already open for its message, without storing it.
    pub fn validate(&self, header: &FragmentHeader, chunk_len: usize) -> Result<()> {
        self.check_bounds(header, chunk_len)?;
        match self.records.lock().get(&header.message_id) {
            Some(record) => Self::check_record(record, header),
            None => Ok(()),
        }
    }

    fn check_bounds(&self, header: &FragmentHeader, chunk_len: usize) -> Result<()> {
        let FragmentHeader {
            message_id,
            index,
            total,
            ..
        } = *header;
        if total == 0 || index >= total {
            return Err(TetherStreamError::InvalidFragment {
                message_id,
                index,
                total,
            });
        }
        let bound = total as usize * self.fragment_size;
        if bound > self.max_message_size {
            return Err(TetherStreamError::MessageTooLarge {
                size: bound,
                max: self.max_message_size,
            });
        }
        if chunk_len > self.fragment_size {
            return Err(TetherStreamError::PayloadTooLarge {
                size: chunk_len,
                max: self.fragment_size,
            });
        }
        Ok(())
    }

    fn check_record(record: &AssemblyRecord, header: &FragmentHeader) -> Result<()> {
        if record.total != header.total || record.sequence != header.sequence {
            return Err(TetherStreamError::InvalidFragment {
                message_id: header.message_id,
                index: header.index,
                total: header.total,
            });
        }
        Ok(())
    }

    /// Store one chunk. Returns the full message when it completes it.
    /// Duplicate indices are ignored.
    pub fn on_fragment_received(
        &self,
        header: FragmentHeader,
        chunk: Bytes,
    ) -> Result<Option<Reassembled>> {
        self.check_bounds(&header, chunk.len())?;
        let FragmentHeader {
            message_id,
            index,
            total,
            sequence,
        } = header;

        let mut records = self.records.lock();
        if let Some(record) = records.get(&message_id) {
            Self::check_record(record, &header)?;
        }
        let record = records.entry(message_id).or_insert_with(|| AssemblyRecord {
            total,
            sequence,
            chunks: vec![None; total as usize],
            received: 0,
        });

        let slot = &mut record.chunks[index as usize];
        if slot.is_some() {
            return Ok(None);
        }
        *slot = Some(chunk);
        record.received += 1;
        if record.received < record.total {
            return Ok(None);
        }

        let Some(record) = records.remove(&message_id) else {
            return Ok(None);
        };
        drop(records);

        let len = record.chunks.iter().flatten().map(Bytes::len).sum();
        let mut payload = BytesMut::with_capacity(len);
        for chunk in record.chunks.into_iter().flatten() {
            payload.extend_from_slice(&chunk);
        }
        Ok(Some(Reassembled {
            message_id,
            sequence: record.sequence,
            payload: payload.freeze(),
        }))
    }

    /// Number of messages still being assembled.
    pub fn pending(&self) -> usize {
        self.records.lock().len()
    }

    /// Evict every partial message.
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn split_sizes() {
        let fragmenter = Fragmenter::new(1024);
        let parts = fragmenter.split(&payload(4000), Some(3)).unwrap();
        let sizes: Vec<usize> = parts.iter().map(|(_, chunk)| chunk.len()).collect();
        assert_eq!(sizes, vec![1024, 1024, 1024, 928]);
        assert!(parts.iter().all(|(h, _)| h.total == 4 && h.sequence == Some(3)));
        let ids: Vec<u16> = parts.iter().map(|(h, _)| h.message_id).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn message_ids_differ_between_messages() {
        let fragmenter = Fragmenter::new(4);
        let a = fragmenter.split(&payload(8), None).unwrap();
        let b = fragmenter.split(&payload(8), None).unwrap();
        assert_ne!(a[0].0.message_id, b[0].0.message_id);
    }

    #[test]
    fn reassembles_in_any_order() {
        let fragmenter = Fragmenter::new(10);
        let assembler = FragmentAssembler::new(10, 1000);
        let original = payload(35);
        let mut parts = fragmenter.split(&original, None).unwrap();
        parts.reverse();

        let last = parts.pop().unwrap();
        for (header, chunk) in parts {
            assert!(assembler.on_fragment_received(header, chunk).unwrap().is_none());
        }
        assert_eq!(assembler.pending(), 1);
        let message = assembler.on_fragment_received(last.0, last.1).unwrap().unwrap();
        assert_eq!(message.payload, original);
        assert_eq!(message.sequence, None);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn duplicate_index_ignored() {
        let assembler = FragmentAssembler::new(4, 64);
        let header = |index| FragmentHeader {
            message_id: 1,
            index,
            total: 2,
            sequence: Some(0),
        };
        let first = Bytes::from_static(b"abcd");
        assert!(assembler.on_fragment_received(header(0), first.clone()).unwrap().is_none());
        assert!(assembler.on_fragment_received(header(0), first).unwrap().is_none());
        let done = assembler
            .on_fragment_received(header(1), Bytes::from_static(b"ef"))
            .unwrap()
            .unwrap();
        assert_eq!(&done.payload[..], b"abcdef");
        assert_eq!(done.sequence, Some(0));
    }

    #[test]
    fn oversized_fragment_count_rejected() {
        let assembler = FragmentAssembler::new(1024, 4096);
        let header = FragmentHeader {
            message_id: 9,
            index: 0,
            total: 5000,
            sequence: None,
        };
        assert!(matches!(
            assembler.on_fragment_received(header, Bytes::from_static(b"x")),
            Err(TetherStreamError::MessageTooLarge { .. })
        ));
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn conflicting_total_rejected() {
        let assembler = FragmentAssembler::new(4, 64);
        let mut header = FragmentHeader {
            message_id: 2,
            index: 0,
            total: 3,
            sequence: None,
        };
        assembler.on_fragment_received(header, Bytes::from_static(b"aaaa")).unwrap();
        header.index = 1;
        header.total = 4;
        assert!(matches!(
            assembler.on_fragment_received(header, Bytes::from_static(b"bbbb")),
            Err(TetherStreamError::InvalidFragment { .. })
        ));
    }

    #[test]
    fn validate_leaves_no_record() {
        let assembler = FragmentAssembler::new(4, 64);
        let mut header = FragmentHeader {
            message_id: 4,
            index: 0,
            total: 2,
            sequence: Some(1),
        };
        assembler.validate(&header, 4).unwrap();
        assert_eq!(assembler.pending(), 0);
        assert!(matches!(
            assembler.validate(&header, 5),
            Err(TetherStreamError::PayloadTooLarge { size: 5, max: 4 })
        ));

        assembler.on_fragment_received(header, Bytes::from_static(b"abcd")).unwrap();
        header.index = 1;
        header.sequence = Some(2);
        assert!(matches!(
            assembler.validate(&header, 2),
            Err(TetherStreamError::InvalidFragment { .. })
        ));
    }

    #[test]
    fn clear_evicts_partial_messages() {
        let assembler = FragmentAssembler::new(4, 64);
        let header = FragmentHeader {
            message_id: 3,
            index: 1,
            total: 2,
            sequence: None,
        };
        assembler.on_fragment_received(header, Bytes::from_static(b"zz")).unwrap();
        assembler.clear();
        assert_eq!(assembler.pending(), 0);
    }
}
