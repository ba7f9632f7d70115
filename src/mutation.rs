use crate::error::StrataError;
use compact_str::CompactString;
use smallvec::SmallVec;

/// Serialized partition key bytes. Small keys stay inline.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PartitionKey(SmallVec<[u8; 16]>);

impl PartitionKey {
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        PartitionKey(SmallVec::from_slice(bytes.as_ref()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 64-bit partition token. fmix64 over the key bytes; stable across
    /// restarts, used for rate-limit bucketing.
    pub fn token(&self) -> u64 {
        let mut h: u64 = 0x9E37_79B9_7F4A_7C15;
        for chunk in self.0.chunks(8) {
            let mut buf = [0u8; 8];
            buf[..chunk.len()].copy_from_slice(chunk);
            h ^= u64::from_le_bytes(buf);
            h = fmix64(h);
        }
        fmix64(h ^ self.0.len() as u64)
    }

    pub fn hex(&self) -> String {
        let mut out = String::with_capacity(2 + self.0.len() * 2);
        out.push_str("0x");
        for b in &self.0 {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    k ^= k >> 33;
    k = k.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
    k ^= k >> 33;
    k
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub column: CompactString,
    pub timestamp_micros: u64,
    pub value: Vec<u8>,
}

/// A single-partition write: per-column upserts plus an optional partition
/// tombstone deleting everything at or below its timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub key: PartitionKey,
    pub cells: Vec<Cell>,
    pub tombstone_micros: Option<u64>,
}

impl Mutation {
    pub fn upsert(key: PartitionKey, cells: Vec<Cell>) -> Self {
        Self {
            key,
            cells,
            tombstone_micros: None,
        }
    }

    pub fn partition_delete(key: PartitionKey, timestamp_micros: u64) -> Self {
        Self {
            key,
            cells: Vec::new(),
            tombstone_micros: Some(timestamp_micros),
        }
    }

    /// Approximate in-memory footprint, accounted against dirty memory.
    pub fn footprint(&self) -> u64 {
        let mut bytes = 64 + self.key.len() as u64;
        for cell in &self.cells {
            bytes += 48 + cell.column.len() as u64 + cell.value.len() as u64;
        }
        bytes
    }

    pub fn max_timestamp_micros(&self) -> u64 {
        let cell_max = self
            .cells
            .iter()
            .map(|c| c.timestamp_micros)
            .max()
            .unwrap_or(0);
        cell_max.max(self.tombstone_micros.unwrap_or(0))
    }

    pub fn min_timestamp_micros(&self) -> u64 {
        self.cells
            .iter()
            .map(|c| c.timestamp_micros)
            .chain(self.tombstone_micros)
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Wire encoding used for commit-log payloads. Length-prefixed fields,
    /// big endian, no self-description: the frame layer owns integrity.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.footprint() as usize);
        out.extend_from_slice(&(self.key.len() as u32).to_be_bytes());
        out.extend_from_slice(self.key.as_bytes());
        match self.tombstone_micros {
            Some(ts) => {
                out.push(1);
                out.extend_from_slice(&ts.to_be_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&(self.cells.len() as u32).to_be_bytes());
        for cell in &self.cells {
            out.extend_from_slice(&(cell.column.len() as u16).to_be_bytes());
            out.extend_from_slice(cell.column.as_bytes());
            out.extend_from_slice(&cell.timestamp_micros.to_be_bytes());
            out.extend_from_slice(&(cell.value.len() as u32).to_be_bytes());
            out.extend_from_slice(&cell.value);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StrataError> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let key_len = cursor.u32()? as usize;
        let key = PartitionKey::new(cursor.take(key_len)?);
        let tombstone_micros = match cursor.u8()? {
            0 => None,
            1 => Some(cursor.u64()?),
            _ => return Err(StrataError::Corruption("bad tombstone flag".into())),
        };
        let cell_count = cursor.u32()? as usize;
        let mut cells = Vec::with_capacity(cell_count.min(1024));
        for _ in 0..cell_count {
            let name_len = cursor.u16()? as usize;
            let name = std::str::from_utf8(cursor.take(name_len)?)
                .map_err(|_| StrataError::Corruption("non-utf8 column name".into()))?;
            let timestamp_micros = cursor.u64()?;
            let value_len = cursor.u32()? as usize;
            let value = cursor.take(value_len)?.to_vec();
            cells.push(Cell {
                column: CompactString::new(name),
                timestamp_micros,
                value,
            });
        }
        Ok(Mutation {
            key,
            cells,
            tombstone_micros,
        })
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], StrataError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| StrataError::Corruption("truncated mutation payload".into()))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, StrataError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, StrataError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().expect("len")))
    }

    fn u32(&mut self) -> Result<u32, StrataError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("len")))
    }

    fn u64(&mut self) -> Result<u64, StrataError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().expect("len")))
    }
}

#[cfg(test)]
mod tests {
    use super::{Cell, Mutation, PartitionKey};

    fn sample() -> Mutation {
        Mutation {
            key: PartitionKey::new(b"user:42"),
            cells: vec![
                Cell {
                    column: "name".into(),
                    timestamp_micros: 100,
                    value: b"ada".to_vec(),
                },
                Cell {
                    column: "age".into(),
                    timestamp_micros: 101,
                    value: vec![0, 0, 0, 36],
                },
            ],
            tombstone_micros: None,
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let m = sample();
        let decoded = Mutation::decode(&m.encode()).expect("decode");
        assert_eq!(decoded, m);

        let del = Mutation::partition_delete(PartitionKey::new(b"k"), 7);
        assert_eq!(Mutation::decode(&del.encode()).expect("decode"), del);
    }

    #[test]
    fn truncated_payload_is_corruption() {
        let bytes = sample().encode();
        for cut in 1..bytes.len() {
            assert!(Mutation::decode(&bytes[..cut]).is_err(), "cut={cut}");
        }
    }

    #[test]
    fn token_is_stable_and_spreads() {
        let a = PartitionKey::new(b"alpha").token();
        assert_eq!(a, PartitionKey::new(b"alpha").token());
        assert_ne!(a, PartitionKey::new(b"beta").token());
        assert_ne!(a, PartitionKey::new(b"alpha\0").token());
    }

    #[test]
    fn timestamps_cover_tombstone() {
        let del = Mutation::partition_delete(PartitionKey::new(b"k"), 9);
        assert_eq!(del.max_timestamp_micros(), 9);
        assert_eq!(del.min_timestamp_micros(), 9);
    }
}
