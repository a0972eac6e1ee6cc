use std::io::{self, Read, Write};

use crc32c::crc32c;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Byte offset of the payload within a record body: `type u32 | dn_id u64`.
pub const RECORD_HEADER_SIZE: usize = 4 + 8;

/// Upper bound on one disk frame; anything larger is treated as corruption
/// rather than allocated.
pub const MAX_FRAME_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    Internal,
    LeaseUpdate,
    UserRecord,
}

impl RecordType {
    pub fn as_u32(self) -> u32 {
        match self {
            RecordType::Internal => 0,
            RecordType::LeaseUpdate => 1,
            RecordType::UserRecord => 2,
        }
    }

    pub fn from_u32(raw: u32) -> Result<Self, StoreError> {
        match raw {
            0 => Ok(RecordType::Internal),
            1 => Ok(RecordType::LeaseUpdate),
            2 => Ok(RecordType::UserRecord),
            other => Err(StoreError::Decode(format!("unknown record type {other}"))),
        }
    }
}

/// One replicated log record. On the wire and on disk the layout is
/// `lsn u64 BE | type u32 LE | dn_id u64 LE | payload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub lsn: u64,
    pub rec_type: RecordType,
    pub dn_id: u64,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn user(dn_id: u64, payload: Vec<u8>) -> Self {
        Self {
            lsn: 0,
            rec_type: RecordType::UserRecord,
            dn_id,
            payload,
        }
    }

    pub fn lease_update(dn_id: u64) -> Self {
        Self {
            lsn: 0,
            rec_type: RecordType::LeaseUpdate,
            dn_id,
            payload: dn_id.to_le_bytes().to_vec(),
        }
    }

    pub fn internal(payload: Vec<u8>) -> Self {
        Self {
            lsn: 0,
            rec_type: RecordType::Internal,
            dn_id: 0,
            payload,
        }
    }

    pub fn encoded_len(&self) -> usize {
        8 + RECORD_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.lsn.to_be_bytes());
        out.extend_from_slice(&self.rec_type.as_u32().to_le_bytes());
        out.extend_from_slice(&self.dn_id.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, StoreError> {
        if buf.len() < 8 + RECORD_HEADER_SIZE {
            return Err(StoreError::Decode(format!(
                "log record too short: {} bytes",
                buf.len()
            )));
        }
        let lsn = u64::from_be_bytes(buf[0..8].try_into().expect("sized slice"));
        let rec_type = RecordType::from_u32(u32::from_le_bytes(
            buf[8..12].try_into().expect("sized slice"),
        ))?;
        let dn_id = u64::from_le_bytes(buf[12..20].try_into().expect("sized slice"));
        Ok(Self {
            lsn,
            rec_type,
            dn_id,
            payload: buf[20..].to_vec(),
        })
    }
}

/// Frame kinds inside one shard's on-disk segment.
pub const FRAME_RECORD: u8 = 1;
pub const FRAME_TRUNCATE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub body: Vec<u8>,
}

/// Append-only frame codec for shard segments:
/// `len u32 BE | frame_type u8 | body | crc32c u32 BE`. The checksum
/// covers length, type, and body; torn tails read back as truncation.
pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn append(&mut self, frame_type: u8, body: &[u8]) -> Result<(), StoreError> {
        let body_len = 1 + body.len() + 4;
        let frame_len = u32::try_from(body_len)
            .map_err(|_| StoreError::Encode("frame body too large".into()))?;
        if body_len > MAX_FRAME_BODY_BYTES {
            return Err(StoreError::Encode("frame body too large".into()));
        }
        let len_bytes = frame_len.to_be_bytes();
        let mut crc_input = Vec::with_capacity(4 + 1 + body.len());
        crc_input.extend_from_slice(&len_bytes);
        crc_input.push(frame_type);
        crc_input.extend_from_slice(body);
        let crc = crc32c(&crc_input).to_be_bytes();

        self.inner.write_all(&len_bytes)?;
        self.inner.write_all(&[frame_type])?;
        self.inner.write_all(body)?;
        self.inner.write_all(&crc)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameReadError {
    Truncation,
    Corruption,
    Io(String),
}

impl From<io::Error> for FrameReadError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameReadError> {
        let mut len_buf = [0u8; 4];
        let first = self.inner.read(&mut len_buf[0..1])?;
        if first == 0 {
            return Ok(None);
        }
        match self.inner.read_exact(&mut len_buf[1..4]) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(FrameReadError::Truncation);
            }
            Err(e) => return Err(FrameReadError::Io(e.to_string())),
        }
        let body_len = u32::from_be_bytes(len_buf) as usize;
        if body_len < 1 + 4 || body_len > MAX_FRAME_BODY_BYTES {
            return Err(FrameReadError::Corruption);
        }
        let mut body = vec![0u8; body_len];
        match self.inner.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(FrameReadError::Truncation);
            }
            Err(e) => return Err(FrameReadError::Io(e.to_string())),
        }

        let crc_offset = body_len - 4;
        let stored_crc = u32::from_be_bytes(
            body[crc_offset..]
                .try_into()
                .map_err(|_| FrameReadError::Corruption)?,
        );
        let mut crc_input = Vec::with_capacity(4 + crc_offset);
        crc_input.extend_from_slice(&len_buf);
        crc_input.extend_from_slice(&body[..crc_offset]);
        if stored_crc != crc32c(&crc_input) {
            return Err(FrameReadError::Corruption);
        }

        Ok(Some(Frame {
            frame_type: body[0],
            body: body[1..crc_offset].to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{
        Frame, FrameReadError, FrameReader, FrameWriter, LogRecord, RecordType, FRAME_RECORD,
        RECORD_HEADER_SIZE,
    };

    #[test]
    fn record_encode_decode_round_trip() {
        let mut record = LogRecord::user(7, b"hello".to_vec());
        record.lsn = 42;
        let bytes = record.encode();
        assert_eq!(bytes.len(), 8 + RECORD_HEADER_SIZE + 5);
        // lsn big-endian, type little-endian, dn_id little-endian.
        assert_eq!(&bytes[0..8], &42u64.to_be_bytes());
        assert_eq!(&bytes[8..12], &2u32.to_le_bytes());
        assert_eq!(&bytes[12..20], &7u64.to_le_bytes());
        assert_eq!(LogRecord::decode(&bytes).expect("decode"), record);
    }

    #[test]
    fn lease_update_payload_names_the_new_holder() {
        let record = LogRecord::lease_update(9);
        assert_eq!(record.rec_type, RecordType::LeaseUpdate);
        assert_eq!(record.payload, 9u64.to_le_bytes().to_vec());
    }

    #[test]
    fn internal_records_carry_no_writer_identity() {
        let mut record = LogRecord::internal(b"shard-meta".to_vec());
        record.lsn = 3;
        assert_eq!(record.rec_type, RecordType::Internal);
        assert_eq!(record.dn_id, 0);
        assert_eq!(LogRecord::decode(&record.encode()).expect("decode"), record);
    }

    #[test]
    fn unknown_record_type_fails_decode() {
        let mut bytes = LogRecord::user(1, Vec::new()).encode();
        bytes[8] = 0xEE;
        assert!(LogRecord::decode(&bytes).is_err());
    }

    #[test]
    fn frames_round_trip() {
        let mut writer = FrameWriter::new(Vec::<u8>::new());
        for i in 0..100u64 {
            let mut record = LogRecord::user(3, format!("r{i}").into_bytes());
            record.lsn = i + 1;
            writer
                .append(FRAME_RECORD, &record.encode())
                .expect("append");
        }
        writer.flush().expect("flush");
        let bytes = writer.into_inner();

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let mut count = 0u64;
        while let Some(Frame { frame_type, body }) = reader.next_frame().expect("frame") {
            assert_eq!(frame_type, FRAME_RECORD);
            let record = LogRecord::decode(&body).expect("decode");
            count += 1;
            assert_eq!(record.lsn, count);
        }
        assert_eq!(count, 100);
    }

    #[test]
    fn torn_tail_reads_as_truncation() {
        let mut writer = FrameWriter::new(Vec::<u8>::new());
        let mut record = LogRecord::user(3, b"payload".to_vec());
        record.lsn = 1;
        writer
            .append(FRAME_RECORD, &record.encode())
            .expect("append");
        let mut bytes = writer.into_inner();
        bytes.truncate(bytes.len() - 3);

        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert_eq!(
            reader.next_frame().expect_err("torn"),
            FrameReadError::Truncation
        );
    }

    #[test]
    fn bit_flip_reads_as_corruption() {
        let mut writer = FrameWriter::new(Vec::<u8>::new());
        let mut record = LogRecord::user(3, b"payload".to_vec());
        record.lsn = 1;
        writer
            .append(FRAME_RECORD, &record.encode())
            .expect("append");
        let mut bytes = writer.into_inner();
        bytes[10] ^= 0x01;

        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert_eq!(
            reader.next_frame().expect_err("flip"),
            FrameReadError::Corruption
        );
    }
}
