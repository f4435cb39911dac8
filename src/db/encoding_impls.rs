//! Wire format for [`Record`] — the payload of every memtable WAL frame.
//!
//! Layout: `op:u8, key:[u32 len][bytes], value:[u32 len][bytes], seq:u64`.
//! Tombstones carry an empty value so that every frame has the same shape.

use crate::db::utils::Record;
use crate::encoding::{self, EncodingError};

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;

impl encoding::Encode for Record {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Record::Put { key, value, seq } => {
                encoding::Encode::encode_to(&OP_PUT, buf)?;
                encoding::Encode::encode_to(key, buf)?;
                encoding::Encode::encode_to(value, buf)?;
                encoding::Encode::encode_to(seq, buf)?;
            }
            Record::Delete { key, seq } => {
                encoding::Encode::encode_to(&OP_DELETE, buf)?;
                encoding::Encode::encode_to(key, buf)?;
                encoding::Encode::encode_to(&Vec::<u8>::new(), buf)?;
                encoding::Encode::encode_to(seq, buf)?;
            }
        }
        Ok(())
    }
}

impl encoding::Decode for Record {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (op, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let (key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;

        match op {
            OP_PUT => Ok((Record::Put { key, value, seq }, offset)),
            OP_DELETE => Ok((Record::Delete { key, seq }, offset)),
            other => Err(EncodingError::InvalidTag {
                tag: other as u32,
                type_name: "Record",
            }),
        }
    }
}
