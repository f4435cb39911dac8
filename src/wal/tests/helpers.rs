//! Shared helpers for WAL unit tests.

use crate::encoding::{self, EncodingError};

/// Minimal record type exercising the generic WAL machinery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRecord {
    pub id: u64,
    pub payload: Vec<u8>,
}

impl TestRecord {
    pub fn new(id: u64, payload: &[u8]) -> Self {
        Self {
            id,
            payload: payload.to_vec(),
        }
    }
}

impl encoding::Encode for TestRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::Encode::encode_to(&self.id, buf)?;
        encoding::Encode::encode_to(&self.payload, buf)?;
        Ok(())
    }
}

impl encoding::Decode for TestRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (payload, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { id, payload }, offset))
    }
}

/// Initialize a tracing subscriber controlled by `RUST_LOG`.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
