//! Packed vector codec for embedding blobs.
//!
//! The wire format is little-endian 32-bit floats, `4 * dimension` bytes,
//! no header.

use crate::StoreError;

/// Pack a float slice into little-endian bytes.
pub fn encode(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Unpack little-endian bytes into floats.
///
/// Fails when the byte length is not a multiple of four.
pub fn decode(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::Storage(format!(
            "vector blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_and_is_little_endian() {
        let values = vec![1.0f32, -2.5, 0.0, f32::MAX];
        let bytes = encode(&values);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(decode(&bytes).unwrap(), values);
    }

    #[test]
    fn rejects_truncated_blobs() {
        assert!(decode(&[0u8; 5]).is_err());
        assert_eq!(decode(&[]).unwrap(), Vec::<f32>::new());
    }
}
