//! Vector math and embedding blob codec.

/// Cosine distance between two equal-length vectors: `1 - (a.b)/(|a||b|)`.
///
/// Returns `1.0` when either norm is zero. Mismatched lengths are a
/// programmer error, not a runtime condition.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), b.len(), "cosine_distance on mismatched lengths");

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Encode an embedding as a contiguous little-endian f32 sequence, no header.
/// Empty input encodes to an empty blob, stored as NULL by the stores.
pub fn encode_embedding(emb: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(emb.len() * 4);
    for v in emb {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

/// Decode an embedding blob. Blobs whose length is not a multiple of 4
/// decode to an empty vector.
pub fn decode_embedding(buf: &[u8]) -> Vec<f32> {
    if buf.is_empty() || buf.len() % 4 != 0 {
        return Vec::new();
    }
    buf.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
