use image::GenericImageView;
use sha2::{Digest, Sha256};

use crate::models::ContentFingerprint;

/// Compute the content fingerprint of an attachment.
///
/// Decodable images are hashed over their normalized form (dimensions followed
/// by RGBA8 pixels) so a PNG and a lossless re-encode of the same picture
/// share a fingerprint. Anything the decoders reject is hashed as raw bytes,
/// under a distinct domain tag so the two spaces never collide.
///
/// CPU-bound: call from `spawn_blocking`.
pub fn compute_fingerprint(bytes: &[u8]) -> ContentFingerprint {
    let digest = match image::load_from_memory(bytes) {
        Ok(img) => {
            let (width, height) = img.dimensions();
            let rgba = img.to_rgba8();
            let mut hasher = Sha256::new();
            hasher.update(b"img:");
            hasher.update(width.to_be_bytes());
            hasher.update(height.to_be_bytes());
            hasher.update(rgba.as_raw());
            hasher.finalize()
        }
        Err(e) => {
            tracing::debug!(error = %e, len = bytes.len(), "Attachment not decodable, hashing raw bytes");
            let mut hasher = Sha256::new();
            hasher.update(b"raw:");
            hasher.update(bytes);
            hasher.finalize()
        }
    };

    ContentFingerprint::from_hex(format!("{:x}", digest))
}
