//! One in-flight upload: ciphertext in, checksummed plaintext out.

use std::path::PathBuf;

use bytes::BytesMut;

use cask_core::config::UploadPadding;
use cask_core::crypto::{
    strip_pkcs7, Checksum, ChecksumKind, SessionKey, StreamDecryptor, BLOCK_SIZE,
};

use super::SessionError;
use crate::storage::UploadTarget;

/// A finished upload, moved into place.
#[derive(Debug)]
pub(crate) struct CompletedUpload {
    pub path: PathBuf,
    pub checksum: u32,
    pub plaintext_len: u64,
}

pub(crate) struct Upload {
    decryptor: StreamDecryptor,
    target: UploadTarget,
    checksum: Box<dyn Checksum>,
    padding: UploadPadding,
    content_size: u64,
    consumed: u64,
    /// Ciphertext received but not yet decrypted.
    pending: BytesMut,
}

impl Upload {
    /// Reject content sizes the padding policy cannot decrypt.
    pub fn check_content_size(content_size: u32, padding: UploadPadding) -> Result<(), SessionError> {
        let aligned = content_size as usize % BLOCK_SIZE == 0;
        let ok = match padding {
            UploadPadding::None => aligned,
            UploadPadding::Pkcs7 => aligned && content_size as usize >= BLOCK_SIZE,
        };
        if !ok {
            return Err(SessionError::UnalignedContent {
                size: content_size,
                padding,
            });
        }
        Ok(())
    }

    pub fn new(
        key: &SessionKey,
        target: UploadTarget,
        checksum: ChecksumKind,
        padding: UploadPadding,
        content_size: u32,
    ) -> Self {
        Self {
            decryptor: StreamDecryptor::new(key),
            target,
            checksum: checksum.start(),
            padding,
            content_size: content_size as u64,
            consumed: 0,
            pending: BytesMut::with_capacity(2 * BLOCK_SIZE + cask_core::wire::PACKET_SIZE),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.content_size - self.consumed
    }

    pub fn is_complete(&self) -> bool {
        self.consumed == self.content_size
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Accept the next stretch of the ciphertext stream. Bytes past the
    /// declared content size are frame padding and are ignored.
    pub async fn feed(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let take = (self.remaining().min(data.len() as u64)) as usize;
        self.pending.extend_from_slice(&data[..take]);
        self.consumed += take as u64;

        // With PKCS#7 the last block must survive until `finish`.
        let keep = match self.padding {
            UploadPadding::None => 0,
            UploadPadding::Pkcs7 => BLOCK_SIZE,
        };
        let ready = StreamDecryptor::decryptable_now(self.pending.len().saturating_sub(keep));
        if ready > 0 {
            let ciphertext = self.pending.split_to(ready);
            let plaintext = self.decryptor.decrypt(&ciphertext)?;
            self.write(&plaintext).await?;
        }
        Ok(())
    }

    async fn write(&mut self, plaintext: &[u8]) -> Result<(), SessionError> {
        self.checksum.update(plaintext);
        self.target.append(plaintext).await?;
        Ok(())
    }

    /// Decrypt whatever is held back, then commit the target.
    pub async fn finish(mut self) -> Result<CompletedUpload, SessionError> {
        if !self.is_complete() {
            return Err(SessionError::TruncatedUpload {
                expected: self.content_size,
                received: self.consumed,
            });
        }

        if self.padding == UploadPadding::Pkcs7 {
            let last = self.pending.split();
            let block = self.decryptor.decrypt(&last)?;
            let data = strip_pkcs7(&block)?;
            self.write(data).await?;
        }
        debug_assert!(self.pending.is_empty());

        let plaintext_len = self.target.written();
        let checksum = self.checksum.finalize();
        let path = self.target.commit().await?;
        Ok(CompletedUpload {
            path,
            checksum,
            plaintext_len,
        })
    }

    /// Drop the partial upload.
    pub async fn abort(self) {
        if let Err(e) = self.target.abort().await {
            tracing::warn!(error = %e, "failed to remove partial upload");
        }
    }
}
