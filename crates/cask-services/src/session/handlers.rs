//! Request handlers. Each returns the flow for the session loop; an error
//! is dropped or closes the connection according to `Session::handle_frame`.

use tokio::io::{AsyncRead, AsyncWrite};

use cask_core::crypto::{generate_session_key, wrap_key};
use cask_core::wire::{
    ClientId, CrcRequest, PublicKeyField, RequestHeader, Response, SEND_FILE_DATA_OFFSET,
};

use super::upload::Upload;
use super::{Flow, Session, SessionError};
use crate::storage::validate_file_name;
use crate::store::{ClientRecord, FileRecord};

/// Registration names: non-empty ASCII letters and digits.
fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric())
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Look up the client named by a request header and refresh its
    /// last-seen time.
    fn resolve(&self, id: &ClientId) -> Result<ClientRecord, SessionError> {
        let client = self
            .ctx
            .store
            .client(id)
            .ok_or_else(|| SessionError::UnknownClient(hex::encode(id)))?;
        self.ctx.store.touch(id)?;
        Ok(client)
    }

    fn check_body_id(&self, header: &RequestHeader, body_id: &ClientId) {
        if *body_id != header.client_id {
            tracing::warn!(
                peer = %self.peer,
                header = %hex::encode(header.client_id),
                body = %hex::encode(body_id),
                "client id in body differs from header, using header"
            );
        }
    }

    // ── Registration ──────────────────────────────────────────────────────────

    pub(super) async fn register(&mut self, name: String) -> Result<Flow, SessionError> {
        if !valid_name(&name) {
            tracing::info!(peer = %self.peer, name = %name, "registration refused: invalid name");
            self.send(Response::RegistrationFailed).await?;
            return Ok(Flow::Continue);
        }

        let registered = match self.ctx.store.register(&name) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(peer = %self.peer, name = %name, error = %e, "registration failed");
                None
            }
        };
        match registered {
            Some(client) => {
                tracing::info!(
                    peer = %self.peer,
                    client = %hex::encode(client.id),
                    name = %name,
                    "client registered"
                );
                self.send(Response::RegistrationSuccess {
                    client_id: client.id,
                })
                .await?;
            }
            None => {
                tracing::info!(peer = %self.peer, name = %name, "registration refused");
                self.send(Response::RegistrationFailed).await?;
            }
        }
        Ok(Flow::Continue)
    }

    // ── Key exchange ──────────────────────────────────────────────────────────

    pub(super) async fn exchange_key(
        &mut self,
        header: &RequestHeader,
        name: String,
        public_key: PublicKeyField,
    ) -> Result<Flow, SessionError> {
        let client = self.resolve(&header.client_id)?;
        if name != client.name {
            tracing::debug!(
                client = %hex::encode(client.id),
                registered = %client.name,
                sent = %name,
                "key exchange name differs from registration"
            );
        }

        let key = generate_session_key();
        let wrapped_key = wrap_key(&key, &public_key)?;
        self.ctx.store.set_keys(&client.id, public_key, key)?;

        tracing::info!(
            peer = %self.peer,
            client = %hex::encode(client.id),
            wrapped = wrapped_key.len(),
            "session key issued"
        );
        self.send(Response::AesKey {
            client_id: client.id,
            wrapped_key,
        })
        .await?;
        Ok(Flow::Continue)
    }

    // ── Upload ────────────────────────────────────────────────────────────────

    pub(super) async fn receive_file(
        &mut self,
        header: &RequestHeader,
        body_id: ClientId,
        content_size: u32,
        file_name: String,
        received: &[u8],
    ) -> Result<Flow, SessionError> {
        let client = self.resolve(&header.client_id)?;
        self.check_body_id(header, &body_id);
        let client_hex = hex::encode(client.id);
        let key = client
            .session_key
            .as_ref()
            .ok_or_else(|| SessionError::NoSessionKey(client_hex.clone()))?;
        validate_file_name(&file_name)?;
        let settings = self.ctx.settings.clone();
        Upload::check_content_size(content_size, settings.upload_padding)?;
        // The stream ended inside the request itself.
        let Some(first_data) = received.get(SEND_FILE_DATA_OFFSET..) else {
            return Err(SessionError::TruncatedUpload {
                expected: content_size as u64,
                received: 0,
            });
        };

        let target = self.ctx.storage.begin_upload(&client.id, &file_name).await?;
        let mut upload = Upload::new(
            key,
            target,
            settings.checksum,
            settings.upload_padding,
            content_size,
        );
        tracing::debug!(client = %client_hex, file = %file_name, bytes = content_size, "upload started");

        if let Err(e) = self.stream_upload(&mut upload, first_data).await {
            upload.abort().await;
            return Err(e);
        }
        let done = upload.finish().await?;

        let previous = self.ctx.store.upsert_file(FileRecord {
            client_id: client.id,
            file_name: file_name.clone(),
            path: done.path.clone(),
            verified: false,
        })?;
        if let Some(previous) = previous {
            if previous.path != done.path {
                self.ctx.storage.remove(&previous.path).await?;
            }
        }

        tracing::info!(
            peer = %self.peer,
            client = %client_hex,
            file = %file_name,
            bytes = done.plaintext_len,
            checksum = done.checksum,
            "upload complete"
        );
        self.send(Response::FileReceived {
            client_id: client.id,
            content_size,
            file_name,
            checksum: done.checksum,
        })
        .await?;
        Ok(Flow::Continue)
    }

    /// Feed the ciphertext after the request body, then following frames,
    /// until the declared length has been consumed. Only bytes the peer
    /// sent count; the padding of a partial final frame does not.
    async fn stream_upload(
        &mut self,
        upload: &mut Upload,
        first_data: &[u8],
    ) -> Result<(), SessionError> {
        upload.feed(first_data).await?;
        while !upload.is_complete() {
            match self.read_frame().await? {
                Some((frame, len)) => upload.feed(&frame[..len]).await?,
                None => {
                    return Err(SessionError::TruncatedUpload {
                        expected: upload.consumed() + upload.remaining(),
                        received: upload.consumed(),
                    })
                }
            }
        }
        Ok(())
    }

    // ── Checksum confirmation ─────────────────────────────────────────────────

    pub(super) async fn crc_valid(
        &mut self,
        header: &RequestHeader,
        crc: CrcRequest,
    ) -> Result<Flow, SessionError> {
        let client = self.resolve(&header.client_id)?;
        self.check_body_id(header, &crc.client_id);

        if !self.ctx.store.mark_verified(&client.id, &crc.file_name)? {
            return Err(SessionError::UnknownFile {
                client: hex::encode(client.id),
                file: crc.file_name,
            });
        }
        tracing::info!(
            peer = %self.peer,
            client = %hex::encode(client.id),
            file = %crc.file_name,
            "file verified"
        );
        self.send(Response::MessageReceived).await?;
        Ok(Flow::Terminate)
    }

    pub(super) async fn crc_invalid(
        &mut self,
        header: &RequestHeader,
        crc: CrcRequest,
    ) -> Result<Flow, SessionError> {
        self.discard_upload(header, &crc).await?;
        self.send(Response::MessageReceived).await?;
        Ok(Flow::Continue)
    }

    /// The client's final retry failed. The session ends whatever happens.
    pub(super) async fn crc_last_invalid(
        &mut self,
        header: &RequestHeader,
        crc: CrcRequest,
    ) -> Result<Flow, SessionError> {
        match self.discard_upload(header, &crc).await {
            Ok(()) => self.send(Response::MessageReceived).await?,
            Err(e) => tracing::warn!(
                peer = %self.peer,
                client = %hex::encode(header.client_id),
                file = %crc.file_name,
                error = %e,
                "cleanup after final checksum failure did not complete"
            ),
        }
        Ok(Flow::Terminate)
    }

    /// Delete the stored bytes and record of an unverified upload.
    async fn discard_upload(
        &mut self,
        header: &RequestHeader,
        crc: &CrcRequest,
    ) -> Result<(), SessionError> {
        let client = self.resolve(&header.client_id)?;
        self.check_body_id(header, &crc.client_id);
        let client_hex = hex::encode(client.id);

        let record = self
            .ctx
            .store
            .file(&client.id, &crc.file_name)
            .ok_or_else(|| SessionError::UnknownFile {
                client: client_hex.clone(),
                file: crc.file_name.clone(),
            })?;
        if record.verified {
            return Err(SessionError::AlreadyVerified {
                client: client_hex,
                file: crc.file_name.clone(),
            });
        }

        self.ctx.storage.remove(&record.path).await?;
        self.ctx.store.remove_file(&client.id, &crc.file_name)?;
        tracing::info!(
            peer = %self.peer,
            client = %client_hex,
            file = %crc.file_name,
            "unverified upload discarded"
        );
        Ok(())
    }
}
