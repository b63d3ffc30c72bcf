use crate::*;

use cask_core::config::UploadPadding;
use cask_core::crypto::ChecksumKind;

/// Upload, confirm with ValidCRC: stored, verified, connection closed.
#[tokio::test]
async fn test_upload_valid_crc_end_to_end() -> Result<()> {
    let server = TestServer::start(SessionSettings::default()).await?;
    let mut client = Client::ready(server.addr, "alice").await?;

    // Ten frames' worth, block aligned but not frame aligned.
    let plaintext: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 256) as u8).collect();

    let (content_size, checksum) = client.upload("report.bin", &plaintext).await?;
    assert_eq!(content_size, 10_000);
    assert_eq!(checksum, ChecksumKind::Cksum.compute(&plaintext));

    let path = server.ctx.storage.path_for(&client.id, "report.bin")?;
    assert_eq!(std::fs::read(&path)?, plaintext);

    client.confirm(Request::ValidCrc, "report.bin").await?;
    assert_eq!(client.response().await?, Response::MessageReceived);
    assert!(client.closed().await, "server should close after ValidCRC");

    let record = server
        .ctx
        .store
        .file(&client.id, "report.bin")
        .context("file record missing")?;
    assert!(record.verified);

    server.stop().await
}

/// Upload, InvalidCRC, re-upload, ValidCRC: only the second upload survives.
#[tokio::test]
async fn test_invalid_crc_retry_end_to_end() -> Result<()> {
    let server = TestServer::start(SessionSettings::default()).await?;
    let mut client = Client::ready(server.addr, "bob").await?;
    let path = server.ctx.storage.path_for(&client.id, "photo.raw")?;

    client.upload("photo.raw", &[0xAA; 3072]).await?;
    client.confirm(Request::InvalidCrc, "photo.raw").await?;
    assert_eq!(client.response().await?, Response::MessageReceived);
    assert!(!path.exists(), "rejected upload should be deleted");
    assert!(server.ctx.store.file(&client.id, "photo.raw").is_none());

    client.upload("photo.raw", &[0xBB; 3072]).await?;
    client.confirm(Request::ValidCrc, "photo.raw").await?;
    assert_eq!(client.response().await?, Response::MessageReceived);

    assert_eq!(std::fs::read(&path)?, vec![0xBB; 3072]);
    assert!(server.ctx.store.file(&client.id, "photo.raw").map(|r| r.verified) == Some(true));

    server.stop().await
}

/// Three strikes: LastInvalidCRC cleans up and closes the connection.
#[tokio::test]
async fn test_last_invalid_crc_end_to_end() -> Result<()> {
    let server = TestServer::start(SessionSettings::default()).await?;
    let mut client = Client::ready(server.addr, "carol").await?;

    for attempt in 0..2 {
        client.upload("a.bin", &[attempt as u8; 48]).await?;
        client.confirm(Request::InvalidCrc, "a.bin").await?;
        assert_eq!(client.response().await?, Response::MessageReceived);
    }
    client.upload("a.bin", &[9u8; 48]).await?;
    client.confirm(Request::LastInvalidCrc, "a.bin").await?;
    assert_eq!(client.response().await?, Response::MessageReceived);
    assert!(client.closed().await);

    assert_eq!(server.ctx.store.file_count(), 0);
    assert!(!server.ctx.storage.path_for(&client.id, "a.bin")?.exists());

    server.stop().await
}

/// A key exchange on a new connection rotates the key; uploads use the new one.
#[tokio::test]
async fn test_reconnect_uses_fresh_key() -> Result<()> {
    let server = TestServer::start(SessionSettings::default()).await?;
    let first = Client::ready(server.addr, "dave").await?;
    let old_key = first.key.context("no key")?;
    drop(first.stream);

    let mut second = server.connect().await?;
    second.id = first.id;
    second.name = first.name.clone();
    let new_key = second.exchange_key().await?;
    assert_ne!(old_key, new_key);

    let (_, checksum) = second.upload("b.bin", &[1u8; 64]).await?;
    assert_eq!(checksum, ChecksumKind::Cksum.compute(&[1u8; 64]));

    server.stop().await
}

#[tokio::test]
async fn test_path_traversal_is_refused() -> Result<()> {
    let server = TestServer::start(SessionSettings::default()).await?;
    let mut client = Client::ready(server.addr, "eve").await?;

    client.send_file("../../outside", &[0u8; 32]).await?;
    assert!(client.closed().await, "server should drop the connection");

    assert!(!server.root.join("outside").exists());
    assert!(!server.ctx.storage.client_dir(&client.id).exists());
    assert_eq!(server.ctx.store.file_count(), 0);

    server.stop().await
}

#[tokio::test]
async fn test_pkcs7_upload() -> Result<()> {
    let settings = SessionSettings {
        upload_padding: UploadPadding::Pkcs7,
        ..SessionSettings::default()
    };
    let server = TestServer::start(settings).await?;
    let mut client = Client::ready(server.addr, "frank").await?;

    let plaintext = b"a short message that is not block aligned".to_vec();
    let pad = 16 - plaintext.len() % 16;
    let mut padded = plaintext.clone();
    padded.extend(std::iter::repeat(pad as u8).take(pad));

    let (content_size, checksum) = client.upload("msg.txt", &padded).await?;
    assert_eq!(content_size as usize, padded.len());
    assert_eq!(checksum, ChecksumKind::Cksum.compute(&plaintext));
    assert_eq!(
        std::fs::read(server.ctx.storage.path_for(&client.id, "msg.txt")?)?,
        plaintext
    );

    server.stop().await
}

/// The longest name the wire format carries is stored like any other.
#[tokio::test]
async fn test_longest_file_name_upload() -> Result<()> {
    let server = TestServer::start(SessionSettings::default()).await?;
    let mut client = Client::ready(server.addr, "grace").await?;
    let name = "L".repeat(254);

    client.upload(&name, &[7u8; 64]).await?;
    client.confirm(Request::ValidCrc, &name).await?;
    assert_eq!(client.response().await?, Response::MessageReceived);
    assert_eq!(
        std::fs::read(server.ctx.storage.path_for(&client.id, &name)?)?,
        vec![7u8; 64]
    );

    server.stop().await
}

/// Uploading `a.bin` must not disturb a stored, verified `a.bin.part`.
#[tokio::test]
async fn test_upload_leaves_similarly_named_file_alone() -> Result<()> {
    let server = TestServer::start(SessionSettings::default()).await?;
    let mut first = Client::ready(server.addr, "heidi").await?;
    first.upload("a.bin.part", &[1u8; 32]).await?;
    first.confirm(Request::ValidCrc, "a.bin.part").await?;
    assert_eq!(first.response().await?, Response::MessageReceived);

    let mut second = server.connect().await?;
    second.id = first.id;
    second.name = first.name.clone();
    second.exchange_key().await?;
    second.upload("a.bin", &[2u8; 32]).await?;

    let stored = server.ctx.storage.path_for(&first.id, "a.bin.part")?;
    assert_eq!(std::fs::read(&stored)?, vec![1u8; 32]);
    let record = server
        .ctx
        .store
        .file(&first.id, "a.bin.part")
        .context("record missing")?;
    assert!(record.verified);

    server.stop().await
}
