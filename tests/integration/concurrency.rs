use crate::*;

/// A client that stops halfway through an upload must not hold up anyone
/// else: accepting and serving other connections carries on.
#[tokio::test]
async fn test_stalled_upload_does_not_block_others() -> Result<()> {
    let server = TestServer::start(SessionSettings::default()).await?;

    let mut stalled = Client::ready(server.addr, "slow").await?;
    let key = stalled.key.context("no key")?;
    let ciphertext = encrypt(&key, &[0u8; 1024]);
    // Declare far more than is sent, then go quiet with the socket open.
    let request = Request::SendFile {
        client_id: stalled.id,
        content_size: 1 << 20,
        file_name: "huge.bin".into(),
    };
    stalled.send(&request, &ciphertext).await?;

    let started = std::time::Instant::now();
    let mut other = Client::ready(server.addr, "fast").await?;
    let (size, _) = other.upload("small.bin", &[3u8; 128]).await?;
    assert_eq!(size, 128);
    other.confirm(Request::ValidCrc, "small.bin").await?;
    assert_eq!(other.response().await?, Response::MessageReceived);
    assert!(started.elapsed() < Duration::from_secs(5));

    // The stalled upload has not produced a record.
    assert!(server.ctx.store.file(&stalled.id, "huge.bin").is_none());

    server.stop().await
}

/// Many clients register and upload at once; every one gets its own id and
/// its own bytes back.
#[tokio::test]
async fn test_parallel_clients() -> Result<()> {
    let server = TestServer::start(SessionSettings::default()).await?;
    let addr = server.addr;

    let tasks: Vec<_> = (0..8u8)
        .map(|i| {
            tokio::spawn(async move {
                let mut client = Client::ready(addr, &format!("client{i}")).await?;
                let body = vec![i; 16 * (i as usize + 1)];
                client.upload("mine.bin", &body).await?;
                client.confirm(Request::ValidCrc, "mine.bin").await?;
                client.response().await?;
                Ok::<_, anyhow::Error>((client.id, body))
            })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        let (id, body) = task.await??;
        let path = server.ctx.storage.path_for(&id, "mine.bin")?;
        assert_eq!(std::fs::read(path)?, body);
        ids.push(id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    assert_eq!(server.ctx.store.client_count(), 8);

    server.stop().await
}

/// Concurrent registration of one name: exactly one connection wins.
#[tokio::test]
async fn test_concurrent_duplicate_registration() -> Result<()> {
    let server = TestServer::start(SessionSettings::default()).await?;
    let addr = server.addr;

    let tasks: Vec<_> = (0..6)
        .map(|_| {
            tokio::spawn(async move {
                let mut client = Client::connect(addr).await?;
                client
                    .send(&Request::Registration { name: "shared".into() }, &[])
                    .await?;
                client.response().await
            })
        })
        .collect();

    let mut wins = 0;
    for task in tasks {
        match task.await?? {
            Response::RegistrationSuccess { .. } => wins += 1,
            Response::RegistrationFailed => {}
            other => anyhow::bail!("unexpected response {other:?}"),
        }
    }
    assert_eq!(wins, 1);

    server.stop().await
}
