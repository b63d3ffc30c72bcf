//! Cask integration test harness.
//!
//! Every test starts its own server on 127.0.0.1:0 with a fresh storage
//! area and an on-disk record store under the system temp directory, and
//! talks to it over real TCP with the small protocol client below.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncryptMut, KeyIvInit};
use anyhow::{bail, Context, Result};
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::{Oaep, RsaPrivateKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use cask_core::wire::{
    pad_to_frames, ClientId, CrcRequest, PublicKeyField, Request, Response, PACKET_SIZE,
};
use cask_services::{server, FileStorage, RecordStore, SessionContext, SessionSettings};

mod concurrency;
mod uploads;

// ── Server ────────────────────────────────────────────────────────────────────

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// A running server and the state it was started with.
pub struct TestServer {
    pub addr: SocketAddr,
    pub ctx: SessionContext,
    pub root: PathBuf,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl TestServer {
    pub async fn start(settings: SessionSettings) -> Result<Self> {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!("cask-it-{}-{}", std::process::id(), n));
        let _ = std::fs::remove_dir_all(&root);

        let ctx = SessionContext {
            store: RecordStore::open(&root.join("cask.db"))?,
            storage: FileStorage::new(root.join("files"))?,
            settings,
        };
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown, rx) = broadcast::channel(1);
        let task = tokio::spawn(server::serve(listener, ctx.clone(), rx));

        Ok(Self {
            addr,
            ctx,
            root,
            shutdown,
            task,
        })
    }

    pub async fn connect(&self) -> Result<Client> {
        Client::connect(self.addr).await
    }

    /// Stop accepting and remove the temp directory.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task.await.context("server task panicked")??;
        let _ = std::fs::remove_dir_all(&self.root);
        Ok(())
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

pub fn rsa_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("rsa keygen"))
}

pub fn public_key_field() -> PublicKeyField {
    let der = rsa_key()
        .to_public_key()
        .to_pkcs1_der()
        .expect("pkcs1 encode");
    let mut field = [0u8; 160];
    field[..der.as_bytes().len()].copy_from_slice(der.as_bytes());
    field
}

pub fn encrypt(key: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    let mut enc = cbc::Encryptor::<aes::Aes128>::new(
        GenericArray::from_slice(key),
        &GenericArray::default(),
    );
    let mut out = plaintext.to_vec();
    for block in out.chunks_exact_mut(16) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
    out
}

/// A protocol client, the way a real uploader drives the server.
pub struct Client {
    pub stream: TcpStream,
    pub id: ClientId,
    pub name: String,
    pub key: Option<[u8; 16]>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        Ok(Self {
            stream,
            id: [0u8; 16],
            name: String::new(),
            key: None,
        })
    }

    pub async fn send(&mut self, request: &Request, trailing: &[u8]) -> Result<()> {
        let mut bytes = request.encode(&self.id, 3)?;
        bytes.extend_from_slice(trailing);
        self.stream.write_all(&pad_to_frames(&bytes)).await?;
        Ok(())
    }

    pub async fn response(&mut self) -> Result<Response> {
        let mut frame = [0u8; PACKET_SIZE];
        tokio::time::timeout(Duration::from_secs(10), self.stream.read_exact(&mut frame))
            .await
            .context("timed out waiting for a response")??;
        Ok(Response::decode(&frame)?)
    }

    /// True once the server has closed the connection.
    pub async fn closed(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(
            tokio::time::timeout(Duration::from_secs(10), self.stream.read(&mut byte)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    pub async fn register(&mut self, name: &str) -> Result<ClientId> {
        self.send(&Request::Registration { name: name.into() }, &[])
            .await?;
        match self.response().await? {
            Response::RegistrationSuccess { client_id } => {
                self.id = client_id;
                self.name = name.into();
                Ok(client_id)
            }
            other => bail!("registration of {name} failed: {other:?}"),
        }
    }

    pub async fn exchange_key(&mut self) -> Result<[u8; 16]> {
        let request = Request::PublicKey {
            name: self.name.clone(),
            public_key: public_key_field(),
        };
        self.send(&request, &[]).await?;
        match self.response().await? {
            Response::AesKey {
                client_id,
                wrapped_key,
            } => {
                if client_id != self.id {
                    bail!("AESKey for another client");
                }
                let raw = rsa_key().decrypt(Oaep::new::<sha1::Sha1>(), &wrapped_key)?;
                let key: [u8; 16] = raw
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("unwrapped key is not 16 bytes"))?;
                self.key = Some(key);
                Ok(key)
            }
            other => bail!("key exchange failed: {other:?}"),
        }
    }

    /// Register and exchange keys.
    pub async fn ready(addr: SocketAddr, name: &str) -> Result<Self> {
        let mut client = Client::connect(addr).await?;
        client.register(name).await?;
        client.exchange_key().await?;
        Ok(client)
    }

    /// Encrypt and send a file. Does not wait for the response.
    pub async fn send_file(&mut self, file_name: &str, plaintext: &[u8]) -> Result<()> {
        let key = self.key.context("no session key")?;
        let ciphertext = encrypt(&key, plaintext);
        let request = Request::SendFile {
            client_id: self.id,
            content_size: ciphertext.len() as u32,
            file_name: file_name.into(),
        };
        self.send(&request, &ciphertext).await
    }

    /// Send a file and return the server's (content size, checksum).
    pub async fn upload(&mut self, file_name: &str, plaintext: &[u8]) -> Result<(u32, u32)> {
        self.send_file(file_name, plaintext).await?;
        match self.response().await? {
            Response::FileReceived {
                content_size,
                checksum,
                file_name: echoed,
                ..
            } => {
                if echoed != file_name {
                    bail!("FileReceived for {echoed}, expected {file_name}");
                }
                Ok((content_size, checksum))
            }
            other => bail!("upload of {file_name} failed: {other:?}"),
        }
    }

    pub async fn confirm(&mut self, kind: fn(CrcRequest) -> Request, file_name: &str) -> Result<()> {
        let crc = CrcRequest {
            client_id: self.id,
            file_name: file_name.into(),
        };
        self.send(&kind(crc), &[]).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_registration_over_tcp() -> Result<()> {
    let server = TestServer::start(SessionSettings::default()).await?;

    let mut a = server.connect().await?;
    let mut b = server.connect().await?;
    let id_a = a.register("alice").await?;
    let id_b = b.register("bob").await?;
    assert_ne!(id_a, id_b);

    // Name uniqueness holds across connections.
    let mut c = server.connect().await?;
    c.send(&Request::Registration { name: "alice".into() }, &[])
        .await?;
    assert_eq!(c.response().await?, Response::RegistrationFailed);

    server.stop().await
}

#[tokio::test]
async fn test_records_persist_across_restart() -> Result<()> {
    let server = TestServer::start(SessionSettings::default()).await?;
    let db = server.root.join("cask.db");

    let mut client = Client::ready(server.addr, "alice").await?;
    client.upload("notes.txt", &[5u8; 256]).await?;
    client.confirm(Request::ValidCrc, "notes.txt").await?;
    assert_eq!(client.response().await?, Response::MessageReceived);
    let id = client.id;

    let _ = server.shutdown.send(());
    server.task.await??;

    let reopened = RecordStore::open(&db)?;
    let alice = reopened.client_by_name("alice").context("alice not reloaded")?;
    assert_eq!(alice.id, id);
    assert!(alice.session_key.is_some());
    assert!(reopened.file(&id, "notes.txt").context("file not reloaded")?.verified);

    let _ = std::fs::remove_dir_all(&server.root);
    Ok(())
}
