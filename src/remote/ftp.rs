//! FTP implementation of [`RemoteSource`] on top of `suppaftp`'s blocking
//! client. Every protocol round-trip runs on tokio's blocking pool so a slow
//! server never stalls the runtime.

use std::io::{Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};

use super::error::TransportError;
use super::{RemoteListing, RemoteSession, RemoteSource};

/// Connection parameters for the FTP server.
#[derive(Clone)]
pub struct FtpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for FtpSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FtpSource {
    settings: FtpSettings,
}

impl FtpSource {
    pub fn new(settings: FtpSettings) -> Self {
        Self { settings }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.settings.host, self.settings.port)
    }
}

#[async_trait]
impl RemoteSource for FtpSource {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, TransportError> {
        let settings = self.settings.clone();
        let addr = self.addr();
        let stream = tokio::task::spawn_blocking(move || open_stream(&settings, &addr)).await??;
        Ok(Box::new(FtpSession {
            stream: Some(stream),
        }))
    }

    fn describe(&self) -> String {
        format!("ftp://{}", self.addr())
    }
}

fn open_stream(settings: &FtpSettings, addr: &str) -> Result<FtpStream, TransportError> {
    let connect_err = |message: String| TransportError::Connect {
        addr: addr.to_string(),
        message,
    };

    let sock: SocketAddr = (settings.host.as_str(), settings.port)
        .to_socket_addrs()
        .map_err(|e| connect_err(e.to_string()))?
        .next()
        .ok_or_else(|| connect_err("host resolved to no addresses".to_string()))?;

    let mut stream =
        FtpStream::connect_timeout(sock, settings.timeout).map_err(|e| connect_err(e.to_string()))?;
    stream
        .get_ref()
        .set_read_timeout(Some(settings.timeout))
        .map_err(|e| connect_err(e.to_string()))?;

    stream
        .login(settings.user.as_str(), settings.password.as_str())
        .map_err(|e| TransportError::Login {
            user: settings.user.clone(),
            message: e.to_string(),
        })?;
    stream
        .transfer_type(FileType::Binary)
        .map_err(|e| connect_err(e.to_string()))?;

    tracing::debug!(addr, "FTP session opened");
    Ok(stream)
}

/// An open FTP control connection.
///
/// The stream is moved into each blocking task and handed back afterwards.
/// If a task panics or its future is dropped mid-flight the stream is gone
/// and the session reports [`TransportError::Closed`] from then on.
pub struct FtpSession {
    stream: Option<FtpStream>,
}

impl FtpSession {
    async fn run<T, F>(&mut self, op: F) -> Result<T, TransportError>
    where
        F: FnOnce(&mut FtpStream) -> Result<T, TransportError> + Send + 'static,
        T: Send + 'static,
    {
        let mut stream = self.stream.take().ok_or(TransportError::Closed)?;
        let (stream, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut stream);
            (stream, result)
        })
        .await?;
        self.stream = Some(stream);
        result
    }
}

#[async_trait]
impl RemoteSession for FtpSession {
    async fn list(&mut self, remote_dir: &str) -> Result<RemoteListing, TransportError> {
        let dir = remote_dir.to_string();
        let lines = self
            .run(move |ftp| {
                ftp.mlsd(Some(dir.as_str())).map_err(|e| TransportError::List {
                    path: dir.clone(),
                    message: e.to_string(),
                })
            })
            .await?;
        parse_mlsd_listing(&lines, true)
    }

    async fn fetch(&mut self, remote_path: &str) -> Result<Vec<u8>, TransportError> {
        let path = remote_path.to_string();
        self.run(move |ftp| {
            ftp.retr_as_buffer(&path)
                .map(|cursor| cursor.into_inner())
                .map_err(|e| TransportError::Transfer {
                    path: path.clone(),
                    message: e.to_string(),
                })
        })
        .await
    }

    async fn fetch_to(
        &mut self,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), TransportError> {
        let path = remote_path.to_string();
        let local: PathBuf = local_path.to_path_buf();
        let abandon = AbandonOnDrop::new();
        let abandoned = abandon.flag();
        self.run(move |ftp| {
            let write_err = |e: std::io::Error| TransportError::LocalWrite {
                path: local.display().to_string(),
                source: e,
            };
            if abandoned.load(Ordering::Relaxed) {
                return Err(TransportError::Closed);
            }
            let mut file = std::fs::File::create(&local).map_err(write_err)?;
            let copied = ftp.retr(&path, |reader| {
                copy_unless_abandoned(reader, &mut file, &abandoned).map_err(FtpError::ConnectionError)
            });
            if abandoned.load(Ordering::Relaxed) {
                drop(file);
                let _ = std::fs::remove_file(&local);
                return Err(TransportError::Closed);
            }
            copied.map_err(|e| TransportError::Transfer {
                path: path.clone(),
                message: e.to_string(),
            })?;
            file.flush().map_err(write_err)
        })
        .await
    }

    async fn close(&mut self) {
        let result = self.run(|ftp| ftp.quit().map_err(|_| TransportError::Closed)).await;
        if let Err(e) = result {
            tracing::debug!(error = %e, "FTP QUIT failed");
        }
        self.stream = None;
    }
}

/// Raises its flag when dropped, telling a blocking transfer that nobody
/// awaits it any more.
struct AbandonOnDrop(Arc<AtomicBool>);

impl AbandonOnDrop {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Copy `reader` into `out`, giving up between chunks once `abandoned` is set.
fn copy_unless_abandoned(
    reader: &mut dyn Read,
    out: &mut impl Write,
    abandoned: &AtomicBool,
) -> std::io::Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        if abandoned.load(Ordering::Relaxed) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "transfer abandoned",
            ));
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        out.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Parse MLSD lines into a listing.
///
/// Each line is `fact=value;fact=value; name` (RFC 3659). Only `type` and
/// `modify` are consulted. Entries of type `cdir`/`pdir` are always dropped;
/// `dir` entries are dropped when `skip_dirs` is set.
pub(crate) fn parse_mlsd_listing(
    lines: &[String],
    skip_dirs: bool,
) -> Result<RemoteListing, TransportError> {
    let mut listing = RemoteListing::new();
    for line in lines {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }
        if let Some((name, ts)) = parse_mlsd_line(line, skip_dirs)? {
            listing.insert(name, ts);
        }
    }
    Ok(listing)
}

fn parse_mlsd_line(line: &str, skip_dirs: bool) -> Result<Option<(String, String)>, TransportError> {
    let parse_err = |reason: &str| TransportError::Parse {
        line: line.to_string(),
        reason: reason.to_string(),
    };

    let (facts, name) = line
        .split_once(' ')
        .ok_or_else(|| parse_err("missing fact/name separator"))?;
    if name.is_empty() {
        return Err(parse_err("empty name"));
    }

    let mut kind = None;
    let mut modify = None;
    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let Some((key, value)) = fact.split_once('=') else {
            continue;
        };
        match key.to_ascii_lowercase().as_str() {
            "type" => kind = Some(value.to_ascii_lowercase()),
            "modify" => modify = Some(value),
            _ => {}
        }
    }

    let kind = kind.ok_or_else(|| parse_err("no type fact"))?;
    match kind.as_str() {
        "cdir" | "pdir" => return Ok(None),
        "file" => {}
        _ if skip_dirs => return Ok(None),
        _ => {}
    }

    let modify = modify.ok_or_else(|| parse_err("no modify fact"))?;
    let ts = normalize_timestamp(modify).ok_or_else(|| parse_err("bad modify timestamp"))?;
    Ok(Some((name.to_string(), ts)))
}

/// Truncate fractional seconds and check the result is a real date.
fn normalize_timestamp(raw: &str) -> Option<String> {
    let ts = raw.get(..14)?;
    NaiveDateTime::parse_from_str(ts, "%Y%m%d%H%M%S").ok()?;
    Some(ts.to_string())
}
