use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::read_until_double_crlf;

/// One request as the origin saw it. Header names are lowercased.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl SeenRequest {
    fn parse(head: &str) -> Option<Self> {
        let mut lines = head.split("\r\n");
        let mut start = lines.next()?.split_whitespace();
        let method = start.next()?.to_string();
        let target = start.next()?.to_string();
        let headers = lines
            .filter(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
            .collect();
        Some(Self {
            method,
            target,
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, value)| value.as_str())
    }
}

/// What the origin writes back before closing the connection.
#[derive(Debug, Clone)]
pub struct Reply {
    bytes: Vec<u8>,
}

impl Reply {
    /// A complete response with `Content-Length` filled in.
    pub fn new(status: &str, headers: &[(&str, String)], body: &[u8]) -> Self {
        let mut head = format!("HTTP/1.1 {status}\r\nContent-Length: {}\r\n", body.len());
        for (name, value) in headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("Connection: close\r\n\r\n");
        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(body);
        Self { bytes }
    }

    pub fn ok(headers: &[(&str, String)], body: &[u8]) -> Self {
        Self::new("200 OK", headers, body)
    }

    pub fn not_modified(headers: &[(&str, String)]) -> Self {
        let mut head = String::from("HTTP/1.1 304 Not Modified\r\n");
        for (name, value) in headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("Connection: close\r\n\r\n");
        Self {
            bytes: head.into_bytes(),
        }
    }

    /// Bytes sent verbatim, for responses that break their own framing.
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

type Script = dyn Fn(&SeenRequest, usize) -> Reply + Send + Sync;

/// TCP origin that answers each connection from a script and remembers
/// every request it received.
pub struct ScriptedOrigin {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    handle: JoinHandle<()>,
}

impl ScriptedOrigin {
    /// The script gets the request and its zero-based arrival index.
    pub async fn spawn<F>(script: F) -> Result<Self>
    where
        F: Fn(&SeenRequest, usize) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let script: Arc<Script> = Arc::new(script);
        let accept_seen = seen.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let seen = accept_seen.clone();
                let script = script.clone();
                tokio::spawn(async move {
                    let _ = answer(stream, seen, script).await;
                });
            }
        });
        Ok(Self { addr, seen, handle })
    }

    /// Same response for every request.
    pub async fn fixed(reply: Reply) -> Result<Self> {
        Self::spawn(move |_, _| reply.clone()).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }

    pub fn last_request(&self) -> Option<SeenRequest> {
        self.seen.lock().last().cloned()
    }
}

impl Drop for ScriptedOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn answer(
    mut stream: TcpStream,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    script: Arc<Script>,
) -> Result<()> {
    let head = read_until_double_crlf(&mut stream).await?;
    let Some(request) = SeenRequest::parse(&head) else {
        return Ok(());
    };
    // Unread request bytes would turn the close into a reset.
    if let Some(length) = request
        .header("content-length")
        .and_then(|value| value.parse::<usize>().ok())
    {
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await?;
    }
    let index = {
        let mut seen = seen.lock();
        seen.push(request.clone());
        seen.len() - 1
    };
    let reply = script(&request, index);
    stream.write_all(&reply.bytes).await?;
    stream.shutdown().await.ok();
    Ok(())
}
