//! Client for an onionbox server.
//!
//! ```no_run
//! # async fn demo() -> Result<(), onionbox_client::ClientError> {
//! use onionbox_client::ClientBuilder;
//!
//! let client = ClientBuilder::new("abcdef.onion").tor().build()?;
//! client.connect().await?;
//! client.mkdir("docs").await?;
//! client.cd("docs").await?;
//! client.upload_bytes("hello.txt", b"hi".to_vec()).await?;
//! println!("{}", client.list().await?);
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{multipart, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use url::Url;

/// Cookie the server binds sessions to.
pub const SESSION_COOKIE: &str = "session_id";

/// Local Tor SOCKS proxy; `socks5h` resolves `.onion` names through Tor.
pub const TOR_PROXY: &str = "socks5h://127.0.0.1:9050";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// One entry of a JSON directory listing.
#[derive(Debug, Clone, Deserialize)]
pub struct Entry {
    pub name: String,
    pub kind: String,
    pub size: u64,
    pub mode: u32,
    pub modified: i64,
}

#[derive(Debug, Deserialize)]
struct Listing {
    entries: Vec<Entry>,
}

pub struct ClientBuilder {
    url: String,
    proxy: Option<String>,
    timeout: Option<Duration>,
}

impl ClientBuilder {
    /// `url` may be a bare host such as `abcdef.onion:8080`; `http://` is
    /// assumed when no scheme is given.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            proxy: None,
            timeout: None,
        }
    }

    /// Routes every request through `proxy` (http, https, socks5 or socks5h).
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Routes requests through the local Tor daemon.
    pub fn tor(self) -> Self {
        self.proxy(TOR_PROXY)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<Client> {
        let base = normalize_url(&self.url)?;
        let mut builder = reqwest::Client::builder();
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Client {
            http: builder.build()?,
            base,
            session_id: Mutex::new(None),
        })
    }
}

fn normalize_url(raw: &str) -> Result<Url> {
    // A trailing slash keeps any path prefix when endpoints are joined on.
    let raw = raw.trim().trim_end_matches('/');
    if raw.contains("://") {
        Ok(Url::parse(&format!("{raw}/"))?)
    } else {
        Ok(Url::parse(&format!("http://{raw}/"))?)
    }
}

/// Pulls the session token out of a `Set-Cookie` header value.
fn session_from_set_cookie(value: &str) -> Option<&str> {
    let pair = value.split(';').next()?.trim();
    let (name, token) = pair.split_once('=')?;
    (name.trim() == SESSION_COOKIE && !token.is_empty()).then_some(token.trim())
}

/// A connection to one onionbox server. Remembers the session the server
/// assigns and presents it on every request.
pub struct Client {
    http: reqwest::Client,
    base: Url,
    session_id: Mutex<Option<String>>,
}

impl Client {
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// The session token currently held, if the server has issued one.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|s| (*s).clone())
    }

    /// Opens a session by fetching the listing of the root.
    pub async fn connect(&self) -> Result<()> {
        self.list().await.map(|_| ())
    }

    /// Text listing of the current directory.
    pub async fn list(&self) -> Result<String> {
        let response = self.send(self.request(Method::GET, "files")?).await?;
        Ok(response.text().await?)
    }

    /// Structured listing of the current directory.
    pub async fn list_entries(&self) -> Result<Vec<Entry>> {
        let request = self
            .request(Method::GET, "files")?
            .query(&[("format", "json")]);
        let listing: Listing = self.send(request).await?.json().await?;
        Ok(listing.entries)
    }

    /// Uploads a local file under its own file name. Returns the server's
    /// count of bytes written.
    pub async fn upload_file(&self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a file path"))?;
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        let part = multipart::Part::stream_with_length(reqwest::Body::from(file), len)
            .file_name(name);
        self.upload_part(part).await
    }

    /// Uploads `data` as a file called `name`.
    pub async fn upload_bytes(&self, name: &str, data: impl Into<Vec<u8>>) -> Result<u64> {
        let part = multipart::Part::bytes(data.into()).file_name(name.to_string());
        self.upload_part(part).await
    }

    async fn upload_part(&self, part: multipart::Part) -> Result<u64> {
        let form = multipart::Form::new().part("file", part);
        let response = self
            .send(self.request(Method::POST, "upload")?.multipart(form))
            .await?;
        Ok(response
            .headers()
            .get("x-bytes-written")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Downloads `name` from the current directory into memory.
    pub async fn download(&self, name: &str) -> Result<Bytes> {
        let request = self
            .request(Method::GET, "download")?
            .query(&[("file", name)]);
        Ok(self.send(request).await?.bytes().await?)
    }

    /// Streams `name` into the local file `dest`. Returns bytes written.
    pub async fn download_to(&self, name: &str, dest: impl AsRef<Path>) -> Result<u64> {
        let request = self
            .request(Method::GET, "download")?
            .query(&[("file", name)]);
        let response = self.send(request).await?;

        let mut file = tokio::fs::File::create(dest.as_ref()).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    /// Fetches `name` as text.
    pub async fn cat(&self, name: &str) -> Result<String> {
        let request = self.request(Method::GET, "cat")?.query(&[("file", name)]);
        Ok(self.send(request).await?.text().await?)
    }

    pub async fn delete(&self, name: &str) -> Result<String> {
        let request = self
            .request(Method::DELETE, "delete")?
            .query(&[("file", name)]);
        Ok(self.send(request).await?.text().await?)
    }

    /// Changes the session's directory: a child name, `..`, or `root`.
    pub async fn cd(&self, dir: &str) -> Result<String> {
        let request = self.request(Method::GET, "cd")?.query(&[("dir", dir)]);
        Ok(self.send(request).await?.text().await?)
    }

    pub async fn mkdir(&self, dir: &str) -> Result<String> {
        let request = self.request(Method::GET, "mkdir")?.query(&[("dir", dir)]);
        Ok(self.send(request).await?.text().await?)
    }

    /// Ends the session on the server and forgets the local token.
    pub async fn quit(&self) -> Result<()> {
        self.send(self.request(Method::GET, "quit")?).await?;
        if let Ok(mut session) = self.session_id.lock() {
            *session = None;
        }
        Ok(())
    }

    fn request(&self, method: Method, endpoint: &str) -> Result<RequestBuilder> {
        let url = self.base.join(endpoint)?;
        let mut request = self.http.request(method, url);
        if let Some(token) = self.session_id() {
            request = request.header(COOKIE, format!("{SESSION_COOKIE}={token}"));
        }
        Ok(request)
    }

    /// Sends `request`, records any new session cookie and turns non-200
    /// replies into [`ClientError::Server`].
    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;

        let issued = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(session_from_set_cookie)
            .map(str::to_owned);
        if let Some(token) = issued {
            if let Ok(mut session) = self.session_id.lock() {
                *session = Some(token);
            }
        }

        let status = response.status();
        if status != StatusCode::OK {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Server {
                status: status.as_u16(),
                message: message.trim().to_string(),
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_gets_http_scheme() {
        let url = normalize_url("abcdef.onion:8080").unwrap();
        assert_eq!(url.as_str(), "http://abcdef.onion:8080/");
        assert_eq!(url.join("files").unwrap().as_str(), "http://abcdef.onion:8080/files");
    }

    #[test]
    fn explicit_scheme_is_kept() {
        let url = normalize_url("https://box.example/").unwrap();
        assert_eq!(url.as_str(), "https://box.example/");
    }

    #[test]
    fn path_prefix_survives_joins() {
        let url = normalize_url("http://box.example/share").unwrap();
        assert_eq!(url.join("cd").unwrap().as_str(), "http://box.example/share/cd");
    }

    #[test]
    fn garbage_url_is_rejected() {
        assert!(matches!(
            normalize_url("http://exa mple.com"),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn session_cookie_is_extracted() {
        assert_eq!(
            session_from_set_cookie("session_id=abc123; HttpOnly; Path=/"),
            Some("abc123")
        );
        assert_eq!(session_from_set_cookie("other=1; Path=/"), None);
        assert_eq!(session_from_set_cookie("session_id=; Path=/"), None);
    }

    #[test]
    fn tor_sets_socks_proxy() {
        let builder = ClientBuilder::new("x.onion").tor();
        assert_eq!(builder.proxy.as_deref(), Some(TOR_PROXY));
        assert!(builder.build().is_ok());
    }

    #[test]
    fn fresh_client_has_no_session() {
        let client = ClientBuilder::new("127.0.0.1:8080").build().unwrap();
        assert!(client.session_id().is_none());
        assert_eq!(client.base_url().host_str(), Some("127.0.0.1"));
    }
}
