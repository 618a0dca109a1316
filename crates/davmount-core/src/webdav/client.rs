//! reqwest-backed implementation of the transport seam.

use std::fs::File;

use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::{Method, StatusCode, Url};

use super::{DavTransport, Depth, GetOutcome, ListingVisitor, MoveOutcome, PropfindOutcome};
use crate::errors::{DavError, DavResult};
use crate::store::stat_cache::StatEntry;
use crate::util::unix_time;

const PROPFIND_BODY: &str = concat!(
    r#"<?xml version="1.0" encoding="utf-8"?>"#,
    r#"<D:propfind xmlns:D="DAV:"><D:allprop/></D:propfind>"#
);

#[derive(Debug, Clone, Default)]
pub struct DavConfig {
    pub uri: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_certificate: Option<std::path::PathBuf>,
    pub client_certificate: Option<std::path::PathBuf>,
}

pub struct DavClient {
    http: Client,
    /// scheme://host[:port], no path.
    host: String,
    /// Path component of the mount URI, trailing slash stripped; `/` when
    /// the collection is at the server root.
    base_directory: String,
    username: Option<String>,
    password: Option<String>,
}

impl DavClient {
    pub fn new(config: &DavConfig) -> DavResult<Self> {
        let url = Url::parse(&config.uri)
            .map_err(|err| DavError::io(format!("bad uri {}: {err}", config.uri)))?;

        let mut builder = Client::builder();
        if let Some(ca) = &config.ca_certificate {
            let pem = std::fs::read(ca)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|err| DavError::io(format!("ca certificate: {err}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(client_cert) = &config.client_certificate {
            let pem = std::fs::read(client_cert)?;
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|err| DavError::io(format!("client certificate: {err}")))?;
            builder = builder.identity(identity);
        }
        let http = builder
            .build()
            .map_err(|err| DavError::io(format!("http client: {err}")))?;

        let mut host = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
        if let Some(port) = url.port() {
            host.push_str(&format!(":{port}"));
        }
        let mut base_directory = url.path().to_string();
        if base_directory.len() > 1 && base_directory.ends_with('/') {
            base_directory.pop();
        }
        if base_directory.is_empty() {
            base_directory.push('/');
        }

        Ok(Self {
            http,
            host,
            base_directory,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// The directory every kernel path is resolved under.
    pub fn base_directory(&self) -> &str {
        &self.base_directory
    }

    fn request(&self, method: &str, url: &str) -> DavResult<RequestBuilder> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|err| DavError::io(format!("method {method}: {err}")))?;
        let mut request = self.http.request(method, url);
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.as_deref());
        }
        Ok(request)
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.host, path)
    }
}

impl DavTransport for DavClient {
    fn propfind(
        &self,
        path: &str,
        depth: Depth,
        changes_since: Option<u64>,
        visit: ListingVisitor,
    ) -> DavResult<PropfindOutcome> {
        let mut url = self.url_for(path);
        if let Some(since) = changes_since {
            url.push_str(&format!("?changes_since={since}"));
        }

        let response = self
            .request("PROPFIND", &url)?
            .header("Depth", match depth {
                Depth::Zero => "0",
                Depth::One => "1",
            })
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .map_err(|err| DavError::io(format!("PROPFIND {path}: {err}")))?;

        let status = response.status();
        if status == StatusCode::PRECONDITION_FAILED && changes_since.is_some() {
            return Ok(PropfindOutcome::StaleWindow);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(DavError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(DavError::io(format!("PROPFIND {path} returned {status}")));
        }

        let body = response
            .text()
            .map_err(|err| DavError::io(format!("PROPFIND {path}: {err}")))?;
        parse_multistatus(&body, &mut |href, st, status| {
            visit(&href_to_path(href), st, status);
        })?;
        Ok(PropfindOutcome::Complete)
    }

    fn get_if_none_match(&self, path: &str, etag: Option<&str>) -> DavResult<GetOutcome> {
        let mut request = self.request("GET", &self.url_for(path))?;
        if let Some(tag) = etag {
            request = request.header("If-None-Match", tag);
        }
        let response = request
            .send()
            .map_err(|err| DavError::io(format!("GET {path}: {err}")))?;

        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(GetOutcome::NotModified),
            StatusCode::OK => {
                let etag = header_string(&response, "etag");
                Ok(GetOutcome::Modified {
                    body: Box::new(response),
                    etag,
                })
            }
            StatusCode::NOT_FOUND => Err(DavError::NotFound(path.to_string())),
            status => Err(DavError::io(format!("GET {path} returned {status}"))),
        }
    }

    fn put(&self, path: &str, body: File, len: u64) -> DavResult<String> {
        let response = self
            .request("PUT", &self.url_for(path))?
            .header("Content-Length", len)
            .body(reqwest::blocking::Body::sized(body, len))
            .send()
            .map_err(|err| DavError::io(format!("PUT {path}: {err}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(DavError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(DavError::io(format!("PUT {path} returned {status}")));
        }
        Ok(header_string(&response, "etag"))
    }

    fn mkcol(&self, path: &str) -> DavResult<()> {
        let response = self
            .request("MKCOL", &self.url_for(path))?
            .send()
            .map_err(|err| DavError::io(format!("MKCOL {path}: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DavError::io(format!("MKCOL {path} returned {status}")));
        }
        Ok(())
    }

    fn mov(&self, from: &str, to: &str) -> DavResult<MoveOutcome> {
        let response = self
            .request("MOVE", &self.url_for(from))?
            .header("Destination", self.url_for(to))
            .send()
            .map_err(|err| DavError::io(format!("MOVE {from}: {err}")))?;
        match response.status().as_u16() {
            404 | 500 => Ok(MoveOutcome::ServerLostSource),
            _ if response.status().is_success() => Ok(MoveOutcome::Moved),
            status => Err(DavError::io(format!("MOVE {from} returned {status}"))),
        }
    }

    fn delete(&self, path: &str) -> DavResult<()> {
        let response = self
            .request("DELETE", &self.url_for(path))?
            .send()
            .map_err(|err| DavError::io(format!("DELETE {path}: {err}")))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(DavError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(DavError::io(format!("DELETE {path} returned {status}")));
        }
        Ok(())
    }
}

fn header_string(response: &reqwest::blocking::Response, name: &str) -> String {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Strips scheme and host from a multistatus href and normalizes the
/// trailing slash; hrefs stay percent-escaped, which is the internal form.
fn href_to_path(href: &str) -> String {
    let mut path = match href.find("://") {
        Some(idx) => match href[idx + 3..].find('/') {
            Some(slash) => href[idx + 3 + slash..].to_string(),
            None => "/".to_string(),
        },
        None => href.to_string(),
    };
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Walks a 207 multistatus document, invoking `visit` once per
/// `<response>` with the href, a synthesized stat record, and the entry's
/// status code. Deleted children arrive as status 410.
fn parse_multistatus(
    xml: &str,
    visit: &mut dyn FnMut(&str, StatEntry, u16),
) -> DavResult<()> {
    let mut reader = Reader::from_reader(xml.as_bytes());
    let mut buf = Vec::new();

    let mut href = String::new();
    let mut is_dir = false;
    let mut size: i64 = 0;
    let mut mtime: i64 = 0;
    let mut statuses: Vec<u16> = Vec::new();
    let mut capture: Option<&'static str> = None;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|err| DavError::io(format!("multistatus parse: {err}")))?;
        match event {
            Event::Start(start) => match start.local_name().as_ref() {
                b"response" => {
                    href.clear();
                    is_dir = false;
                    size = 0;
                    mtime = 0;
                    statuses.clear();
                }
                b"href" => capture = Some("href"),
                b"getcontentlength" => capture = Some("length"),
                b"getlastmodified" => capture = Some("modified"),
                b"status" => capture = Some("status"),
                b"collection" => is_dir = true,
                _ => {}
            },
            Event::Empty(empty) => {
                if empty.local_name().as_ref() == b"collection" {
                    is_dir = true;
                }
            }
            Event::Text(text) => {
                let content = text
                    .unescape()
                    .map_err(|err| DavError::io(format!("multistatus parse: {err}")))?;
                let content = content.trim();
                match capture {
                    Some("href") => href = content.to_string(),
                    Some("length") => size = content.parse().unwrap_or(0),
                    Some("modified") => {
                        mtime = chrono::DateTime::parse_from_rfc2822(content)
                            .map(|t| t.timestamp())
                            .unwrap_or(0);
                    }
                    Some("status") => {
                        if let Some(code) = parse_status_line(content) {
                            statuses.push(code);
                        }
                    }
                    _ => {}
                }
            }
            Event::End(end) => {
                match end.local_name().as_ref() {
                    b"response" => {
                        if !href.is_empty() {
                            let status = if statuses.iter().any(|s| (200..300).contains(s)) {
                                200
                            } else {
                                statuses.last().copied().unwrap_or(200)
                            };
                            visit(&href, build_stat(is_dir, size, mtime), status);
                        }
                    }
                    b"href" | b"getcontentlength" | b"getlastmodified" | b"status" => {
                        capture = None;
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

/// "HTTP/1.1 200 OK" -> 200
fn parse_status_line(line: &str) -> Option<u16> {
    line.split_whitespace().nth(1)?.parse().ok()
}

fn build_stat(is_dir: bool, size: i64, mtime: i64) -> StatEntry {
    let time = if mtime > 0 { mtime } else { unix_time() as i64 };
    let (mode, nlink, size) = if is_dir {
        (libc::S_IFDIR | 0o770, 3, 4096)
    } else {
        (libc::S_IFREG | 0o660, 1, size)
    };
    StatEntry {
        mode,
        nlink,
        size,
        atime: time,
        mtime: time,
        ctime: time,
        blksize: 4096,
        blocks: (size + 511) / 512,
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>http://example.com/dav/dir/</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype><D:collection/></D:resourcetype>
        <D:getlastmodified>Fri, 12 Jun 2020 10:00:00 GMT</D:getlastmodified>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/dav/dir/file.txt</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype/>
        <D:getcontentlength>1234</D:getcontentlength>
        <D:getlastmodified>Fri, 12 Jun 2020 11:30:00 GMT</D:getlastmodified>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/dav/dir/removed.txt</D:href>
    <D:status>HTTP/1.1 410 Gone</D:status>
  </D:response>
</D:multistatus>"#;

    #[test]
    fn parses_directories_files_and_removals() {
        let mut seen = Vec::new();
        parse_multistatus(SAMPLE, &mut |href, st, status| {
            seen.push((href.to_string(), st, status));
        })
        .unwrap();

        assert_eq!(seen.len(), 3);

        let (href, dir, status) = &seen[0];
        assert_eq!(href, "http://example.com/dav/dir/");
        assert!(dir.is_dir());
        assert_eq!(dir.size, 4096);
        assert_eq!(*status, 200);

        let (_, file, status) = &seen[1];
        assert!(file.is_reg());
        assert_eq!(file.size, 1234);
        assert!(file.mtime > 0);
        assert_eq!(*status, 200);

        let (href, _, status) = &seen[2];
        assert_eq!(href, "/dav/dir/removed.txt");
        assert_eq!(*status, 410);
    }

    #[test]
    fn href_normalization() {
        assert_eq!(href_to_path("http://h:8080/dav/dir/"), "/dav/dir");
        assert_eq!(href_to_path("/dav/file.txt"), "/dav/file.txt");
        assert_eq!(href_to_path("https://h/"), "/");
        assert_eq!(href_to_path("/with%20space"), "/with%20space");
    }

    #[test]
    fn status_line_parsing() {
        assert_eq!(parse_status_line("HTTP/1.1 404 Not Found"), Some(404));
        assert_eq!(parse_status_line("garbage"), None);
    }

    #[test]
    fn base_directory_from_uri() {
        let client = DavClient::new(&DavConfig {
            uri: "http://example.com/files/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(client.base_directory(), "/files");
        assert_eq!(client.url_for("/files/a.txt"), "http://example.com/files/a.txt");

        let root = DavClient::new(&DavConfig {
            uri: "https://example.com".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(root.base_directory(), "/");
    }
}
