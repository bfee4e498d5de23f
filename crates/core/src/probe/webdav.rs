use std::future::Future;
use std::pin::Pin;

use crate::account::{Protocol, ProtocolExtra, RemoteAccount};
use crate::probe::{RemoteClient, RemoteEntry};
use crate::{Error, Result};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<propfind xmlns="DAV:"><prop><resourcetype/></prop></propfind>"#;

/// Native WebDAV session: `OPTIONS` to authenticate, `PROPFIND` depth 1 to
/// list. Share discovery is an SMB concept and is not supported here.
pub struct WebDavClient {
    base: String,
    user: String,
    pass: String,
    client: reqwest::Client,
}

impl WebDavClient {
    pub fn new(account: &RemoteAccount) -> Result<Self> {
        let ProtocolExtra::WebDav { insecure } = &account.extra else {
            return Err(Error::Probe {
                message: format!("account {} is not a webdav account", account.name),
            });
        };

        let base = base_url(&account.host, account.port, *insecure);
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Probe {
                message: format!("webdav client init failed: {e}"),
            })?;

        Ok(Self {
            base,
            user: account.user.clone(),
            pass: account.pass.clone(),
            client,
        })
    }

    fn url_for(&self, path: &str) -> String {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            format!("{}/", self.base)
        } else {
            format!("{}/{}/", self.base, trimmed)
        }
    }
}

impl RemoteClient for WebDavClient {
    fn protocol(&self) -> Protocol {
        Protocol::WebDav
    }

    fn authenticate<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let res = self
                .client
                .request(reqwest::Method::OPTIONS, self.url_for("/"))
                .basic_auth(&self.user, Some(&self.pass))
                .send()
                .await
                .map_err(|e| Error::Probe {
                    message: format!("webdav request failed: {e}"),
                })?;

            let status = res.status();
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(Error::Probe {
                    message: "webdav authentication failed (http 401)".to_string(),
                });
            }
            if !status.is_success() {
                return Err(Error::Probe {
                    message: format!("webdav http {status}"),
                });
            }
            Ok(())
        })
    }

    fn list_shares<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>> {
        Box::pin(async move {
            Err(Error::Probe {
                message: "webdav does not expose shares".to_string(),
            })
        })
    }

    fn list_dir<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RemoteEntry>>> + Send + 'a>> {
        Box::pin(async move {
            let method =
                reqwest::Method::from_bytes(b"PROPFIND").map_err(|e| Error::Probe {
                    message: format!("webdav method: {e}"),
                })?;
            let url = self.url_for(path);
            let res = self
                .client
                .request(method, &url)
                .basic_auth(&self.user, Some(&self.pass))
                .header("Depth", "1")
                .header("Content-Type", "application/xml")
                .body(PROPFIND_BODY)
                .send()
                .await
                .map_err(|e| Error::Probe {
                    message: format!("webdav request failed: {e}"),
                })?;

            let status = res.status();
            let body = res.text().await.map_err(|e| Error::Probe {
                message: format!("webdav read response failed: {e}"),
            })?;
            if status.as_u16() != 207 && !status.is_success() {
                return Err(Error::Probe {
                    message: format!("webdav http {status}: {body}"),
                });
            }

            Ok(entries_from_multistatus(&body, path))
        })
    }
}

fn base_url(host: &str, port: Option<u16>, insecure: bool) -> String {
    if host.contains("://") {
        return host.trim_end_matches('/').to_string();
    }
    let scheme = if insecure { "http" } else { "https" };
    match port {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    }
}

/// Pulls `href` values out of a multistatus body without an XML parser;
/// collections are recognized by their trailing slash. The first response is
/// the listed collection itself and is dropped by path comparison.
fn entries_from_multistatus(body: &str, requested: &str) -> Vec<RemoteEntry> {
    let requested = requested.trim_matches('/');
    extract_hrefs(body)
        .into_iter()
        .filter_map(|href| {
            let is_dir = href.ends_with('/');
            let clean = href.trim_end_matches('/');
            let name = clean.rsplit('/').next().unwrap_or_default();
            if name.is_empty() {
                return None;
            }
            // Skip the collection entry for the requested path itself.
            if clean.trim_start_matches('/').ends_with(requested)
                && requested
                    .rsplit('/')
                    .next()
                    .is_some_and(|last| last == name)
            {
                return None;
            }
            Some(RemoteEntry {
                name: name.to_string(),
                is_dir,
            })
        })
        .collect()
}

fn extract_hrefs(body: &str) -> Vec<String> {
    let lower = body.to_ascii_lowercase();
    let mut out = Vec::new();
    let mut cursor = 0;

    while let Some(found) = lower[cursor..].find("href") {
        let tag_at = cursor + found;
        let Some(open) = lower[tag_at..].find('>') else {
            break;
        };
        let value_start = tag_at + open + 1;
        let Some(close) = lower[value_start..].find('<') else {
            break;
        };
        let value = body[value_start..value_start + close].trim();
        if !value.is_empty() {
            out.push(value.to_string());
        }
        cursor = value_start + close;
    }
    out
}
