// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! S3-compatible object-store backend over HTTP. Credentials and the
//! endpoint come from the `OBS_HOST` / `OBS_BUCKET` / `OBS_AK` / `OBS_SK`
//! environment (the host accepts `http[s]://` or a bare name). Requests are
//! signed with header-style HMAC-SHA1 auth; transient failures retry with
//! exponential backoff.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Result};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use base64::encode as b64encode;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::blocking::{Client, Response};
use reqwest::header::{AUTHORIZATION, RANGE};
use reqwest::Method;
use reqwest::StatusCode;
use sha1::Sha1;

use falcon_utils::stats::{FalconStats, StatItem};

use super::BlobBackend;
use crate::StatFsBuf;

const RETRY_NUM: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(200);
const COPY_SOURCE_HEADER: &str = "x-obs-copy-source";
const CHUNK: usize = 64 * 1024;

type HmacSha1 = Hmac<Sha1>;

pub struct ObsStorage {
    client: Client,
    scheme: &'static str,
    host: String,
    bucket: String,
    access_key: String,
    secret_key: String,
    stats: Arc<FalconStats>,
}

pub fn new(config: &HashMap<String, String>, stats: Arc<FalconStats>) -> Result<Arc<ObsStorage>> {
    let lookup = |key: &str, env: &str| -> Option<String> {
        config
            .get(key)
            .cloned()
            .or_else(|| std::env::var(env).ok())
    };
    let host = lookup("host", "OBS_HOST").ok_or_else(|| einval!("OBS_HOST is not set"))?;
    let bucket = lookup("bucket", "OBS_BUCKET").ok_or_else(|| einval!("OBS_BUCKET is not set"))?;
    let access_key = lookup("access_key", "OBS_AK").ok_or_else(|| einval!("OBS_AK is not set"))?;
    let secret_key = lookup("secret_key", "OBS_SK").ok_or_else(|| einval!("OBS_SK is not set"))?;

    let (scheme, host) = match host.split_once("://") {
        Some((scheme, rest)) => (
            if scheme == "https" { "https" } else { "http" },
            rest.to_string(),
        ),
        None => ("http", host),
    };

    let storage = Arc::new(ObsStorage {
        client: Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| eio!(format!("http client init failed: {}", e)))?,
        scheme,
        host,
        bucket,
        access_key,
        secret_key,
        stats,
    });
    storage.head_bucket()?;
    info!("obs backend ready, host = {}", storage.host);
    Ok(storage)
}

impl ObsStorage {
    fn url(&self, key: &str) -> String {
        format!("{}://{}/{}/{}", self.scheme, self.host, self.bucket, key)
    }

    fn sign(&self, method: &Method, key: &str, date: &str) -> String {
        let resource = format!("/{}/{}", self.bucket, key);
        let data = format!("{}\n\n\n{}\n{}", method.as_str(), date, resource);
        let mut mac = HmacSha1::new_from_slice(self.secret_key.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(data.as_bytes());
        let signature = b64encode(mac.finalize().into_bytes());
        format!("OBS {}:{}", self.access_key, signature)
    }

    fn request(
        &self,
        method: Method,
        key: &str,
        range: Option<(u64, u64)>,
        body: Option<Vec<u8>>,
        copy_source: Option<String>,
    ) -> Result<Response> {
        let mut attempt = 0;
        loop {
            let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
            let mut builder = self
                .client
                .request(method.clone(), self.url(key))
                .header("Date", date.clone())
                .header(AUTHORIZATION, self.sign(&method, key, &date));
            if let Some((start, len)) = range {
                builder = if len == 0 {
                    builder.header(RANGE, format!("bytes={}-", start))
                } else {
                    builder.header(RANGE, format!("bytes={}-{}", start, start + len - 1))
                };
            }
            if let Some(src) = &copy_source {
                builder = builder.header(COPY_SOURCE_HEADER, src.clone());
            }
            if let Some(body) = &body {
                builder = builder.body(body.clone());
            }

            let result = builder.send();
            let retryable = match &result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return result.map_err(|e| eio!(format!("obs request: {}", e)));
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(enoent!(format!("object {} not found", key)));
                    }
                    status.is_server_error() || status == StatusCode::FORBIDDEN
                }
                Err(e) => e.is_timeout() || e.is_connect(),
            };

            attempt += 1;
            if !retryable || attempt > RETRY_NUM {
                return match result {
                    Ok(resp) => Err(eio!(format!(
                        "obs {} on {} answered {}",
                        method, key, resp.status()
                    ))),
                    Err(e) => Err(eio!(format!("obs {} on {} failed: {}", method, key, e))),
                };
            }
            std::thread::sleep(RETRY_BASE * (1 << attempt));
        }
    }

    fn head_bucket(&self) -> Result<()> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let url = format!("{}://{}/{}", self.scheme, self.host, self.bucket);
        let resp = self
            .client
            .request(Method::HEAD, url)
            .header("Date", date.clone())
            .header(AUTHORIZATION, self.sign(&Method::HEAD, "", &date))
            .send()
            .map_err(|e| eio!(format!("obs head bucket failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(eio!(format!("obs bucket check answered {}", resp.status())));
        }
        Ok(())
    }
}

impl BlobBackend for ObsStorage {
    fn read_object(
        &self,
        key: &str,
        offset: u64,
        size: u64,
        fd: Option<RawFd>,
        mut buf: Option<&mut [u8]>,
    ) -> Result<usize> {
        let mut resp = self.request(Method::GET, key, Some((offset, size)), None, None)?;
        let mut chunk = vec![0u8; CHUNK];
        let mut total = 0usize;
        loop {
            let n = resp
                .read(&mut chunk)
                .map_err(|e| eio!(format!("obs body read: {}", e)))?;
            if n == 0 {
                break;
            }
            if let Some(out) = buf.as_deref_mut() {
                if total < out.len() {
                    let count = n.min(out.len() - total);
                    out[total..total + count].copy_from_slice(&chunk[..count]);
                }
            }
            if let Some(fd) = fd {
                let mut written = 0usize;
                while written < n {
                    let w = nix::sys::uio::pwrite(
                        fd,
                        &chunk[written..n],
                        (total + written) as libc::off_t,
                    )
                    .map_err(|e| eio!(format!("pwrite during download: {}", e)))?;
                    written += w;
                }
                self.stats.add(StatItem::BlockcacheWrite, n as u64);
            }
            total += n;
        }
        self.stats.add(StatItem::ObjGet, total as u64);
        Ok(total)
    }

    fn put_file(&self, key: &str, path: &std::path::Path) -> Result<()> {
        let mut file = File::open(path)?;
        let mut body = Vec::new();
        file.read_to_end(&mut body)?;
        self.stats.add(StatItem::ObjPut, body.len() as u64);
        self.request(Method::PUT, key, None, Some(body), None)
            .map(|_| ())
    }

    fn put_buffer(&self, key: &str, buf: &[u8], offset: u64) -> Result<()> {
        if offset != 0 {
            return Err(einval!("obs put_buffer supports only whole objects"));
        }
        self.stats.add(StatItem::ObjPut, buf.len() as u64);
        self.request(Method::PUT, key, None, Some(buf.to_vec()), None)
            .map(|_| ())
    }

    fn delete_object(&self, key: &str) -> Result<()> {
        self.request(Method::DELETE, key, None, None, None).map(|_| ())
    }

    fn copy_object(&self, src: &str, dst: &str) -> Result<()> {
        let source = format!("/{}/{}", self.bucket, src);
        self.request(Method::PUT, dst, None, None, Some(source))
            .map(|_| ())
    }

    fn stat_fs(&self) -> Result<StatFsBuf> {
        // The object tier reports no filesystem geometry; surface an
        // effectively unbounded capacity in 4 KiB units.
        let blocks = (1u64 << 42) / 4096;
        Ok(StatFsBuf {
            f_blocks: blocks,
            f_bfree: blocks,
            f_bavail: blocks,
            f_files: u64::MAX / 2,
            f_ffree: u64::MAX / 2,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_storage() -> ObsStorage {
        ObsStorage {
            client: Client::new(),
            scheme: "http",
            host: "obs.example.com".to_string(),
            bucket: "falcon".to_string(),
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            stats: FalconStats::new(),
        }
    }

    #[test]
    fn test_url_layout() {
        let storage = test_storage();
        assert_eq!(
            storage.url("a/b"),
            "http://obs.example.com/falcon/a/b"
        );
    }

    #[test]
    fn test_signature_is_deterministic() {
        let storage = test_storage();
        let date = "Mon, 01 Jan 2024 00:00:00 GMT";
        let a = storage.sign(&Method::GET, "a/b", date);
        let b = storage.sign(&Method::GET, "a/b", date);
        assert_eq!(a, b);
        assert!(a.starts_with("OBS ak:"));
        assert_ne!(a, storage.sign(&Method::PUT, "a/b", date));
    }

    #[test]
    fn test_put_buffer_rejects_offsets() {
        let storage = test_storage();
        let err = storage.put_buffer("k", b"x", 1).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }
}
