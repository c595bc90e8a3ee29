use std::fs;
use std::net::ToSocketAddrs;
use std::thread;
use std::time::{Duration, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{
    CONTENT_TYPE, ETAG, HeaderMap, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
    USER_AGENT,
};
use suppaftp::FtpStream;
use suppaftp::types::FileType;
use url::Url;

use crate::domain::{Credentials, Validators};
use crate::error::KiraError;

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub credentials: Option<Credentials>,
    pub validators: Validators,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub validators: Validators,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Unchanged,
    Payload(Payload),
}

pub trait SourceFetcher: Send + Sync {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome, KiraError>;
}

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub timeout: Duration,
    pub max_retries: usize,
    pub base_delay: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

const MAX_ERROR_BODY: usize = 200;
const FTP_PORT: u16 = 21;

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    options: FetchOptions,
}

impl HttpFetcher {
    pub fn new(options: FetchOptions) -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-br/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::FetchHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(options.timeout)
            .build()
            .map_err(|err| KiraError::FetchHttp(err.to_string()))?;
        Ok(Self { client, options })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, KiraError>
    where
        F: FnMut() -> RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            let delay = self.options.base_delay * (attempt as u32 + 1);
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < self.options.max_retries && is_retryable_status(status) {
                        tracing::debug!(status, attempt, "retrying source request");
                        thread::sleep(delay);
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < self.options.max_retries && is_retryable_error(&err) {
                        tracing::debug!(error = %err, attempt, "retrying source request");
                        thread::sleep(delay);
                        attempt += 1;
                        continue;
                    }
                    return Err(KiraError::FetchHttp(err.to_string()));
                }
            }
        }
    }
}

impl SourceFetcher for HttpFetcher {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome, KiraError> {
        let recorded = &request.validators;
        let response = self.send_with_retries(|| {
            let mut builder = self.client.get(&request.url);
            if let Some(credentials) = &request.credentials {
                builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
            }
            if let Some(etag) = &recorded.etag {
                builder = builder.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &recorded.last_modified {
                builder = builder.header(IF_MODIFIED_SINCE, last_modified);
            }
            builder
        })?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::Unchanged);
        }
        if !status.is_success() {
            let message = response
                .text()
                .map(|body| body.trim().chars().take(MAX_ERROR_BODY).collect::<String>())
                .unwrap_or_else(|_| "source request failed".to_string());
            return Err(KiraError::FetchStatus {
                status: status.as_u16(),
                message,
            });
        }

        let headers = response.headers();
        let validators = Validators {
            etag: header_string(headers, ETAG),
            last_modified: header_string(headers, LAST_MODIFIED),
            content_length: response.content_length(),
        };
        if same_resource(recorded, &validators) {
            tracing::debug!(url = %request.url, "server ignored validators, resource unchanged");
            return Ok(FetchOutcome::Unchanged);
        }
        let content_type = header_string(headers, CONTENT_TYPE);
        let last_modified = validators.last_modified.as_deref().and_then(parse_http_date);
        let bytes = response
            .bytes()
            .map_err(|err| KiraError::FetchHttp(err.to_string()))?
            .to_vec();
        Ok(FetchOutcome::Payload(Payload {
            bytes,
            content_type,
            last_modified,
            validators,
        }))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileFetcher;

impl SourceFetcher for FileFetcher {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome, KiraError> {
        let url = Url::parse(&request.url)
            .map_err(|err| KiraError::InvalidSourceUrl(err.to_string()))?;
        let path = url
            .to_file_path()
            .map_err(|_| KiraError::InvalidSourceUrl(request.url.clone()))?;
        let metadata = fs::metadata(&path)
            .map_err(|err| KiraError::FetchHttp(format!("{}: {err}", path.display())))?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .and_then(|since| DateTime::from_timestamp(since.as_secs() as i64, 0));
        let validators = Validators {
            etag: None,
            last_modified: modified.map(|time| time.to_rfc2822()),
            content_length: Some(metadata.len()),
        };
        if same_resource(&request.validators, &validators) {
            return Ok(FetchOutcome::Unchanged);
        }
        let bytes =
            fs::read(&path).map_err(|err| KiraError::FetchHttp(format!("{}: {err}", path.display())))?;
        Ok(FetchOutcome::Payload(Payload {
            bytes,
            content_type: None,
            last_modified: modified,
            validators,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FtpFetcher {
    options: FetchOptions,
}

impl FtpFetcher {
    pub fn new(options: FetchOptions) -> Self {
        Self { options }
    }

    fn connect(&self, url: &Url, credentials: Option<&Credentials>) -> Result<FtpStream, KiraError> {
        let host = url
            .host_str()
            .ok_or_else(|| KiraError::InvalidSourceUrl(url.to_string()))?;
        let addr = (host, url.port().unwrap_or(FTP_PORT))
            .to_socket_addrs()
            .map_err(|err| KiraError::FetchHttp(format!("{host}: {err}")))?
            .next()
            .ok_or_else(|| KiraError::FetchHttp(format!("{host}: no address")))?;
        let mut ftp = FtpStream::connect_timeout(addr, self.options.timeout)
            .map_err(|err| KiraError::FetchHttp(format!("ftp connect {host}: {err}")))?;
        ftp.get_ref()
            .set_read_timeout(Some(self.options.timeout))
            .map_err(|err| KiraError::FetchHttp(err.to_string()))?;
        let (user, password) = match credentials {
            Some(credentials) => (credentials.username.as_str(), credentials.password.as_str()),
            None => ("anonymous", "anonymous@"),
        };
        ftp.login(user, password)
            .map_err(|err| KiraError::FetchHttp(format!("ftp login {host}: {err}")))?;
        ftp.transfer_type(FileType::Binary)
            .map_err(|err| KiraError::FetchHttp(format!("ftp type: {err}")))?;
        Ok(ftp)
    }
}

impl SourceFetcher for FtpFetcher {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome, KiraError> {
        let url = Url::parse(&request.url)
            .map_err(|err| KiraError::InvalidSourceUrl(err.to_string()))?;
        let path = url.path().to_string();
        let mut ftp = self.connect(&url, request.credentials.as_ref())?;

        // Servers without MDTM or SIZE simply give no validator.
        let modified = ftp
            .mdtm(&path)
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive));
        let size = ftp.size(&path).ok().map(|size| size as u64);
        let validators = Validators {
            etag: None,
            last_modified: modified.map(|time| time.to_rfc2822()),
            content_length: size,
        };
        if same_resource(&request.validators, &validators) {
            let _ = ftp.quit();
            return Ok(FetchOutcome::Unchanged);
        }

        let bytes = ftp
            .retr_as_buffer(&path)
            .map_err(|err| KiraError::FetchHttp(format!("ftp retr {path}: {err}")))?
            .into_inner();
        let _ = ftp.quit();
        Ok(FetchOutcome::Payload(Payload {
            bytes,
            content_type: None,
            last_modified: modified,
            validators,
        }))
    }
}

pub struct TransportFetcher {
    http: HttpFetcher,
    ftp: FtpFetcher,
    file: FileFetcher,
}

impl TransportFetcher {
    pub fn new(options: FetchOptions) -> Result<Self, KiraError> {
        Ok(Self {
            http: HttpFetcher::new(options)?,
            ftp: FtpFetcher::new(options),
            file: FileFetcher,
        })
    }
}

impl SourceFetcher for TransportFetcher {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome, KiraError> {
        let url = Url::parse(&request.url)
            .map_err(|err| KiraError::InvalidSourceUrl(err.to_string()))?;
        match url.scheme() {
            "http" | "https" => self.http.fetch(request),
            "ftp" => self.ftp.fetch(request),
            "file" => self.file.fetch(request),
            other => Err(KiraError::UnsupportedScheme(other.to_string())),
        }
    }
}

fn same_resource(recorded: &Validators, current: &Validators) -> bool {
    if let (Some(old), Some(new)) = (&recorded.etag, &current.etag) {
        return old == new;
    }
    match (
        &recorded.last_modified,
        &current.last_modified,
        recorded.content_length,
        current.content_length,
    ) {
        (Some(old_date), Some(new_date), Some(old_len), Some(new_len)) => {
            old_date == new_date && old_len == new_len
        }
        _ => false,
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validators(etag: Option<&str>, date: Option<&str>, len: Option<u64>) -> Validators {
        Validators {
            etag: etag.map(str::to_string),
            last_modified: date.map(str::to_string),
            content_length: len,
        }
    }

    #[test]
    fn etag_decides_when_both_sides_have_one() {
        let old = validators(Some("\"a\""), Some("Mon, 01 Jan 2024 00:00:00 GMT"), Some(3));
        let same = validators(Some("\"a\""), Some("Tue, 02 Jan 2024 00:00:00 GMT"), Some(9));
        let other = validators(Some("\"b\""), Some("Mon, 01 Jan 2024 00:00:00 GMT"), Some(3));
        assert!(same_resource(&old, &same));
        assert!(!same_resource(&old, &other));
    }

    #[test]
    fn size_and_date_need_to_match_together() {
        let old = validators(None, Some("Mon, 01 Jan 2024 00:00:00 GMT"), Some(3));
        assert!(same_resource(
            &old,
            &validators(None, Some("Mon, 01 Jan 2024 00:00:00 GMT"), Some(3))
        ));
        assert!(!same_resource(
            &old,
            &validators(None, Some("Mon, 01 Jan 2024 00:00:00 GMT"), Some(4))
        ));
        assert!(!same_resource(&Validators::default(), &old));
    }

    #[test]
    fn http_dates_parse() {
        let date = parse_http_date("Tue, 15 Nov 1994 08:12:31 GMT").unwrap();
        assert_eq!(date.timestamp(), 784_887_151);
        assert!(parse_http_date("yesterday").is_none());
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn file_mirror_reports_unchanged_on_second_fetch() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("mirror.txt");
        fs::write(&path, b"content").unwrap();
        let url = Url::from_file_path(&path).unwrap().to_string();
        let first = FileFetcher
            .fetch(&FetchRequest {
                url: url.clone(),
                credentials: None,
                validators: Validators::default(),
            })
            .unwrap();
        let FetchOutcome::Payload(payload) = first else {
            panic!("expected payload");
        };
        assert_eq!(payload.bytes, b"content");
        let second = FileFetcher
            .fetch(&FetchRequest {
                url,
                credentials: None,
                validators: payload.validators,
            })
            .unwrap();
        assert_eq!(second, FetchOutcome::Unchanged);
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let fetcher = TransportFetcher::new(FetchOptions::default()).unwrap();
        let err = fetcher
            .fetch(&FetchRequest {
                url: "gopher://gopher.example.org/1/x".to_string(),
                credentials: None,
                validators: Validators::default(),
            })
            .unwrap_err();
        assert!(matches!(err, KiraError::UnsupportedScheme(scheme) if scheme == "gopher"));
    }
}
