use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::header::{RETRY_AFTER, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

const CLIENT_USER_AGENT: &str = concat!("backscrobble/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SIGNING_SKIP: [&str; 2] = ["format", "callback"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    #[default]
    LastFm,
    LibreFm,
}

impl Service {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "lastfm" => Ok(Service::LastFm),
            "librefm" => Ok(Service::LibreFm),
            _ => bail!("Unsupported service: {value}"),
        }
    }

    pub fn base_url(self) -> &'static str {
        match self {
            Service::LastFm => "https://ws.audioscrobbler.com/2.0/",
            Service::LibreFm => "https://libre.fm/2.0/",
        }
    }

    fn authorize_url(self) -> &'static str {
        match self {
            Service::LastFm => "https://www.last.fm/api/auth/",
            Service::LibreFm => "https://libre.fm/api/auth/",
        }
    }
}

/// Everything needed to sign and authorize a write request.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub session_key: String,
}

impl Credentials {
    /// Completes a parameter list with method, key, session and signature.
    pub fn sign_request(&self, method: &str, mut params: Vec<(String, String)>) -> Vec<(String, String)> {
        params.push(("method".to_string(), method.to_string()));
        params.push(("api_key".to_string(), self.api_key.clone()));
        params.push(("sk".to_string(), self.session_key.clone()));
        let api_sig = sign_params(&params, &self.api_secret);
        params.push(("api_sig".to_string(), api_sig));
        params.push(("format".to_string(), "json".to_string()));
        params
    }
}

/// `md5(name1 value1 name2 value2 ... secret)` over the parameters sorted by
/// name, excluding `format` and `callback`.
pub fn sign_params(params: &[(String, String)], secret: &str) -> String {
    let mut sorted: Vec<_> = params
        .iter()
        .filter(|(key, _)| !SIGNING_SKIP.contains(&key.as_str()))
        .collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let mut signature = String::new();
    for (key, value) in sorted {
        signature.push_str(key);
        signature.push_str(value);
    }
    signature.push_str(secret);
    format!("{:x}", md5::compute(signature))
}

/// Drops the session key and signature so parameters can be logged.
pub fn redacted(params: &[(String, String)]) -> BTreeMap<&str, &str> {
    params
        .iter()
        .filter(|(key, _)| key != "sk" && key != "api_sig")
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect()
}

/// Raw HTTP reply, before interpretation.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub retry_after: Option<String>,
    pub body: String,
}

pub trait Transport {
    fn post(&mut self, params: &[(String, String)]) -> Result<Reply>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn post(&mut self, params: &[(String, String)]) -> Result<Reply> {
        (**self).post(params)
    }
}

pub struct ServiceClient {
    service: Service,
    http: Client,
}

impl ServiceClient {
    pub fn new(service: Service) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed building HTTP client")?;
        Ok(Self { service, http })
    }

    fn call(&self, mut params: Vec<(String, String)>, api_secret: &str) -> Result<Value> {
        let api_sig = sign_params(&params, api_secret);
        params.push(("api_sig".to_string(), api_sig));
        params.push(("format".to_string(), "json".to_string()));
        let text = self
            .http
            .post(self.service.base_url())
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .form(&params)
            .send()
            .context("Failed sending API request")?
            .text()
            .context("Failed reading API response")?;
        check_api_error(&text)?;
        serde_json::from_str(&text).context("Failed parsing API response")
    }

    pub fn request_token(&self, api_key: &str, api_secret: &str) -> Result<String> {
        let params = vec![
            ("method".to_string(), "auth.getToken".to_string()),
            ("api_key".to_string(), api_key.to_string()),
        ];
        let json = self.call(params, api_secret)?;
        json.get("token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Missing token in response"))
    }

    pub fn authorize_url(&self, api_key: &str, token: &str) -> Result<String> {
        let url = reqwest::Url::parse_with_params(
            self.service.authorize_url(),
            &[("api_key", api_key), ("token", token)],
        )
        .context("Failed building authorization URL")?;
        Ok(url.to_string())
    }

    pub fn request_session(&self, api_key: &str, api_secret: &str, token: &str) -> Result<Session> {
        let params = vec![
            ("method".to_string(), "auth.getSession".to_string()),
            ("api_key".to_string(), api_key.to_string()),
            ("token".to_string(), token.to_string()),
        ];
        session_from_value(&self.call(params, api_secret)?)
    }

    pub fn request_mobile_session(
        &self,
        api_key: &str,
        api_secret: &str,
        username: &str,
        password: &str,
    ) -> Result<Session> {
        let params = vec![
            ("method".to_string(), "auth.getMobileSession".to_string()),
            ("username".to_string(), username.to_string()),
            ("password".to_string(), password.to_string()),
            ("api_key".to_string(), api_key.to_string()),
        ];
        session_from_value(&self.call(params, api_secret)?)
    }
}

impl Transport for ServiceClient {
    fn post(&mut self, params: &[(String, String)]) -> Result<Reply> {
        let response = self
            .http
            .post(self.service.base_url())
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .form(params)
            .send()
            .context("Failed sending scrobble request")?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .context("Failed reading scrobble response")?;
        debug!("Scrobble response ({status}): {body}");
        Ok(Reply {
            status,
            retry_after,
            body,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub name: String,
    pub key: String,
}

fn session_from_value(json: &Value) -> Result<Session> {
    let session = json
        .get("session")
        .ok_or_else(|| anyhow::anyhow!("Missing session in response"))?;
    let field = |name: &str| {
        session
            .get(name)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    match (field("name"), field("key")) {
        (Some(name), Some(key)) => Ok(Session { name, key }),
        _ => bail!("Incomplete session in response"),
    }
}

fn check_api_error(payload: &str) -> Result<()> {
    if let Some((code, message)) = api_error(payload) {
        bail!("API error {code}: {message}");
    }
    Ok(())
}

fn api_error(payload: &str) -> Option<(u32, String)> {
    let json: Value = serde_json::from_str(payload).ok()?;
    let error = json.get("error")?;
    let code = error
        .as_u64()
        .and_then(|code| u32::try_from(code).ok())
        .or_else(|| error.as_str().and_then(|raw| raw.trim().parse().ok()))?;
    let message = json
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("API error")
        .to_string();
    Some((code, message))
}

/// Service error codes that mean the key, secret or session is not usable.
const AUTH_ERROR_CODES: [u32; 5] = [4, 9, 10, 14, 26];
const TEMPORARY_ERROR_CODES: [u32; 2] = [11, 16];
const RATE_LIMIT_ERROR_CODE: u32 = 29;

/// Human readable reason for a per-scrobble `ignoredMessage` code.
pub fn ignored_reason(code: u32) -> &'static str {
    match code {
        1 => "artist ignored",
        2 => "track ignored",
        3 => "timestamp too old",
        4 => "timestamp too new",
        5 => "daily scrobble limit exceeded",
        _ => "unknown reason",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredScrobble {
    pub index: usize,
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub accepted: u32,
    pub ignored: Vec<IgnoredScrobble>,
}

/// Interpretation of one submission reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted(BatchReport),
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    Recoverable {
        message: String,
    },
    AuthFailed {
        code: u32,
        message: String,
    },
    Rejected {
        code: Option<u32>,
        message: String,
    },
}

impl Outcome {
    pub fn message(&self) -> &str {
        match self {
            Outcome::Accepted(_) => "Accepted",
            Outcome::RateLimited { message, .. }
            | Outcome::Recoverable { message }
            | Outcome::AuthFailed { message, .. }
            | Outcome::Rejected { message, .. } => message,
        }
    }
}

/// Interprets a reply to a batch of `submitted` scrobbles. A 2xx reply that
/// is not an error always counts as received, so the batch is never resent.
pub fn classify(reply: &Reply, submitted: usize, now: DateTime<Utc>) -> Outcome {
    if reply.status == 429 {
        return Outcome::RateLimited {
            retry_after: reply
                .retry_after
                .as_deref()
                .and_then(|value| parse_retry_after(value, now)),
            message: api_error(&reply.body)
                .map_or_else(|| "Too many requests".to_string(), |(_, message)| message),
        };
    }
    if let Some((code, message)) = api_error(&reply.body) {
        return match code {
            RATE_LIMIT_ERROR_CODE => Outcome::RateLimited {
                retry_after: reply
                    .retry_after
                    .as_deref()
                    .and_then(|value| parse_retry_after(value, now)),
                message,
            },
            code if TEMPORARY_ERROR_CODES.contains(&code) => Outcome::Recoverable {
                message: format!("API error {code}: {message}"),
            },
            code if AUTH_ERROR_CODES.contains(&code) => Outcome::AuthFailed { code, message },
            code => Outcome::Rejected {
                code: Some(code),
                message,
            },
        };
    }
    if reply.status >= 500 {
        return Outcome::Recoverable {
            message: format!("HTTP {}", reply.status),
        };
    }
    if !(200..300).contains(&reply.status) {
        return Outcome::Rejected {
            code: None,
            message: format!("HTTP {}", reply.status),
        };
    }
    let json: Value = match serde_json::from_str(&reply.body) {
        Ok(json) => json,
        Err(err) => {
            warn!("Unreadable scrobble response, assuming the batch was received: {err}");
            return Outcome::Accepted(BatchReport::default());
        }
    };
    let lfm = json.get("lfm");
    if let Some(scrobbles) = json
        .get("scrobbles")
        .or_else(|| lfm.and_then(|lfm| lfm.get("scrobbles")))
    {
        return Outcome::Accepted(scrobble_report(scrobbles));
    }
    if lfm.and_then(|lfm| lfm.get("status")).and_then(Value::as_str) == Some("ok") {
        return Outcome::Accepted(BatchReport {
            accepted: u32::try_from(submitted).unwrap_or(u32::MAX),
            ignored: Vec::new(),
        });
    }
    warn!("Unexpected scrobble response, assuming the batch was received: {json}");
    Outcome::Accepted(BatchReport::default())
}

fn scrobble_report(scrobbles: &Value) -> BatchReport {
    match Scrobbles::deserialize(scrobbles) {
        Ok(parsed) => parsed.report(),
        Err(err) => {
            debug!("Falling back to untyped scrobble results: {err}");
            report_from_value(scrobbles)
        }
    }
}

fn report_from_value(scrobbles: &Value) -> BatchReport {
    let accepted = scrobbles
        .get("@attr")
        .and_then(|attr| attr.get("accepted"))
        .and_then(parse_u32_value)
        .unwrap_or(0);
    let entries: Vec<&Value> = match scrobbles.get("scrobble") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(item @ Value::Object(_)) => vec![item],
        _ => Vec::new(),
    };
    let ignored = entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let message = entry.get("ignoredMessage")?;
            let code = message
                .get("code")
                .and_then(parse_u32_value)
                .or_else(|| parse_u32_value(message))?;
            let text = message
                .get("#text")
                .and_then(Value::as_str)
                .unwrap_or_default();
            (code != 0).then(|| IgnoredScrobble {
                index,
                code,
                message: text.to_string(),
            })
        })
        .collect();
    BatchReport { accepted, ignored }
}

fn parse_u32_value(value: &Value) -> Option<u32> {
    if let Some(value) = value.as_u64() {
        return u32::try_from(value).ok();
    }
    value.as_str().and_then(|raw| raw.trim().parse::<u32>().ok())
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[derive(Debug, Deserialize)]
struct Scrobbles {
    #[serde(rename = "@attr")]
    #[serde(default)]
    attr: Option<ScrobbleAttr>,
    #[serde(default)]
    scrobble: Option<ScrobbleEntries>,
}

impl Scrobbles {
    fn report(&self) -> BatchReport {
        let entries: &[ScrobbleEntry] = match &self.scrobble {
            Some(ScrobbleEntries::One(entry)) => std::slice::from_ref(entry),
            Some(ScrobbleEntries::Many(entries)) => entries,
            None => &[],
        };
        let ignored = entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                let (code, message) = match entry.ignored_message.as_ref()? {
                    IgnoredMessageField::Object(message) => (
                        message.code.as_ref().and_then(StringOrU32::as_u32)?,
                        message.text.clone().unwrap_or_default(),
                    ),
                    IgnoredMessageField::Text(text) => (text.trim().parse().ok()?, String::new()),
                    IgnoredMessageField::Number(code) => (*code, String::new()),
                };
                (code != 0).then(|| IgnoredScrobble {
                    index,
                    code,
                    message,
                })
            })
            .collect();
        BatchReport {
            accepted: self.attr.as_ref().map_or(0, |attr| attr.accepted),
            ignored,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScrobbleAttr {
    #[serde(deserialize_with = "deserialize_u32_string_or_number")]
    accepted: u32,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScrobbleEntries {
    Many(Vec<ScrobbleEntry>),
    One(ScrobbleEntry),
}

#[derive(Debug, Deserialize)]
struct ScrobbleEntry {
    #[serde(rename = "ignoredMessage")]
    #[serde(default)]
    ignored_message: Option<IgnoredMessageField>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IgnoredMessageField {
    Object(IgnoredMessage),
    Text(String),
    Number(u32),
}

#[derive(Debug, Deserialize)]
struct IgnoredMessage {
    #[serde(rename = "#text")]
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    code: Option<StringOrU32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrU32 {
    String(String),
    Number(u32),
}

impl StringOrU32 {
    fn as_u32(&self) -> Option<u32> {
        match self {
            StringOrU32::String(value) => value.trim().parse().ok(),
            StringOrU32::Number(value) => Some(*value),
        }
    }
}

fn deserialize_u32_string_or_number<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    StringOrU32::deserialize(deserializer)?
        .as_u32()
        .ok_or_else(|| serde::de::Error::custom("expected an unsigned integer"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect()
    }

    fn reply(status: u16, body: &str) -> Reply {
        Reply {
            status,
            retry_after: None,
            body: body.to_string(),
        }
    }

    #[test]
    fn signs_sorted_params_with_secret() {
        let signature = sign_params(
            &params(&[
                ("token", "yyy"),
                ("method", "auth.getSession"),
                ("api_key", "xxx"),
            ]),
            "zzz",
        );
        assert_eq!(signature, "75df1fdb6b738160924a52b1732fdde7");
    }

    #[test]
    fn signature_ignores_format_and_sorts_bytewise() {
        let signature = sign_params(
            &params(&[
                ("method", "track.scrobble"),
                ("api_key", "key"),
                ("sk", "session"),
                ("artist[0]", "Björk"),
                ("track[0]", "Jóga"),
                ("timestamp[0]", "1700000000"),
                ("album[0]", "Homogenic"),
                ("albumArtist[0]", "Björk"),
                ("format", "json"),
            ]),
            "secret",
        );
        assert_eq!(signature, "d75198ec681cfb17ce3493ac185b8320");
    }

    #[test]
    fn signed_request_carries_auth_params() {
        let credentials = Credentials {
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            session_key: "session".to_string(),
        };
        let signed = credentials.sign_request(
            "track.scrobble",
            params(&[
                ("artist[0]", "Björk"),
                ("track[0]", "Jóga"),
                ("timestamp[0]", "1700000000"),
                ("album[0]", "Homogenic"),
                ("albumArtist[0]", "Björk"),
            ]),
        );
        let get = |name: &str| {
            signed
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };
        assert_eq!(get("api_sig"), Some("d75198ec681cfb17ce3493ac185b8320"));
        assert_eq!(get("format"), Some("json"));
        let visible = redacted(&signed);
        assert!(!visible.contains_key("sk"));
        assert!(!visible.contains_key("api_sig"));
        assert_eq!(visible.get("method"), Some(&"track.scrobble"));
    }

    #[test]
    fn classifies_accepted_batch_with_ignored_records() {
        let body = r##"{"scrobbles":{"@attr":{"accepted":"1","ignored":"2"},"scrobble":[
            {"ignoredMessage":{"code":"0","#text":""}},
            {"ignoredMessage":{"code":"1","#text":"Artist was ignored"}},
            {"ignoredMessage":{"code":"5","#text":"Daily scrobble limit exceeded"}}
        ]}}"##;
        let Outcome::Accepted(report) = classify(&reply(200, body), 1, Utc::now()) else {
            panic!("expected an accepted batch");
        };
        assert_eq!(report.accepted, 1);
        let codes: Vec<_> = report.ignored.iter().map(|item| (item.index, item.code)).collect();
        assert_eq!(codes, vec![(1, 1), (2, 5)]);
    }

    #[test]
    fn classifies_single_scrobble_object() {
        let body = r##"{"scrobbles":{"@attr":{"accepted":0,"ignored":1},"scrobble":
            {"ignoredMessage":{"code":"3","#text":"Timestamp too old"}}}}"##;
        let Outcome::Accepted(report) = classify(&reply(200, body), 1, Utc::now()) else {
            panic!("expected an accepted batch");
        };
        assert_eq!(report.accepted, 0);
        assert_eq!(report.ignored[0].code, 3);
        assert_eq!(report.ignored[0].message, "Timestamp too old");
    }

    #[test]
    fn accepts_text_ignored_message() {
        let body = r#"{"scrobbles":{"@attr":{"accepted":1,"ignored":0},"scrobble":{"ignoredMessage":""}}}"#;
        assert_eq!(
            classify(&reply(200, body), 1, Utc::now()),
            Outcome::Accepted(BatchReport {
                accepted: 1,
                ignored: Vec::new(),
            })
        );
    }

    #[test]
    fn reads_irregular_scrobble_results_untyped() {
        let body = r##"{"scrobbles":{"@attr":{"accepted":"2"},"scrobble":[
            {"ignoredMessage":{"code":"1","#text":"Artist was ignored"}},
            {"ignoredMessage":true},
            {"ignoredMessage":{"code":"0"}}
        ]}}"##;
        let Outcome::Accepted(report) = classify(&reply(200, body), 3, Utc::now()) else {
            panic!("expected an accepted batch");
        };
        assert_eq!(report.accepted, 2);
        assert_eq!(
            report.ignored,
            vec![IgnoredScrobble {
                index: 0,
                code: 1,
                message: "Artist was ignored".to_string(),
            }]
        );
    }

    #[test]
    fn accepts_lfm_wrapped_replies() {
        let now = Utc::now();
        let Outcome::Accepted(report) = classify(&reply(200, r#"{"lfm":{"status":"ok"}}"#), 7, now)
        else {
            panic!("expected an accepted batch");
        };
        assert_eq!(report.accepted, 7);
        assert!(report.ignored.is_empty());

        let nested = r##"{"lfm":{"status":"ok","scrobbles":{"@attr":{"accepted":"1","ignored":"1"},"scrobble":[
            {"ignoredMessage":{"code":"0","#text":""}},
            {"ignoredMessage":{"code":"4","#text":"Timestamp too new"}}
        ]}}}"##;
        let Outcome::Accepted(report) = classify(&reply(200, nested), 2, now) else {
            panic!("expected an accepted batch");
        };
        assert_eq!(report.accepted, 1);
        assert_eq!(report.ignored[0].index, 1);
        assert_eq!(report.ignored[0].code, 4);
    }

    #[test]
    fn unreadable_success_is_never_resent() {
        let now = Utc::now();
        for body in ["<html>ok</html>", "", r#"{"unexpected":true}"#] {
            assert_eq!(
                classify(&reply(200, body), 5, now),
                Outcome::Accepted(BatchReport::default())
            );
        }
    }

    #[test]
    fn classifies_service_errors() {
        let now = Utc::now();
        assert!(matches!(
            classify(&reply(403, r#"{"error":9,"message":"Invalid session key"}"#), 1, now),
            Outcome::AuthFailed { code: 9, .. }
        ));
        assert!(matches!(
            classify(&reply(200, r#"{"error":"11","message":"Service Offline"}"#), 1, now),
            Outcome::Recoverable { .. }
        ));
        assert!(matches!(
            classify(&reply(503, r#"{"error":16,"message":"Temporary error"}"#), 1, now),
            Outcome::Recoverable { .. }
        ));
        assert!(matches!(
            classify(&reply(200, r#"{"error":29,"message":"Rate limit exceeded"}"#), 1, now),
            Outcome::RateLimited { retry_after: None, .. }
        ));
        assert!(matches!(
            classify(&reply(400, r#"{"error":6,"message":"Invalid parameters"}"#), 1, now),
            Outcome::Rejected { code: Some(6), .. }
        ));
        assert!(matches!(
            classify(&reply(502, "<html>Bad gateway</html>"), 1, now),
            Outcome::Recoverable { .. }
        ));
    }

    #[test]
    fn honours_retry_after_on_429() {
        let now = DateTime::parse_from_rfc3339("2023-11-14T22:13:20Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut limited = reply(429, "");
        limited.retry_after = Some("120".to_string());
        assert_eq!(
            classify(&limited, 1, now),
            Outcome::RateLimited {
                retry_after: Some(Duration::from_secs(120)),
                message: "Too many requests".to_string(),
            }
        );
        assert_eq!(
            parse_retry_after("Tue, 14 Nov 2023 22:15:20 GMT", now),
            Some(Duration::from_secs(120))
        );
        assert_eq!(
            parse_retry_after("Tue, 14 Nov 2023 22:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn reads_session_from_response() {
        let json: Value =
            serde_json::from_str(r#"{"session":{"name":"listener","key":"abc","subscriber":0}}"#)
                .unwrap();
        assert_eq!(
            session_from_value(&json).unwrap(),
            Session {
                name: "listener".to_string(),
                key: "abc".to_string(),
            }
        );
        let partial: Value = serde_json::from_str(r#"{"session":{"name":"listener"}}"#).unwrap();
        assert!(session_from_value(&partial).is_err());
    }

    #[test]
    fn parses_service_names() {
        assert_eq!(Service::parse("lastfm").unwrap(), Service::LastFm);
        assert_eq!(Service::parse("librefm").unwrap(), Service::LibreFm);
        assert!(Service::parse("myspace").is_err());
    }
}
