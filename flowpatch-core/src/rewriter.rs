//! Login request rewriting.
//!
//! The login request is turned into a browser-like form POST carrying the
//! configured credentials. It is the only operation in the engine allowed to
//! block, and the wait is bounded by [`LoginRewriter::timeout`].

use crate::error::PolicyError;
use crate::flow::Flow;
use crate::settings::{ConfigStore, Settings};
use hudsucker::hyper::header::{HeaderName, HeaderValue};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const LOGIN_URL: &str = "https://www.hssenglish.com/student/user/login";

const TIMING_HEADER: &str = "x-uctiming-46938875";

/// Browser signature the login endpoint expects.
const SIGNATURE_HEADERS: &[(&str, &str)] = &[
    (
        "accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
    ),
    ("accept-encoding", "gzip, deflate, br, zstd"),
    ("accept-language", "zh-CN,zh;q=0.9,en;q=0.8"),
    ("cache-control", "max-age=0"),
    ("connection", "keep-alive"),
    ("content-type", "application/x-www-form-urlencoded"),
    ("host", "www.hssenglish.com"),
    ("origin", "https://www.hssenglish.com"),
    ("referer", "https://www.hssenglish.com/"),
    ("sec-fetch-dest", "document"),
    ("sec-fetch-mode", "navigate"),
    ("sec-fetch-site", "same-origin"),
    ("sec-fetch-user", "?1"),
    ("upgrade-insecure-requests", "1"),
    (
        "user-agent",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36 QuarkPC/6.1.5.666",
    ),
    ("sec-ch-ua", "\"Not?A_Brand\";v=\"99\", \"Chromium\";v=\"130\""),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"Windows\""),
];

#[derive(Debug, Clone)]
pub struct LoginRewriter {
    login_url: String,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl LoginRewriter {
    pub fn new(poll_interval: Duration, timeout: Option<Duration>) -> Self {
        Self {
            login_url: LOGIN_URL.to_string(),
            poll_interval,
            timeout,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn matches(&self, url: &str) -> bool {
        url == self.login_url
    }

    /// Rewrite the login request in `flow`.
    ///
    /// Credentials are resolved first: `snapshot` is used when it already holds
    /// them, otherwise `store` is polled. If the wait times out the flow is left
    /// untouched.
    pub fn rewrite(
        &self,
        flow: &mut Flow,
        store: &dyn ConfigStore,
        snapshot: &Settings,
    ) -> Result<(), PolicyError> {
        info!("Intercepted login request [{}] {}", flow.id, flow.request.url);

        let (username, password) = match snapshot.credentials() {
            Some((u, p)) => (u.to_string(), p.to_string()),
            None => self.wait_for_credentials(store)?,
        };

        let request = &mut flow.request;
        request.method = "POST".to_string();
        for &(name, value) in SIGNATURE_HEADERS {
            request
                .headers
                .insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        }
        request.headers.insert(
            HeaderName::from_static(TIMING_HEADER),
            HeaderValue::from(chrono::Utc::now().timestamp_millis()),
        );
        request.set_body(login_form(&username, &password).into_bytes());

        info!("Login request [{}] rewritten as form POST", flow.id);
        Ok(())
    }

    /// Poll `store` until both username and password are non-empty.
    fn wait_for_credentials(&self, store: &dyn ConfigStore) -> Result<(String, String), PolicyError> {
        let started = Instant::now();
        warn!("No credentials configured yet, waiting for them before forwarding login");

        loop {
            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    return Err(PolicyError::CredentialTimeout(limit));
                }
            }

            std::thread::sleep(self.poll_interval);

            match store.load() {
                Ok(settings) => {
                    if let Some((u, p)) = settings.credentials() {
                        debug!("Credentials became available after {:?}", started.elapsed());
                        return Ok((u.to_string(), p.to_string()));
                    }
                }
                Err(e) => debug!("Settings unreadable while waiting for credentials: {}", e),
            }
        }
    }
}

/// `userId=<u>&password=<p>`, form-urlencoded.
pub fn login_form(username: &str, password: &str) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("userId", username)
        .append_pair("password", password)
        .finish()
}
