//! Where a Jupyter server lives and how to authenticate against it.

use url::Url;

use crate::config::ServerSettingsOptions;
use crate::error::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8888/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// HTTP(S) base URL, always ending in `/`.
    pub base_url: String,
    /// WS(S) base URL, always ending in `/`.
    pub ws_url: String,
    pub token: Option<String>,
    /// Also pass the token as a query parameter on the kernel socket.
    pub append_token: bool,
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

/// `http://host/x` becomes `ws://host/x`, `https://...` becomes `wss://...`.
fn derive_ws_url(base_url: &str) -> String {
    match base_url.strip_prefix("http") {
        Some(rest) => format!("ws{rest}"),
        None => base_url.to_string(),
    }
}

impl ServerSettings {
    /// Settings for a server handed back by an ephemeral build.
    pub fn from_url_and_token(url: &str, token: Option<&str>) -> Self {
        let base_url = with_trailing_slash(url);
        Self {
            ws_url: derive_ws_url(&base_url),
            base_url,
            token: token.filter(|t| !t.is_empty()).map(str::to_string),
            append_token: true,
        }
    }

    pub fn from_options(options: &ServerSettingsOptions) -> Result<Self> {
        let base_url = with_trailing_slash(options.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL));
        Url::parse(&base_url).map_err(|e| Error::Config(format!("baseUrl {base_url:?}: {e}")))?;
        let ws_url = match options.ws_url.as_deref() {
            Some(ws) => with_trailing_slash(ws),
            None => derive_ws_url(&base_url),
        };
        Ok(Self {
            base_url,
            ws_url,
            token: options.token.clone().filter(|t| !t.is_empty()),
            append_token: options.append_token,
        })
    }

    /// Resolve a REST path (`api/kernels`) against the base URL.
    pub fn rest_url(&self, path: &str) -> Result<Url> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("baseUrl {:?}: {e}", self.base_url)))?;
        base.join(path.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("{path:?}: {e}")))
    }

    /// The kernel's multiplexed channel socket.
    pub fn kernel_channels_url(&self, kernel_id: &str, session_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.ws_url)
            .map_err(|e| Error::Config(format!("wsUrl {:?}: {e}", self.ws_url)))?;
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("wsUrl {:?} cannot be a base", self.ws_url)))?
            .pop_if_empty()
            .extend(["api", "kernels", kernel_id, "channels"]);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("session_id", session_id);
            if self.append_token {
                if let Some(token) = &self.token {
                    query.append_pair("token", token);
                }
            }
        }
        Ok(url)
    }

    /// Value of the `Authorization` header, if a token is configured.
    pub fn authorization(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("token {t}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_url_and_token() {
        let settings = ServerSettings::from_url_and_token(
            "https://hub.example.org/user/abc",
            Some("secret"),
        );
        assert_eq!(settings.base_url, "https://hub.example.org/user/abc/");
        assert_eq!(settings.ws_url, "wss://hub.example.org/user/abc/");
        assert_eq!(settings.authorization().as_deref(), Some("token secret"));
        assert!(settings.append_token);
    }

    #[test]
    fn test_kernel_channels_url() {
        let settings = ServerSettings::from_url_and_token("http://localhost:8888/user/x/", Some("t0k"));
        let url = settings.kernel_channels_url("k-1", "s-1").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:8888/user/x/api/kernels/k-1/channels?session_id=s-1&token=t0k"
        );

        let mut settings = settings;
        settings.append_token = false;
        let url = settings.kernel_channels_url("k-1", "s-1").unwrap();
        assert!(!url.as_str().contains("token"));
    }

    #[test]
    fn test_from_options_defaults() {
        let settings = ServerSettings::from_options(&ServerSettingsOptions::default()).unwrap();
        assert_eq!(settings.base_url, DEFAULT_BASE_URL);
        assert_eq!(settings.ws_url, "ws://localhost:8888/");
        assert!(settings.token.is_none());
    }

    #[test]
    fn test_from_options_explicit_ws_and_empty_token() {
        let options = ServerSettingsOptions {
            base_url: Some("http://a:1".into()),
            ws_url: Some("ws://b:2".into()),
            token: Some(String::new()),
            append_token: true,
        };
        let settings = ServerSettings::from_options(&options).unwrap();
        assert_eq!(settings.ws_url, "ws://b:2/");
        assert!(settings.token.is_none());
    }

    #[test]
    fn test_invalid_base_url() {
        let options = ServerSettingsOptions {
            base_url: Some("not a url".into()),
            ..Default::default()
        };
        assert!(matches!(ServerSettings::from_options(&options), Err(Error::Config(_))));
    }

    #[test]
    fn test_rest_url() {
        let settings = ServerSettings::from_url_and_token("http://h/base", None);
        assert_eq!(settings.rest_url("/api/kernels").unwrap().as_str(), "http://h/base/api/kernels");
    }
}
