//! Serializable connection settings.
//!
//! [`ConnConfig`] carries the plain-data subset of [`Options`]: the parts
//! that can live in a file. Capabilities and reporters are attached in code.
//!
//! ```
//! use vatlink::ConnConfig;
//!
//! let cfg = ConnConfig::default();
//! assert_eq!(cfg.abort_timeout_ms, 100);
//! let opts = cfg.into_options();
//! assert_eq!(opts.abort_timeout().as_millis(), 100);
//! ```

use crate::rpc::{DEFAULT_ABORT_TIMEOUT, DEFAULT_THREAD_NAME, Options};
use crate::transport::codec::DEFAULT_MAX_FRAME_LEN;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection settings loadable from configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnConfig {
    /// Bound on the best-effort `Abort` send during shutdown, in milliseconds.
    pub abort_timeout_ms: u64,
    /// Largest frame a stream transport accepts.
    pub max_frame_len: usize,
    /// Prefix for connection thread names.
    pub thread_name: String,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            abort_timeout_ms: DEFAULT_ABORT_TIMEOUT.as_millis() as u64,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

impl ConnConfig {
    /// Parses a TOML document. Missing keys take their defaults.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(s: &str) -> crate::error::Result<Self> {
        toml::from_str(s).map_err(|err| crate::error::Error::failed(format!("parse config: {err}")))
    }

    /// Abort timeout as a duration.
    #[must_use]
    pub const fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }

    /// Builds connection options. `max_frame_len` is not part of them; pass
    /// it to [`StreamTransport::with_max_frame_len`].
    ///
    /// [`StreamTransport::with_max_frame_len`]: crate::transport::StreamTransport::with_max_frame_len
    #[must_use]
    pub fn into_options(self) -> Options {
        Options::new()
            .with_abort_timeout(self.abort_timeout())
            .with_thread_name(self.thread_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn defaults_match_options() {
        init_test("defaults_match_options");
        let cfg = ConnConfig::default();
        assert_eq!(cfg.abort_timeout(), DEFAULT_ABORT_TIMEOUT);
        assert_eq!(cfg.max_frame_len, DEFAULT_MAX_FRAME_LEN);
        assert_eq!(cfg.clone().into_options().abort_timeout(), DEFAULT_ABORT_TIMEOUT);
        crate::test_complete!("defaults_match_options");
    }

    #[test]
    fn toml_partial_document_fills_defaults() {
        init_test("toml_partial_document_fills_defaults");
        let cfg: ConnConfig = toml::from_str("abort_timeout_ms = 250\n").unwrap();
        assert_eq!(cfg.abort_timeout_ms, 250);
        assert_eq!(cfg.thread_name, DEFAULT_THREAD_NAME);

        let text = toml::to_string(&cfg).unwrap();
        let parsed: ConnConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, cfg);

        assert!(toml::from_str::<ConnConfig>("bogus = 1\n").is_err());
        crate::test_complete!("toml_partial_document_fills_defaults");
    }

    #[test]
    fn json_round_trip() {
        init_test("json_round_trip");
        let cfg = ConnConfig {
            abort_timeout_ms: 5,
            max_frame_len: 1024,
            thread_name: "edge".into(),
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert_eq!(serde_json::from_str::<ConnConfig>(&json).unwrap(), cfg);
        crate::test_complete!("json_round_trip");
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn from_toml_str_reports_parse_errors() {
        init_test("from_toml_str_reports_parse_errors");
        let cfg = ConnConfig::from_toml_str("thread_name = \"svc\"").unwrap();
        assert_eq!(cfg.thread_name, "svc");
        let err = ConnConfig::from_toml_str("abort_timeout_ms = \"soon\"").unwrap_err();
        assert!(err.to_string().contains("parse config"));
        crate::test_complete!("from_toml_str_reports_parse_errors");
    }
}
