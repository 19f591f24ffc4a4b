//! Credential masking for anything that ends up in a log or audit line.

use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Secrets at or below this length are fully masked.
const MIN_PARTIAL_MASK_LEN: usize = 10;

/// An API credential sent as a request header.
///
/// `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredential {
    /// Header name (e.g. `"chave-api-dados"` or `"Authorization"`).
    pub header: String,
    /// Header value.
    pub value: String,
}

impl ApiCredential {
    /// Creates a credential. Surrounding whitespace is trimmed from the
    /// value, since keys pasted into `.env` files often carry it.
    #[must_use]
    pub fn new(header: &str, value: &str) -> Self {
        Self {
            header: header.to_string(),
            value: value.trim().to_string(),
        }
    }
}

impl std::fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredential")
            .field("header", &self.header)
            .field("value", &mask_secret(&self.value))
            .finish()
    }
}

/// Masks a secret: `abcdef...wxyz (len=N)` when long enough to keep a
/// recognisable prefix and suffix, `***` otherwise.
#[must_use]
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    if chars.len() <= MIN_PARTIAL_MASK_LEN {
        return "***".to_string();
    }

    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail} (len={})", chars.len())
}

/// Masks an `Authorization` header value, keeping the `Bearer ` scheme.
#[must_use]
pub fn mask_authorization(value: &str) -> String {
    value.strip_prefix("Bearer ").map_or_else(
        || mask_secret(value),
        |token| {
            if token.is_empty() {
                "Bearer ".to_string()
            } else {
                format!("Bearer {}", mask_secret(token))
            }
        },
    )
}

/// Produces pre-redacted representations of requests.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    /// Header carrying the API key, masked in header dumps.
    pub secret_header: Option<String>,
    /// Query parameter names whose values are secrets.
    pub secret_params: Vec<String>,
    /// Disables masking entirely (local debugging only).
    pub unsafe_http: bool,
}

impl Redactor {
    /// Returns `params` as a map with secret values masked.
    #[must_use]
    pub fn params<'a, I>(&self, params: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        params
            .into_iter()
            .map(|(k, v)| {
                let value = if !self.unsafe_http && self.is_secret_param(k) {
                    mask_secret(v)
                } else {
                    v.clone()
                };
                (k.clone(), value)
            })
            .collect()
    }

    /// Returns `headers` with the credential header and any
    /// `Authorization` header masked.
    #[must_use]
    pub fn headers(&self, headers: &[(String, String)]) -> BTreeMap<String, String> {
        headers
            .iter()
            .map(|(k, v)| {
                let value = if self.unsafe_http {
                    v.clone()
                } else if k.eq_ignore_ascii_case("authorization") {
                    mask_authorization(v)
                } else if self
                    .secret_header
                    .as_deref()
                    .is_some_and(|h| h.eq_ignore_ascii_case(k))
                {
                    mask_secret(v)
                } else {
                    v.clone()
                };
                (k.clone(), value)
            })
            .collect()
    }

    /// Renders `url?k=v&…` with secret parameter values masked.
    #[must_use]
    pub fn url(&self, url: &str, params: &[(String, String)]) -> String {
        let mut rendered = url.to_string();
        let mut separator = if url.contains('?') { '&' } else { '?' };
        for (k, v) in params {
            let value = if !self.unsafe_http && self.is_secret_param(k) {
                mask_secret(v)
            } else {
                v.clone()
            };
            let _ = write!(rendered, "{separator}{k}={value}");
            separator = '&';
        }
        rendered
    }

    fn is_secret_param(&self, name: &str) -> bool {
        self.secret_params
            .iter()
            .any(|secret| secret.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redactor() -> Redactor {
        Redactor {
            secret_header: Some("chave-api-dados".to_string()),
            secret_params: vec!["api_key".to_string()],
            unsafe_http: false,
        }
    }

    #[test]
    fn long_secret_keeps_prefix_and_suffix() {
        assert_eq!(
            mask_secret("0123456789abcdef"),
            "012345...cdef (len=16)"
        );
    }

    #[test]
    fn short_secret_fully_masked() {
        assert_eq!(mask_secret("0123456789"), "***");
    }

    #[test]
    fn bearer_prefix_survives() {
        assert_eq!(
            mask_authorization("Bearer 0123456789abcdef"),
            "Bearer 012345...cdef (len=16)"
        );
        assert_eq!(mask_authorization("Basic abc"), "***");
    }

    #[test]
    fn headers_mask_credential_and_authorization() {
        let headers = vec![
            ("chave-api-dados".to_string(), "supersecretkey123".to_string()),
            ("Authorization".to_string(), "Bearer tok".to_string()),
            ("User-Agent".to_string(), "bronze".to_string()),
        ];
        let redacted = redactor().headers(&headers);
        assert_eq!(redacted["chave-api-dados"], "supers...y123 (len=17)");
        assert_eq!(redacted["Authorization"], "Bearer ***");
        assert_eq!(redacted["User-Agent"], "bronze");
    }

    #[test]
    fn url_masks_secret_params_only() {
        let params = vec![
            ("pagina".to_string(), "3".to_string()),
            ("API_KEY".to_string(), "abc".to_string()),
        ];
        assert_eq!(
            redactor().url("https://api.example.com/x", &params),
            "https://api.example.com/x?pagina=3&API_KEY=***"
        );
    }

    #[test]
    fn unsafe_mode_disables_masking() {
        let redactor = Redactor {
            unsafe_http: true,
            ..redactor()
        };
        let params = BTreeMap::from([("api_key".to_string(), "abc".to_string())]);
        assert_eq!(redactor.params(&params)["api_key"], "abc");
    }

    #[test]
    fn credential_debug_hides_value() {
        let credential = ApiCredential::new("chave-api-dados", "  supersecretkey123\n");
        assert_eq!(credential.value, "supersecretkey123");
        let debug = format!("{credential:?}");
        assert!(!debug.contains("supersecretkey123"));
    }
}
