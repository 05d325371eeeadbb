//! HTTP digest authentication, as used by monerod's restricted RPC.
//!
//! Digest auth's state machine (track the last challenge, recompute the
//! response per request, retry once on a fresh `WWW-Authenticate`) is
//! exactly what every monerod deployment with `--rpc-login` needs, bit for
//! bit.

use std::cmp::Ordering;
use std::sync::atomic::{self, AtomicU32};
use std::sync::{Arc, Mutex, PoisonError};

use hyper::header::{HeaderValue, WWW_AUTHENTICATE};
use hyper::http::uri::PathAndQuery;
use hyper::{Method, Response, Uri};
use log::trace;
use md5::{Digest, Md5};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use strum::Display;
use thiserror::Error;

/// Digest authentication state for a single daemon connection.
#[derive(Debug, Clone)]
pub(crate) struct AuthInfo {
    username: String,
    password: String,
    counter: Arc<AtomicU32>,
    last_auth_params: Arc<Mutex<Option<AuthParams>>>,
    rng: ChaCha12Rng,
}

impl AuthInfo {
    pub fn new(username: String, password: String) -> AuthInfo {
        AuthInfo {
            username,
            password,
            counter: Arc::new(AtomicU32::new(1)),
            last_auth_params: Arc::new(Mutex::new(None)),
            rng: ChaCha12Rng::from_entropy(),
        }
    }

    /// Builds an `AUTHORIZATION` header from the most recently seen
    /// challenge. Returns `None` if no challenge has been seen yet.
    #[allow(clippy::similar_names)]
    pub fn authenticate(
        &mut self,
        uri: &Uri,
        method: &Method,
    ) -> Result<Option<HeaderValue>, AuthError> {
        let maybe_auth_params = &*self
            .last_auth_params
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(auth_params) = maybe_auth_params else {
            return Ok(None);
        };
        let mut cnonce_bytes: [u8; 16] = [0; 16];
        self.rng.fill(&mut cnonce_bytes[..]);

        let path_and_query = uri
            .path_and_query()
            .map_or(uri.path(), PathAndQuery::as_str);
        let nc = format!("{:08x}", self.counter.load(atomic::Ordering::Relaxed));
        let qop = auth_params.qop.iter().max().ok_or(AuthError::Unsupported)?;
        let nonce = &auth_params.nonce;
        let realm = &auth_params.realm;
        let opaque = &auth_params.opaque;
        let cnonce = hex::encode(cnonce_bytes);
        let algorithm = &auth_params.algorithm;

        trace!("digest auth with qop={qop}, algorithm={algorithm}, nc={nc}");

        let ha1_input = format!("{}:{}:{}", &self.username, realm, &self.password);
        let mut ha1 = md5_str(ha1_input);
        if algorithm.is_sess() {
            ha1 = md5_str(format!("{ha1}:{nonce}:{cnonce}"));
        }
        let ha2 = md5_str(format!("{method}:{path_and_query}"));
        let response = md5_str(format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}"));

        let mut auth_header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", qop={}, nc={}, cnonce=\"{}\", response=\"{}\", algorithm={}",
            self.username, realm, nonce, path_and_query, qop, nc, cnonce, response, algorithm,
        );
        if let Some(opaque_val) = opaque {
            auth_header.push_str(&format!(", opaque={opaque_val}"));
        }

        self.counter.fetch_add(1, atomic::Ordering::Relaxed);
        Ok(Some(HeaderValue::from_str(&auth_header)?))
    }

    /// Builds an `AUTHORIZATION` header from a `401` response's
    /// `WWW-Authenticate` challenge(s), remembering the winning challenge for
    /// subsequent requests.
    pub fn authenticate_with_resp<T>(
        &mut self,
        response: &Response<T>,
        uri: &Uri,
        method: &Method,
    ) -> Result<HeaderValue, AuthError> {
        let authenticate_headers = response
            .headers()
            .get_all(WWW_AUTHENTICATE)
            .into_iter()
            .map(|h| {
                h.to_str()
                    .map_err(|_| AuthError::InvalidHeader("header is not valid utf-8".to_string()))
            })
            .collect::<Result<Vec<&str>, AuthError>>()?;
        let mut auth_choices = authenticate_headers
            .into_iter()
            .filter_map(|h| h.strip_prefix("Digest "))
            .map(parse_header)
            .collect::<Result<Vec<AuthParams>, AuthError>>()?;
        auth_choices.sort_unstable();
        let auth_params = auth_choices.last().ok_or(AuthError::Unsupported)?;

        *self
            .last_auth_params
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(auth_params.clone());
        self.counter.store(1, atomic::Ordering::Relaxed);
        self.authenticate(uri, method)
            .transpose()
            .ok_or(AuthError::Unsupported)?
    }
}

fn parse_header(header: &str) -> Result<AuthParams, AuthError> {
    let str_params = split_header(header);

    let realm = find_string_value(&str_params, "realm").unwrap_or_default();
    let qop = find_string_value(&str_params, "qop")
        .unwrap_or_default()
        .split(',')
        .map(|s| match s.trim() {
            "" | "auth" => Ok(Qop::Auth),
            q => Err(AuthError::InvalidHeader(format!("unknown QoP directive: {q}"))),
        })
        .collect::<Result<Vec<Qop>, AuthError>>()?;
    let algorithm = match find_string_value(&str_params, "algorithm")
        .unwrap_or_default()
        .trim()
    {
        "" | "MD5" => Algorithm::Md5,
        "MD5-sess" => Algorithm::Md5Sess,
        a => return Err(AuthError::InvalidHeader(format!("unknown algorithm: {a}"))),
    };
    let nonce = find_string_value(&str_params, "nonce")
        .ok_or_else(|| AuthError::InvalidHeader("no nonce provided".to_string()))?;
    let opaque = find_string_value(&str_params, "opaque");

    Ok(AuthParams { realm, qop, algorithm, nonce, opaque })
}

fn split_header(header_str: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut last_split = 0;
    let mut char_iterator = header_str.char_indices().peekable();
    while let Some((i, c)) = char_iterator.next() {
        match c {
            '\'' => in_single_quote = !in_single_quote,
            '\"' => in_double_quote = !in_double_quote,
            ',' if !in_single_quote && !in_double_quote => {
                parts.push(header_str[last_split..i].trim_start_matches(',').trim());
                last_split = i;
            }
            _ => {}
        }
        if char_iterator.peek().is_none() {
            parts.push(header_str[last_split..].trim_start_matches(',').trim());
        }
    }
    parts
}

fn find_string_value(parts: &[&str], field: &'static str) -> Option<String> {
    parts.iter().find_map(|&p| {
        p.starts_with(field).then(|| {
            p.replace(&format!("{field}="), "")
                .trim_start_matches('\"')
                .trim_end_matches('\"')
                .to_string()
        })
    })
}

fn md5_str(input: String) -> String {
    let mut digest = Md5::new();
    digest.update(input.into_bytes());
    hex::encode(digest.finalize())
}

#[derive(Clone, PartialEq, Eq, Debug)]
struct AuthParams {
    realm: String,
    qop: Vec<Qop>,
    algorithm: Algorithm,
    nonce: String,
    opaque: Option<String>,
}

impl Ord for AuthParams {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.qop.iter().max().cmp(&other.qop.iter().max()) {
            Ordering::Equal => self.algorithm.cmp(&other.algorithm),
            ord => ord,
        }
    }
}

impl PartialOrd for AuthParams {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Quality-of-protection directives, best option last.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Display, Debug)]
#[strum(serialize_all = "kebab-case")]
enum Qop {
    Auth,
}

/// Digest algorithms, best option last.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Display, Debug)]
enum Algorithm {
    #[strum(serialize = "MD5")]
    Md5,
    #[strum(serialize = "MD5-sess")]
    Md5Sess,
}

impl Algorithm {
    fn is_sess(self) -> bool {
        matches!(self, Algorithm::Md5Sess)
    }
}

/// Digest authentication failures.
#[derive(Error, Debug)]
pub enum AuthError {
    /// No credentials configured for a daemon that demanded authentication.
    #[error("daemon requires authentication but none was configured")]
    Unauthorized,
    /// A `WWW-Authenticate` header could not be parsed.
    #[error("invalid WWW-Authenticate header: {0}")]
    InvalidHeader(String),
    /// The computed digest response could not be encoded as a header value.
    #[error("failed to construct AUTHORIZATION header: {0}")]
    HeaderConstruction(#[from] hyper::header::InvalidHeaderValue),
    /// The daemon offered no qop/algorithm this client understands.
    #[error("no supported authentication method offered")]
    Unsupported,
}

#[cfg(test)]
mod tests {
    use hyper::header::WWW_AUTHENTICATE;
    use hyper::{Method, Response, Uri};

    use super::AuthInfo;

    #[test]
    fn digest_auth_round_trip_builds_authorization_header() {
        let mut auth_info = AuthInfo::new("user".to_string(), "pass".to_string());
        let response = Response::builder()
            .header(
                WWW_AUTHENTICATE,
                "Digest qop=\"auth\",algorithm=MD5,realm=\"rpc\",nonce=\"abc123\"",
            )
            .body(())
            .expect("response body");
        let header = auth_info
            .authenticate_with_resp(
                &response,
                &Uri::from_static("https://daemon.local:18089/json_rpc"),
                &Method::POST,
            )
            .expect("digest header");
        let rendered = header.to_str().expect("ascii header");
        assert!(rendered.starts_with("Digest username=\"user\""));
        assert!(rendered.contains("nc=00000001"));
    }
}
