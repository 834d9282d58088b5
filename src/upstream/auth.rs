use base64::{Engine, prelude::BASE64_STANDARD};
use n0_error::e;

use crate::error::UpstreamError;

/// Version byte of the RFC 1929 username/password sub-negotiation.
pub(crate) const USERPASS_VERSION: u8 = 0x01;

/// Username and password presented to the upstream proxy.
///
/// Either part may be empty. Credentials are only sent when at least one
/// part is non-empty.
#[derive(Clone, Default, PartialEq, Eq, derive_more::Debug)]
pub struct Credentials {
    username: String,
    #[debug("***")]
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns true if neither username nor password is set.
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }

    /// Returns the `Proxy-Authorization` header value, or `None` without credentials.
    pub fn basic_auth_header(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let encoded = BASE64_STANDARD.encode(format!("{}:{}", self.username, self.password));
        Some(format!("Basic {encoded}"))
    }

    /// Encodes the RFC 1929 request: `VER ULEN UNAME PLEN PASSWD`.
    ///
    /// Fails if either part exceeds 255 bytes.
    pub fn userpass_request(&self) -> Result<Vec<u8>, UpstreamError> {
        let user = self.username.as_bytes();
        let pass = self.password.as_bytes();
        let user_len = length_prefix(user, "username")?;
        let pass_len = length_prefix(pass, "password")?;
        let mut frame = Vec::with_capacity(3 + user.len() + pass.len());
        frame.push(USERPASS_VERSION);
        frame.push(user_len);
        frame.extend_from_slice(user);
        frame.push(pass_len);
        frame.extend_from_slice(pass);
        Ok(frame)
    }

    /// Checks that both parts fit in a one-byte length prefix.
    pub(crate) fn check_userpass_len(&self) -> Result<(), UpstreamError> {
        length_prefix(self.username.as_bytes(), "username")?;
        length_prefix(self.password.as_bytes(), "password")?;
        Ok(())
    }
}

fn length_prefix(field: &[u8], name: &str) -> Result<u8, UpstreamError> {
    u8::try_from(field.len()).map_err(|_| {
        e!(UpstreamError::Credentials {
            message: format!("{name} is {} bytes, at most 255 allowed", field.len())
        })
    })
}
