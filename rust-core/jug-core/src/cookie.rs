//! Cookie reading and `Set-Cookie` rendering, on top of the `cookie` crate.
//!
//! Values are query-escaped on the way out and unescaped on the way in.
//! Names must be tokens, and `Path`/`Domain` may not contain `;` or control
//! characters, so a caller-supplied attribute can never smuggle in another.

use crate::error::{Error, Result};
use crate::request::{query_escape, url_unescape};
use ::cookie::time::Duration;
use hyper::header::{HeaderMap, COOKIE};

/// `SameSite` attribute of a cookie
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    /// `SameSite=Lax`
    Lax,
    /// `SameSite=Strict`
    Strict,
    /// `SameSite=None`
    None,
}

impl From<SameSite> for ::cookie::SameSite {
    fn from(same_site: SameSite) -> Self {
        match same_site {
            SameSite::Lax => Self::Lax,
            SameSite::Strict => Self::Strict,
            SameSite::None => Self::None,
        }
    }
}

/// A cookie to send with [`Context::set_cookie`](crate::Context::set_cookie).
///
/// `max_age` follows the usual convention: `0` omits the attribute, a
/// negative value expires the cookie immediately (`Max-Age=0`), a positive
/// value is the lifetime in seconds. An empty `path` becomes `/`.
#[derive(Debug, Clone, Default)]
pub struct Cookie {
    /// Cookie name
    pub name: String,
    /// Cookie value, escaped when rendered
    pub value: String,
    /// Lifetime in seconds
    pub max_age: i64,
    /// `Path` attribute
    pub path: String,
    /// `Domain` attribute
    pub domain: String,
    /// `Secure` flag
    pub secure: bool,
    /// `HttpOnly` flag
    pub http_only: bool,
    /// `SameSite` attribute
    pub same_site: Option<SameSite>,
}

impl Cookie {
    /// A cookie with default attributes
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Self::default()
        }
    }

    /// Render as a `Set-Cookie` header value
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidCookie` when the name is not a token or the
    /// path or domain contains `;` or a control character.
    pub fn to_header_value(&self) -> Result<String> {
        let invalid = |reason| Error::InvalidCookie {
            name: self.name.clone(),
            reason,
        };
        if !is_token(&self.name) {
            return Err(invalid("name is not a token"));
        }
        if !is_attribute_value(&self.path) {
            return Err(invalid("path contains a forbidden character"));
        }
        if !is_attribute_value(&self.domain) {
            return Err(invalid("domain contains a forbidden character"));
        }

        let path = if self.path.is_empty() { "/" } else { self.path.as_str() };
        let mut builder = ::cookie::Cookie::build((self.name.as_str(), query_escape(&self.value)))
            .path(path)
            .http_only(self.http_only)
            .secure(self.secure);
        if !self.domain.is_empty() {
            builder = builder.domain(self.domain.as_str());
        }
        if self.max_age != 0 {
            builder = builder.max_age(Duration::seconds(self.max_age.max(0)));
        }
        if let Some(same_site) = self.same_site {
            builder = builder.same_site(same_site.into());
        }
        Ok(builder.build().to_string())
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={}".contains(&b))
}

fn is_attribute_value(s: &str) -> bool {
    !s.chars().any(|c| c == ';' || c.is_control())
}

/// Find the first cookie called `name` across all `Cookie` headers.
///
/// Surrounding double quotes are stripped and the value is unescaped; a
/// value with a broken escape is returned as sent.
pub(crate) fn find_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(::cookie::Cookie::split_parse)
        .filter_map(std::result::Result::ok)
        .find(|cookie| cookie.name() == name)
        .map(|cookie| {
            let value = cookie.value();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            url_unescape(value).unwrap_or_else(|| value.to_string())
        })
}
