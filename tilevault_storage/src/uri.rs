use std::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The scheme assumed for URIs given as plain paths.
pub const DEFAULT_SCHEME: &str = "file";

/// An invalid URI.
#[derive(Debug, Error)]
#[error("invalid URI: {0}")]
pub struct UriError(String);

/// A resource location, such as an array directory or an attribute file.
///
/// A URI is either `<scheme>://<path>` or a plain path, in which case the
/// `file` scheme is assumed. Trailing slashes are stripped on construction,
/// so equal locations compare equal.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    /// Create a new URI.
    ///
    /// # Errors
    /// Returns a [`UriError`] if `uri` is empty or has an empty path.
    pub fn new(uri: impl Into<String>) -> Result<Self, UriError> {
        let mut uri: String = uri.into();
        while uri.len() > 1 && uri.ends_with('/') && !uri.ends_with("://") {
            uri.pop();
        }
        if uri.is_empty() || uri.ends_with("://") {
            return Err(UriError(uri));
        }
        Ok(Self(uri))
    }

    /// The URI as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The URI scheme, e.g. `file` or `mem`.
    ///
    /// Plain paths report [`DEFAULT_SCHEME`].
    #[must_use]
    pub fn scheme(&self) -> &str {
        match self.0.find("://") {
            Some(pos) => &self.0[..pos],
            None => DEFAULT_SCHEME,
        }
    }

    /// The path component, without the scheme prefix.
    #[must_use]
    pub fn path(&self) -> &str {
        match self.0.find("://") {
            Some(pos) => &self.0[pos + 3..],
            None => &self.0,
        }
    }

    /// Append a path segment.
    #[must_use]
    pub fn join(&self, segment: &str) -> Self {
        let segment = segment.trim_matches('/');
        if self.0.ends_with('/') {
            Self(format!("{}{segment}", self.0))
        } else {
            Self(format!("{}/{segment}", self.0))
        }
    }

    /// The URI with the final path segment removed, if there is one.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let path = self.path();
        let cut = path.rfind('/')?;
        if cut == 0 && self.0.find("://").is_none() {
            // Parent of a top-level absolute path is the root.
            return if path.len() > 1 {
                Some(Self("/".to_string()))
            } else {
                None
            };
        }
        let keep = self.0.len() - (path.len() - cut);
        let parent = &self.0[..keep];
        if parent.ends_with("://") {
            None
        } else {
            Some(Self(parent.to_string()))
        }
    }

    /// The final path segment.
    #[must_use]
    pub fn last_path_part(&self) -> &str {
        let path = self.path();
        match path.rfind('/') {
            Some(pos) => &path[pos + 1..],
            None => path,
        }
    }
}

impl Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for Uri {
    type Error = UriError;
    fn try_from(uri: &str) -> Result<Self, Self::Error> {
        Self::new(uri)
    }
}
