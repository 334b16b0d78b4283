use std::fmt;
use std::fs::DirBuilder;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Local-domain address of a dispatch service.
///
/// Two spellings are accepted: an absolute filesystem path (`/run/app.sock`)
/// and, on Linux, an abstract-namespace name prefixed with `@`
/// (`@app-service`). Abstract sockets have no filesystem presence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum ServiceEndpoint {
    /// Socket bound to a path on the filesystem.
    Path(Utf8PathBuf),
    /// Socket bound in the Linux abstract namespace.
    Abstract(String),
}

impl ServiceEndpoint {
    /// Builds a filesystem endpoint.
    #[must_use]
    pub fn path(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Path(path.into())
    }

    /// Builds an abstract-namespace endpoint. The name excludes the `@`.
    #[must_use]
    pub fn abstract_name(name: impl Into<String>) -> Self {
        Self::Abstract(name.into())
    }

    /// Returns the filesystem path when the endpoint has one.
    #[must_use]
    pub fn filesystem_path(&self) -> Option<&Utf8Path> {
        match self {
            Self::Path(path) => Some(path.as_ref()),
            Self::Abstract(_) => None,
        }
    }

    /// Ensures the socket's parent directory exists with restrictive permissions.
    pub fn prepare_filesystem(&self) -> Result<(), EndpointPreparationError> {
        let Some(path) = self.filesystem_path() else {
            return Ok(());
        };
        let Some(parent) = path.parent() else {
            return Err(EndpointPreparationError::MissingParent {
                path: path.to_path_buf(),
            });
        };

        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }

        if let Err(source) = builder.create(parent.as_std_path())
            && source.kind() != std::io::ErrorKind::AlreadyExists
        {
            return Err(EndpointPreparationError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            });
        }

        Ok(())
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(formatter, "{path}"),
            Self::Abstract(name) => write!(formatter, "@{name}"),
        }
    }
}

impl FromStr for ServiceEndpoint {
    type Err = EndpointParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.len() < 2 {
            return Err(EndpointParseError::TooShort(input.to_owned()));
        }
        if let Some(name) = input.strip_prefix('@') {
            return Ok(Self::abstract_name(name));
        }
        if input.starts_with('/') {
            return Ok(Self::path(input));
        }
        Err(EndpointParseError::NotAbsolute(input.to_owned()))
    }
}

impl TryFrom<String> for ServiceEndpoint {
    type Error = EndpointParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServiceEndpoint> for String {
    fn from(endpoint: ServiceEndpoint) -> Self {
        endpoint.to_string()
    }
}

/// Errors encountered while parsing a [`ServiceEndpoint`] from text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointParseError {
    /// The service name was empty or a bare prefix.
    #[error("service name '{0}' is too short")]
    TooShort(String),
    /// Neither an absolute path nor an `@`-prefixed abstract name.
    #[error("service '{0}' must be an absolute path or an @abstract name")]
    NotAbsolute(String),
}

/// Errors raised when preparing socket directories.
#[derive(Debug, Error)]
pub enum EndpointPreparationError {
    /// Parent directory is missing when creating a socket path.
    #[error("socket path '{path}' has no parent directory")]
    MissingParent { path: Utf8PathBuf },
    /// Failed to create or adjust socket directories.
    #[error("failed to create socket directory '{path}': {source}")]
    CreateDirectory {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}
