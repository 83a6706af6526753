use reqwest::{StatusCode, Url};
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// A page or image could not be retrieved.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP {status} for {url}")]
    Status { url: Url, status: StatusCode },

    #[error("request for {url} failed after {attempts} attempt(s)")]
    Network {
        url: Url,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("cache access failed")]
    Cache(#[from] easy_error::Error),
}

impl FetchError {
    /// Whether another attempt might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            FetchError::Network { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            FetchError::Cache(_) => false,
        }
    }
}

/// A fetched page did not have the structure of a post.
#[derive(Error, Debug)]
#[error("could not extract post from {url}: {reason}")]
pub struct ExtractionFailure {
    pub url: Url,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum CollectError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("no links found on {0}")]
    NoLinks(Url),

    #[error("could not read URL list")]
    File(#[source] easy_error::Error),
}

#[derive(Error, Debug)]
pub enum ImageProcessingError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("unsupported image format for {0}")]
    Unsupported(Url),

    #[error("could not decode {url}")]
    Decode {
        url: Url,
        #[source]
        source: image::ImageError,
    },

    #[error("could not encode {url}")]
    Encode {
        url: Url,
        #[source]
        source: image::ImageError,
    },
}

#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error("no posts left to put into the book")]
    NoPosts,

    #[error("could not build ebook: {0}")]
    Epub(String),

    #[error("could not write {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("converter {0:?} not found on PATH")]
    Missing(String),

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("could not run converter")]
    Io(#[from] std::io::Error),
}

/// Errors that abort the whole run.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cache setup failed")]
    Cache(#[source] easy_error::Error),

    #[error("could not collect post URLs")]
    Collect(#[from] CollectError),

    #[error("no post URLs were collected")]
    NothingCollected,

    #[error("could not create HTTP client")]
    Client(#[source] reqwest::Error),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),
}
