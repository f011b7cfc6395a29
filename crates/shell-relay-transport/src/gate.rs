//! Hook point for the upstream authentication layer.
//!
//! The relay does no authentication itself. A gate only reads an identity
//! that something in front of the relay already validated.

use async_trait::async_trait;
use axum::{
    http::{HeaderMap, HeaderName, StatusCode, header::InvalidHeaderName},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Who a connection belongs to, as vouched for upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// Subject name; `None` for anonymous connections.
    pub subject: Option<String>,
}

impl Identity {
    /// An anonymous identity.
    #[must_use]
    pub const fn anonymous() -> Self {
        Self { subject: None }
    }

    /// A named identity.
    #[must_use]
    pub fn named(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
        }
    }
}

/// A connection was refused before upgrade.
#[derive(Debug, Error)]
pub enum GateRejection {
    #[error("Missing identity header: {0}")]
    MissingIdentity(HeaderName),
    #[error("Identity header is not valid UTF-8: {0}")]
    InvalidIdentity(HeaderName),
}

impl IntoResponse for GateRejection {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self, "Connection rejected by gate");
        (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
    }
}

/// Decides whether a connection may reach the relay.
///
/// Implement this trait to plug in your upstream identity source.
#[async_trait]
pub trait ConnectionGate: Send + Sync {
    /// Admit or reject a connection based on its upgrade request headers.
    async fn admit(&self, headers: &HeaderMap) -> Result<Identity, GateRejection>;
}

/// Admits every connection anonymously.
#[derive(Debug, Default, Clone)]
pub struct AllowAll;

#[async_trait]
impl ConnectionGate for AllowAll {
    async fn admit(&self, _headers: &HeaderMap) -> Result<Identity, GateRejection> {
        Ok(Identity::anonymous())
    }
}

/// Reads an identity that a reverse proxy has already validated.
#[derive(Debug, Clone)]
pub struct TrustedHeader {
    header: HeaderName,
}

impl TrustedHeader {
    /// Trust the value of `header`.
    ///
    /// # Errors
    /// Returns error if `header` is not a valid header name.
    pub fn new(header: &str) -> Result<Self, InvalidHeaderName> {
        Ok(Self {
            header: HeaderName::try_from(header)?,
        })
    }
}

#[async_trait]
impl ConnectionGate for TrustedHeader {
    async fn admit(&self, headers: &HeaderMap) -> Result<Identity, GateRejection> {
        let value = headers
            .get(&self.header)
            .ok_or_else(|| GateRejection::MissingIdentity(self.header.clone()))?;
        let subject = value
            .to_str()
            .map_err(|_| GateRejection::InvalidIdentity(self.header.clone()))?
            .trim();
        if subject.is_empty() {
            return Err(GateRejection::MissingIdentity(self.header.clone()));
        }
        Ok(Identity::named(subject))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[tokio::test]
    async fn allow_all_is_anonymous() {
        let identity = AllowAll.admit(&HeaderMap::new()).await.unwrap();
        assert_eq!(identity, Identity::anonymous());
    }

    #[tokio::test]
    async fn trusted_header_reads_subject() {
        let gate = TrustedHeader::new("x-forwarded-user").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-user", HeaderValue::from_static(" alice "));

        let identity = gate.admit(&headers).await.unwrap();
        assert_eq!(identity, Identity::named("alice"));
    }

    #[tokio::test]
    async fn trusted_header_rejects_missing_or_blank() {
        let gate = TrustedHeader::new("x-forwarded-user").unwrap();
        let err = tokio_test::assert_err!(gate.admit(&HeaderMap::new()).await);
        assert!(matches!(err, GateRejection::MissingIdentity(_)));

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-user", HeaderValue::from_static("  "));
        assert!(gate.admit(&headers).await.is_err());
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        assert!(TrustedHeader::new("bad header").is_err());
    }
}
