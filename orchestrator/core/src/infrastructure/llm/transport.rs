// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Provider connection pool and HTTP error mapping.
//
// One ProviderPool per configured provider, shared by every request and every
// stage that targets it. The semaphore is the concurrent-call ceiling. After
// any failed call the HTTP client is rebuilt so the next attempt opens a fresh
// connection instead of reusing one from the failed exchange.

use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::domain::llm::LLMError;
use crate::domain::provider::ConfigurationError;

pub struct ProviderPool {
    name: String,
    max_concurrent: usize,
    permits: Arc<Semaphore>,
    client: RwLock<reqwest::Client>,
}

impl ProviderPool {
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Result<Self, ConfigurationError> {
        let name = name.into();
        let client = build_client().map_err(|e| ConfigurationError::ProviderInit {
            provider: name.clone(),
            detail: e.to_string(),
        })?;

        Ok(Self {
            name,
            max_concurrent,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            client: RwLock::new(client),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    /// Run one outbound call under a concurrency permit.
    pub async fn run<T, F, Fut>(&self, call: F) -> Result<T, LLMError>
    where
        F: FnOnce(reqwest::Client) -> Fut,
        Fut: Future<Output = Result<T, LLMError>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LLMError::Network(format!("provider pool '{}' is closed", self.name)))?;

        let client = self.client.read().clone();
        let result = call(client).await;
        if result.is_err() {
            self.reset();
        }
        result
    }

    /// Drop pooled connections by swapping in a fresh client.
    pub fn reset(&self) {
        match build_client() {
            Ok(client) => {
                *self.client.write() = client;
                debug!(provider = %self.name, "Provider connections reset");
            }
            Err(e) => warn!(provider = %self.name, error = %e, "Failed to rebuild HTTP client"),
        }
    }
}

fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
}

/// Map a transport-level reqwest failure.
pub fn transport_error(err: reqwest::Error) -> LLMError {
    if err.is_timeout() {
        LLMError::Timeout(Duration::ZERO)
    } else if err.is_builder() {
        LLMError::MalformedRequest(err.to_string())
    } else if err.is_decode() {
        LLMError::InvalidResponse(err.to_string())
    } else {
        LLMError::Network(err.to_string())
    }
}

/// Map a non-success HTTP status and its body.
pub fn classify_status(status: u16, body: &str, model: &str) -> LLMError {
    match status {
        401 | 403 => LLMError::Authentication(body.to_string()),
        404 => LLMError::ModelNotFound(model.to_string()),
        408 | 504 => LLMError::Timeout(Duration::ZERO),
        429 => LLMError::RateLimit(body.to_string()),
        400 | 422 if mentions_parameter(body) => LLMError::InvalidParameter(body.to_string()),
        400..=499 => LLMError::MalformedRequest(format!("HTTP {status}: {body}")),
        _ => LLMError::Server {
            status,
            message: body.to_string(),
        },
    }
}

fn mentions_parameter(body: &str) -> bool {
    let body = body.to_ascii_lowercase();
    ["temperature", "reasoning", "parameter", "unsupported", "thinking"]
        .iter()
        .any(|needle| body.contains(needle))
}

/// Read the body of a failed response and classify it.
pub async fn error_from_response(response: reqwest::Response, model: &str) -> LLMError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, &body, model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::llm::ErrorClass;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(classify_status(401, "", "m"), LLMError::Authentication(_)));
        assert!(matches!(classify_status(404, "", "gpt-x"), LLMError::ModelNotFound(m) if m == "gpt-x"));
        assert!(matches!(classify_status(429, "", "m"), LLMError::RateLimit(_)));
        assert!(matches!(classify_status(504, "", "m"), LLMError::Timeout(_)));
        assert!(matches!(classify_status(529, "overloaded", "m"), LLMError::Server { status: 529, .. }));
        assert!(matches!(
            classify_status(400, r#"{"error":"Unsupported value: 'temperature'"}"#, "m"),
            LLMError::InvalidParameter(_)
        ));
        assert!(matches!(classify_status(400, "bad json", "m"), LLMError::MalformedRequest(_)));

        assert_eq!(classify_status(503, "", "m").class(), ErrorClass::Retryable);
        assert_eq!(classify_status(422, "parameter x", "m").class(), ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_pool_enforces_ceiling() {
        let pool = Arc::new(ProviderPool::new("test", 2).unwrap());
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        let mut handles = Vec::new();
        for _ in 0..2 {
            let pool = pool.clone();
            let mut rx = release_rx.clone();
            handles.push(tokio::spawn(async move {
                pool.run(|_client| async move {
                    let _ = rx.wait_for(|released| *released).await;
                    Ok::<_, LLMError>(())
                })
                .await
            }));
        }

        while pool.in_flight() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.in_flight(), 2);

        release_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(pool.in_flight(), 0);
    }
}
