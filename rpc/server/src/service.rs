//! Typed service and method registration.
//!
//! A [`Service`] is a named bundle of async methods. Methods are registered
//! with their concrete argument and reply types; registration erases them
//! behind a dispatch table that decodes the argument from the connection's
//! content type, invokes the handler, and encodes the reply. Handlers have
//! the shape `Fn(Args) -> Future<Result<Reply, BoxError>>`.
//!
//! # Example
//!
//! ```
//! use rpc_server::Service;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args { num1: i32, num2: i32 }
//!
//! let service = Service::builder("Arith")
//!     .method("Sum", |args: Args| async move {
//!         Ok(args.num1 + args.num2)
//!     })
//!     .build();
//! assert_eq!(service.name(), "Arith");
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use protocol_wire::ContentType;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type handlers may return; surfaced verbatim in the response header.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure modes of a single method invocation.
#[derive(Debug, thiserror::Error)]
pub enum MethodError {
    #[error("reading body: {0}")]
    DecodeArgs(String),
    #[error("encoding reply: {0}")]
    EncodeReply(String),
    #[error("{0}")]
    Handler(String),
}

/// Type-erased method: decode args, invoke, encode reply.
#[async_trait]
pub(crate) trait ErasedMethod: Send + Sync {
    async fn call(&self, content_type: ContentType, argv: Bytes) -> Result<Bytes, MethodError>;
    fn num_calls(&self) -> u64;
}

struct TypedMethod<A, R, F> {
    handler: F,
    num_calls: AtomicU64,
    _types: PhantomData<fn(A) -> R>,
}

#[async_trait]
impl<A, R, F, Fut> ErasedMethod for TypedMethod<A, R, F>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, BoxError>> + Send,
{
    async fn call(&self, content_type: ContentType, argv: Bytes) -> Result<Bytes, MethodError> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        let args: A = content_type
            .decode(&argv)
            .map_err(|e| MethodError::DecodeArgs(e.to_string()))?;
        let reply = (self.handler)(args)
            .await
            .map_err(|e| MethodError::Handler(e.to_string()))?;
        let body = content_type
            .encode(&reply)
            .map_err(|e| MethodError::EncodeReply(e.to_string()))?;
        Ok(Bytes::from(body))
    }

    fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }
}

/// A named bundle of callable methods.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<dyn ErasedMethod>>,
}

impl Service {
    /// Start building a service. The name is the left half of the
    /// `Service.Method` strings clients send.
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn method(&self, name: &str) -> Option<&Arc<dyn ErasedMethod>> {
        self.methods.get(name)
    }

    /// Method names with their call counts, sorted by name.
    pub fn method_stats(&self) -> Vec<(String, u64)> {
        let mut stats: Vec<_> = self
            .methods
            .iter()
            .map(|(name, m)| (name.clone(), m.num_calls()))
            .collect();
        stats.sort();
        stats
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods.len())
            .finish()
    }
}

pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, Arc<dyn ErasedMethod>>,
}

impl ServiceBuilder {
    /// Register a method.
    ///
    /// Re-registering a name replaces the earlier handler; services are
    /// built once at startup, so this is a programming convenience rather
    /// than a runtime feature.
    pub fn method<A, R, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
    {
        self.methods.insert(
            name.into(),
            Arc::new(TypedMethod {
                handler,
                num_calls: AtomicU64::new(0),
                _types: PhantomData,
            }),
        );
        self
    }

    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Args {
        num1: i32,
        num2: i32,
    }

    fn arith() -> Service {
        Service::builder("Arith")
            .method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) })
            .method("Div", |args: Args| async move {
                if args.num2 == 0 {
                    return Err("divide by zero".into());
                }
                Ok(args.num1 / args.num2)
            })
            .build()
    }

    #[tokio::test]
    async fn dispatch_decodes_invokes_and_encodes() {
        let service = arith();
        let ct = ContentType::Bincode;
        let argv = Bytes::from(ct.encode(&Args { num1: 3, num2: 4 }).unwrap());
        let reply = service.method("Sum").unwrap().call(ct, argv).await.unwrap();
        let sum: i32 = ct.decode(&reply).unwrap();
        assert_eq!(sum, 7);
    }

    #[tokio::test]
    async fn handler_errors_surface_with_their_message() {
        let service = arith();
        let ct = ContentType::Json;
        let argv = Bytes::from(ct.encode(&Args { num1: 1, num2: 0 }).unwrap());
        let err = service
            .method("Div")
            .unwrap()
            .call(ct, argv)
            .await
            .unwrap_err();
        assert!(matches!(err, MethodError::Handler(ref m) if m == "divide by zero"));
    }

    #[tokio::test]
    async fn undecodable_args_are_a_decode_error() {
        let service = arith();
        let err = service
            .method("Sum")
            .unwrap()
            .call(ContentType::Json, Bytes::from_static(b"gibberish"))
            .await
            .unwrap_err();
        assert!(matches!(err, MethodError::DecodeArgs(_)));
    }

    #[tokio::test]
    async fn call_counts_accumulate() {
        let service = arith();
        let ct = ContentType::Bincode;
        for _ in 0..3 {
            let argv = Bytes::from(ct.encode(&Args { num1: 1, num2: 1 }).unwrap());
            service.method("Sum").unwrap().call(ct, argv).await.unwrap();
        }
        assert_eq!(
            service.method_stats(),
            vec![("Div".to_string(), 0), ("Sum".to_string(), 3)]
        );
    }

    #[test]
    fn unknown_method_lookup_fails() {
        assert!(arith().method("Mul").is_none());
    }
}
