// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A `tower` layer marking every request that arrives on the admin
//! listener, so a downstream auth interceptor can treat the caller as a
//! superuser. The interceptor itself is out of scope here; this only
//! attaches the marker requests are expected to carry.

use std::task::{Context, Poll};

use http::Request;
use tower::{Layer, Service};

/// Marker inserted into the request extensions of every call received on
/// the admin listener.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdminRequest;

/// `tower::Layer` that wraps a service with [`AdminTagService`].
#[derive(Clone, Copy, Default)]
pub struct AdminTagLayer;

impl<S> Layer<S> for AdminTagLayer {
    type Service = AdminTagService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdminTagService { inner }
    }
}

/// Inserts [`AdminRequest`] into each request's extensions before passing it
/// on, unconditionally.
#[derive(Clone)]
pub struct AdminTagService<S> {
    inner: S,
}

impl<S, B> Service<Request<B>> for AdminTagService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        req.extensions_mut().insert(AdminRequest);
        self.inner.call(req)
    }
}
