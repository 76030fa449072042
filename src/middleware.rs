use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::{header, StatusCode},
    Error, HttpResponse, ResponseError,
};
use futures::future::LocalBoxFuture;
use std::future::{ready, Ready};
use std::rc::Rc;
use subtle::ConstantTimeEq;

use crate::protocol::{ErrorDetail, ErrorResponse};

const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing or malformed Authorization header")]
    Missing,
    #[error("invalid API key")]
    Invalid,
}

impl ResponseError for AuthError {
    fn status_code(&self) -> StatusCode {
        match self {
            AuthError::Missing => StatusCode::UNAUTHORIZED,
            AuthError::Invalid => StatusCode::FORBIDDEN,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: ErrorDetail {
                message: self.to_string(),
                error_type: "authentication_error".to_string(),
                param: None,
                code: None,
            },
        })
    }
}

/// Check a raw `Authorization` header value against the expected key.
pub fn check_bearer(value: Option<&header::HeaderValue>, expected: &str) -> Result<(), AuthError> {
    let token = value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(BEARER_PREFIX))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::Missing)?;

    if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(AuthError::Invalid)
    }
}

/// Middleware requiring `Authorization: Bearer <key>` on every route.
/// With no key configured every request passes.
#[derive(Clone)]
pub struct ApiKeyAuth {
    api_key: Option<Rc<str>>,
}

impl ApiKeyAuth {
    pub fn new(api_key: Option<&str>) -> Self {
        Self {
            api_key: api_key.map(Rc::from),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for ApiKeyAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = ApiKeyAuthService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ApiKeyAuthService {
            service,
            api_key: self.api_key.clone(),
        }))
    }
}

pub struct ApiKeyAuthService<S> {
    service: S,
    api_key: Option<Rc<str>>,
}

impl<S, B> Service<ServiceRequest> for ApiKeyAuthService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        if let Some(expected) = &self.api_key {
            if let Err(e) = check_bearer(req.headers().get(header::AUTHORIZATION), expected) {
                log::warn!("Rejected {} {}: {}", req.method(), req.path(), e);
                let response = e.error_response().map_into_right_body();
                return Box::pin(async move { Ok(req.into_response(response)) });
            }
        }

        let fut = self.service.call(req);
        Box::pin(async move { Ok(fut.await?.map_into_left_body()) })
    }
}
