//! Client side protocol rules, mirrored pairs of request and response
//! processors.

use http::{
    header::{HeaderValue, CONNECTION, CONTENT_LENGTH, EXPECT, HOST, TRANSFER_ENCODING, USER_AGENT},
    request, response, Method, Version,
};

use super::{ExchangeContext, HttpProcessor};
use crate::{
    error::{Result, TransportError},
    pipeline::RequestBody,
    route::Route,
};

fn header_has_token(head_headers: &http::HeaderMap, name: http::header::HeaderName, token: &str) -> bool {
    head_headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Derives message framing headers from the request body. A message that
/// already carries `Content-Length` or `Transfer-Encoding` is rejected so
/// framing always matches what will actually be written.
pub struct RequestContent;

impl HttpProcessor for RequestContent {
    fn process_request(
        &self,
        head: &mut request::Parts,
        body: &RequestBody,
        _cx: &mut ExchangeContext,
    ) -> Result<()> {
        if head.headers.contains_key(CONTENT_LENGTH) || head.headers.contains_key(TRANSFER_ENCODING)
        {
            return Err(TransportError::Framing(
                "content framing headers are managed by the transport".into(),
            ));
        }
        match body {
            RequestBody::None => {
                if matches!(head.method, Method::POST | Method::PUT | Method::PATCH) {
                    head.headers.insert(CONTENT_LENGTH, HeaderValue::from(0usize));
                }
            }
            RequestBody::Fixed(bytes) => {
                head.headers
                    .insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            }
            RequestBody::Chunked(_) => {
                if head.version == Version::HTTP_10 {
                    return Err(TransportError::Framing(
                        "chunked transfer coding requires http/1.1".into(),
                    ));
                }
                head.headers
                    .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            }
        }
        Ok(())
    }
}

/// Fills in the `Host` header from the request target when absent.
pub struct RequestTargetHost;

impl HttpProcessor for RequestTargetHost {
    fn process_request(
        &self,
        head: &mut request::Parts,
        _body: &RequestBody,
        _cx: &mut ExchangeContext,
    ) -> Result<()> {
        if head.headers.contains_key(HOST) {
            return Ok(());
        }
        let route = Route::try_from(&head.uri)?;
        let value = HeaderValue::from_str(&route.authority())
            .map_err(|_| TransportError::Framing("target host is not a valid header value".into()))?;
        head.headers.insert(HOST, value);
        Ok(())
    }
}

/// Maintains the `Connection` header and records the caller's keep-alive
/// intent in the exchange context.
pub struct RequestConnControl;

impl HttpProcessor for RequestConnControl {
    fn process_request(
        &self,
        head: &mut request::Parts,
        _body: &RequestBody,
        cx: &mut ExchangeContext,
    ) -> Result<()> {
        if header_has_token(&head.headers, CONNECTION, "close") {
            cx.set_reuse(false);
            return Ok(());
        }
        if !head.headers.contains_key(CONNECTION) {
            if !cx.reuse() {
                head.headers
                    .insert(CONNECTION, HeaderValue::from_static("close"));
            } else if head.version == Version::HTTP_10 {
                head.headers
                    .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
            }
        }
        Ok(())
    }
}

/// Adds a `User-Agent` header when the request does not carry one.
pub struct RequestUserAgent {
    agent: HeaderValue,
}

impl RequestUserAgent {
    pub fn new(agent: HeaderValue) -> Self {
        Self { agent }
    }
}

impl Default for RequestUserAgent {
    fn default() -> Self {
        Self {
            agent: HeaderValue::from_static(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            )),
        }
    }
}

impl HttpProcessor for RequestUserAgent {
    fn process_request(
        &self,
        head: &mut request::Parts,
        _body: &RequestBody,
        _cx: &mut ExchangeContext,
    ) -> Result<()> {
        if !head.headers.contains_key(USER_AGENT) {
            head.headers.insert(USER_AGENT, self.agent.clone());
        }
        Ok(())
    }
}

/// Adds `Expect: 100-continue` for requests with a body. Not part of the
/// default chain: deferring body transmission serializes a pipeline, so this
/// is strictly opt in.
pub struct RequestExpectContinue;

impl HttpProcessor for RequestExpectContinue {
    fn process_request(
        &self,
        head: &mut request::Parts,
        body: &RequestBody,
        _cx: &mut ExchangeContext,
    ) -> Result<()> {
        if matches!(body, RequestBody::None) || head.version == Version::HTTP_10 {
            return Ok(());
        }
        if !head.headers.contains_key(EXPECT) {
            head.headers
                .insert(EXPECT, HeaderValue::from_static("100-continue"));
        }
        Ok(())
    }
}

/// Clears the reuse intent when the server signalled it will close the
/// connection after this response.
pub struct ResponseConnControl;

impl HttpProcessor for ResponseConnControl {
    fn process_response(&self, head: &response::Parts, cx: &mut ExchangeContext) -> Result<()> {
        if header_has_token(&head.headers, CONNECTION, "close") {
            cx.set_reuse(false);
        } else if head.version == Version::HTTP_10
            && !header_has_token(&head.headers, CONNECTION, "keep-alive")
        {
            cx.set_reuse(false);
        }
        Ok(())
    }
}
