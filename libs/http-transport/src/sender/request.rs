use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::Request;

use super::multipart::{MultipartBuilder, MultipartKind, MultipartPart};
use crate::body::RequestBody;
use crate::config::{HttpMethod, PostType};
use crate::endpoint::Endpoint;
use crate::error::HttpError;

/// How a message and its parameters become a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BodyStrategy {
    /// No entity; parameters go to the query string (GET)
    Query,
    /// No entity and no parameters; only the configured URL (HEAD, DELETE)
    Bare,
    /// Message text with the parameters appended as `&name=value`
    Raw,
    /// Message bytes unchanged; parameters are not sent
    Binary,
    /// Optional message field plus parameters as a url-encoded form
    UrlEncoded,
    Multipart(MultipartKind),
}

impl BodyStrategy {
    pub(super) fn select(method: HttpMethod, post_type: PostType) -> Self {
        match method {
            HttpMethod::Get => return Self::Query,
            HttpMethod::Head | HttpMethod::Delete => return Self::Bare,
            _ => {}
        }
        match post_type {
            PostType::Raw => Self::Raw,
            PostType::Binary => Self::Binary,
            PostType::Urlencoded => Self::UrlEncoded,
            PostType::Formdata => Self::Multipart(MultipartKind::FormData),
            PostType::Mtom => Self::Multipart(MultipartKind::Mtom),
        }
    }
}

/// Inputs for one outgoing message.
pub(super) struct RequestPlan<'a> {
    pub(super) method: HttpMethod,
    pub(super) strategy: BodyStrategy,
    pub(super) endpoint: &'a Endpoint,
    pub(super) content_type: Option<&'a HeaderValue>,
    pub(super) charset: &'a str,
    pub(super) first_body_part_name: Option<&'a str>,
    /// Request parameters, already stripped of header and url parameters
    pub(super) params: &'a [(String, String)],
    pub(super) parts: &'a [MultipartPart],
    /// Replace any header of the same name
    pub(super) headers: Vec<(HeaderName, HeaderValue)>,
}

impl RequestPlan<'_> {
    pub(super) fn build(self, message: Bytes) -> Result<Request<RequestBody>, HttpError> {
        let (endpoint, content_type, body) = self.entity(message)?;

        let mut request = Request::builder()
            .method(self.method.as_method())
            .uri(endpoint.as_uri().clone())
            .body(body)?;
        let headers = request.headers_mut();
        if let Some(content_type) = content_type {
            headers.insert(CONTENT_TYPE, content_type);
        }
        for (name, value) in self.headers {
            headers.insert(name, value);
        }

        tracing::debug!(
            method = %request.method(),
            uri = %request.uri(),
            strategy = ?self.strategy,
            "built request"
        );
        Ok(request)
    }

    fn ignore_params(&self) {
        if !self.params.is_empty() {
            tracing::debug!(
                count = self.params.len(),
                strategy = ?self.strategy,
                "request parameters are not sent with this method and post type"
            );
        }
    }

    /// Target, content type and body for the selected strategy.
    fn entity(
        &self,
        message: Bytes,
    ) -> Result<(Endpoint, Option<HeaderValue>, RequestBody), HttpError> {
        Ok(match self.strategy {
            BodyStrategy::Query => (
                self.endpoint.with_query(self.params)?,
                self.content_type.cloned(),
                RequestBody::empty(),
            ),
            BodyStrategy::Bare => {
                self.ignore_params();
                let content_type = if self.method == HttpMethod::Head {
                    None
                } else {
                    self.content_type.cloned()
                };
                (self.endpoint.clone(), content_type, RequestBody::empty())
            }
            BodyStrategy::Raw => (
                self.endpoint.clone(),
                self.content_type.cloned(),
                RequestBody::from_bytes(raw_entity(message, self.params)?),
            ),
            BodyStrategy::Binary => {
                self.ignore_params();
                (
                    self.endpoint.clone(),
                    self.content_type.cloned(),
                    RequestBody::from_bytes(message),
                )
            }
            BodyStrategy::UrlEncoded => {
                let text = String::from_utf8_lossy(&message);
                let mut fields: Vec<(&str, &str)> = Vec::with_capacity(self.params.len() + 1);
                if let Some(name) = self.first_body_part_name {
                    fields.push((name, text.as_ref()));
                }
                fields.extend(self.params.iter().map(|(n, v)| (n.as_str(), v.as_str())));
                let form = serde_urlencoded::to_string(&fields)?;
                let content_type = HeaderValue::from_str(&format!(
                    "application/x-www-form-urlencoded; charset={}",
                    self.charset
                ))?;
                (
                    self.endpoint.clone(),
                    Some(content_type),
                    RequestBody::from_bytes(form),
                )
            }
            BodyStrategy::Multipart(kind) => {
                let mut builder = MultipartBuilder::new(kind, self.charset);
                if let Some(name) = self.first_body_part_name {
                    builder.message_part(name, &message);
                }
                for (name, value) in self.params {
                    builder.text_part(name, value);
                }
                for part in self.parts {
                    builder.caller_part(part);
                }
                let (content_type, entity) = builder.finish();
                (
                    self.endpoint.clone(),
                    Some(HeaderValue::from_str(&content_type)?),
                    RequestBody::from_bytes(entity),
                )
            }
        })
    }
}

/// `message&a=1&b=2`, or just `a=1&b=2` for an empty message.
fn raw_entity(message: Bytes, params: &[(String, String)]) -> Result<Bytes, HttpError> {
    if params.is_empty() {
        return Ok(message);
    }
    let encoded = serde_urlencoded::to_string(params)?;
    let mut buf = BytesMut::with_capacity(message.len() + encoded.len() + 1);
    buf.put_slice(&message);
    if !message.is_empty() {
        buf.put_u8(b'&');
    }
    buf.put_slice(encoded.as_bytes());
    Ok(buf.freeze())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, v)| ((*n).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn body_text(request: &Request<RequestBody>) -> String {
        match request.body() {
            RequestBody::Repeatable(Some(bytes)) => String::from_utf8(bytes.to_vec()).unwrap(),
            RequestBody::Repeatable(None) => String::new(),
            RequestBody::OneShot(_) => panic!("sender bodies are always repeatable"),
        }
    }

    fn plan<'a>(
        method: HttpMethod,
        post_type: PostType,
        endpoint: &'a Endpoint,
        params: &'a [(String, String)],
    ) -> RequestPlan<'a> {
        RequestPlan {
            method,
            strategy: BodyStrategy::select(method, post_type),
            endpoint,
            content_type: None,
            charset: "UTF-8",
            first_body_part_name: None,
            params,
            parts: &[],
            headers: Vec::new(),
        }
    }

    #[test]
    fn strategy_selection() {
        assert_eq!(BodyStrategy::select(HttpMethod::Get, PostType::Formdata), BodyStrategy::Query);
        assert_eq!(BodyStrategy::select(HttpMethod::Delete, PostType::Raw), BodyStrategy::Bare);
        assert_eq!(BodyStrategy::select(HttpMethod::Head, PostType::Raw), BodyStrategy::Bare);
        assert_eq!(BodyStrategy::select(HttpMethod::Put, PostType::Binary), BodyStrategy::Binary);
        assert_eq!(
            BodyStrategy::select(HttpMethod::Post, PostType::Mtom),
            BodyStrategy::Multipart(MultipartKind::Mtom)
        );
    }

    #[test]
    fn get_appends_params_to_query() {
        let endpoint = Endpoint::parse("http://localhost/api?fixed=1").unwrap();
        let params = params(&[("q", "a b"), ("n", "2")]);
        let ct = HeaderValue::from_static("text/plain; charset=UTF-8");
        let request = RequestPlan {
            content_type: Some(&ct),
            ..plan(HttpMethod::Get, PostType::Raw, &endpoint, &params)
        }
        .build(Bytes::from_static(b"ignored"))
        .unwrap();

        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().query(), Some("fixed=1&q=a+b&n=2"));
        assert_eq!(request.headers()[CONTENT_TYPE], "text/plain; charset=UTF-8");
        assert!(body_text(&request).is_empty());
    }

    #[test]
    fn delete_and_head_keep_only_the_configured_url() {
        let endpoint = Endpoint::parse("http://localhost/items/9?force=true").unwrap();
        let params = params(&[("q", "x")]);
        let ct = HeaderValue::from_static("application/json");
        for method in [HttpMethod::Delete, HttpMethod::Head] {
            let request = RequestPlan {
                content_type: Some(&ct),
                ..plan(method, PostType::Raw, &endpoint, &params)
            }
            .build(Bytes::from_static(b"ignored"))
            .unwrap();
            assert_eq!(request.uri().query(), Some("force=true"));
            assert!(body_text(&request).is_empty());
        }
    }

    #[test]
    fn head_never_sends_content_type() {
        let endpoint = Endpoint::parse("http://localhost/api").unwrap();
        let ct = HeaderValue::from_static("text/html");
        let request = RequestPlan {
            content_type: Some(&ct),
            ..plan(HttpMethod::Head, PostType::Raw, &endpoint, &[])
        }
        .build(Bytes::new())
        .unwrap();
        assert!(!request.headers().contains_key(CONTENT_TYPE));
    }

    #[test]
    fn raw_appends_params_to_message() {
        let endpoint = Endpoint::parse("http://localhost/api").unwrap();
        let params = params(&[("a", "1"), ("b", "x&y")]);

        let request = plan(HttpMethod::Post, PostType::Raw, &endpoint, &params)
            .build(Bytes::from_static(b"<msg/>"))
            .unwrap();
        assert_eq!(body_text(&request), "<msg/>&a=1&b=x%26y");
        assert_eq!(request.uri().query(), None);

        let request = plan(HttpMethod::Post, PostType::Raw, &endpoint, &params)
            .build(Bytes::new())
            .unwrap();
        assert_eq!(body_text(&request), "a=1&b=x%26y");
    }

    #[test]
    fn binary_keeps_message_and_drops_params() {
        let endpoint = Endpoint::parse("http://localhost/upload?v=2").unwrap();
        let params = params(&[("id", "7")]);
        let request = plan(HttpMethod::Put, PostType::Binary, &endpoint, &params)
            .build(Bytes::from_static(&[0, 159, 146, 150]))
            .unwrap();

        assert_eq!(request.method(), http::Method::PUT);
        assert_eq!(request.uri().query(), Some("v=2"));
        match request.body() {
            RequestBody::Repeatable(Some(bytes)) => assert_eq!(&bytes[..], &[0, 159, 146, 150]),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn urlencoded_form_with_message_field() {
        let endpoint = Endpoint::parse("http://localhost/form").unwrap();
        let params = params(&[("lang", "nl")]);
        let request = RequestPlan {
            first_body_part_name: Some("message"),
            ..plan(HttpMethod::Post, PostType::Urlencoded, &endpoint, &params)
        }
        .build(Bytes::from_static(b"hello world"))
        .unwrap();

        assert_eq!(body_text(&request), "message=hello+world&lang=nl");
        assert_eq!(
            request.headers()[CONTENT_TYPE],
            "application/x-www-form-urlencoded; charset=UTF-8"
        );
    }

    #[test]
    fn multipart_includes_message_params_and_parts() {
        let endpoint = Endpoint::parse("http://localhost/upload").unwrap();
        let params = params(&[("a", "1")]);
        let parts = [MultipartPart::new("doc", "PDF").with_content_type("application/pdf")];
        let request = RequestPlan {
            first_body_part_name: Some("message"),
            parts: &parts,
            ..plan(HttpMethod::Post, PostType::Formdata, &endpoint, &params)
        }
        .build(Bytes::from_static(b"<m/>"))
        .unwrap();

        let content_type = request.headers()[CONTENT_TYPE].to_str().unwrap().to_owned();
        let boundary = content_type
            .strip_prefix("multipart/form-data; boundary=")
            .unwrap();
        let body = body_text(&request);
        assert!(body.starts_with(&format!("--{boundary}\r\n")));
        assert!(body.contains("name=\"message\"\r\nContent-Type: text/plain; charset=UTF-8\r\n\r\n<m/>\r\n"));
        assert!(body.contains("name=\"a\"\r\nContent-Type: text/plain; charset=UTF-8\r\n\r\n1\r\n"));
        assert!(body.contains("name=\"doc\"\r\nContent-Type: application/pdf\r\n\r\nPDF\r\n"));
        assert!(body.ends_with(&format!("--{boundary}--\r\n")));
    }

    #[test]
    fn headers_replace_existing_values() {
        let endpoint = Endpoint::parse("http://localhost/api").unwrap();
        let request = RequestPlan {
            headers: vec![
                (HeaderName::from_static("x-a"), HeaderValue::from_static("1")),
                (HeaderName::from_static("x-a"), HeaderValue::from_static("2")),
            ],
            ..plan(HttpMethod::Delete, PostType::Raw, &endpoint, &[])
        }
        .build(Bytes::new())
        .unwrap();
        assert_eq!(request.headers().get_all("x-a").iter().count(), 1);
        assert_eq!(request.headers()["x-a"], "2");
    }
}
