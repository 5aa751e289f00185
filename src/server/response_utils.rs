use headers::{ContentLength, ContentType, HeaderMapExt};
use http_body_util::combinators::BoxBody;
use hyper::{body::Bytes, header::HeaderValue, StatusCode};

use crate::http_utils::body_full;

pub type Response = hyper::Response<BoxBody<Bytes, anyhow::Error>>;

/// Media type of serialized proofs on the wire.
pub const PROOF_MIME: &str = "application/vnd.opentimestamps.v1";

pub fn status_not_found(res: &mut Response, body: &str) {
    *res.status_mut() = StatusCode::NOT_FOUND;
    *res.body_mut() = body_full(body.to_string());
}

pub fn status_bad_request(res: &mut Response, body: &str) {
    *res.status_mut() = StatusCode::BAD_REQUEST;
    *res.body_mut() = body_full(body.to_string());
}

pub fn status_unauthorized(res: &mut Response) {
    *res.status_mut() = StatusCode::UNAUTHORIZED;
    *res.body_mut() = body_full("Unauthorized");
}

pub fn status_overloaded(res: &mut Response, body: &str) {
    *res.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    *res.body_mut() = body_full(body.to_string());
}

pub fn status_range_not_satisfiable(res: &mut Response) {
    *res.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
    *res.body_mut() = body_full("Requested offset is past the journal end");
}

pub fn set_proof_response(res: &mut Response, content: Vec<u8>) {
    res.headers_mut().insert("content-type", HeaderValue::from_static(PROOF_MIME));
    res.headers_mut().typed_insert(ContentLength(content.len() as u64));
    *res.body_mut() = body_full(content);
}

pub fn set_json_response(res: &mut Response, content: String) {
    res.headers_mut().typed_insert(ContentType::json());
    res.headers_mut().typed_insert(ContentLength(content.len() as u64));
    *res.body_mut() = body_full(content);
}

pub fn set_text_response(res: &mut Response, content: String) {
    res.headers_mut().typed_insert(ContentType::text_utf8());
    res.headers_mut().typed_insert(ContentLength(content.len() as u64));
    *res.body_mut() = body_full(content);
}
