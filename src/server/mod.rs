mod response_utils;
mod router;

pub use response_utils::Response;

use anyhow::{Context, Result};
use futures_util::TryStreamExt;
use headers::{ContentLength, HeaderMapExt};
use hmac::{Hmac, Mac};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::HeaderValue;
use hyper::{Method, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::json;
use sha2::Sha256;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;

use crate::aggregator::{Aggregator, SubmitError};
use crate::calendar::{timestamp_bytes, Calendar, StoreError};
use crate::http_utils::{body_empty, body_full, read_body_limited};
use crate::merkle::{self, DIGEST_LEN};

use response_utils::{
    set_json_response, set_proof_response, set_text_response, status_bad_request,
    status_not_found, status_overloaded, status_range_not_satisfiable, status_unauthorized,
};
use router::Route;

pub type Request = hyper::Request<hyper::body::Incoming>;

const STREAM_BUF_SIZE: usize = 65536;

/// Access token for the backup feed, derived from the calendar's secret key.
pub fn derive_backup_token(hmac_key: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(hmac_key).expect("hmac accepts any key length");
    mac.update(b"backup");
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub struct Server {
    aggregator: Arc<Aggregator>,
    calendar: Arc<Calendar>,
    uri: String,
    donation_addr: Option<String>,
    backup_token: String,
}

impl Server {
    pub fn new(
        aggregator: Arc<Aggregator>,
        calendar: Arc<Calendar>,
        uri: String,
        donation_addr: Option<String>,
        hmac_key: &[u8],
    ) -> Self {
        Server {
            aggregator,
            calendar,
            uri,
            donation_addr,
            backup_token: derive_backup_token(hmac_key),
        }
    }

    pub async fn handle(self: Arc<Self>, req: Request) -> Result<Response> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let route = Route::from_request(&method, &path);

        let mut res = Response::new(body_empty());
        if let Err(e) = self.dispatch(route, req, &mut res).await {
            if let Some(violation) = e.downcast_ref::<StoreError>() {
                error!("store invariant violated: {violation}");
                std::process::exit(2);
            }
            error!("request \"{method} {path}\" failed: {e:#}");
            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            *res.body_mut() = body_full("Internal Server Error");
        }
        if method == Method::HEAD {
            *res.body_mut() = body_empty();
        }
        info!("\"{} {}\" - {}", method, path, res.status());
        Ok(res)
    }

    async fn dispatch(&self, route: Route, req: Request, res: &mut Response) -> Result<()> {
        match route {
            Route::Submit => self.handle_submit(req, res).await,
            Route::Timestamp { digest_hex } => self.handle_timestamp(&digest_hex, res),
            Route::Tip => self.handle_tip(res),
            Route::Backup { offset } => self.handle_backup(offset, &req, res).await,
            Route::Info => self.handle_info(res),
            Route::NotFound => {
                status_not_found(res, "Not Found");
                Ok(())
            }
        }
    }

    async fn handle_submit(&self, req: Request, res: &mut Response) -> Result<()> {
        let body = match read_body_limited(req.into_body(), DIGEST_LEN * 2).await {
            Ok(body) => body,
            Err(_) => {
                status_bad_request(res, "digest must be exactly 32 bytes");
                return Ok(());
            }
        };
        let Some(digest) = merkle::digest_from_slice(&body) else {
            status_bad_request(res, "digest must be exactly 32 bytes");
            return Ok(());
        };

        match self.aggregator.submit(digest).await {
            Ok(timestamp) => {
                set_proof_response(res, timestamp_bytes(&timestamp)?);
                Ok(())
            }
            Err(SubmitError::Overloaded) => {
                status_overloaded(res, "Calendar is overloaded, try again later");
                Ok(())
            }
            Err(e @ SubmitError::RoundFailed) => Err(e.into()),
        }
    }

    fn handle_timestamp(&self, digest_hex: &str, res: &mut Response) -> Result<()> {
        let digest = match hex::decode(digest_hex) {
            Ok(bytes) if bytes.len() == DIGEST_LEN => bytes,
            _ => {
                status_bad_request(res, "digest must be 64 hex characters");
                return Ok(());
            }
        };
        match self.calendar.get(&digest)? {
            Some(timestamp) => {
                set_proof_response(res, timestamp_bytes(&timestamp)?);
                Ok(())
            }
            None => {
                status_not_found(res, "digest not found");
                Ok(())
            }
        }
    }

    fn handle_tip(&self, res: &mut Response) -> Result<()> {
        let Some((commitment, timestamp)) = self.calendar.tip()? else {
            status_not_found(res, "calendar is empty");
            return Ok(());
        };
        let attestation = match merkle::terminal(&timestamp) {
            Some((opentimestamps::attestation::Attestation::Bitcoin { height }, _)) => {
                json!({ "kind": "bitcoin", "height": height })
            }
            _ => json!({ "kind": "pending", "uri": self.uri }),
        };
        let body = json!({
            "commitment": hex::encode(commitment),
            "attestation": attestation,
        });
        set_json_response(res, serde_json::to_string_pretty(&body)?);
        Ok(())
    }

    /// Stream raw journal records from `offset` to the committed end.
    async fn handle_backup(&self, offset: u64, req: &Request, res: &mut Response) -> Result<()> {
        let token = req
            .uri()
            .query()
            .map(|query| {
                form_urlencoded::parse(query.as_bytes())
                    .find(|(key, _)| key == "token")
                    .map(|(_, value)| value.into_owned())
                    .unwrap_or_default()
            })
            .unwrap_or_default();
        if !constant_time_eq(token.as_bytes(), self.backup_token.as_bytes()) {
            status_unauthorized(res);
            return Ok(());
        }

        let journal = self.calendar.journal();
        let committed = journal.committed_len();
        if offset > committed {
            status_range_not_satisfiable(res);
            return Ok(());
        }
        let length = committed - offset;
        res.headers_mut()
            .insert("content-type", HeaderValue::from_static("application/octet-stream"));
        res.headers_mut().typed_insert(ContentLength(length));
        if length == 0 {
            return Ok(());
        }

        let mut file = tokio::fs::File::open(journal.segment_path()).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let reader_stream = ReaderStream::with_capacity(file.take(length), STREAM_BUF_SIZE);
        let stream_body =
            StreamBody::new(reader_stream.map_ok(Frame::data).map_err(anyhow::Error::from));
        *res.body_mut() = stream_body.boxed();
        Ok(())
    }

    fn handle_info(&self, res: &mut Response) -> Result<()> {
        let stats = self.calendar.stats();
        let mut page = format!(
            "{} {}\n\npublic uri: {}\n",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            self.uri
        );
        if let Some(addr) = &self.donation_addr {
            page.push_str(&format!("donation address: {addr}\n"));
        }
        page.push_str(&format!(
            "\ncommitments: {} ({} awaiting anchor)\nattestations: {}\njournal bytes: {}\nindexed digests: {}\n",
            stats.commitments, stats.unconfirmed, stats.upgrades, stats.journal_bytes,
            stats.indexed_digests
        ));
        set_text_response(res, page);
        Ok(())
    }
}

/// Accept loop; runs until the listener is torn down by shutdown.
pub async fn serve(server: Arc<Server>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await.context("accept failed")?;
        let io = TokioIo::new(stream);
        let server = server.clone();
        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req| server.clone().handle(req));
            let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
            if let Err(err) = builder.serve_connection(io, service).await {
                debug!("connection error: {err:?}");
            }
        });
    }
}
