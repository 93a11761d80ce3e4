//! Actix Web surface over the stream registry.
//!
//! The server runs on a dedicated thread so the pipeline hot path never
//! touches the Actix runtime. MJPEG clients are woken by the registry's
//! sequence watch channel and only ever receive frames they have not seen.

use std::sync::Arc;

use actix_web::{
    http::header,
    web::{self, Bytes},
    App, HttpResponse, HttpServer,
};
use anyhow::{Context, Result};
use async_stream::stream;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::pipeline::{registry::StreamHub, telemetry};

/// Shared state backing HTTP handlers.
struct ServerState {
    hub: Arc<StreamHub>,
}

/// Handle for the HTTP server thread.
pub struct MjpegServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl MjpegServer {
    /// Signal the server to stop and block until the thread exits.
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the HTTP server thread and return a handle that can stop it.
pub fn spawn_server(hub: Arc<StreamHub>, host: String, port: u16) -> Result<MjpegServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = std::thread::Builder::new()
        .name("mjpeg-server".into())
        .spawn(move || {
            if let Err(err) = actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(ServerState { hub: hub.clone() }))
                        .route("/health", web::get().to(health_handler))
                        .route("/streams", web::get().to(streams_handler))
                        .route("/metrics", web::get().to(metrics_handler))
                        .route("/meta/{key:.*}", web::get().to(meta_handler))
                        .route("/snapshot/{key:.*}", web::get().to(snapshot_handler))
                        .route("/video/{key:.*}", web::get().to(video_handler))
                })
                .bind((host.as_str(), port))?
                .run();

                debug!("http server listening on {host}:{port}");

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });

                server.await
            }) {
                error!("HTTP server error: {err}");
            }
        })
        .context("failed to spawn http server thread")?;
    Ok(MjpegServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

async fn health_handler() -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain").body("ok")
}

async fn streams_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.hub.list_streams())
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::Ok().content_type("text/plain").body(""),
    }
}

async fn meta_handler(state: web::Data<ServerState>, key: web::Path<String>) -> HttpResponse {
    match state.hub.get(key.as_str()) {
        Some(stream) => HttpResponse::Ok()
            .append_header((header::CACHE_CONTROL, "no-cache"))
            .content_type("application/json")
            .body(stream.meta()),
        None => HttpResponse::NotFound().finish(),
    }
}

async fn snapshot_handler(state: web::Data<ServerState>, key: web::Path<String>) -> HttpResponse {
    let Some(stream) = state.hub.get(key.as_str()) else {
        return HttpResponse::NotFound().finish();
    };
    match stream.snapshot() {
        Some(jpeg) => HttpResponse::Ok()
            .append_header((header::CACHE_CONTROL, "no-cache"))
            .content_type("image/jpeg")
            .body(jpeg.as_ref().clone()),
        None => HttpResponse::NoContent().finish(),
    }
}

/// One part of the `multipart/x-mixed-replace` body.
pub(crate) fn mjpeg_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

async fn video_handler(state: web::Data<ServerState>, key: web::Path<String>) -> HttpResponse {
    let Some(stream_state) = state.hub.get(key.as_str()) else {
        return HttpResponse::NotFound().finish();
    };

    let body = stream! {
        let mut rx = stream_state.subscribe();
        // The frame present at connect time counts as already seen; clients
        // receive only frames pushed after they join.
        let mut last_sent = *rx.borrow();
        loop {
            if rx.changed().await.is_err() {
                break;
            }
            let Some((jpeg, seq)) = stream_state.snapshot_with_seq() else {
                continue;
            };
            if seq == last_sent {
                continue;
            }
            last_sent = seq;
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(mjpeg_part(&jpeg)));
        }
    };

    HttpResponse::Ok()
        .append_header((header::CACHE_CONTROL, "no-cache"))
        .append_header((header::PRAGMA, "no-cache"))
        .append_header((header::CONNECTION, "close"))
        .content_type("multipart/x-mixed-replace; boundary=frame")
        .streaming(body)
}

#[cfg(test)]
mod tests {
    use actix_web::{test, web, App};

    use super::*;

    #[test]
    fn part_framing_is_byte_exact() {
        let jpeg = vec![0xFFu8, 0xD8, 0xFF, 0xD9];
        let part = mjpeg_part(&jpeg);
        let expected_prefix =
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n".to_vec();
        assert!(part.starts_with(&expected_prefix));
        assert!(part.ends_with(b"\xFF\xD9\r\n"));
        assert_eq!(part.len(), expected_prefix.len() + jpeg.len() + 2);
    }

    #[test]
    fn parts_reflect_each_distinct_jpeg() {
        let j0 = vec![1u8; 10];
        let j1 = vec![2u8; 25];
        let p0 = mjpeg_part(&j0);
        let p1 = mjpeg_part(&j1);
        assert!(String::from_utf8_lossy(&p0).contains("Content-Length: 10"));
        assert!(String::from_utf8_lossy(&p1).contains("Content-Length: 25"));
    }

    macro_rules! test_app {
        ($hub:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new(ServerState { hub: $hub }))
                    .route("/health", web::get().to(health_handler))
                    .route("/streams", web::get().to(streams_handler))
                    .route("/meta/{key:.*}", web::get().to(meta_handler))
                    .route("/snapshot/{key:.*}", web::get().to(snapshot_handler)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn health_returns_ok_text() {
        let app = test_app!(Arc::new(StreamHub::default()));
        let resp =
            test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert!(resp.status().is_success());
        let body = test::read_body(resp).await;
        assert_eq!(&body[..], b"ok");
    }

    #[actix_web::test]
    async fn streams_lists_registered_keys_sorted() {
        let hub = Arc::new(StreamHub::default());
        hub.register_stream("cam1/ui");
        hub.register_stream("cam0/ui");
        let app = test_app!(hub);
        let resp =
            test::call_service(&app, test::TestRequest::get().uri("/streams").to_request()).await;
        let body = test::read_body(resp).await;
        assert_eq!(&body[..], br#"["cam0/ui","cam1/ui"]"#);
    }

    #[actix_web::test]
    async fn unknown_keys_are_not_found() {
        let app = test_app!(Arc::new(StreamHub::default()));
        for uri in ["/meta/nope/ui", "/snapshot/nope/ui"] {
            let resp =
                test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
            assert_eq!(resp.status(), 404, "{uri} should 404");
        }
    }

    #[actix_web::test]
    async fn snapshot_before_first_frame_is_no_content() {
        let hub = Arc::new(StreamHub::default());
        hub.register_stream("cam0/ui");
        let app = test_app!(hub.clone());
        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/snapshot/cam0/ui").to_request(),
        )
        .await;
        assert_eq!(resp.status(), 204);

        hub.push_jpeg("cam0/ui", vec![9, 9, 9]);
        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/snapshot/cam0/ui").to_request(),
        )
        .await;
        assert_eq!(resp.status(), 200);
        let body = test::read_body(resp).await;
        assert_eq!(&body[..], &[9, 9, 9]);
    }

    #[actix_web::test]
    async fn meta_defaults_to_empty_object() {
        let hub = Arc::new(StreamHub::default());
        hub.register_stream("cam0/inf");
        let app = test_app!(hub);
        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/meta/cam0/inf").to_request(),
        )
        .await;
        let body = test::read_body(resp).await;
        assert_eq!(&body[..], b"{}");
    }
}
