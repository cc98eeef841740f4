use std::convert::Infallible;
use std::io::Cursor;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::routing::{get, post, Router};
use axum::{extract, handler::Handler, AddExtensionLayer};
use hyper::server::conn::Http;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionResponse, AdmissionReview, Operation};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::internal::pemfile;
use tokio_rustls::rustls::{NoClientAuth, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tower_http::trace::TraceLayer;

use agones_core::crd::{GameServer, GameServerSet};

use crate::config::Config;
use crate::get_metrics_recorder;
use crate::server::LivenessChecks;

/// The HTTP server for admission webhooks, healthchecks and metrics.
pub struct WebhookServer {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The liveness checks behind `/health`.
    checks: LivenessChecks,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: broadcast::Receiver<()>,

    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl WebhookServer {
    /// Construct a new instance.
    pub async fn new(config: Arc<Config>, checks: LivenessChecks, shutdown: broadcast::Sender<()>) -> Result<Self> {
        let rustls_config = rustls_server_config(&config).context("error building webhook TLS config")?;
        let acceptor = TlsAcceptor::from(rustls_config);
        let listener = TcpListener::bind(("0.0.0.0", config.http_port))
            .await
            .context("error binding socket address for webhook server")?;

        Ok(Self {
            config,
            checks,
            shutdown_rx: shutdown.subscribe(),
            shutdown_tx: shutdown,
            listener,
            acceptor,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let metrics_handle = get_metrics_recorder(&self.config).handle();
        let router = Router::new()
            .route("/health", get(health.layer(AddExtensionLayer::new(self.checks.clone()))))
            .route("/metrics", get(prom_metrics.layer(AddExtensionLayer::new(metrics_handle))))
            .route("/validate", post(validate_game_server_set.layer(TraceLayer::new_for_http())))
            .route("/mutate", post(mutate_game_server.layer(TraceLayer::new_for_http())));

        loop {
            tokio::select! {
                sock_res = self.listener.accept() => {
                    let (stream, _addr) = match sock_res {
                        Ok((stream, addr)) => (stream, addr),
                        Err(err) => {
                            tracing::error!(error = ?err, "error accepting webhook socket connection");
                            let _res = self.shutdown_tx.send(());
                            break;
                        }
                    };
                    let (acceptor, router) = (self.acceptor.clone(), router.clone());
                    tokio::spawn(async move {
                        if let Ok(stream) = acceptor.accept(stream).await {
                            let _res = Http::new().serve_connection(stream, router).await;
                        }
                    });
                },
                _ = self.shutdown_rx.recv() => break,
            }
        }

        Ok(())
    }
}

/// Build the RusTLS server config from the config's PEM key & certificate.
fn rustls_server_config(config: &Config) -> Result<Arc<ServerConfig>> {
    let key_bytes = base64::decode(&config.webhook_key).context("error decoding webhook key")?;
    let mut reader = Cursor::new(key_bytes);
    let mut keys = pemfile::pkcs8_private_keys(&mut reader).map_err(|_| anyhow!("error parsing webhook private key"))?;
    if keys.is_empty() {
        reader.set_position(0);
        keys = pemfile::rsa_private_keys(&mut reader).map_err(|_| anyhow!("error parsing webhook private key"))?;
    }
    let key = keys.into_iter().next().context("no private key found in webhook key data")?;

    let cert_bytes = base64::decode(&config.webhook_cert).context("error decoding webhook certificate")?;
    let certs = pemfile::certs(&mut Cursor::new(cert_bytes)).map_err(|_| anyhow!("error parsing webhook certificate"))?;

    let mut tls = ServerConfig::new(NoClientAuth::new());
    tls.set_single_cert(certs, key).context("error configuring webhook certificate")?;
    tls.set_protocols(&[b"h2".to_vec(), b"http/1.1".to_vec()]);
    Ok(Arc::new(tls))
}

/// Liveness handler; fails when any controller's workers have stalled.
pub(super) async fn health(extract::Extension(checks): extract::Extension<LivenessChecks>) -> StatusCode {
    match checks.check() {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            tracing::error!(error = ?err, "liveness check failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Handler for serving Prometheus metrics.
pub(super) async fn prom_metrics(extract::Extension(handle): extract::Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, handle.render())
}

/// Validation handler for GameServerSet updates.
///
/// Replica changes pass; template mutation is rejected with the cause list.
#[tracing::instrument(level = "debug", skip(payload))]
pub(super) async fn validate_game_server_set(
    mut payload: extract::Json<AdmissionReview<GameServerSet>>,
) -> std::result::Result<axum::Json<AdmissionReview<DynamicObject>>, Infallible> {
    tracing::debug!("received GameServerSet validation request");
    let req = match payload.0.request.take() {
        Some(req) => req,
        None => {
            let res = AdmissionResponse::invalid("malformed webhook request received, no `request` field");
            return Ok(axum::Json::from(res.into_review()));
        }
    };

    // Only updates can mutate the template; everything else is accepted.
    if !matches!(req.operation, Operation::Update) {
        return Ok(axum::Json::from(AdmissionResponse::from(&req).into_review()));
    }

    let (new_gss, old_gss) = match (&req.object, &req.old_object) {
        (Some(new_gss), Some(old_gss)) => (new_gss, old_gss),
        _ => {
            let res = AdmissionResponse::invalid("no GameServerSet objects found in the request, can not validate");
            return Ok(axum::Json::from(res.into_review()));
        }
    };

    let causes = old_gss.validate_update(new_gss);
    if !causes.is_empty() {
        let rejection = causes.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
        tracing::debug!(%rejection, "invalid GameServerSet update");
        return Ok(axum::Json::from(AdmissionResponse::invalid(rejection).into_review()));
    }

    Ok(axum::Json::from(AdmissionResponse::from(&req).into_review()))
}

/// Mutation handler for GameServer creation.
///
/// Applies defaults and returns them as a JSON patch; invalid GameServers are
/// rejected with the validation cause list.
#[tracing::instrument(level = "debug", skip(payload))]
pub(super) async fn mutate_game_server(
    mut payload: extract::Json<AdmissionReview<GameServer>>,
) -> std::result::Result<axum::Json<AdmissionReview<DynamicObject>>, Infallible> {
    tracing::debug!("received GameServer mutation request");
    let req = match payload.0.request.take() {
        Some(req) => req,
        None => {
            let res = AdmissionResponse::invalid("malformed webhook request received, no `request` field");
            return Ok(axum::Json::from(res.into_review()));
        }
    };

    let gs = match &req.object {
        Some(gs) => gs,
        None => {
            let res = AdmissionResponse::invalid("no GameServer object found in the `object` field, can not mutate");
            return Ok(axum::Json::from(res.into_review()));
        }
    };

    let mut defaulted = gs.clone();
    defaulted.apply_defaults();

    let causes = defaulted.validate();
    if !causes.is_empty() {
        let rejection = causes.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
        tracing::debug!(%rejection, "invalid GameServer");
        return Ok(axum::Json::from(AdmissionResponse::invalid(rejection).into_review()));
    }

    let patch = match gs.patch_to(&defaulted) {
        Ok(patch) => patch,
        Err(err) => {
            let res = AdmissionResponse::invalid(format!("error computing defaults patch: {}", err));
            return Ok(axum::Json::from(res.into_review()));
        }
    };
    let res = match AdmissionResponse::from(&req).with_patch(patch) {
        Ok(res) => res,
        Err(err) => AdmissionResponse::invalid(format!("error serializing defaults patch: {}", err)),
    };
    Ok(axum::Json::from(res.into_review()))
}
