//! Server bootstrap and lifecycle
//!
//! `Server::new` runs the trust-subsystem startup ladder — record store,
//! root key provider, data key, field cipher, certificate provider,
//! rotation policy, TLS assembly — strictly before any listener is bound,
//! so request handlers only ever observe fully initialized trust state.

pub mod http;

use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::config::Args;
use crate::keys::{EncryptionKeyStore, FieldCipher, LocalKeyProvider, DB_KEY_NAME};
use crate::pki::{
    pem_to_der, resolve_rotation_policy, tls::build_server_config, CertificateProvider,
    NativeCertificateProvider,
};
use crate::store::{Store, TrustedCertificate};
use crate::telemetry;
use crate::types::{Result, WardenError};

pub use http::AppState;

/// Bound listener addresses, recorded so callers (and tests binding port 0)
/// can discover them.
#[derive(Debug, Clone, Copy)]
pub struct Addrs {
    pub http: SocketAddr,
    pub https: SocketAddr,
    pub metrics: SocketAddr,
}

/// A fully bootstrapped server, ready to serve.
pub struct Server {
    state: Arc<AppState>,
    tls_config: Arc<rustls::ServerConfig>,
    http_listener: TcpListener,
    https_listener: TcpListener,
    metrics_listener: TcpListener,
    pub addrs: Addrs,
}

impl Server {
    /// Bootstrap the trust subsystem and bind listeners.
    ///
    /// Any error here is fatal: the process must not begin serving traffic
    /// with partial trust state.
    pub async fn new(args: Args) -> Result<Server> {
        args.validate()?;

        let store = Store::open(&args.db_path)?;

        let key_provider = Arc::new(LocalKeyProvider::new(&args.root_key_dir));
        let key_store = EncryptionKeyStore::new(store.clone(), key_provider);
        let data_key = key_store.load_or_create(DB_KEY_NAME, &args.root_key_id)?;
        let cipher = Arc::new(FieldCipher::new(data_key));
        info!(key_id = cipher.key_id(), "Database encryption key loaded");

        let certificate_provider = load_certificates(&args, &store, Arc::clone(&cipher))?;

        seed_trusted_client_key(&args, &store)?;

        let hosts = args.host_list();
        let tls_config = Arc::new(build_server_config(
            args.mtls_enabled(),
            certificate_provider.as_ref(),
            &store,
            &hosts,
        )?);
        info!(
            mode = %args.network_encryption,
            active_cas = certificate_provider.active_cas().len(),
            "TLS configuration assembled"
        );

        let http_listener = TcpListener::bind(args.listen_http).await?;
        let https_listener = TcpListener::bind(args.listen_https).await?;
        let metrics_listener = TcpListener::bind(args.listen_metrics).await?;

        let addrs = Addrs {
            http: http_listener.local_addr()?,
            https: https_listener.local_addr()?,
            metrics: metrics_listener.local_addr()?,
        };

        let certificate_provider: Arc<dyn CertificateProvider> = certificate_provider;
        let state = Arc::new(AppState {
            args,
            store,
            cipher,
            certificate_provider,
            started_at: Instant::now(),
        });

        Ok(Server {
            state,
            tls_config,
            http_listener,
            https_listener,
            metrics_listener,
            addrs,
        })
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// The assembled TLS configuration the HTTPS listener serves with.
    pub fn server_tls_config(&self) -> Arc<rustls::ServerConfig> {
        Arc::clone(&self.tls_config)
    }

    /// Serve until ctrl-c.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                let _ = shutdown_tx.send(true);
            }
        });

        self.run_with_shutdown(shutdown_rx).await
    }

    /// Serve until the shutdown channel flips to true. Listeners stop
    /// accepting immediately; in-flight connections drain on the runtime;
    /// the heartbeat task observes the same signal and exits cleanly.
    pub async fn run_with_shutdown(self, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Warden listening - http:{} https:{} metrics:{}",
            self.addrs.http, self.addrs.https, self.addrs.metrics
        );

        let heartbeat = telemetry::spawn_heartbeat_task(
            std::time::Duration::from_secs(self.state.args.heartbeat_interval_secs),
            Arc::clone(&self.state),
            shutdown_rx.clone(),
        );

        let acceptor = TlsAcceptor::from(Arc::clone(&self.tls_config));

        let plain = tokio::spawn(serve_plain(
            self.http_listener,
            Arc::clone(&self.state),
            shutdown_rx.clone(),
        ));
        let tls = tokio::spawn(serve_tls(
            self.https_listener,
            acceptor,
            Arc::clone(&self.state),
            shutdown_rx.clone(),
        ));
        let metrics = tokio::spawn(serve_metrics(
            self.metrics_listener,
            Arc::clone(&self.state),
            shutdown_rx,
        ));

        for task in [plain, tls, metrics] {
            task.await
                .map_err(|e| WardenError::Internal(format!("listener task: {e}")))??;
        }
        let _ = heartbeat.await;

        info!("Warden stopped");
        Ok(())
    }
}

/// Construct the certificate provider and bring the CA set to its steady
/// state: optional preload of configured material, then the rotation ladder
/// until stable. Runs once per startup; rotation is not on a timer.
fn load_certificates(
    args: &Args,
    store: &Store,
    cipher: Arc<FieldCipher>,
) -> Result<Arc<NativeCertificateProvider>> {
    let provider = Arc::new(NativeCertificateProvider::new(
        store.clone(),
        cipher,
        args.full_key_rotation_days,
    )?);

    // Externally supplied CA material is only considered when no CA exists.
    if provider.active_cas().is_empty() {
        if let (Some(cert_pem), Some(public_key_b64)) = (
            args.initial_root_ca_cert.as_deref(),
            args.initial_root_ca_public_key.as_deref(),
        ) {
            // Malformed material is a configuration error, fatal before the
            // provider is even consulted.
            pem_to_der(cert_pem)?;
            let public_key = BASE64.decode(public_key_b64).map_err(|_| {
                WardenError::Config("initial root CA public key is not valid base64".into())
            })?;

            match provider.preload(cert_pem, &public_key) {
                Ok(()) => info!("Preloaded root CA from configuration"),
                Err(err) if err.is_unsupported() => {
                    info!("Certificate provider does not support preloading, generating a CA instead");
                }
                Err(err) => return Err(err),
            }
        }
    }

    while resolve_rotation_policy(provider.as_ref(), args.full_key_rotation_days)? {}

    Ok(provider)
}

/// Seed the externally trusted client public key, if configured. Idempotent
/// across restarts.
fn seed_trusted_client_key(args: &Args, store: &Store) -> Result<()> {
    let Some(encoded) = args.trust_initial_client_public_key.as_deref() else {
        return Ok(());
    };

    let raw = BASE64.decode(encoded).map_err(|_| {
        WardenError::Config("trusted initial client public key is not valid base64".into())
    })?;

    let tc = TrustedCertificate::from_public_key(raw, "Ed25519", "Ed25519");
    store.trust_certificate(&tc)?;
    info!("Trusted initial client public key");
    Ok(())
}

async fn serve_plain(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Plaintext listener stopping");
                    return Ok(());
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        http::serve_connection(stream, state, addr).await;
                    });
                }
                Err(e) => error!("Error accepting connection: {:?}", e),
            }
        }
    }
}

async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("TLS listener stopping");
                    return Ok(());
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let state = Arc::clone(&state);
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                http::serve_connection(tls_stream, state, addr).await;
                            }
                            Err(e) => {
                                // Expected for clients without a certificate
                                // in mTLS mode; fail closed, log and move on.
                                warn!(peer = %addr, "TLS handshake failed: {}", e);
                            }
                        }
                    });
                }
                Err(e) => error!("Error accepting TLS connection: {:?}", e),
            }
        }
    }
}

async fn serve_metrics(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Metrics listener stopping");
                    return Ok(());
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        http::serve_metrics_connection(stream, state, addr).await;
                    });
                }
                Err(e) => error!("Error accepting metrics connection: {:?}", e),
            }
        }
    }
}
