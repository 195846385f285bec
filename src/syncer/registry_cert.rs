//! Rotates the internal registry's TLS certificate.
//!
//! Rotation is disruptive (the registry pod restarts), so it only happens
//! outside active build windows: each due project waits for zero running
//! executions, bounded by a hard timeout, before a new CA-signed certificate
//! is cut and the pod is bounced.

use crate::models::resources::Namespace;
use crate::models::setting::{parse_duration, SETTING_SIGNING_DURATION};
use crate::models::{
    Selector, APP_LABEL, FINISH_LABEL, INFRA_NAMESPACE_LABEL, PROJECT_ID_ANNOTATION, REGISTRY_APP,
};
use crate::repository::{Repository, RepositoryError};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const REGISTRY_TLS_SECRET: &str = "registry-tls";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";

pub const CA_SECRET: &str = "pipeline-ca";
pub const CA_CERT_KEY: &str = "ca.crt";
pub const CA_KEY_KEY: &str = "ca.key";

/// Rotate once this much of the certificate lifetime has elapsed, leaving
/// comfortable margin before expiry.
const ROTATE_LIFETIME_FRACTION: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct RegistryCertSyncer {
    repository: Arc<dyn Repository>,
    /// Namespace holding the cluster CA secret.
    system_namespace: String,
    interval: Duration,
    quiescence_poll_interval: Duration,
    quiescence_budget: Duration,
}

impl RegistryCertSyncer {
    pub fn new(
        repository: Arc<dyn Repository>,
        system_namespace: String,
        interval: Duration,
        quiescence_poll_interval: Duration,
        quiescence_budget: Duration,
    ) -> Self {
        RegistryCertSyncer {
            repository,
            system_namespace,
            interval,
            quiescence_poll_interval,
            quiescence_budget,
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Registry cert syncer shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sync_once(&token).await {
                        error!(error = %e, "Could not check registry certificates");
                    }
                }
            }
        }
    }

    /// Check every pipeline namespace and kick off rotation for the ones whose
    /// certificate is due. Rotations run concurrently per project; their
    /// errors are logged, never surfaced to the ticker.
    pub async fn sync_once(&self, token: &CancellationToken) -> Result<()> {
        let namespaces = self
            .repository
            .list_namespaces(&Selector::new().eq(INFRA_NAMESPACE_LABEL, "true"))
            .await?;

        for namespace in namespaces {
            if namespace.meta.deletion_timestamp.is_some() {
                continue;
            }
            let secret = match self
                .repository
                .get_secret(&namespace.meta.name, REGISTRY_TLS_SECRET)
                .await
            {
                Ok(secret) => secret,
                // The registry has not been provisioned here yet.
                Err(RepositoryError::NotFound) => continue,
                Err(e) => return Err(e.into()),
            };

            let cert = secret.data.get(TLS_CERT_KEY).cloned().unwrap_or_default();
            if !should_rotate(&cert, Utc::now()) {
                continue;
            }

            let syncer = self.clone();
            let child = token.child_token();
            tokio::spawn(async move {
                let name = namespace.meta.name.clone();
                if let Err(e) = syncer.rotate(namespace, child).await {
                    error!(namespace = name, error = %e, "Could not rotate registry certificate");
                }
            });
        }
        Ok(())
    }

    /// Rotate one project's registry certificate. Blocks its own task, not the
    /// ticker, while waiting for the project to go quiet.
    pub async fn rotate(&self, namespace: Namespace, token: CancellationToken) -> Result<()> {
        let project = namespace
            .project_id()
            .with_context(|| {
                format!(
                    "namespace '{}' has no {} annotation",
                    namespace.meta.name, PROJECT_ID_ANNOTATION
                )
            })?;

        self.wait_for_quiescence(&project, &token).await?;

        let ca = self
            .repository
            .get_secret(&self.system_namespace, CA_SECRET)
            .await
            .context("cluster CA material is missing")?;
        let ca_cert = read_pem(&ca.data, CA_CERT_KEY)?;
        let ca_key = read_pem(&ca.data, CA_KEY_KEY)?;

        let validity = self.signing_duration(&project).await?;
        let dns_names = registry_dns_names(&namespace.meta.name);
        let (cert_pem, key_pem) = generate_registry_cert(&ca_cert, &ca_key, &dns_names, validity)?;

        let mut secret = self
            .repository
            .get_secret(&namespace.meta.name, REGISTRY_TLS_SECRET)
            .await?;
        secret
            .data
            .insert(TLS_CERT_KEY.to_string(), cert_pem.into_bytes());
        secret
            .data
            .insert(TLS_KEY_KEY.to_string(), key_pem.into_bytes());
        self.repository.update_secret(&secret).await?;

        // Bounce the registry pod so it picks the new certificate up. Exactly
        // one is expected; none just means nothing to restart yet.
        let pods = self
            .repository
            .list_pods(&namespace.meta.name, &Selector::new().eq(APP_LABEL, REGISTRY_APP))
            .await?;
        if pods.len() > 1 {
            warn!(
                namespace = namespace.meta.name,
                count = pods.len(),
                "Expected exactly one registry pod"
            );
        }
        for pod in pods {
            match self
                .repository
                .delete_pod(&namespace.meta.name, &pod.meta.name)
                .await
            {
                Ok(()) | Err(RepositoryError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            namespace = namespace.meta.name,
            project = project,
            "Rotated registry certificate"
        );
        Ok(())
    }

    /// Block until no executions in the project are actively running. Polling
    /// past the budget is the one bounded wait in the system that produces a
    /// hard error; the next 12h tick retries.
    async fn wait_for_quiescence(&self, project: &str, token: &CancellationToken) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.quiescence_budget;
        let mut poll = tokio::time::interval(self.quiescence_poll_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    bail!("cancelled while waiting for executions to finish");
                }
                _ = poll.tick() => {
                    let running = self
                        .repository
                        .list_executions(Some(project), &Selector::new().eq(FINISH_LABEL, "false"))
                        .await?;
                    if running.is_empty() {
                        return Ok(());
                    }
                    if tokio::time::Instant::now() >= deadline {
                        bail!("time out waiting all executions to finish");
                    }
                }
            }
        }
    }

    async fn signing_duration(&self, project: &str) -> Result<Duration> {
        let value = match self
            .repository
            .get_setting(project, SETTING_SIGNING_DURATION)
            .await
        {
            Ok(setting) => setting.effective().to_string(),
            Err(RepositoryError::NotFound) => {
                crate::models::setting::compiled_default(SETTING_SIGNING_DURATION).to_string()
            }
            Err(e) => return Err(e.into()),
        };
        parse_duration(&value)
            .with_context(|| format!("invalid {SETTING_SIGNING_DURATION} setting '{value}'"))
    }
}

fn read_pem(data: &std::collections::BTreeMap<String, Vec<u8>>, key: &str) -> Result<String> {
    let bytes = data
        .get(key)
        .with_context(|| format!("CA secret is missing '{key}'"))?;
    String::from_utf8(bytes.clone()).with_context(|| format!("'{key}' is not valid UTF-8"))
}

/// Whether the stored certificate is due for rotation. Unparseable or empty
/// certificate material rotates unconditionally: a registry with a broken
/// certificate is worse than a restart.
pub fn should_rotate(cert_pem: &[u8], now: DateTime<Utc>) -> bool {
    if cert_pem.is_empty() {
        return true;
    }
    let Ok((_, pem)) = x509_parser::pem::parse_x509_pem(cert_pem) else {
        return true;
    };
    let Ok(cert) = pem.parse_x509() else {
        return true;
    };

    let not_before = cert.validity().not_before.timestamp();
    let not_after = cert.validity().not_after.timestamp();
    if not_after <= not_before {
        return true;
    }
    let lifetime = (not_after - not_before) as f64;
    let threshold = not_before + (lifetime * ROTATE_LIFETIME_FRACTION) as i64;
    now.timestamp() >= threshold
}

/// The DNS names the registry is reachable under inside the cluster.
pub fn registry_dns_names(namespace: &str) -> Vec<String> {
    vec![
        "registry".to_string(),
        format!("registry.{namespace}"),
        format!("registry.{namespace}.svc"),
        format!("registry.{namespace}.svc.cluster.local"),
    ]
}

/// Cut a fresh leaf certificate for the registry, signed by the cluster CA.
pub fn generate_registry_cert(
    ca_cert_pem: &str,
    ca_key_pem: &str,
    dns_names: &[String],
    validity: Duration,
) -> Result<(String, String)> {
    let ca_key = rcgen::KeyPair::from_pem(ca_key_pem)
        .context("could not parse cluster CA private key")?;
    let ca_params = rcgen::CertificateParams::from_ca_cert_pem(ca_cert_pem)
        .context("could not parse cluster CA certificate")?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .context("could not reconstruct cluster CA certificate")?;

    let key = rcgen::KeyPair::generate().context("could not generate registry key")?;
    let mut params = rcgen::CertificateParams::new(dns_names.to_vec())
        .context("could not build certificate params")?;
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now
        + time::Duration::try_from(validity)
            .context("signing duration does not fit a certificate validity window")?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "registry");

    let cert = params
        .signed_by(&key, &ca_cert, &ca_key)
        .context("could not sign registry certificate")?;
    Ok((cert.pem(), key.serialize_pem()))
}
