//! Certificates issued out of band (certbot on the host) and picked up from
//! the letsencrypt directory.

use std::path::PathBuf;

use async_trait::async_trait;
use keel_scheduler::{CertificateAuthority, SchedulerError, SchedulerResult};
use tracing::debug;

pub struct PreIssuedCertificates {
    letsencrypt_dir: PathBuf,
}

impl PreIssuedCertificates {
    pub fn new(letsencrypt_dir: impl Into<PathBuf>) -> Self {
        Self {
            letsencrypt_dir: letsencrypt_dir.into(),
        }
    }

    fn fullchain(&self, domain: &str) -> PathBuf {
        self.letsencrypt_dir
            .join("live")
            .join(domain)
            .join("fullchain.pem")
    }
}

#[async_trait]
impl CertificateAuthority for PreIssuedCertificates {
    async fn verify_domain_resolves(&self, domain: &str) -> SchedulerResult<()> {
        let mut addrs = tokio::net::lookup_host((domain, 80)).await.map_err(|e| {
            SchedulerError::Generic(format!("Cannot resolve {domain}: {e}"))
        })?;
        match addrs.next() {
            Some(addr) => {
                debug!(%domain, %addr, "domain resolves");
                Ok(())
            }
            None => Err(SchedulerError::Generic(format!(
                "{domain} does not resolve to any address"
            ))),
        }
    }

    async fn verify_owns_domain(&self, domain: &str) -> SchedulerResult<()> {
        self.verify_domain_resolves(domain).await
    }

    async fn request_certificate(&self, domain: &str) -> SchedulerResult<()> {
        let path = self.fullchain(domain);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            Ok(())
        } else {
            Err(SchedulerError::Generic(format!(
                "No certificate issued for {domain}, expected {}",
                path.display()
            )))
        }
    }
}
