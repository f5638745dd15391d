//! Lookup of the volumes and databases that make up a tenant site.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use crate::crd::{SpecMySql, SpecVolume, SITE_LABEL};
use crate::error::Result;

/// Label marking a Secret as holding MySQL connection details for its site.
pub const MYSQL_LABEL: &str = "backups.shepherd/mysql";

/// What a backup of one site has to capture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteTargets {
    pub volumes: BTreeMap<String, SpecVolume>,
    pub mysql: BTreeMap<String, SpecMySql>,
}

impl SiteTargets {
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty() && self.mysql.is_empty()
    }
}

/// Resolves a `site` label value into backup targets.
#[async_trait]
pub trait SiteDirectory: Send + Sync {
    async fn targets(&self, namespace: &str, site: &str) -> Result<SiteTargets>;
}

/// Finds targets by label: PVCs carrying `site=<site>` become volumes, and
/// Secrets carrying both `site=<site>` and [`MYSQL_LABEL`]`=true` become
/// databases.
pub struct LabelSiteDirectory {
    client: Client,
}

impl LabelSiteDirectory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SiteDirectory for LabelSiteDirectory {
    async fn targets(&self, namespace: &str, site: &str) -> Result<SiteTargets> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        let site_selector = format!("{}={}", SITE_LABEL, site);
        let mysql_selector = format!("{},{}=true", site_selector, MYSQL_LABEL);

        let volumes = pvcs
            .list(&ListParams::default().labels(&site_selector))
            .await?
            .items
            .into_iter()
            .map(|pvc| {
                let name = pvc.name_any();
                (name.clone(), SpecVolume { claim_name: name })
            })
            .collect();

        let mysql = secrets
            .list(&ListParams::default().labels(&mysql_selector))
            .await?
            .items
            .into_iter()
            .map(|secret| {
                let name = secret.name_any();
                (name.clone(), SpecMySql { secret: name })
            })
            .collect();

        let targets = SiteTargets { volumes, mysql };
        debug!(
            site = %site,
            volumes = targets.volumes.len(),
            databases = targets.mysql.len(),
            "Resolved site targets"
        );
        Ok(targets)
    }
}
