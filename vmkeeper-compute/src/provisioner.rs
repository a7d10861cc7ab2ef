//! Backing storage for new servers.

use serde::Deserialize;
use tracing::{info, instrument};

use crate::error::{ComputeError, Result};
use crate::traits::HypervisorConnection;
use crate::types::{Volume, VolumeFilter, VolumeOptions};

/// Volume parameters given at server construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VolumeRequest {
    pub name: Option<String>,
    pub pool_name: Option<String>,
    pub format_type: Option<String>,
    pub capacity: Option<String>,
    pub allocation: Option<String>,
    /// Clone this volume instead of creating a fresh one
    pub template_name: Option<String>,
}

impl VolumeRequest {
    /// `<server-name>.<format>`, `img` when no format is given.
    pub fn default_name(&self, server_name: &str) -> String {
        format!(
            "{}.{}",
            server_name,
            self.format_type.as_deref().unwrap_or("img")
        )
    }
}

/// Creates or clones the volume a new server boots from.
pub struct VolumeProvisioner<'a> {
    connection: &'a dyn HypervisorConnection,
}

impl<'a> VolumeProvisioner<'a> {
    pub fn new(connection: &'a dyn HypervisorConnection) -> Self {
        Self { connection }
    }

    /// Provision one volume for `server_name` and append it to `existing`.
    #[instrument(skip(self, request, existing), fields(vm_name = %server_name))]
    pub async fn provision(
        &self,
        server_name: &str,
        request: &VolumeRequest,
        existing: Option<Vec<Volume>>,
    ) -> Result<Vec<Volume>> {
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| request.default_name(server_name));

        let volume = match &request.template_name {
            Some(template) => self.clone_template(template, &name).await?,
            None => self.create_fresh(name, request).await?,
        };

        let mut volumes = existing.unwrap_or_default();
        volumes.push(volume);
        Ok(volumes)
    }

    async fn clone_template(&self, template: &str, name: &str) -> Result<Volume> {
        let source = self
            .connection
            .list_volumes(&VolumeFilter::by_name(template))
            .await
            .map_err(|e| ComputeError::hypervisor(format!("Failed to look up template {}", template), e))?
            .into_iter()
            .next()
            .ok_or_else(|| ComputeError::Configuration(format!("Template {} not found", template)))?;

        let volume = self
            .connection
            .clone_volume(&source, name)
            .await
            .map_err(|e| {
                ComputeError::hypervisor(format!("Failed to clone {} into {}", template, name), e)
                    .into_provisioning("Error creating the volume")
            })?;

        info!(template = %template, volume = %name, "Cloned volume from template");
        Ok(volume)
    }

    async fn create_fresh(&self, name: String, request: &VolumeRequest) -> Result<Volume> {
        let options = VolumeOptions {
            name,
            pool_name: request.pool_name.clone(),
            format_type: request.format_type.clone(),
            capacity: request.capacity.clone(),
            allocation: request.allocation.clone(),
        };

        let volume = self.connection.create_volume(&options).await.map_err(|e| {
            ComputeError::hypervisor(format!("Failed to create volume {}", options.name), e)
                .into_provisioning("Error creating the volume")
        })?;

        info!(volume = %volume.name, "Created volume");
        Ok(volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnection;

    #[test]
    fn test_default_name() {
        let request = VolumeRequest::default();
        assert_eq!(request.default_name("web-1"), "web-1.img");

        let request = VolumeRequest {
            format_type: Some("qcow2".to_string()),
            ..Default::default()
        };
        assert_eq!(request.default_name("web-1"), "web-1.qcow2");
    }

    #[tokio::test]
    async fn test_fresh_volume_passes_only_given_options() {
        let conn = MockConnection::new();
        let request = VolumeRequest {
            capacity: Some("20G".to_string()),
            ..Default::default()
        };

        let volumes = VolumeProvisioner::new(&conn)
            .provision("web-1", &request, None)
            .await
            .unwrap();

        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "web-1.img");
        assert_eq!(volumes[0].capacity.as_deref(), Some("20G"));
        assert_eq!(volumes[0].format_type, None);
        assert_eq!(volumes[0].allocation, None);
    }

    #[tokio::test]
    async fn test_template_clone_appends() {
        let conn = MockConnection::new();
        conn.add_volume(
            Volume::new("base.qcow2")
                .with_path("/var/lib/libvirt/images/base.qcow2")
                .with_pool("default"),
        );

        let request = VolumeRequest {
            template_name: Some("base.qcow2".to_string()),
            format_type: Some("qcow2".to_string()),
            ..Default::default()
        };
        let existing = vec![Volume::new("data.img")];

        let volumes = VolumeProvisioner::new(&conn)
            .provision("web-1", &request, Some(existing))
            .await
            .unwrap();

        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].name, "data.img");
        assert_eq!(volumes[1].name, "web-1.qcow2");
        assert_eq!(volumes[1].backing_volume.as_deref(), Some("base.qcow2"));
    }

    #[tokio::test]
    async fn test_missing_template() {
        let conn = MockConnection::new();
        let request = VolumeRequest {
            template_name: Some("missing".to_string()),
            ..Default::default()
        };

        let err = VolumeProvisioner::new(&conn)
            .provision("web-1", &request, None)
            .await
            .unwrap_err();

        assert!(matches!(err, ComputeError::Configuration(ref m) if m == "Template missing not found"));
        assert_eq!(conn.count_calls("clone_volume"), 0);
    }

    #[tokio::test]
    async fn test_create_failure_is_provisioning_error() {
        let conn = MockConnection::new();
        conn.fail_on("create_volume");

        let err = VolumeProvisioner::new(&conn)
            .provision("web-1", &VolumeRequest::default(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, ComputeError::Provisioning { .. }));
    }
}
