//! Image resolution for the Scaleway driver.

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};

use crate::driver::{DriverError, with_timeout};
use crate::scaleway::{KIND, ScalewayDriver};

impl ScalewayDriver {
    /// Resolves an image label to the newest available image id, preferring
    /// images scoped to the configured project.
    pub(in crate::scaleway) async fn resolve_image_id(
        &self,
        zone: &str,
        label: &str,
    ) -> Result<String, DriverError> {
        let arch = self.config.default_architecture.as_str();
        let project_images = with_timeout(KIND, "image lookup", self.request_timeout, async {
            let mut scoped = ScalewayListInstanceImagesBuilder::new(self.api.clone(), zone)
                .public(true)
                .project(&self.project_id)
                .name(label)
                .arch(arch);
            if let Some(org) = self.config.default_organization_id.as_deref() {
                scoped = scoped.organization(org);
            }
            scoped
                .run_async()
                .await
                .map_err(|err| DriverError::provision(KIND, err))
        })
        .await?;

        let candidates = if project_images.is_empty() {
            with_timeout(KIND, "image lookup", self.request_timeout, async {
                ScalewayListInstanceImagesBuilder::new(self.api.clone(), zone)
                    .public(true)
                    .name(label)
                    .arch(arch)
                    .run_async()
                    .await
                    .map_err(|err| DriverError::provision(KIND, err))
            })
            .await?
        } else {
            project_images
        };

        select_image_id(candidates, label, arch, zone)
    }
}

/// Keeps available images of the right architecture.
pub(super) fn filter_images(images: Vec<ScalewayImage>, arch: &str) -> Vec<ScalewayImage> {
    images
        .into_iter()
        .filter(|image| image.arch == arch)
        .filter(|image| image.state == "available")
        .collect()
}

/// Picks the most recently created usable image.
pub(super) fn select_image_id(
    images: Vec<ScalewayImage>,
    label: &str,
    arch: &str,
    zone: &str,
) -> Result<String, DriverError> {
    filter_images(images, arch)
        .into_iter()
        .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
        .map(|image| image.id)
        .ok_or_else(|| {
            DriverError::provision(
                KIND,
                format!("image '{label}' (arch {arch}) not found in zone {zone}"),
            )
        })
}
