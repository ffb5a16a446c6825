//! Image-pull resolver: makes a container image available in the local
//! backend. The cache entry only carries a breadcrumb (the resolved
//! image id); the bytes live in the backend, which is why cache hits are
//! re-validated against it.

use async_trait::async_trait;
use bollard::query_parameters::CreateImageOptions;
use bollard::Docker;
use camino::Utf8Path;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Output, Resolver};
use crate::cache::CacheKey;

const IMAGE_ID_FILE: &str = "image-id";

pub const META_REFERENCE: &str = "reference";
pub const META_IMAGE_ID: &str = "image_id";

pub struct ImagePullResolver {
    docker: Docker,
    reference: String,
}

impl ImagePullResolver {
    pub fn new(docker: Docker, reference: impl Into<String>) -> Self {
        ImagePullResolver {
            docker,
            reference: reference.into(),
        }
    }

    fn output(&self, image_id: String) -> Output {
        Output {
            path: None,
            meta: [
                (META_REFERENCE.to_string(), self.reference.clone()),
                (META_IMAGE_ID.to_string(), image_id),
            ]
            .into(),
        }
    }
}

#[async_trait]
impl Resolver for ImagePullResolver {
    fn cache_key(&self) -> CacheKey {
        CacheKey::of("image", self.reference.as_bytes())
    }

    async fn cached(&self, output_dir: &Utf8Path) -> anyhow::Result<Option<Output>> {
        match std::fs::read_to_string(output_dir.join(IMAGE_ID_FILE)) {
            Ok(image_id) => Ok(Some(self.output(image_id.trim().to_string()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve(
        &self,
        cancel: &CancellationToken,
        output_dir: &Utf8Path,
    ) -> anyhow::Result<Output> {
        info!("pulling image {}", self.reference);
        let options = CreateImageOptions {
            from_image: Some(self.reference.clone()),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("pull of {} cancelled", self.reference),
                item = progress.next() => match item {
                    Some(Ok(update)) => {
                        if let Some(status) = update.status {
                            debug!("pull {}: {status}", self.reference);
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                }
            }
        }

        let inspected = self.docker.inspect_image(&self.reference).await?;
        let image_id = inspected
            .id
            .ok_or_else(|| anyhow::anyhow!("backend returned no id for {}", self.reference))?;
        utils::crashsafe::overwrite(&output_dir.join(IMAGE_ID_FILE), image_id.as_bytes())?;

        Ok(self.output(image_id))
    }

    fn retryable(&self) -> bool {
        true
    }

    /// The image must still exist in the backend; a `docker image prune`
    /// behind our back invalidates the breadcrumb.
    async fn valid(&self, _output: &Output) -> bool {
        self.docker.inspect_image(&self.reference).await.is_ok()
    }
}
